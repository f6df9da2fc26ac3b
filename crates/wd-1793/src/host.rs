//! Host extension channel.
//!
//! Writing the all-ones drive-select nibble turns the command register
//! into a control channel for the host: firmware identity, directory
//! listing, image mounting, raw file access and clock get/set. Payloads
//! travel through the length-prefixed sub-protocol: one length byte,
//! then that many bytes, each handshaked through DRQ. Responses are
//! staged in the transfer buffer and served directly by the bus
//! responder's data-register read path.

use crate::datetime;
use crate::service::{HostOp, Service};
use crate::storage::{OpenMode, Storage};
use crate::{drive, CommandType, Wd1793, MAX_DRIVES, TRANSFER_LEN};

/// Reported firmware identity.
pub const VERSION_TEXT: &str = concat!("SD-FDC Version ", env!("CARGO_PKG_VERSION"));

/// Directory snapshot bound (find-first keeps at most this many).
pub const FIND_MAX: usize = 100;

/// Largest read-file block returned per request.
pub const READ_BLOCK: usize = 250;

/// Host opcodes (command register values while the sentinel is
/// selected).
mod opcode {
    pub const VERSION: u8 = 1;
    pub const FIND_FIRST: u8 = 2;
    pub const FIND_NEXT: u8 = 3;
    pub const MOUNT: u8 = 4;
    pub const OPEN_FILE: u8 = 5;
    pub const READ_FILE: u8 = 6;
    pub const WRITE_FILE: u8 = 7;
    pub const CLOSE_FILE: u8 = 8;
    pub const SET_TIME: u8 = 9;
    pub const GET_TIME: u8 = 10;
    pub const FIND_INI: u8 = 0x80;
    pub const FIND_DMK: u8 = 0x81;
    pub const FIND_HFE: u8 = 0x82;
}

/// Case-insensitively sorted directory snapshot with a cursor.
#[derive(Default)]
pub struct FindState {
    pub(crate) entries: Vec<crate::storage::DirEntry>,
    pub(crate) index: usize,
}

pub(crate) fn dispatch(fdc: &mut Wd1793, storage: &mut dyn Storage) {
    fdc.command_type = CommandType::Type2;

    match fdc.cur_command {
        opcode::VERSION => version_status(fdc, storage),
        opcode::FIND_FIRST => find_first(fdc, storage, "*"),
        opcode::FIND_NEXT => find_next(fdc),
        opcode::MOUNT => receive(fdc, HostOp::Mount),
        opcode::OPEN_FILE => receive(fdc, HostOp::OpenFile),
        opcode::READ_FILE => read_file(fdc, storage),
        opcode::WRITE_FILE => receive(fdc, HostOp::WriteFile),
        opcode::CLOSE_FILE => close_file(fdc, storage),
        opcode::SET_TIME => receive(fdc, HostOp::SetTime),
        opcode::GET_TIME => get_time(fdc),
        opcode::FIND_INI => find_first(fdc, storage, ".INI"),
        opcode::FIND_DMK => find_first(fdc, storage, ".DMK"),
        opcode::FIND_HFE => find_first(fdc, storage, ".HFE"),
        _ => {
            fdc.flags.busy = false;
        }
    }
}

/// Stage a text response: [total length][text bytes][NUL], then switch
/// to the send state with DRQ raised.
fn stage_text(fdc: &mut Wd1793, text: &str) {
    let bytes = text.as_bytes();
    let n = bytes.len().min(TRANSFER_LEN - 2);
    fdc.transfer.buf[0] = (n + 2) as u8;
    fdc.transfer.buf[1..=n].copy_from_slice(&bytes[..n]);
    fdc.transfer.buf[n + 1] = 0;
    fdc.transfer.len = n + 2;
    fdc.transfer.index = 0;
    start_send(fdc);
}

fn start_send(fdc: &mut Wd1793) {
    fdc.read_status_count = 0;
    fdc.state_counter_us = 100_000;
    fdc.service = Service::SendData;
    fdc.flags.data_request = true;
    fdc.flags.busy = false;
}

fn receive(fdc: &mut Wd1793, op: HostOp) {
    fdc.read_status_count = 0;
    fdc.flags.data_request = false;
    fdc.service = Service::HostReceive(op, 0);
}

/// Opcode 1: firmware version plus mount state — or, after the boot
/// configuration was replaced, the new INI's contents.
fn version_status(fdc: &mut Wd1793, storage: &mut dyn Storage) {
    let mut text = String::new();
    text.push_str(VERSION_TEXT);
    text.push('\r');
    text.push_str("BootIni=");
    text.push_str(&fdc.boot_config);
    text.push('\r');

    if fdc.boot_config_modified {
        match crate::storage::read_all(storage, &fdc.boot_config) {
            Some(raw) => {
                for line in String::from_utf8_lossy(&raw).lines() {
                    if line.trim().len() > 2 {
                        text.push_str(line.trim());
                        text.push('\r');
                    }
                }
            }
            None => text.push_str("Unable to open specified ini file"),
        }
    } else {
        for (i, slot) in fdc.drives.iter().enumerate() {
            text.push_str(&format!("{i}: {}\r", slot.file_name()));
        }
    }

    stage_text(fdc, &text);
}

/// Opcodes 2 and $80-$82: snapshot the directory, filtered and sorted
/// case-insensitively, and return the first entry.
fn find_first(fdc: &mut Wd1793, storage: &mut dyn Storage, filter: &str) {
    let filter_lower = filter.to_ascii_lowercase();
    let mut entries: Vec<_> = storage
        .list_dir()
        .into_iter()
        .filter(|e| {
            filter == "*" || e.name.to_ascii_lowercase().contains(&filter_lower)
        })
        .collect();
    entries.sort_by(|a, b| {
        a.name
            .to_ascii_lowercase()
            .cmp(&b.name.to_ascii_lowercase())
    });
    entries.truncate(FIND_MAX);

    fdc.find = FindState { entries, index: 0 };
    find_next(fdc);
}

/// Opcode 3: next snapshot entry, or an empty response once exhausted.
fn find_next(fdc: &mut Wd1793) {
    if fdc.find.index < fdc.find.entries.len() {
        let entry = &fdc.find.entries[fdc.find.index];
        let text = format!(
            "{} {:7} {}",
            datetime::format_date(&entry.modified),
            entry.size,
            entry.name
        );
        fdc.find.index += 1;
        stage_text(fdc, &text);
    } else {
        stage_text(fdc, "");
    }
}

/// Opcode 6: next block of the open file, length-prefixed raw bytes.
fn read_file(fdc: &mut Wd1793, storage: &mut dyn Storage) {
    let n = match fdc.open_file {
        Some(id) => {
            let buf = &mut fdc.transfer.buf[1..=READ_BLOCK];
            storage.read(id, buf)
        }
        None => 0,
    };
    fdc.transfer.buf[0] = n as u8;
    fdc.transfer.len = n + 1;
    fdc.transfer.index = 0;
    start_send(fdc);
}

fn close_file(fdc: &mut Wd1793, storage: &mut dyn Storage) {
    if let Some(id) = fdc.open_file.take() {
        storage.close(id);
    }
    fdc.flags.busy = false;
}

/// Opcode 10: clock as text, `MM/DD/YY HH:MM:SS`.
fn get_time(fdc: &mut Wd1793) {
    let dt = datetime::code_datetime(fdc.rtc_seconds);
    stage_text(fdc, &datetime::format_datetime(&dt));
}

fn payload_text(fdc: &Wd1793) -> String {
    let len = fdc.transfer.len.min(TRANSFER_LEN);
    String::from_utf8_lossy(&fdc.transfer.buf[..len])
        .trim_matches(char::from(0))
        .trim()
        .to_string()
}

/// Mount payload: either an INI name (becomes the active boot
/// configuration) or `"<drive> <image>"` (mounts the image, closing
/// whatever the slot held).
pub(crate) fn complete_mount(fdc: &mut Wd1793, storage: &mut dyn Storage) {
    let payload = payload_text(fdc);

    if payload.to_ascii_lowercase().ends_with(".ini") {
        save_boot_config(fdc, storage, &payload);
        return;
    }

    let Some((index_text, path)) = payload.split_once(' ') else {
        return;
    };
    let Ok(index) = index_text.trim().parse::<usize>() else {
        return;
    };
    let path = path.trim();
    if index >= MAX_DRIVES || !storage.exists(path) {
        return;
    }

    fdc.drives[index].unmount(storage);
    fdc.drives[index].file_name = path.to_string();
    drive::mount(&mut fdc.drives[index], storage);
    fdc.cache.invalidate();
}

fn save_boot_config(fdc: &mut Wd1793, storage: &mut dyn Storage, name: &str) {
    let Some(id) = storage.open(crate::config::BOOT_POINTER, OpenMode::create()) else {
        return;
    };
    storage.write(id, name.as_bytes());
    storage.close(id);
    fdc.boot_config = name.to_string();
    fdc.boot_config_modified = true;
}

/// Open-file payload: `name,mode` with `r`/`w` mode letters. A `/` in
/// the name is folded to `.` and a leading drive prefix (`0:`) is
/// dropped.
pub(crate) fn complete_open_file(fdc: &mut Wd1793, storage: &mut dyn Storage) {
    let payload = payload_text(fdc);
    let Some((raw_name, mode_text)) = payload.split_once(',') else {
        return;
    };

    let name = raw_name
        .rsplit(':')
        .next()
        .unwrap_or(raw_name)
        .replace('/', ".");

    let mut mode = OpenMode::default();
    for c in mode_text.chars() {
        match c {
            'r' => mode.read = true,
            'w' => mode.write = true,
            _ => {}
        }
    }

    if let Some(old) = fdc.open_file.take() {
        storage.close(old);
    }
    fdc.open_file = storage.open(name.trim(), mode);
}

pub(crate) fn complete_write_file(fdc: &mut Wd1793, storage: &mut dyn Storage) {
    if let Some(id) = fdc.open_file {
        let len = fdc.transfer.len.min(TRANSFER_LEN);
        storage.write(id, &fdc.transfer.buf[..len]);
    }
}

/// Set-time payload: `MM/DD/YYYY HH:MM:SS`.
pub(crate) fn complete_set_time(fdc: &mut Wd1793) {
    let dt = datetime::parse_datetime(&payload_text(fdc));
    fdc.rtc_seconds = datetime::encode_datetime(&dt);
}

/// Keep the host-sequence detector fed from data-register writes: the
/// nine-byte unlock table must be matched in order, any mismatch
/// restarts it.
pub(crate) fn detect_sequence(fdc: &mut Wd1793, byte: u8) {
    let seq = crate::HOST_SEQUENCE;
    if fdc.wr_host_seq < seq.len() && seq[fdc.wr_host_seq] == byte {
        fdc.wr_host_seq += 1;
    } else {
        fdc.wr_host_seq = 0;
        fdc.rd_host_seq = 0;
    }
}
