//! Cooperative service state machine.
//!
//! Each long-running operation is a named micro-state-machine advanced
//! at most one step per background tick; nothing here blocks. The DRQ
//! bit is a two-sided rendezvous with the bus responder: whichever side
//! flips it is signalling the other, and every wait is bounded by the
//! countdown timer: a timed-out byte is skipped with the lost-data
//! status set rather than stalling the engine.

use crate::commands;
use crate::drive::Geometry;
use crate::storage::Storage;
use crate::{host, Wd1793};
use format_dmk::Density;

/// Active service operation plus its sub-state index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Service {
    #[default]
    Idle,
    /// Type I step-delay settle before busy clears and INTRQ fires.
    Type1Settle,
    /// Byte-at-a-time transfer out of the track cache (also serves
    /// Read Address and Read Track).
    ReadSector(u8),
    WriteSector(u8),
    WriteTrack(u8),
    /// Length-prefixed host-channel response, served by the responder.
    SendData,
    /// Length-prefixed host-channel payload receive.
    HostReceive(HostOp, u8),
}

/// Host-channel operations that receive a payload before executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostOp {
    Mount,
    OpenFile,
    WriteFile,
    SetTime,
}

impl HostOp {
    /// Per-byte handshake timeout while receiving, in microseconds.
    fn timeout_us(self) -> u32 {
        match self {
            HostOp::Mount => 100_000,
            _ => 10_000,
        }
    }
}

/// One background iteration: reset and media supervision, then either
/// command pickup or a single step of the active operation.
pub(crate) fn run(fdc: &mut Wd1793, storage: &mut dyn Storage) {
    if fdc.reset_pending {
        fdc.reset(storage);
        return;
    }

    let present = storage.media_present();
    if present != fdc.media_present {
        if present {
            fdc.init(storage);
        } else {
            fdc.close_all(storage);
        }
        fdc.media_present = present;
        return;
    }

    if fdc.command_received {
        commands::process(fdc, storage);
        return;
    }

    match fdc.service {
        Service::Idle => {}
        Service::Type1Settle => type1_settle(fdc),
        Service::ReadSector(step) => read_sector(fdc, step),
        Service::WriteSector(step) => write_sector(fdc, storage, step),
        Service::WriteTrack(step) => write_track(fdc, storage, step),
        Service::SendData => send_data(fdc),
        Service::HostReceive(op, step) => host_receive(fdc, storage, op, step),
    }
}

fn type1_settle(fdc: &mut Wd1793) {
    if fdc.state_counter_us != 0 {
        return;
    }
    fdc.flags.busy = false;
    fdc.generate_intr();
    fdc.service = Service::Idle;
}

fn read_sector(fdc: &mut Wd1793, step: u8) {
    match step {
        0 => {
            fdc.read_status_count = 0;
            fdc.service = Service::ReadSector(1);
        }
        1 => {
            // Surface the real record mark now that the host has had a
            // few status reads at the default value.
            fdc.flags.record_type = fdc.record_mark;
            fdc.read_status_count = 0;
            fdc.service = Service::ReadSector(2);
        }
        2 => {
            fdc.state_counter_us = 100;
            fdc.service = Service::ReadSector(3);
        }
        3 => {
            // Wait for the host to take the previous byte.
            if fdc.flags.data_request {
                if fdc.state_counter_us == 0 {
                    fdc.flags.data_request = false;
                    fdc.flags.data_lost = true;
                } else {
                    return;
                }
            }
            fdc.state_counter_us = 100;
            fdc.service = Service::ReadSector(4);
        }
        4 => {
            // Hold off while the bus is not stalled on us, but never
            // forever.
            if fdc.cache.read_count > 0 && !fdc.wait_output && fdc.state_counter_us != 0 {
                return;
            }

            let pos = fdc.cache.read_pos.min(fdc.cache.data.len() - 1);
            fdc.data_reg = fdc.cache.data[pos];
            fdc.state_counter_us = 100;

            if fdc.cache.read_count > 0 {
                fdc.cache.read_pos += 1;
                fdc.cache.read_count -= 1;
                if fdc.cache.read_count == 0 {
                    fdc.data_reg_read_count = 0;
                }
                fdc.generate_drq();
                fdc.service = Service::ReadSector(3);
                return;
            }

            fdc.drv_sel_write_count = 0;
            fdc.read_status_count = 0;
            fdc.state_counter_us = 20;
            fdc.service = Service::ReadSector(5);
        }
        _ => {
            if fdc.state_counter_us != 0 {
                return;
            }
            fdc.generate_intr();
            fdc.flags.busy = false;
            fdc.service = Service::Idle;
        }
    }
}

fn write_sector(fdc: &mut Wd1793, storage: &mut dyn Storage, step: u8) {
    match step {
        0 => {
            // Let the host poll status a few times before the first DRQ.
            if fdc.read_status_count < 25 && fdc.state_counter_us != 0 {
                return;
            }
            fdc.generate_drq();
            fdc.service = Service::WriteSector(1);
        }
        1 => {
            // Wait for the host to deposit a byte.
            if fdc.flags.data_request {
                return;
            }
            fdc.state_counter_us = 1000;
            fdc.service = Service::WriteSector(2);
        }
        2 => {
            if !fdc.wait_output && fdc.state_counter_us != 0 {
                return;
            }

            let pos = fdc.cache.write_pos.min(fdc.cache.data.len() - 1);
            fdc.cache.data[pos] = fdc.data_reg;

            if fdc.cache.write_count > 0 {
                fdc.cache.write_pos += 1;
                fdc.cache.write_count -= 1;
                if fdc.cache.write_count == 0 {
                    fdc.service = Service::WriteSector(3);
                    return;
                }
                fdc.generate_drq();
                fdc.service = Service::WriteSector(1);
                return;
            }

            fdc.state_counter_us = 200;
            fdc.service = Service::WriteSector(3);
        }
        3 => {
            update_data_mark(fdc);
            if let Some(dam) = fdc.sector.dam {
                let size = fdc.sector.size;
                format_dmk::write_data_crc(&mut fdc.cache.data[..fdc.cache.size], dam, size);
            }
            flush_sector(fdc, storage);
            fdc.release_wait();
            fdc.state_counter_us = 200;
            fdc.service = Service::WriteSector(4);
        }
        _ => {
            if fdc.state_counter_us != 0 {
                return;
            }
            fdc.generate_intr();
            fdc.flags.busy = false;
            fdc.service = Service::Idle;
        }
    }
}

/// Replace the data mark byte with the one the write command selected
/// ($FB regular, $F8 deleted). The mark is the first non-sync byte of
/// the DAM window.
fn update_data_mark(fdc: &mut Wd1793) {
    let Some(dam) = fdc.sector.dam else {
        return;
    };
    for i in 0..4 {
        if fdc.cache.data[dam + i] != 0xA1 {
            fdc.cache.data[dam + i] = fdc.sector.mark;
            break;
        }
    }
}

/// Flush the rewritten sector (data mark through CRC) back to a DMK
/// image. HFE media never flushes; those drives report protected.
fn flush_sector(fdc: &mut Wd1793, storage: &mut dyn Storage) {
    let Some((drive, _, _)) = fdc.cache.identity() else {
        return;
    };
    let Some(dam) = fdc.sector.dam else {
        return;
    };
    let slot = &fdc.drives[drive];
    if let (Some(file), Geometry::Dmk(_)) = (slot.file, &slot.geometry) {
        let end = (dam + fdc.sector.size + 6).min(fdc.cache.size);
        storage.seek(file, fdc.cache.file_offset + dam as u64);
        storage.write(file, &fdc.cache.data[dam..end]);
        storage.flush(file);
    }
}

fn write_track(fdc: &mut Wd1793, storage: &mut dyn Storage, step: u8) {
    match step {
        0 => {
            if fdc.read_status_count < 25 && fdc.state_counter_us != 0 {
                return;
            }
            fdc.generate_drq();
            fdc.service = Service::WriteTrack(1);
        }
        1 => {
            if fdc.flags.data_request {
                return;
            }
            fdc.state_counter_us = 1000;
            fdc.service = Service::WriteTrack(2);
        }
        2 => {
            if !fdc.wait_output && fdc.state_counter_us != 0 {
                return;
            }

            let pos = fdc.cache.write_pos.min(fdc.cache.data.len() - 1);
            fdc.cache.data[pos] = fdc.data_reg;

            if fdc.cache.write_count > 0 {
                fdc.cache.write_pos += 1;
                fdc.cache.write_count -= 1;
                if fdc.cache.write_count == 0 {
                    fdc.service = Service::WriteTrack(3);
                    return;
                }
                fdc.generate_drq();
                fdc.service = Service::WriteTrack(1);
                return;
            }

            fdc.state_counter_us = 200;
            fdc.service = Service::WriteTrack(3);
        }
        3 => {
            finish_track(fdc, storage);
            fdc.release_wait();
            fdc.state_counter_us = 200;
            fdc.service = Service::WriteTrack(4);
        }
        _ => {
            if fdc.state_counter_us != 0 {
                return;
            }
            fdc.generate_intr();
            fdc.flags.busy = false;
            fdc.service = Service::Idle;
        }
    }
}

/// Resolve the received track image (sync/CRC sentinels), rebuild the
/// IDAM pointer table and mark tables, and flush the whole record.
fn finish_track(fdc: &mut Wd1793, storage: &mut dyn Storage) {
    let Some((drive, side, track)) = fdc.cache.identity() else {
        return;
    };
    let size = fdc.cache.size;

    let density = match &fdc.drives[drive].geometry {
        Geometry::Dmk(geo) => geo.density,
        _ => Density::Double,
    };

    format_dmk::resolve_write_sentinels(&mut fdc.cache.data[..size]);
    format_dmk::rebuild_idam_table(&mut fdc.cache.data[..size], density);
    format_dmk::fill_mark_tables(
        &fdc.cache.data[..size],
        track,
        side,
        &mut fdc.cache.idam,
        &mut fdc.cache.dam,
    );

    let slot = &fdc.drives[drive];
    if let (Some(file), Geometry::Dmk(_)) = (slot.file, &slot.geometry) {
        storage.seek(file, fdc.cache.file_offset);
        storage.write(file, &fdc.cache.data[..size]);
        storage.flush(file);
    }
}

/// Backstop for a host-channel response the host stopped reading; the
/// responder serves the actual bytes.
fn send_data(fdc: &mut Wd1793) {
    if fdc.state_counter_us != 0 {
        return;
    }
    fdc.flags.data_request = false;
    fdc.flags.busy = false;
    fdc.service = Service::Idle;
}

fn host_receive(fdc: &mut Wd1793, storage: &mut dyn Storage, op: HostOp, step: u8) {
    match step {
        0 => {
            fdc.state_counter_us = op.timeout_us();
            fdc.flags.data_request = true;
            fdc.flags.busy = false;
            fdc.service = Service::HostReceive(op, 1);
        }
        1 => {
            // First byte is the payload length.
            if fdc.state_counter_us == 0 {
                fdc.service = Service::Idle;
                return;
            }
            if fdc.flags.data_request {
                return;
            }

            fdc.transfer.len = fdc.data_reg as usize;
            fdc.transfer.index = 0;
            fdc.state_counter_us = op.timeout_us();
            fdc.flags.data_request = true;
            fdc.flags.busy = false;
            fdc.service = Service::HostReceive(op, 2);
        }
        _ => {
            if fdc.state_counter_us == 0 {
                fdc.service = Service::Idle;
                return;
            }
            if fdc.flags.data_request {
                return;
            }

            let index = fdc.transfer.index.min(fdc.transfer.buf.len() - 1);
            fdc.transfer.buf[index] = fdc.data_reg;
            fdc.transfer.index += 1;

            if fdc.transfer.index < fdc.transfer.len {
                fdc.flags.data_request = true;
            } else {
                fdc.service = Service::Idle;
                match op {
                    HostOp::Mount => host::complete_mount(fdc, storage),
                    HostOp::OpenFile => host::complete_open_file(fdc, storage),
                    HostOp::WriteFile => host::complete_write_file(fdc, storage),
                    HostOp::SetTime => host::complete_set_time(fdc),
                }
            }

            fdc.state_counter_us = op.timeout_us();
            fdc.flags.busy = false;
        }
    }
}
