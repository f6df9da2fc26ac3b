//! Command decoding and Type I-IV dispatch.
//!
//! The service loop calls [`process`] when the bus responder has
//! latched a command byte. Type I commands complete here (with their
//! step delay handed to the `Type1Settle` service state); Type II/III
//! commands stage the transfer cursors and hand off to the service
//! state machine. Force Interrupt never reaches this module on the
//! normal path; the bus responder executes it synchronously.

use crate::drive::Geometry;
use crate::service::Service;
use crate::storage::Storage;
use crate::track::MAX_TRACK_LEN;
use crate::{host, CommandType, SectorView, Wd1793, HOST_SELECT};
use format_dmk::{IDAM_TABLE_LEN, SECTOR_SLOTS};

/// Stepping motor rate from the command's low two bits, in ms per step.
#[must_use]
pub fn step_rate_ms(command: u8) -> u32 {
    match command & 0x03 {
        0 => 3,
        1 => 6,
        2 => 10,
        _ => 15,
    }
}

/// Drive slot index from the one-hot drive select bits.
#[must_use]
pub fn drive_index(drive_sel: u8) -> Option<usize> {
    (0..crate::MAX_DRIVES).find(|&i| drive_sel & (1 << i) != 0)
}

/// Side select (drive-select bit 4).
#[must_use]
pub fn side_select(drive_sel: u8) -> u8 {
    (drive_sel >> 4) & 1
}

/// Decode and execute the latched command byte.
pub(crate) fn process(fdc: &mut Wd1793, storage: &mut dyn Storage) {
    fdc.service = Service::Idle;
    fdc.cur_command = fdc.command_reg;
    fdc.command_received = false;

    if fdc.drive_sel == HOST_SELECT {
        host::dispatch(fdc, storage);
        return;
    }

    match fdc.cur_command >> 4 {
        0x0 => restore(fdc, storage),
        0x1 => seek(fdc, storage),
        0x2 | 0x3 => step(fdc, storage, None),
        0x4 | 0x5 => step(fdc, storage, Some(1)),
        0x6 | 0x7 => step(fdc, storage, Some(-1)),
        0x8 | 0x9 => read_sector(fdc, storage),
        0xA | 0xB => write_sector(fdc, storage),
        0xC => read_address(fdc, storage),
        0xD => force_interrupt(fdc),
        0xE => read_track(fdc, storage),
        _ => write_track(fdc),
    }
}

// ---------------------------------------------------------------------------
// Type I — Restore, Seek, Step, Step In, Step Out
// ---------------------------------------------------------------------------

/// Schedule Type I completion: busy stays set for `delay_us`, then the
/// settle state clears it and raises INTRQ. A zero delay completes now.
fn finish_type1(fdc: &mut Wd1793, delay_us: u32) {
    if delay_us == 0 {
        fdc.flags.busy = false;
        fdc.generate_intr();
    } else {
        fdc.state_counter_us = delay_us;
        fdc.service = Service::Type1Settle;
    }
}

/// Command 0 0 0 0 h V r1 r0 — position to track zero.
fn restore(fdc: &mut Wd1793, storage: &mut dyn Storage) {
    fdc.command_type = CommandType::Type1;
    let side = side_select(fdc.drive_sel);

    if let Some(drive) = drive_index(fdc.drive_sel) {
        fdc.load_track(drive, side, 0, storage);
    }

    fdc.track_reg = 0;
    finish_type1(fdc, 0);
}

/// Command 0 0 0 1 h V r1 r0 — seek to the track in the data register.
fn seek(fdc: &mut Wd1793, storage: &mut dyn Storage) {
    fdc.command_type = CommandType::Type1;
    let side = side_select(fdc.drive_sel);
    let target = fdc.data_reg;

    let drive = drive_index(fdc.drive_sel);
    let in_range = drive.is_some_and(|d| target < fdc.drives[d].tracks());
    if !in_range {
        fdc.flags.seek_error = true;
        fdc.flags.busy = false;
        fdc.generate_intr();
        return;
    }

    let steps = u32::from(fdc.track_reg.abs_diff(target));
    let delay_us = step_rate_ms(fdc.command_reg) * steps * 1000;

    if let Some(drive) = drive {
        fdc.load_track(drive, side, target, storage);
    }

    fdc.track_reg = target;
    fdc.flags.seek_error = false;
    finish_type1(fdc, delay_us);
}

/// Commands 0 0 1/0 1 0/0 1 1 u h V r1 r0 — single head step. `dir`
/// forces the direction latch (Step In/Out); `None` keeps the previous
/// direction. The track register moves only when the update bit (u) is
/// set, clamped to 0..=255.
fn step(fdc: &mut Wd1793, storage: &mut dyn Storage, dir: Option<i8>) {
    fdc.command_type = CommandType::Type1;
    let side = side_select(fdc.drive_sel);

    if let Some(dir) = dir {
        fdc.step_dir = dir;
    }

    let stepped = match fdc.step_dir {
        1 => fdc.track_reg.saturating_add(1),
        -1 => fdc.track_reg.saturating_sub(1),
        _ => fdc.track_reg,
    };

    // Step In/Out move the head regardless; plain Step moves it only
    // through the track register update.
    let update = fdc.cur_command & 0x10 != 0;
    if update {
        fdc.track_reg = stepped;
    }
    let head_track = if dir.is_some() { stepped } else { fdc.track_reg };

    if let Some(drive) = drive_index(fdc.drive_sel) {
        fdc.load_track(drive, side, head_track, storage);
    }

    fdc.flags.seek_error = false;
    finish_type1(fdc, step_rate_ms(fdc.command_reg) * 1000);
}

// ---------------------------------------------------------------------------
// Type II — Read Sector, Write Sector
// ---------------------------------------------------------------------------

/// Resolve (drive, side, track register, sector register) through the
/// track cache into the sector view. Failure leaves the record-not-found
/// status set; DMK media also gets ID and data CRC validation.
fn resolve_sector(fdc: &mut Wd1793, storage: &mut dyn Storage) -> bool {
    let Some(drive) = drive_index(fdc.drive_sel) else {
        fdc.flags.not_found = true;
        return false;
    };
    let side = side_select(fdc.drive_sel);

    if !fdc.load_track(drive, side, fdc.track_reg, storage) {
        fdc.flags.not_found = true;
        return false;
    }

    fdc.flags.crc_error = false;
    let slot = fdc.sector_reg as usize;
    let idam = if slot < SECTOR_SLOTS {
        fdc.cache.idam[slot]
    } else {
        None
    };

    let Some(idam) = idam else {
        fdc.sector = SectorView::default();
        fdc.flags.record_type = 0;
        fdc.flags.not_found = true;
        return false;
    };

    let check_crc = matches!(fdc.drives[drive].geometry, Geometry::Dmk(_));
    if check_crc && !format_dmk::id_crc_ok(&fdc.cache.data[..fdc.cache.size], idam) {
        fdc.flags.crc_error = true;
    }

    let Some(dam) = fdc.cache.dam[slot] else {
        fdc.sector = SectorView::default();
        fdc.flags.record_type = 0;
        fdc.flags.not_found = true;
        return false;
    };

    let size = format_dmk::sector_size(&fdc.cache.data, idam);
    fdc.record_mark = fdc.cache.data[dam + 3];
    fdc.sector = SectorView {
        sector: fdc.sector_reg,
        size,
        data_offset: dam + 4,
        dam: Some(dam),
        mark: 0xFB,
    };
    fdc.flags.not_found = false;
    // The live record mark is surfaced a few status reads into the
    // transfer; until then reads report a regular data mark.
    fdc.flags.record_type = 0xFB;

    if check_crc && !format_dmk::data_crc_ok(&fdc.cache.data[..fdc.cache.size], dam, size) {
        fdc.flags.crc_error = true;
    }

    true
}

/// Command 1 0 0 m F2 E F1 0 — read one sector.
fn read_sector(fdc: &mut Wd1793, storage: &mut dyn Storage) {
    fdc.command_type = CommandType::Type2;

    if !resolve_sector(fdc, storage) {
        fdc.flags.busy = false;
        return;
    }

    fdc.read_status_count = 0;
    fdc.state_counter_us = 1000;
    fdc.flags.data_request = false;
    fdc.cache.read_pos = fdc.sector.data_offset;
    fdc.cache.read_count = fdc.sector.size;
    fdc.data_reg_read_count = 0;
    fdc.service = Service::ReadSector(0);
}

/// Command 1 0 1 m F2 E F1 a0 — write one sector. Bit 0 selects the
/// data mark written: 0 = $FB, 1 = $F8 (deleted).
fn write_sector(fdc: &mut Wd1793, storage: &mut dyn Storage) {
    fdc.command_type = CommandType::Type2;
    fdc.flags.record_type = 0xFB;
    fdc.read_status_count = 0;

    let protected = drive_index(fdc.drive_sel)
        .is_none_or(|d| fdc.drives[d].write_protected());
    if protected {
        fdc.flags.protected = true;
        fdc.flags.busy = false;
        fdc.generate_intr();
        return;
    }

    if !resolve_sector(fdc, storage) {
        fdc.flags.busy = false;
        return;
    }

    fdc.flags.data_request = false;
    fdc.sector.mark = if fdc.cur_command & 0x01 == 0 { 0xFB } else { 0xF8 };
    fdc.cache.write_pos = fdc.sector.data_offset;
    fdc.cache.write_count = fdc.sector.size;
    fdc.state_counter_us = 1000;
    fdc.service = Service::WriteSector(0);
}

// ---------------------------------------------------------------------------
// Type III — Read Address, Read Track, Write Track
// ---------------------------------------------------------------------------

/// Command 1 1 0 0 0 E 0 0 — transfer the first ID field of the
/// current track: track, side, sector, size code, CRC high, CRC low.
fn read_address(fdc: &mut Wd1793, storage: &mut dyn Storage) {
    fdc.command_type = CommandType::Type3;

    let loaded = drive_index(fdc.drive_sel).is_some_and(|drive| {
        fdc.load_track(drive, side_select(fdc.drive_sel), fdc.track_reg, storage)
    });
    let Some(first) = loaded.then(|| fdc.cache.first_idam()).flatten() else {
        fdc.flags.not_found = true;
        fdc.flags.busy = false;
        return;
    };

    fdc.cache.read_pos = first + 1;
    fdc.cache.read_count = 6;
    fdc.read_status_count = 0;
    fdc.state_counter_us = 1000;
    fdc.flags.data_request = false;
    fdc.data_reg_read_count = 0;
    fdc.service = Service::ReadSector(0);
}

/// Command 1 1 1 0 0 E 0 0 — transfer the resident track bytes as-is.
fn read_track(fdc: &mut Wd1793, storage: &mut dyn Storage) {
    fdc.command_type = CommandType::Type3;

    let loaded = drive_index(fdc.drive_sel).is_some_and(|drive| {
        fdc.load_track(drive, side_select(fdc.drive_sel), fdc.track_reg, storage)
    });
    if !loaded {
        fdc.flags.not_found = true;
        fdc.flags.busy = false;
        return;
    }

    fdc.cache.read_pos = 0;
    fdc.cache.read_count = fdc.cache.size;
    fdc.read_status_count = 0;
    fdc.state_counter_us = 1000;
    fdc.flags.data_request = false;
    fdc.data_reg_read_count = 0;
    fdc.service = Service::ReadSector(0);
}

/// Command 1 1 1 1 0 E 0 0 — format: receive a full track image. The
/// track body is cleared and refilled byte by byte from the host; the
/// sentinel resolution and IDAM table rebuild run at completion.
fn write_track(fdc: &mut Wd1793) {
    fdc.command_type = CommandType::Type3;
    let side = side_select(fdc.drive_sel);

    let Some(drive) = drive_index(fdc.drive_sel) else {
        fdc.flags.busy = false;
        return;
    };

    if fdc.drives[drive].write_protected() {
        fdc.flags.protected = true;
        fdc.flags.busy = false;
        fdc.generate_intr();
        return;
    }

    let Geometry::Dmk(geo) = &fdc.drives[drive].geometry else {
        fdc.flags.busy = false;
        return;
    };
    let track_len = (geo.track_len as usize).min(MAX_TRACK_LEN);
    let file_offset = geo.track_offset(fdc.track_reg, side) as u64;

    for b in &mut fdc.cache.data[IDAM_TABLE_LEN..track_len] {
        *b = 0;
    }
    fdc.cache.set_identity(drive, side, fdc.track_reg);
    fdc.cache.size = track_len;
    fdc.cache.file_offset = file_offset;
    fdc.cache.write_pos = IDAM_TABLE_LEN;
    fdc.cache.write_count = track_len - IDAM_TABLE_LEN;
    fdc.state_counter_us = 1000;
    fdc.service = Service::WriteTrack(0);
}

// ---------------------------------------------------------------------------
// Type IV — Force Interrupt (background fallback)
// ---------------------------------------------------------------------------

/// The bus responder handles Force Interrupt synchronously; this path
/// only runs if the command byte was latched before a drive-select
/// change re-routed it here.
fn force_interrupt(fdc: &mut Wd1793) {
    fdc.command_type = CommandType::Type4;
    fdc.cache.read_count = 0;
    fdc.cache.write_count = 0;
    fdc.intr_enable = fdc.cur_command & 0x0F;
    fdc.flags = Default::default();
}
