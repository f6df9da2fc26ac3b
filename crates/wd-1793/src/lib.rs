//! WD1793 floppy disk controller emulation backed by virtual disk
//! images.
//!
//! Standalone controller-level emulation in the project's chip-library
//! pattern (like `nec-upd765`): one owned state struct, bus-facing
//! register methods, and a cooperative background tick. The WD1793 is
//! the FDC of the TRS-80 Model I/III expansion bus; this crate lets a
//! host machine boot from DMK and HFE images on removable storage.
//!
//! # Register interface
//!
//! Four registers selected by two address lines:
//! - **0** command (write) / status (read)
//! - **1** track register
//! - **2** sector register
//! - **3** data register
//!
//! plus three auxiliary latches on their own control lines: drive
//! select (write), NMI mask (write) and NMI status (read).
//!
//! # Execution contexts
//!
//! The `read_*`/`write_*` methods are the interrupt-time bus responder:
//! they touch only register and status state, never storage, and
//! complete in bounded time. [`Wd1793::tick`] is the background loop:
//! it advances timers and runs one step of the service state machine,
//! and it is the only place storage I/O happens. The WAIT output and
//! the DRQ bit carry the flow control between the two contexts; every
//! wait is bounded, and a timeout degrades status instead of stalling.
//!
//! # Command set
//!
//! The four WD1793 command types are decoded from the upper nibble:
//! Type I Restore/Seek/Step ($0-$7), Type II Read/Write Sector
//! ($8-$B), Type III Read Address/Read Track/Write Track ($C,$E,$F),
//! Type IV Force Interrupt ($D). Writing $0F to the drive-select latch
//! re-routes the command register to the host extension channel (see
//! [`host`]).

pub mod commands;
pub mod config;
pub mod datetime;
pub mod drive;
pub mod host;
pub mod service;
pub mod storage;
pub mod track;

#[cfg(test)]
pub(crate) mod testutil;

use drive::{DriveSlot, Geometry};
use host::FindState;
use service::Service;
use storage::{FileId, Storage};
use track::TrackCache;

/// Number of drive select lines / drive slots.
pub const MAX_DRIVES: usize = 4;

/// Drive-select value that addresses the host extension channel (all
/// four drive bits set).
pub const HOST_SELECT: u8 = 0x0F;

/// Host-channel transfer buffer capacity.
pub const TRANSFER_LEN: usize = 256;

/// Motor-on window reloaded by every drive-select write.
pub const MOTOR_ON_US: u32 = 2_000_000;

/// One diskette rotation at 300 RPM.
pub const ROTATION_US: u32 = 200_000;

/// Index pulse width: 5 degrees of rotation.
pub const INDEX_US: u32 = ROTATION_US / 72;

/// Reset line must stay low this long to trigger reinitialisation.
pub const RESET_PULSE_US: u32 = 1_000;

/// WAIT output self-release timeout.
pub const WAIT_TIMEOUT_US: u32 = 2_000;

/// Data-register write sequence that unlocks the diagnostic read-back
/// channel. Matched literally, in order; reads then replay the table.
pub const HOST_SEQUENCE: [u8; 9] = [0x80, 0x7F, 0x81, 0xFE, 0x82, 0xFD, 0x83, 0xFC, 0x84];

const NMI_STATUS_IDLE: u8 = 0xFF;
const NMI_STATUS_INTRQ: u8 = 0x7F;

/// Status register bit masks.
pub mod status_bits {
    /// Command in progress (all types).
    pub const BUSY: u8 = 0x01;
    /// Type I: index mark detected once per rotation.
    pub const INDEX: u8 = 0x02;
    /// Type I: head positioned over track zero.
    pub const TRACK0: u8 = 0x04;
    /// CRC error in the ID or data field.
    pub const CRC_ERROR: u8 = 0x08;
    /// Type I: seek error, track not verified.
    pub const SEEK_ERROR: u8 = 0x10;
    /// Type I: head loaded and engaged.
    pub const HEAD_LOADED: u8 = 0x20;
    /// Type II/III: copy of the DRQ output.
    pub const DRQ: u8 = 0x02;
    /// Type II/III: host missed a byte window.
    pub const LOST_DATA: u8 = 0x04;
    /// Type II/III: record not found.
    pub const NOT_FOUND: u8 = 0x10;
    /// Type II read: deleted data mark.
    pub const DELETED: u8 = 0x20;
    /// Media write protected.
    pub const PROTECTED: u8 = 0x40;
    /// Drive not ready.
    pub const NOT_READY: u8 = 0x80;
}

/// WD1793 command classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommandType {
    /// Power-on state, before any command byte.
    #[default]
    None,
    Type1,
    Type2,
    Type3,
    Type4,
}

/// Internal status flags; the status register shape derives from these
/// and the current command type.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatusFlags {
    pub busy: bool,
    pub index: bool,
    pub data_lost: bool,
    pub crc_error: bool,
    pub seek_error: bool,
    pub not_found: bool,
    pub protected: bool,
    pub not_ready: bool,
    /// $FB regular data, $F8 deleted data; reported in bit 5 on reads.
    pub record_type: u8,
    /// DRQ output: a byte is ready (read) or wanted (write).
    pub data_request: bool,
    /// INTRQ output: command completed.
    pub intr_request: bool,
}

/// Host-channel transfer buffer with read/write cursor.
pub struct Transfer {
    pub buf: [u8; TRANSFER_LEN],
    pub len: usize,
    pub index: usize,
}

impl Default for Transfer {
    fn default() -> Self {
        Self {
            buf: [0; TRANSFER_LEN],
            len: 0,
            index: 0,
        }
    }
}

/// Resolved per-operation sector window inside the track cache.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct SectorView {
    pub sector: u8,
    pub size: usize,
    /// First payload byte (one past the data mark).
    pub data_offset: usize,
    /// Offset of the DAM sequence's first sync byte.
    pub dam: Option<usize>,
    /// Mark to write back: $FB regular, $F8 deleted.
    pub mark: u8,
}

/// The controller. One instance owns every register, drive slot and
/// buffer; bus methods run in interrupt context, [`Self::tick`] in the
/// background loop.
pub struct Wd1793 {
    // Host-addressable registers.
    pub(crate) command_reg: u8,
    pub(crate) track_reg: u8,
    pub(crate) sector_reg: u8,
    pub(crate) data_reg: u8,
    pub(crate) flags: StatusFlags,

    pub(crate) command_type: CommandType,
    pub(crate) cur_command: u8,
    pub(crate) command_received: bool,
    /// +1 step in (toward the hub), -1 step out, 0 before any step.
    pub(crate) step_dir: i8,

    pub(crate) drive_sel: u8,
    pub(crate) backup_drive_sel: u8,
    pub(crate) nmi_status: u8,
    pub(crate) nmi_mask: u8,
    /// Force Interrupt condition bits (low nibble of the command).
    pub(crate) intr_enable: u8,
    nmi_pulse: bool,

    pub(crate) record_mark: u8,

    pub(crate) wait_output: bool,
    wait_timeout_us: u32,
    motor_timer_us: u32,
    rotation_us: u32,
    reset_line_low: bool,
    reset_accum_us: u32,
    pub(crate) reset_pending: bool,
    pub(crate) media_present: bool,

    pub(crate) service: Service,
    pub(crate) state_counter_us: u32,
    pub(crate) read_status_count: u32,
    pub(crate) drv_sel_write_count: u32,
    pub(crate) data_reg_read_count: u32,
    pub(crate) wr_host_seq: usize,
    pub(crate) rd_host_seq: usize,

    pub(crate) transfer: Transfer,
    pub(crate) drives: [DriveSlot; MAX_DRIVES],
    pub(crate) cache: TrackCache,
    pub(crate) sector: SectorView,
    pub(crate) find: FindState,

    pub(crate) boot_config: String,
    pub(crate) boot_config_modified: bool,
    pub(crate) open_file: Option<FileId>,

    pub(crate) rtc_seconds: u32,
    rtc_accum_us: u32,
}

impl Wd1793 {
    /// Create a powered-on controller with no drives mounted. Call
    /// [`Self::init`] with the storage collaborator to load the boot
    /// configuration and mount drives.
    #[must_use]
    pub fn new() -> Self {
        Self {
            command_reg: 255,
            track_reg: 0,
            sector_reg: 0,
            data_reg: 0,
            flags: StatusFlags {
                busy: true,
                ..StatusFlags::default()
            },
            command_type: CommandType::None,
            cur_command: 255,
            command_received: false,
            step_dir: 0,
            drive_sel: 0,
            backup_drive_sel: 0,
            nmi_status: 0,
            nmi_mask: 0,
            intr_enable: 0,
            nmi_pulse: false,
            record_mark: 0,
            wait_output: false,
            wait_timeout_us: 0,
            motor_timer_us: 0,
            rotation_us: 0,
            reset_line_low: false,
            reset_accum_us: 0,
            reset_pending: false,
            media_present: true,
            service: Service::Idle,
            state_counter_us: 0,
            read_status_count: 0,
            drv_sel_write_count: 0,
            data_reg_read_count: 0,
            wr_host_seq: 0,
            rd_host_seq: 0,
            transfer: Transfer::default(),
            drives: Default::default(),
            cache: TrackCache::default(),
            sector: SectorView::default(),
            find: FindState::default(),
            boot_config: String::new(),
            boot_config_modified: false,
            open_file: None,
            rtc_seconds: 0,
            rtc_accum_us: 0,
        }
    }

    /// Reinitialise controller state, reload the boot configuration
    /// and mount the configured drives. Any previously open files must
    /// already be closed (see [`Self::close_all`]).
    pub fn init(&mut self, storage: &mut dyn Storage) {
        let rtc_seconds = self.rtc_seconds;
        let rtc_accum_us = self.rtc_accum_us;
        let reset_line_low = self.reset_line_low;
        *self = Self::new();
        self.rtc_seconds = rtc_seconds;
        self.rtc_accum_us = rtc_accum_us;
        self.reset_line_low = reset_line_low;

        if let Some(raw) = storage::read_all(storage, config::BOOT_POINTER) {
            if let Some(name) = config::parse_pointer(&String::from_utf8_lossy(&raw)) {
                self.boot_config = name;
            }
        }
        if !self.boot_config.is_empty() {
            if let Some(raw) = storage::read_all(storage, &self.boot_config.clone()) {
                let text = String::from_utf8_lossy(&raw).into_owned();
                let mut names: [Option<String>; MAX_DRIVES] = Default::default();
                config::parse_ini(&text, |_, label, value| {
                    if let Some(i) = config::drive_label_index(label) {
                        names[i] = Some(value.to_string());
                    }
                });
                for (slot, name) in self.drives.iter_mut().zip(names) {
                    if let Some(name) = name {
                        slot.file_name = name;
                    }
                }
            }
        }

        for slot in &mut self.drives {
            if !slot.file_name.is_empty() {
                drive::mount(slot, storage);
            }
        }

        self.media_present = storage.media_present();
    }

    /// Close every image file and the host-channel file and clear the
    /// drive slots; drives report not-ready until reinitialised.
    pub fn close_all(&mut self, storage: &mut dyn Storage) {
        for slot in &mut self.drives {
            slot.clear(storage);
        }
        if let Some(id) = self.open_file.take() {
            storage.close(id);
        }
        self.cache.invalidate();
    }

    /// Full reinitialisation from a sustained reset pulse: files
    /// closed, state cleared, drives remounted, WAIT released.
    pub fn reset(&mut self, storage: &mut dyn Storage) {
        self.close_all(storage);
        self.init(storage);
        self.release_wait();
    }

    // -----------------------------------------------------------------------
    // Bus responder (interrupt context, no storage access)
    // -----------------------------------------------------------------------

    /// Read the register addressed by the two select lines.
    pub fn bus_read(&mut self, reg: u8) -> u8 {
        match reg & 0x03 {
            0 => self.read_status(),
            1 => self.read_track_reg(),
            2 => self.read_sector_reg(),
            _ => self.read_data(),
        }
    }

    /// Write the register addressed by the two select lines.
    pub fn bus_write(&mut self, reg: u8, value: u8) {
        match reg & 0x03 {
            0 => self.write_command(value),
            1 => self.write_track_reg(value),
            2 => self.write_sector_reg(value),
            _ => self.write_data(value),
        }
    }

    /// Status register read. Shape depends on the current command
    /// type; a pending interrupt is acknowledged and the NMI status
    /// latch returns to its idle pattern.
    pub fn read_status(&mut self) -> u8 {
        let value = self.status_value();
        self.read_status_count += 1;
        if self.flags.intr_request {
            self.nmi_status = NMI_STATUS_IDLE;
            self.flags.intr_request = false;
        }
        self.wr_host_seq = 0;
        value
    }

    fn status_value(&self) -> u8 {
        let host = self.drive_sel == HOST_SELECT;
        let drive = commands::drive_index(self.drive_sel);
        let mounted = drive.is_some_and(|d| self.drives[d].mounted());
        // The host channel stays usable with nothing mounted; for real
        // drives an empty slot reports only head-loaded.
        if !host && !mounted {
            return status_bits::HEAD_LOADED;
        }

        let f = &self.flags;
        let mut status = 0;

        match self.command_type {
            CommandType::Type1 | CommandType::Type4 => {
                if f.busy {
                    status |= status_bits::BUSY;
                }
                if f.index {
                    status |= status_bits::INDEX;
                }
                if self.track_reg == 0 {
                    status |= status_bits::TRACK0;
                }
                if f.crc_error {
                    status |= status_bits::CRC_ERROR;
                }
                if f.seek_error {
                    status |= status_bits::SEEK_ERROR;
                }
                status |= status_bits::HEAD_LOADED;
                let hfe = drive
                    .is_some_and(|d| matches!(self.drives[d].geometry, Geometry::Hfe { .. }));
                if f.protected || hfe {
                    status |= status_bits::PROTECTED;
                }
                if f.not_ready {
                    status |= status_bits::NOT_READY;
                }
            }
            CommandType::Type2 | CommandType::Type3 => {
                if f.busy {
                    status |= status_bits::BUSY;
                }
                if f.data_request {
                    status |= status_bits::DRQ;
                }
                if f.data_lost {
                    status |= status_bits::LOST_DATA;
                }
                if f.crc_error {
                    status |= status_bits::CRC_ERROR;
                }
                if f.not_found {
                    status |= status_bits::NOT_FOUND;
                }
                if f.record_type == 0xF8 {
                    status |= status_bits::DELETED;
                }
                if f.protected {
                    status |= status_bits::PROTECTED;
                }
                if f.not_ready {
                    status |= status_bits::NOT_READY;
                }
            }
            CommandType::None => {}
        }

        status
    }

    pub fn read_track_reg(&mut self) -> u8 {
        self.wr_host_seq = 0;
        self.track_reg
    }

    pub fn read_sector_reg(&mut self) -> u8 {
        self.wr_host_seq = 0;
        self.sector_reg
    }

    /// Data register read. While a host-channel response is staged the
    /// transfer buffer is served directly; otherwise the data register
    /// is returned and DRQ acknowledged. A completed unlock sequence
    /// replays the diagnostic table instead.
    pub fn read_data(&mut self) -> u8 {
        if self.drive_sel == HOST_SELECT && self.service == Service::SendData {
            let index = self.transfer.index.min(TRANSFER_LEN - 1);
            let byte = self.transfer.buf[index];
            self.transfer.index += 1;
            self.state_counter_us = 10_000;

            if self.transfer.index >= self.transfer.len {
                self.service = Service::Idle;
                self.flags.data_request = false;
                if self.backup_drive_sel != 0 {
                    self.drive_sel = self.backup_drive_sel;
                    self.backup_drive_sel = 0;
                }
            }
            return byte;
        }

        let mut byte = self.data_reg;
        self.flags.data_request = false;
        self.data_reg_read_count += 1;

        if self.wr_host_seq == HOST_SEQUENCE.len() {
            if self.rd_host_seq < HOST_SEQUENCE.len() {
                byte = HOST_SEQUENCE[self.rd_host_seq];
                self.rd_host_seq += 1;
            } else {
                self.wr_host_seq = 0;
                self.rd_host_seq = 0;
            }
        }

        byte
    }

    pub fn read_nmi_status(&mut self) -> u8 {
        self.nmi_status
    }

    /// Command register write: classify, reset status, then either
    /// execute synchronously (Force Interrupt) or flag the command for
    /// the service loop.
    ///
    /// Only one primary command can be outstanding: while one is in
    /// flight, further Type I-III writes are ignored. Force Interrupt
    /// and the host channel bypass the gate.
    pub fn write_command(&mut self, value: u8) {
        let host = self.drive_sel == HOST_SELECT;
        let force = value & 0xF0 == 0xD0;
        let in_flight = self.command_received || self.service != Service::Idle;
        if !host && !force && self.flags.busy && in_flight {
            return;
        }

        self.command_reg = value;
        self.command_type = self.classify_command(value);
        self.nmi_status = NMI_STATUS_IDLE;
        self.wr_host_seq = 0;
        self.flags = StatusFlags::default();

        if self.drive_sel == HOST_SELECT {
            self.command_received = true;
            self.flags.busy = true;
            self.flags.data_request = false;
        } else if value & 0xF0 == 0xD0 {
            // Force Interrupt: acts on the spot, terminating whatever
            // is in flight.
            self.command_type = CommandType::Type4;
            self.cache.read_count = 0;
            self.cache.write_count = 0;
            self.cur_command = value;
            self.intr_enable = value & 0x0F;
            self.service = Service::Idle;
            self.command_received = false;
            if value & 0x08 != 0 {
                self.generate_intr();
            }
        } else {
            self.command_received = true;
            self.flags.busy = true;
        }
    }

    fn classify_command(&self, command: u8) -> CommandType {
        if self.drive_sel == HOST_SELECT {
            return CommandType::Type2;
        }
        match command >> 4 {
            0x0..=0x7 => CommandType::Type1,
            0x8..=0xB => CommandType::Type2,
            0xD => CommandType::Type4,
            _ => CommandType::Type3,
        }
    }

    pub fn write_track_reg(&mut self, value: u8) {
        self.track_reg = value;
        self.wr_host_seq = 0;
    }

    pub fn write_sector_reg(&mut self, value: u8) {
        self.sector_reg = value;
        self.wr_host_seq = 0;
    }

    pub fn write_data(&mut self, value: u8) {
        self.data_reg = value;
        self.flags.data_request = false;
        host::detect_sequence(self, value);
    }

    /// NMI mask write. Bit 7 enables INTRQ propagation; clearing it
    /// also drops a pending interrupt.
    pub fn write_nmi_mask(&mut self, value: u8) {
        self.nmi_mask = value;
        if value & 0x80 == 0 {
            self.flags.intr_request = false;
        }
    }

    /// Drive select write: sentinel backup handling, WAIT arming (bit
    /// 6) and motor-on retrigger.
    pub fn write_drive_select(&mut self, value: u8) {
        if value & 0x0F == HOST_SELECT && self.backup_drive_sel == 0 {
            self.backup_drive_sel = self.drive_sel;
        }
        self.drive_sel = value;
        self.drv_sel_write_count += 1;

        // No wait while INTRQ is pending: the host is about to service
        // the completion, not transfer data.
        if !self.flags.intr_request && value & 0x40 != 0 {
            self.wait_timeout_us = WAIT_TIMEOUT_US;
            self.wait_output = true;
        }

        self.motor_timer_us = MOTOR_ON_US;
    }

    /// Reset line level, sampled by the background tick.
    pub fn set_reset_line(&mut self, low: bool) {
        self.reset_line_low = low;
    }

    // -----------------------------------------------------------------------
    // Outputs
    // -----------------------------------------------------------------------

    /// WAIT output: true while the bus should be stalled.
    #[must_use]
    pub fn wait_asserted(&self) -> bool {
        self.wait_output
    }

    /// INTRQ latch state.
    #[must_use]
    pub fn intr_pending(&self) -> bool {
        self.flags.intr_request
    }

    /// Take a pending NMI edge, if one was raised since the last call.
    pub fn take_nmi_pulse(&mut self) -> bool {
        std::mem::replace(&mut self.nmi_pulse, false)
    }

    #[must_use]
    pub fn drive(&self, index: usize) -> &DriveSlot {
        &self.drives[index]
    }

    /// Name of the active boot configuration file.
    #[must_use]
    pub fn boot_config(&self) -> &str {
        &self.boot_config
    }

    /// Real-time clock, seconds since 1980-01-01.
    #[must_use]
    pub fn rtc_seconds(&self) -> u32 {
        self.rtc_seconds
    }

    // -----------------------------------------------------------------------
    // Background loop
    // -----------------------------------------------------------------------

    /// One background iteration: advance the timers by `elapsed_us`,
    /// then run one step of the service state machine. This is the
    /// only entry point that performs storage I/O.
    pub fn tick(&mut self, elapsed_us: u32, storage: &mut dyn Storage) {
        self.advance_timers(elapsed_us);
        service::run(self, storage);
    }

    fn advance_timers(&mut self, dt: u32) {
        if self.wait_timeout_us > 0 {
            self.wait_timeout_us = self.wait_timeout_us.saturating_sub(dt);
            if self.wait_timeout_us == 0 {
                self.release_wait();
            }
        }

        if self.motor_timer_us > 0 {
            self.motor_timer_us = self.motor_timer_us.saturating_sub(dt);
            self.rotation_us = (self.rotation_us + dt) % ROTATION_US;
            self.flags.index = self.rotation_us < INDEX_US;
        }

        if self.reset_line_low {
            self.reset_accum_us = self.reset_accum_us.saturating_add(dt);
            if self.reset_accum_us >= RESET_PULSE_US {
                self.reset_pending = true;
            }
        } else {
            self.reset_accum_us = 0;
        }

        self.state_counter_us = self.state_counter_us.saturating_sub(dt);

        self.rtc_accum_us += dt;
        while self.rtc_accum_us >= 1_000_000 {
            self.rtc_accum_us -= 1_000_000;
            self.rtc_seconds = self.rtc_seconds.wrapping_add(1);
        }
    }

    // -----------------------------------------------------------------------
    // Internal
    // -----------------------------------------------------------------------

    /// Raise INTRQ: the NMI status latch shows the interrupt, WAIT is
    /// released, and an NMI edge fires if the mask enables it.
    pub(crate) fn generate_intr(&mut self) {
        self.nmi_status = NMI_STATUS_INTRQ;
        self.release_wait();
        if self.nmi_mask & 0x80 != 0 {
            self.flags.intr_request = true;
            self.nmi_pulse = true;
        }
    }

    /// Raise DRQ and release WAIT so the host can take the byte.
    pub(crate) fn generate_drq(&mut self) {
        self.flags.data_request = true;
        self.release_wait();
    }

    pub(crate) fn release_wait(&mut self) {
        self.wait_timeout_us = 0;
        self.wait_output = false;
    }

    /// Ensure the track cache holds the requested track of `drive`.
    pub(crate) fn load_track(
        &mut self,
        drive: usize,
        side: u8,
        track: u8,
        storage: &mut dyn Storage,
    ) -> bool {
        self.cache
            .load(drive, side, track, &self.drives[drive], storage)
    }
}

impl Default for Wd1793 {
    fn default() -> Self {
        Self::new()
    }
}
