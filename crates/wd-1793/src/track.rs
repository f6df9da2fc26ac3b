//! Single-track cache.
//!
//! Capacity is exactly one decoded track. The cache is valid only when
//! its identity matches the requested (drive, side, track) triple; any
//! mismatch refills it from the codec, and there is no other eviction.
//! Both codecs leave the same shape behind: raw track bytes plus the
//! two mark offset tables indexed by logical sector number, so the
//! command and service layers never ask which format is mounted.

use crate::drive::{DriveSlot, Geometry};
use crate::storage::Storage;
use format_dmk::SECTOR_SLOTS;
use format_hfe::{Encoding, FluxTrack};

pub const MAX_TRACK_LEN: usize = format_dmk::MAX_TRACK_LEN;

pub struct TrackCache {
    identity: Option<(usize, u8, u8)>,
    pub(crate) data: Vec<u8>,
    pub(crate) size: usize,
    /// Offset of this track record in the image file (DMK only).
    pub(crate) file_offset: u64,
    pub(crate) idam: [Option<usize>; SECTOR_SLOTS],
    pub(crate) dam: [Option<usize>; SECTOR_SLOTS],

    // Byte transfer cursors for the service state machine.
    pub(crate) read_pos: usize,
    pub(crate) read_count: usize,
    pub(crate) write_pos: usize,
    pub(crate) write_count: usize,
}

impl Default for TrackCache {
    fn default() -> Self {
        Self {
            identity: None,
            data: vec![0; MAX_TRACK_LEN],
            size: 0,
            file_offset: 0,
            idam: [None; SECTOR_SLOTS],
            dam: [None; SECTOR_SLOTS],
            read_pos: 0,
            read_count: 0,
            write_pos: 0,
            write_count: 0,
        }
    }
}

impl TrackCache {
    pub fn invalidate(&mut self) {
        self.identity = None;
    }

    #[must_use]
    pub fn matches(&self, drive: usize, side: u8, track: u8) -> bool {
        self.identity == Some((drive, side, track))
    }

    #[must_use]
    pub(crate) fn identity(&self) -> Option<(usize, u8, u8)> {
        self.identity
    }

    pub(crate) fn set_identity(&mut self, drive: usize, side: u8, track: u8) {
        self.identity = Some((drive, side, track));
    }

    /// IDAM offset of the physically first sector on the track.
    #[must_use]
    pub fn first_idam(&self) -> Option<usize> {
        self.idam.iter().flatten().copied().min()
    }

    /// Ensure the cache holds (drive, side, track), refilling from the
    /// image via the matching codec on a miss. Returns false when the
    /// drive is unmounted or the track is unreadable.
    pub(crate) fn load(
        &mut self,
        drive: usize,
        side: u8,
        track: u8,
        slot: &DriveSlot,
        storage: &mut dyn Storage,
    ) -> bool {
        if self.matches(drive, side, track) {
            return true;
        }

        let Some(file) = slot.file else {
            return false;
        };

        match &slot.geometry {
            Geometry::None => false,
            Geometry::Dmk(geo) => {
                let len = geo.track_len as usize;
                let offset = geo.track_offset(track, side) as u64;
                storage.seek(file, offset);
                if storage.read(file, &mut self.data[..len]) != len {
                    self.invalidate();
                    return false;
                }

                self.size = len;
                self.file_offset = offset;
                format_dmk::fill_mark_tables(
                    &self.data[..len],
                    track,
                    side,
                    &mut self.idam,
                    &mut self.dam,
                );
                self.identity = Some((drive, side, track));
                true
            }
            Geometry::Hfe { header, lut } => {
                let Some(entry) = lut.get(track as usize) else {
                    self.invalidate();
                    return false;
                };
                let flux_len = entry.len as usize;
                let mut raw = vec![0u8; flux_len];
                storage.seek(file, u64::from(entry.offset) * format_hfe::BLOCK_LEN as u64);
                if storage.read(file, &mut raw) != flux_len {
                    self.invalidate();
                    return false;
                }

                let flux = FluxTrack::new(raw, side);
                let decoded = format_hfe::decode_track(&flux, header.encoding, MAX_TRACK_LEN);
                let bits_per_byte = match header.encoding {
                    Encoding::IsoMfm => 16,
                    Encoding::IsoFm => 32,
                };
                // Per side: half the flux bytes, then the cell rate.
                self.size = (flux_len * 8 / 2 / bits_per_byte).min(MAX_TRACK_LEN);
                self.data[..decoded.data.len().min(MAX_TRACK_LEN)]
                    .copy_from_slice(&decoded.data[..decoded.data.len().min(MAX_TRACK_LEN)]);
                self.idam = decoded.idam;
                self.dam = decoded.dam;
                self.file_offset = 0;
                self.identity = Some((drive, side, track));
                true
            }
        }
    }
}
