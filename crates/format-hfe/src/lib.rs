//! HFE (HxC Floppy Emulator) image codec.
//!
//! An HFE file stores tracks as raw flux bitstreams. The file begins
//! with a 512-byte header block, followed by a track lookup table (one
//! `(offset, length)` pair per track, offsets in 512-byte blocks), then
//! the track data. Within a track the two sides are interleaved in
//! 256-byte half-blocks: each 512-byte block holds 256 bytes of side 0
//! followed by 256 bytes of side 1.
//!
//! Decoding scans the bitstream for the MFM sync word $4489 (an $A1
//! with a missing clock bit) or, on FM media, the equivalent clock/data
//! composites. Three sync bytes followed by $FE mark an ID field;
//! followed by $FB/$F8 they mark a data field. The decoder assembles
//! the same byte-level track buffer and per-sector mark offset tables
//! the DMK codec produces, so the controller is format-agnostic.

pub mod flux;

pub use flux::FluxTrack;

pub const SIGNATURE: &[u8; 8] = b"HXCPICFE";
pub const BLOCK_LEN: usize = 512;
pub const MAX_TRACKS: usize = 80;
pub const MAX_SECTORS_PER_TRACK: usize = 32;
/// Logical sector slots in the decoded mark tables (matches the DMK
/// pointer table capacity).
pub const SECTOR_SLOTS: usize = 128;

/// MFM flux image of an $A1 sync byte with the missing clock bit.
pub const MFM_SYNC: u16 = 0x4489;

/// FM clock/data composites for the address mark bytes (32 flux bits
/// per byte at the HFE sampling rate).
pub const FM_MARK_FE: u32 = 0x5511_1554;
pub const FM_MARK_FB: u32 = 0x5511_1455;
pub const FM_MARK_F8: u32 = 0x5511_1444;

/// Track encoding modes this codec understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    IsoMfm,
    IsoFm,
}

/// Parsed HFE file header (first bytes of block 0).
#[derive(Debug, Clone)]
pub struct HfeHeader {
    pub tracks: u8,
    pub sides: u8,
    pub encoding: Encoding,
    /// Bit rate in kbit/s (250 for DD media).
    pub bit_rate: u16,
    pub rpm: u16,
    pub interface_mode: u8,
    /// Offset of the track lookup table, in 512-byte blocks.
    pub track_list_offset: u16,
    pub write_allowed: bool,
}

impl HfeHeader {
    /// Parse the file header.
    ///
    /// # Errors
    ///
    /// Returns an error string on a bad signature, an unsupported track
    /// encoding, or a truncated header.
    pub fn parse(data: &[u8]) -> Result<Self, String> {
        if data.len() < 26 {
            return Err("HFE header too short".to_string());
        }
        if &data[0..8] != SIGNATURE {
            return Err("not an HFE file (bad signature)".to_string());
        }

        let encoding = match data[11] {
            0x00 => Encoding::IsoMfm,
            0x02 => Encoding::IsoFm,
            other => return Err(format!("unsupported HFE track encoding {other:#04x}")),
        };

        Ok(Self {
            tracks: data[9],
            sides: data[10],
            encoding,
            bit_rate: u16::from_le_bytes([data[12], data[13]]),
            rpm: u16::from_le_bytes([data[14], data[15]]),
            interface_mode: data[16],
            track_list_offset: u16::from_le_bytes([data[18], data[19]]),
            write_allowed: data[20] != 0,
        })
    }
}

/// One track lookup table entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrackEntry {
    /// Offset of the track data, in 512-byte blocks.
    pub offset: u16,
    /// Length of the track data in bytes (both sides, interleaved).
    pub len: u16,
}

/// Parse the track lookup table: 4 bytes per track, little endian.
///
/// # Errors
///
/// Returns an error string if the table is truncated or oversized.
pub fn parse_track_lut(data: &[u8], tracks: u8) -> Result<Vec<TrackEntry>, String> {
    let count = tracks as usize;
    if count > MAX_TRACKS {
        return Err(format!("HFE track count {count} exceeds maximum"));
    }
    if data.len() < count * 4 {
        return Err("HFE track lookup table truncated".to_string());
    }
    Ok((0..count)
        .map(|i| TrackEntry {
            offset: u16::from_le_bytes([data[i * 4], data[i * 4 + 1]]),
            len: u16::from_le_bytes([data[i * 4 + 2], data[i * 4 + 3]]),
        })
        .collect())
}

/// A track decoded to the byte level: raw track bytes plus the two
/// parallel mark offset tables, indexed by logical sector number. IDAM
/// offsets address the $FE mark byte; DAM offsets address the first $A1
/// (or synthesized $A1 on FM media) of the data mark sequence.
pub struct DecodedTrack {
    pub data: Vec<u8>,
    pub idam: [Option<usize>; SECTOR_SLOTS],
    pub dam: [Option<usize>; SECTOR_SLOTS],
    /// Number of complete sectors (ID field plus data field) found.
    pub sectors: usize,
}

/// Decode one side of a flux track into track bytes and mark tables.
///
/// The decoder free-runs a shift register over the bitstream looking
/// for sync marks; a mark prefix that does not complete rewinds to the
/// detection point and resumes the scan one bit later.
#[must_use]
pub fn decode_track(flux: &FluxTrack, encoding: Encoding, max_len: usize) -> DecodedTrack {
    match encoding {
        Encoding::IsoMfm => decode_mfm(flux, max_len),
        Encoding::IsoFm => decode_fm(flux, max_len),
    }
}

fn decode_mfm(flux: &FluxTrack, max_len: usize) -> DecodedTrack {
    let mut out = DecodedTrack {
        data: vec![0; max_len],
        idam: [None; SECTOR_SLOTS],
        dam: [None; SECTOR_SLOTS],
        sectors: 0,
    };

    let flux_bits = flux.bit_len();
    let mut bitpos = 0usize;
    let mut shift = 0u32;
    let mut sector_size = 0usize;
    let mut last_sector: Option<usize> = None;

    while bitpos < flux_bits && out.sectors < MAX_SECTORS_PER_TRACK {
        shift = (shift << 1) | u32::from(flux.bit(bitpos));
        bitpos += 1;

        if shift as u16 != MFM_SYNC {
            continue;
        }

        let resync = bitpos;
        let mut window = shift as u16;
        let mut mark = flux::read_byte_mfm(flux, &mut bitpos, &mut window);
        let mut sync_run = 0;
        while mark == 0xA1 && sync_run < 3 {
            sync_run += 1;
            mark = flux::read_byte_mfm(flux, &mut bitpos, &mut window);
        }

        if sync_run == 3 && mark == 0xFE {
            // ID field. Four sync/mark bytes were consumed since the
            // first $A1 started, so its byte position is 4 back.
            let Some(byte_pos) = (bitpos / 16).checked_sub(4) else {
                continue;
            };
            if byte_pos + 10 > max_len {
                break;
            }
            out.data[byte_pos..byte_pos + 4].copy_from_slice(&[0xA1, 0xA1, 0xA1, 0xFE]);
            for i in 0..6 {
                out.data[byte_pos + 4 + i] = flux::read_byte_mfm(flux, &mut bitpos, &mut window);
            }

            let sector = out.data[byte_pos + 6] as usize;
            sector_size = 128 << (out.data[byte_pos + 7] & 0x03);
            last_sector = (sector < SECTOR_SLOTS).then_some(sector);
            if let Some(slot) = last_sector {
                out.idam[slot] = Some(byte_pos + 3);
            }
        } else if sync_run == 3 && (mark == 0xFB || mark == 0xF8) {
            let Some(byte_pos) = (bitpos / 16).checked_sub(4) else {
                continue;
            };
            let Some(slot) = last_sector.take() else {
                // Data field with no preceding ID field; keep scanning.
                continue;
            };
            if byte_pos + 4 + sector_size + 2 > max_len {
                break;
            }
            out.data[byte_pos..byte_pos + 3].copy_from_slice(&[0xA1, 0xA1, 0xA1]);
            out.data[byte_pos + 3] = mark;
            for i in 0..sector_size + 2 {
                out.data[byte_pos + 4 + i] = flux::read_byte_mfm(flux, &mut bitpos, &mut window);
            }
            out.dam[slot] = Some(byte_pos);
            out.sectors += 1;
        } else {
            // False sync; resume the bit scan where detection left off.
            bitpos = resync;
        }

        shift = u32::from(window);
    }

    out
}

fn decode_fm(flux: &FluxTrack, max_len: usize) -> DecodedTrack {
    let mut out = DecodedTrack {
        data: vec![0; max_len],
        idam: [None; SECTOR_SLOTS],
        dam: [None; SECTOR_SLOTS],
        sectors: 0,
    };

    let flux_bits = flux.bit_len();
    let mut bitpos = 0usize;
    let mut shift = 0u32;
    let mut sector_size = 0usize;
    let mut last_sector: Option<usize> = None;

    while bitpos < flux_bits && out.sectors < MAX_SECTORS_PER_TRACK {
        shift = (shift << 1) | u32::from(flux.bit(bitpos));
        bitpos += 1;

        // FM address marks carry their identity in the clock pattern;
        // there is no separate sync run to match.
        if shift == FM_MARK_FE {
            // Synthesize the sync-prefixed layout the controller expects.
            let Some(byte_pos) = (bitpos / 32).checked_sub(4) else {
                continue;
            };
            if byte_pos + 10 > max_len {
                break;
            }
            out.data[byte_pos..byte_pos + 4].copy_from_slice(&[0xA1, 0xA1, 0xA1, 0xFE]);
            for i in 0..6 {
                out.data[byte_pos + 4 + i] = flux::read_byte_fm(flux, &mut bitpos);
            }

            let sector = out.data[byte_pos + 6] as usize;
            sector_size = 128 << (out.data[byte_pos + 7] & 0x03);
            last_sector = (sector < SECTOR_SLOTS).then_some(sector);
            if let Some(slot) = last_sector {
                out.idam[slot] = Some(byte_pos + 3);
            }
            shift = 0;
        } else if shift == FM_MARK_FB || shift == FM_MARK_F8 {
            let mark = if shift == FM_MARK_FB { 0xFB } else { 0xF8 };
            let Some(byte_pos) = (bitpos / 32).checked_sub(4) else {
                continue;
            };
            let Some(slot) = last_sector.take() else {
                continue;
            };
            if byte_pos + 4 + sector_size + 2 > max_len {
                break;
            }
            out.data[byte_pos..byte_pos + 3].copy_from_slice(&[0xA1, 0xA1, 0xA1]);
            out.data[byte_pos + 3] = mark;
            for i in 0..sector_size + 2 {
                out.data[byte_pos + 4 + i] = flux::read_byte_fm(flux, &mut bitpos);
            }
            out.dam[slot] = Some(byte_pos);
            out.sectors += 1;
            shift = 0;
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flux::{fm_write, mfm_write};

    /// Skip-clock mask that turns a written $A1 into the $4489 sync word.
    const SYNC_SKIP: u8 = 0x04;

    fn mfm_sector(flux: &mut FluxTrack, bitpos: &mut usize, t: u8, s: u8, sec: u8, fill: u8) {
        let mut prev = 0x4E;
        for _ in 0..8 {
            prev = mfm_write(flux, bitpos, 0x4E, 0, prev);
        }

        // ID field.
        for _ in 0..3 {
            prev = mfm_write(flux, bitpos, 0xA1, SYNC_SKIP, prev);
        }
        let id = [0xFE, t, s, sec, 0x01];
        for &b in &id {
            prev = mfm_write(flux, bitpos, b, 0, prev);
        }
        let mut crc_buf = vec![0xA1, 0xA1, 0xA1];
        crc_buf.extend_from_slice(&id);
        let crc = crc_ccitt::crc16(&crc_buf);
        prev = mfm_write(flux, bitpos, (crc >> 8) as u8, 0, prev);
        prev = mfm_write(flux, bitpos, (crc & 0xFF) as u8, 0, prev);

        for _ in 0..11 {
            prev = mfm_write(flux, bitpos, 0x4E, 0, prev);
        }

        // Data field.
        for _ in 0..3 {
            prev = mfm_write(flux, bitpos, 0xA1, SYNC_SKIP, prev);
        }
        prev = mfm_write(flux, bitpos, 0xFB, 0, prev);
        let mut data_buf = vec![0xA1, 0xA1, 0xA1, 0xFB];
        for _ in 0..256 {
            prev = mfm_write(flux, bitpos, fill, 0, prev);
            data_buf.push(fill);
        }
        let crc = crc_ccitt::crc16(&data_buf);
        prev = mfm_write(flux, bitpos, (crc >> 8) as u8, 0, prev);
        let _ = mfm_write(flux, bitpos, (crc & 0xFF) as u8, 0, prev);
    }

    fn make_mfm_flux() -> FluxTrack {
        let mut flux = FluxTrack::new(vec![0u8; 0x4000], 0);
        let mut bitpos = 0usize;
        mfm_sector(&mut flux, &mut bitpos, 2, 0, 1, 0xAA);
        mfm_sector(&mut flux, &mut bitpos, 2, 0, 2, 0xBB);
        flux
    }

    #[test]
    fn parse_header_fields() {
        let mut h = vec![0u8; 64];
        h[0..8].copy_from_slice(SIGNATURE);
        h[9] = 40; // tracks
        h[10] = 2; // sides
        h[11] = 0x00; // ISO MFM
        h[12..14].copy_from_slice(&250u16.to_le_bytes());
        h[14..16].copy_from_slice(&300u16.to_le_bytes());
        h[18..20].copy_from_slice(&1u16.to_le_bytes());
        h[20] = 0xFF;
        let hdr = HfeHeader::parse(&h).expect("header parses");
        assert_eq!(hdr.tracks, 40);
        assert_eq!(hdr.sides, 2);
        assert_eq!(hdr.encoding, Encoding::IsoMfm);
        assert_eq!(hdr.bit_rate, 250);
        assert_eq!(hdr.track_list_offset, 1);
        assert!(hdr.write_allowed);
    }

    #[test]
    fn bad_signature_rejected() {
        let h = vec![0u8; 64];
        assert!(HfeHeader::parse(&h).is_err());
    }

    #[test]
    fn track_lut_roundtrip() {
        let mut lut = vec![0u8; 16];
        lut[0..2].copy_from_slice(&2u16.to_le_bytes());
        lut[2..4].copy_from_slice(&0x3000u16.to_le_bytes());
        lut[4..6].copy_from_slice(&0x1Au16.to_le_bytes());
        lut[6..8].copy_from_slice(&0x3000u16.to_le_bytes());
        let entries = parse_track_lut(&lut, 2).expect("LUT parses");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].offset, 2);
        assert_eq!(entries[1].offset, 0x1A);
        assert_eq!(entries[1].len, 0x3000);
    }

    #[test]
    fn decode_finds_sectors_in_order() {
        let flux = make_mfm_flux();
        let decoded = decode_track(&flux, Encoding::IsoMfm, 0x4000);
        assert_eq!(decoded.sectors, 2);

        let idam1 = decoded.idam[1].expect("sector 1 found");
        let idam2 = decoded.idam[2].expect("sector 2 found");
        assert!(idam2 > idam1, "marks in ascending track order");
        assert!(decoded.idam[3].is_none());

        // IDAM offsets address the $FE byte, like the DMK tables.
        assert_eq!(decoded.data[idam1], 0xFE);
        assert_eq!(decoded.data[idam1 + 1], 2, "track in ID field");
        assert_eq!(decoded.data[idam1 + 3], 1, "sector in ID field");
    }

    #[test]
    fn decode_recovers_payload() {
        let flux = make_mfm_flux();
        let decoded = decode_track(&flux, Encoding::IsoMfm, 0x4000);
        let dam = decoded.dam[1].expect("sector 1 data found");
        assert_eq!(decoded.data[dam + 3], 0xFB);
        assert_eq!(decoded.data[dam + 4], 0xAA);
        assert_eq!(decoded.data[dam + 4 + 255], 0xAA);

        let dam2 = decoded.dam[2].expect("sector 2 data found");
        assert_eq!(decoded.data[dam2 + 4], 0xBB);
    }

    #[test]
    fn decoded_crc_bytes_match_encoded(){
        // The two CRC bytes captured after the payload must be the ones
        // the fixture computed, proving decode did not lose bit sync.
        let flux = make_mfm_flux();
        let decoded = decode_track(&flux, Encoding::IsoMfm, 0x4000);
        let dam = decoded.dam[1].expect("sector 1 data found");
        let mut buf = vec![0xA1, 0xA1, 0xA1, 0xFB];
        buf.extend_from_slice(&[0xAA; 256]);
        let crc = crc_ccitt::crc16(&buf);
        assert_eq!(decoded.data[dam + 4 + 256], (crc >> 8) as u8);
        assert_eq!(decoded.data[dam + 4 + 257], (crc & 0xFF) as u8);
    }

    #[test]
    fn data_mark_without_id_is_skipped() {
        let mut flux = FluxTrack::new(vec![0u8; 0x2000], 0);
        let mut bitpos = 0usize;
        let mut prev = 0x4E;
        for _ in 0..8 {
            prev = mfm_write(&mut flux, &mut bitpos, 0x4E, 0, prev);
        }
        for _ in 0..3 {
            prev = mfm_write(&mut flux, &mut bitpos, 0xA1, SYNC_SKIP, prev);
        }
        prev = mfm_write(&mut flux, &mut bitpos, 0xFB, 0, prev);
        for _ in 0..64 {
            prev = mfm_write(&mut flux, &mut bitpos, 0x55, 0, prev);
        }
        let decoded = decode_track(&flux, Encoding::IsoMfm, 0x2000);
        assert_eq!(decoded.sectors, 0);
        assert!(decoded.dam.iter().all(Option::is_none));
    }

    #[test]
    fn decode_fm_sector() {
        let mut flux = FluxTrack::new(vec![0u8; 0x4000], 0);
        let mut bitpos = 0usize;
        for _ in 0..8 {
            fm_write(&mut flux, &mut bitpos, 0xFF, 0xFF);
        }
        for _ in 0..6 {
            fm_write(&mut flux, &mut bitpos, 0x00, 0xFF);
        }
        // FM IDAM: $FE with clock $C7.
        fm_write(&mut flux, &mut bitpos, 0xFE, 0xC7);
        for &b in &[0x01u8, 0x00, 0x03, 0x00] {
            fm_write(&mut flux, &mut bitpos, b, 0xFF);
        }
        fm_write(&mut flux, &mut bitpos, 0x12, 0xFF); // CRC placeholder
        fm_write(&mut flux, &mut bitpos, 0x34, 0xFF);
        for _ in 0..6 {
            fm_write(&mut flux, &mut bitpos, 0x00, 0xFF);
        }
        // FM DAM: $FB with clock $C7, then 128 payload bytes.
        fm_write(&mut flux, &mut bitpos, 0xFB, 0xC7);
        for _ in 0..128 {
            fm_write(&mut flux, &mut bitpos, 0xE5, 0xFF);
        }
        fm_write(&mut flux, &mut bitpos, 0x56, 0xFF);
        fm_write(&mut flux, &mut bitpos, 0x78, 0xFF);

        let decoded = decode_track(&flux, Encoding::IsoFm, 0x4000);
        assert_eq!(decoded.sectors, 1);
        let idam = decoded.idam[3].expect("sector 3 found");
        assert_eq!(decoded.data[idam], 0xFE);
        assert_eq!(decoded.data[idam + 1], 0x01, "track");
        assert_eq!(decoded.data[idam + 4], 0x00, "size code 0 = 128 bytes");
        let dam = decoded.dam[3].expect("data field found");
        assert_eq!(decoded.data[dam + 3], 0xFB);
        assert_eq!(decoded.data[dam + 4], 0xE5);
        assert_eq!(decoded.data[dam + 4 + 128], 0x56, "CRC high byte follows payload");
    }
}
