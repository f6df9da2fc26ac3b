//! Disk image builders shared by the crate's test modules.

use format_dmk::{DmkGeometry, HEADER_LEN, IDAM_TABLE_LEN};
use format_hfe::flux::{mfm_write, FluxTrack};

/// Track record length used by [`build_dmk_image`].
pub const DMK_TRACK_LEN: u16 = 0x0C80;
/// Sectors per track in the built images (numbered from 1).
pub const SECTORS: u8 = 2;
/// Sector payload length (size code 1).
pub const SECTOR_LEN: usize = 256;

/// Deterministic payload fill byte for a (track, sector) pair.
#[must_use]
pub fn fill_byte(track: u8, sector: u8) -> u8 {
    0x40 + track.wrapping_mul(4) + sector
}

/// Build a DMK image with `SECTORS` valid 256-byte sectors per track.
#[must_use]
pub fn build_dmk_image(tracks: u8, sides: u8) -> Vec<u8> {
    let geo = DmkGeometry {
        write_protected: false,
        tracks,
        sides,
        track_len: DMK_TRACK_LEN,
        density: format_dmk::Density::Double,
        real_disk: false,
    };

    let mut image = geo.to_bytes().to_vec();
    for track in 0..tracks {
        for side in 0..sides {
            image.extend_from_slice(&build_dmk_track(track, side));
        }
    }
    assert_eq!(
        image.len(),
        HEADER_LEN + tracks as usize * sides as usize * DMK_TRACK_LEN as usize
    );
    image
}

fn build_dmk_track(track: u8, side: u8) -> Vec<u8> {
    let mut data = vec![0u8; IDAM_TABLE_LEN];

    for sector in 1..=SECTORS {
        data.extend_from_slice(&[0x4E; 8]);
        data.extend_from_slice(&[0xA1, 0xA1, 0xA1, 0xFE]);
        let fe = data.len() - 1;
        data.extend_from_slice(&[track, side, sector, 0x01]);
        let id_crc = crc_ccitt::crc16(&data[fe - 3..]);
        data.extend_from_slice(&id_crc.to_be_bytes());

        data.extend_from_slice(&[0x4E; 12]);
        let dam = data.len();
        data.extend_from_slice(&[0xA1, 0xA1, 0xA1, 0xFB]);
        data.extend_from_slice(&[fill_byte(track, sector); SECTOR_LEN]);
        let data_crc = crc_ccitt::crc16(&data[dam..]);
        data.extend_from_slice(&data_crc.to_be_bytes());

        let slot = usize::from(sector - 1);
        let entry = (fe as u16) | 0x8000;
        data[slot * 2..slot * 2 + 2].copy_from_slice(&entry.to_le_bytes());
    }

    data.resize(DMK_TRACK_LEN as usize, 0x4E);
    data
}

/// Flux bytes per HFE track record in [`build_hfe_image`] (two blocks).
pub const HFE_TRACK_LEN: u16 = 1024;

/// Build an MFM HFE image with one 128-byte sector (number 1) per
/// track on side 0.
#[must_use]
pub fn build_hfe_image(tracks: u8) -> Vec<u8> {
    let mut image = vec![0u8; format_hfe::BLOCK_LEN * 2];
    image[0..8].copy_from_slice(format_hfe::SIGNATURE);
    image[9] = tracks;
    image[10] = 1;
    image[11] = 0x00; // ISO MFM
    image[12..14].copy_from_slice(&250u16.to_le_bytes());
    image[14..16].copy_from_slice(&300u16.to_le_bytes());
    image[18..20].copy_from_slice(&1u16.to_le_bytes()); // LUT in block 1

    for track in 0..tracks {
        let block = 2 + u16::from(track) * 2;
        let lut = format_hfe::BLOCK_LEN + usize::from(track) * 4;
        image[lut..lut + 2].copy_from_slice(&block.to_le_bytes());
        image[lut + 2..lut + 4].copy_from_slice(&HFE_TRACK_LEN.to_le_bytes());
        image.extend_from_slice(&build_hfe_track(track));
    }

    image
}

fn build_hfe_track(track: u8) -> Vec<u8> {
    let mut flux = FluxTrack::new(vec![0u8; HFE_TRACK_LEN as usize], 0);
    let mut bitpos = 0usize;
    let mut prev = 0x4E;

    for _ in 0..8 {
        prev = mfm_write(&mut flux, &mut bitpos, 0x4E, 0, prev);
    }
    for _ in 0..3 {
        prev = mfm_write(&mut flux, &mut bitpos, 0xA1, 0x04, prev);
    }
    let id = [0xFE, track, 0x00, 0x01, 0x00]; // sector 1, 128 bytes
    for &b in &id {
        prev = mfm_write(&mut flux, &mut bitpos, b, 0, prev);
    }
    let mut crc_buf = vec![0xA1, 0xA1, 0xA1];
    crc_buf.extend_from_slice(&id);
    let crc = crc_ccitt::crc16(&crc_buf);
    prev = mfm_write(&mut flux, &mut bitpos, (crc >> 8) as u8, 0, prev);
    prev = mfm_write(&mut flux, &mut bitpos, (crc & 0xFF) as u8, 0, prev);

    for _ in 0..11 {
        prev = mfm_write(&mut flux, &mut bitpos, 0x4E, 0, prev);
    }
    for _ in 0..3 {
        prev = mfm_write(&mut flux, &mut bitpos, 0xA1, 0x04, prev);
    }
    prev = mfm_write(&mut flux, &mut bitpos, 0xFB, 0, prev);
    let mut data_buf = vec![0xA1, 0xA1, 0xA1, 0xFB];
    for _ in 0..128 {
        prev = mfm_write(&mut flux, &mut bitpos, 0xE5, 0, prev);
        data_buf.push(0xE5);
    }
    let crc = crc_ccitt::crc16(&data_buf);
    prev = mfm_write(&mut flux, &mut bitpos, (crc >> 8) as u8, 0, prev);
    let _ = mfm_write(&mut flux, &mut bitpos, (crc & 0xFF) as u8, 0, prev);

    flux.raw().to_vec()
}
