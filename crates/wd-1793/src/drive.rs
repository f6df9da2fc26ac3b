//! Drive slots and image mounting.
//!
//! Four drive slots, selected by the low nibble of the drive-select
//! latch (one bit per drive). A slot binds an open image file to its
//! parsed geometry; the image format is chosen by file extension. A
//! failed mount leaves the slot empty and the drive reports not-ready.

use crate::storage::{FileId, OpenMode, Storage};
use format_dmk::DmkGeometry;
use format_hfe::{HfeHeader, TrackEntry, BLOCK_LEN, MAX_TRACKS};

/// Format-specific drive geometry.
pub enum Geometry {
    None,
    Dmk(DmkGeometry),
    Hfe {
        header: HfeHeader,
        lut: Vec<TrackEntry>,
    },
}

/// One mounted (or empty) drive.
pub struct DriveSlot {
    pub(crate) file: Option<FileId>,
    pub(crate) file_name: String,
    pub(crate) geometry: Geometry,
}

impl Default for DriveSlot {
    fn default() -> Self {
        Self {
            file: None,
            file_name: String::new(),
            geometry: Geometry::None,
        }
    }
}

impl DriveSlot {
    #[must_use]
    pub fn mounted(&self) -> bool {
        self.file.is_some() && !matches!(self.geometry, Geometry::None)
    }

    #[must_use]
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Track count of the mounted image (0 when empty).
    #[must_use]
    pub fn tracks(&self) -> u8 {
        match &self.geometry {
            Geometry::None => 0,
            Geometry::Dmk(geo) => geo.tracks,
            Geometry::Hfe { header, .. } => header.tracks,
        }
    }

    /// HFE media is always treated as protected: the flux write-back
    /// path is not wired to storage.
    #[must_use]
    pub fn write_protected(&self) -> bool {
        match &self.geometry {
            Geometry::None => false,
            Geometry::Dmk(geo) => geo.write_protected,
            Geometry::Hfe { .. } => true,
        }
    }

    /// Close the image file and forget the geometry and name.
    pub(crate) fn clear(&mut self, storage: &mut dyn Storage) {
        if let Some(id) = self.file.take() {
            storage.close(id);
        }
        self.file_name.clear();
        self.geometry = Geometry::None;
    }

    /// Close the image file but keep the name for a later remount.
    pub(crate) fn unmount(&mut self, storage: &mut dyn Storage) {
        if let Some(id) = self.file.take() {
            storage.close(id);
        }
        self.geometry = Geometry::None;
    }
}

/// Mount the image named in the slot. The format is picked by file
/// extension; anything else leaves the slot unmounted.
pub(crate) fn mount(slot: &mut DriveSlot, storage: &mut dyn Storage) {
    slot.unmount(storage);

    let name = slot.file_name.to_ascii_lowercase();
    if name.ends_with(".dmk") {
        mount_dmk(slot, storage);
    } else if name.ends_with(".hfe") {
        mount_hfe(slot, storage);
    }
}

fn mount_dmk(slot: &mut DriveSlot, storage: &mut dyn Storage) {
    let Some(id) = storage.open(&slot.file_name, OpenMode::read_write()) else {
        return;
    };

    let mut header = [0u8; format_dmk::HEADER_LEN];
    if storage.read(id, &mut header) != header.len() {
        storage.close(id);
        return;
    }

    match DmkGeometry::parse(&header) {
        Ok(geo) => {
            slot.file = Some(id);
            slot.geometry = Geometry::Dmk(geo);
        }
        Err(_) => storage.close(id),
    }
}

fn mount_hfe(slot: &mut DriveSlot, storage: &mut dyn Storage) {
    let Some(id) = storage.open(&slot.file_name, OpenMode::read_write()) else {
        return;
    };

    let mut block = [0u8; BLOCK_LEN];
    if storage.read(id, &mut block) != block.len() {
        storage.close(id);
        return;
    }

    let header = match HfeHeader::parse(&block) {
        Ok(h) => h,
        Err(_) => {
            storage.close(id);
            return;
        }
    };

    storage.seek(id, u64::from(header.track_list_offset) * BLOCK_LEN as u64);
    let mut lut_raw = [0u8; MAX_TRACKS * 4];
    let wanted = (header.tracks as usize).min(MAX_TRACKS) * 4;
    if storage.read(id, &mut lut_raw[..wanted]) != wanted {
        storage.close(id);
        return;
    }

    match format_hfe::parse_track_lut(&lut_raw[..wanted], header.tracks.min(MAX_TRACKS as u8)) {
        Ok(lut) => {
            slot.file = Some(id);
            slot.geometry = Geometry::Hfe { header, lut };
        }
        Err(_) => storage.close(id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemStorage;

    fn dmk_image(tracks: u8, track_len: u16) -> Vec<u8> {
        let geo = DmkGeometry {
            write_protected: false,
            tracks,
            sides: 1,
            track_len,
            density: format_dmk::Density::Double,
            real_disk: false,
        };
        let mut image = geo.to_bytes().to_vec();
        image.resize(
            format_dmk::HEADER_LEN + tracks as usize * track_len as usize,
            0,
        );
        image
    }

    #[test]
    fn mount_dmk_by_extension() {
        let mut fs = MemStorage::new();
        fs.put_file("boot.dmk", dmk_image(40, 0x0C80));

        let mut slot = DriveSlot {
            file_name: "BOOT.DMK".to_string(),
            ..DriveSlot::default()
        };
        mount(&mut slot, &mut fs);
        assert!(slot.mounted());
        assert_eq!(slot.tracks(), 40);
        assert!(!slot.write_protected());
    }

    #[test]
    fn mount_missing_file_stays_empty() {
        let mut fs = MemStorage::new();
        let mut slot = DriveSlot {
            file_name: "gone.dmk".to_string(),
            ..DriveSlot::default()
        };
        mount(&mut slot, &mut fs);
        assert!(!slot.mounted());
        assert_eq!(slot.tracks(), 0);
    }

    #[test]
    fn mount_bad_header_closes_file() {
        let mut fs = MemStorage::new();
        fs.put_file("bad.dmk", vec![0u8; 8]); // truncated header
        let mut slot = DriveSlot {
            file_name: "bad.dmk".to_string(),
            ..DriveSlot::default()
        };
        mount(&mut slot, &mut fs);
        assert!(!slot.mounted());
    }

    #[test]
    fn hfe_mount_reads_lut_and_protects() {
        let mut fs = MemStorage::new();
        let mut image = vec![0u8; BLOCK_LEN * 2];
        image[0..8].copy_from_slice(format_hfe::SIGNATURE);
        image[9] = 2; // tracks
        image[10] = 1;
        image[11] = 0x00; // ISO MFM
        image[18..20].copy_from_slice(&1u16.to_le_bytes()); // LUT in block 1
        // LUT: track 0 at block 2, 512 bytes; track 1 at block 3.
        image[BLOCK_LEN..BLOCK_LEN + 2].copy_from_slice(&2u16.to_le_bytes());
        image[BLOCK_LEN + 2..BLOCK_LEN + 4].copy_from_slice(&512u16.to_le_bytes());
        image[BLOCK_LEN + 4..BLOCK_LEN + 6].copy_from_slice(&3u16.to_le_bytes());
        image[BLOCK_LEN + 6..BLOCK_LEN + 8].copy_from_slice(&512u16.to_le_bytes());
        fs.put_file("flux.hfe", image);

        let mut slot = DriveSlot {
            file_name: "flux.hfe".to_string(),
            ..DriveSlot::default()
        };
        mount(&mut slot, &mut fs);
        assert!(slot.mounted());
        assert_eq!(slot.tracks(), 2);
        assert!(slot.write_protected(), "HFE drives report protected");
        match &slot.geometry {
            Geometry::Hfe { lut, .. } => {
                assert_eq!(lut[1].offset, 3);
                assert_eq!(lut[1].len, 512);
            }
            _ => panic!("expected HFE geometry"),
        }
    }
}
