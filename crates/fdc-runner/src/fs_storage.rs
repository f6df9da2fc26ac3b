//! Filesystem-backed storage collaborator.
//!
//! Presents one directory as the removable volume the controller sees.
//! Names are matched case-insensitively, like the FAT volumes real
//! images ship on.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use wd_1793::datetime;
use wd_1793::storage::{DirEntry, FileId, OpenMode, Storage};

/// Seconds between the Unix epoch and 1980-01-01 (the FDC clock zero).
const EPOCH_1980: u64 = 315_532_800;

pub struct FsStorage {
    root: PathBuf,
    open: Vec<Option<File>>,
}

impl FsStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            open: Vec::new(),
        }
    }

    /// Resolve a volume name to a path, matching case-insensitively
    /// against the directory contents.
    fn resolve(&self, name: &str) -> PathBuf {
        let direct = self.root.join(name);
        if direct.exists() {
            return direct;
        }
        if let Ok(entries) = std::fs::read_dir(&self.root) {
            for entry in entries.flatten() {
                if entry.file_name().to_string_lossy().eq_ignore_ascii_case(name) {
                    return entry.path();
                }
            }
        }
        direct
    }

    fn file_mut(&mut self, id: FileId) -> Option<&mut File> {
        self.open.get_mut(id.0).and_then(Option::as_mut)
    }
}

fn modified_datetime(path: &Path) -> datetime::DateTime {
    let unix = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_secs());
    datetime::code_datetime(unix.saturating_sub(EPOCH_1980) as u32)
}

impl Storage for FsStorage {
    fn open(&mut self, name: &str, mode: OpenMode) -> Option<FileId> {
        let path = self.resolve(name);
        let file = OpenOptions::new()
            .read(mode.read || !mode.create)
            .write(mode.write)
            .create(mode.create)
            .truncate(mode.create)
            .open(path)
            .ok()?;

        let slot = self.open.iter().position(Option::is_none);
        match slot {
            Some(i) => {
                self.open[i] = Some(file);
                Some(FileId(i))
            }
            None => {
                self.open.push(Some(file));
                Some(FileId(self.open.len() - 1))
            }
        }
    }

    fn close(&mut self, id: FileId) {
        if let Some(slot) = self.open.get_mut(id.0) {
            *slot = None;
        }
    }

    fn read(&mut self, id: FileId, buf: &mut [u8]) -> usize {
        let Some(file) = self.file_mut(id) else {
            return 0;
        };
        let mut total = 0;
        while total < buf.len() {
            match file.read(&mut buf[total..]) {
                Ok(0) | Err(_) => break,
                Ok(n) => total += n,
            }
        }
        total
    }

    fn write(&mut self, id: FileId, data: &[u8]) -> usize {
        self.file_mut(id)
            .and_then(|f| f.write(data).ok())
            .unwrap_or(0)
    }

    fn seek(&mut self, id: FileId, pos: u64) {
        if let Some(file) = self.file_mut(id) {
            let _ = file.seek(SeekFrom::Start(pos));
        }
    }

    fn flush(&mut self, id: FileId) {
        if let Some(file) = self.file_mut(id) {
            let _ = file.flush();
        }
    }

    fn exists(&mut self, name: &str) -> bool {
        self.resolve(name).exists()
    }

    fn list_dir(&mut self) -> Vec<DirEntry> {
        let Ok(entries) = std::fs::read_dir(&self.root) else {
            return Vec::new();
        };
        entries
            .flatten()
            .filter(|e| e.path().is_file())
            .map(|e| DirEntry {
                name: e.file_name().to_string_lossy().into_owned(),
                size: e.metadata().map_or(0, |m| m.len() as u32),
                modified: modified_datetime(&e.path()),
            })
            .collect()
    }
}
