//! Storage collaborator interface.
//!
//! All file and directory access goes through [`Storage`]. The bus
//! responder never touches it; only the background service loop does.
//! Handles are slot indices like the firmware-style file table the
//! controller was designed against; a handle stays valid until closed.
//!
//! [`MemStorage`] is a complete in-memory implementation used by the
//! test suites and by hosts that stage images without a filesystem.

use crate::datetime::DateTime;

/// Open file handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileId(pub usize);

/// File open mode flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenMode {
    pub read: bool,
    pub write: bool,
    /// Truncate or create the file.
    pub create: bool,
}

impl OpenMode {
    #[must_use]
    pub fn read() -> Self {
        Self {
            read: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn read_write() -> Self {
        Self {
            read: true,
            write: true,
            create: false,
        }
    }

    #[must_use]
    pub fn create() -> Self {
        Self {
            read: false,
            write: true,
            create: true,
        }
    }
}

/// One directory listing entry.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub size: u32,
    pub modified: DateTime,
}

/// Block storage and filesystem access, supplied by the host.
///
/// Name lookup is case-insensitive, matching the FAT volumes the images
/// live on. Reads and writes advance an internal position that `seek`
/// repositions. Implementations report transient failures as short
/// reads/writes or a `None` open result; the controller degrades the
/// affected drive to not-ready rather than propagating errors.
pub trait Storage {
    fn open(&mut self, name: &str, mode: OpenMode) -> Option<FileId>;
    fn close(&mut self, id: FileId);
    fn read(&mut self, id: FileId, buf: &mut [u8]) -> usize;
    fn write(&mut self, id: FileId, data: &[u8]) -> usize;
    fn seek(&mut self, id: FileId, pos: u64);
    fn flush(&mut self, _id: FileId) {}
    fn exists(&mut self, name: &str) -> bool;
    /// Snapshot of the volume root (files only).
    fn list_dir(&mut self) -> Vec<DirEntry>;
    /// Whether the removable medium is inserted and initialised.
    fn media_present(&mut self) -> bool {
        true
    }
}

/// Read a whole file through a [`Storage`] implementation.
pub fn read_all(storage: &mut dyn Storage, name: &str) -> Option<Vec<u8>> {
    let id = storage.open(name, OpenMode::read())?;
    let mut out = Vec::new();
    let mut chunk = [0u8; 256];
    loop {
        let n = storage.read(id, &mut chunk);
        out.extend_from_slice(&chunk[..n]);
        if n < chunk.len() {
            break;
        }
    }
    storage.close(id);
    Some(out)
}

struct MemOpenFile {
    name: String,
    pos: usize,
    writable: bool,
}

/// In-memory filesystem with FAT-style case-insensitive names.
#[derive(Default)]
pub struct MemStorage {
    files: Vec<(String, Vec<u8>, DateTime)>,
    open: Vec<Option<MemOpenFile>>,
    removed: bool,
}

impl MemStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or replace a file.
    pub fn put_file(&mut self, name: &str, data: Vec<u8>) {
        self.put_file_dated(name, data, DateTime::default());
    }

    pub fn put_file_dated(&mut self, name: &str, data: Vec<u8>, modified: DateTime) {
        if let Some(slot) = self.lookup(name) {
            self.files[slot].1 = data;
            self.files[slot].2 = modified;
        } else {
            self.files.push((name.to_string(), data, modified));
        }
    }

    #[must_use]
    pub fn file(&self, name: &str) -> Option<&[u8]> {
        self.files
            .iter()
            .find(|(n, _, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, d, _)| d.as_slice())
    }

    /// Simulate removing or inserting the medium.
    pub fn set_present(&mut self, present: bool) {
        self.removed = !present;
    }

    fn lookup(&self, name: &str) -> Option<usize> {
        self.files
            .iter()
            .position(|(n, _, _)| n.eq_ignore_ascii_case(name))
    }
}

impl Storage for MemStorage {
    fn open(&mut self, name: &str, mode: OpenMode) -> Option<FileId> {
        if self.removed {
            return None;
        }
        let slot = match self.lookup(name) {
            Some(slot) => {
                if mode.create {
                    self.files[slot].1.clear();
                }
                slot
            }
            None if mode.create => {
                self.files
                    .push((name.to_string(), Vec::new(), DateTime::default()));
                self.files.len() - 1
            }
            None => return None,
        };

        let name = self.files[slot].0.clone();
        let handle = MemOpenFile {
            name,
            pos: 0,
            writable: mode.write,
        };
        if let Some(free) = self.open.iter().position(Option::is_none) {
            self.open[free] = Some(handle);
            Some(FileId(free))
        } else {
            self.open.push(Some(handle));
            Some(FileId(self.open.len() - 1))
        }
    }

    fn close(&mut self, id: FileId) {
        if let Some(slot) = self.open.get_mut(id.0) {
            *slot = None;
        }
    }

    fn read(&mut self, id: FileId, buf: &mut [u8]) -> usize {
        let Some(Some(handle)) = self.open.get_mut(id.0) else {
            return 0;
        };
        let Some(slot) = self
            .files
            .iter()
            .position(|(n, _, _)| n.eq_ignore_ascii_case(&handle.name))
        else {
            return 0;
        };
        let data = &self.files[slot].1;
        let start = handle.pos.min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        handle.pos = start + n;
        n
    }

    fn write(&mut self, id: FileId, data: &[u8]) -> usize {
        let Some(Some(handle)) = self.open.get_mut(id.0) else {
            return 0;
        };
        if !handle.writable {
            return 0;
        }
        let Some(slot) = self
            .files
            .iter()
            .position(|(n, _, _)| n.eq_ignore_ascii_case(&handle.name))
        else {
            return 0;
        };
        let file = &mut self.files[slot].1;
        let end = handle.pos + data.len();
        if file.len() < end {
            file.resize(end, 0);
        }
        file[handle.pos..end].copy_from_slice(data);
        handle.pos = end;
        data.len()
    }

    fn seek(&mut self, id: FileId, pos: u64) {
        if let Some(Some(handle)) = self.open.get_mut(id.0) {
            handle.pos = pos as usize;
        }
    }

    fn exists(&mut self, name: &str) -> bool {
        !self.removed && self.lookup(name).is_some()
    }

    fn list_dir(&mut self) -> Vec<DirEntry> {
        if self.removed {
            return Vec::new();
        }
        self.files
            .iter()
            .map(|(name, data, modified)| DirEntry {
                name: name.clone(),
                size: data.len() as u32,
                modified: *modified,
            })
            .collect()
    }

    fn media_present(&mut self) -> bool {
        !self.removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_read_write_seek() {
        let mut fs = MemStorage::new();
        fs.put_file("disk.dmk", vec![1, 2, 3, 4, 5]);

        let id = fs.open("DISK.DMK", OpenMode::read_write()).expect("opens");
        let mut buf = [0u8; 2];
        assert_eq!(fs.read(id, &mut buf), 2);
        assert_eq!(buf, [1, 2]);

        fs.seek(id, 4);
        assert_eq!(fs.write(id, &[9, 9]), 2);
        fs.close(id);

        assert_eq!(fs.file("disk.dmk").expect("file exists"), &[1, 2, 3, 4, 9, 9]);
    }

    #[test]
    fn create_truncates() {
        let mut fs = MemStorage::new();
        fs.put_file("a.txt", vec![1, 2, 3]);
        let id = fs.open("a.txt", OpenMode::create()).expect("opens");
        fs.write(id, &[7]);
        fs.close(id);
        assert_eq!(fs.file("a.txt").expect("file exists"), &[7]);
    }

    #[test]
    fn missing_file_does_not_open() {
        let mut fs = MemStorage::new();
        assert!(fs.open("nope.bin", OpenMode::read()).is_none());
        assert!(!fs.exists("nope.bin"));
    }

    #[test]
    fn media_removal_blocks_access() {
        let mut fs = MemStorage::new();
        fs.put_file("x", vec![0]);
        fs.set_present(false);
        assert!(!fs.media_present());
        assert!(fs.open("x", OpenMode::read()).is_none());
        assert!(fs.list_dir().is_empty());
    }

    #[test]
    fn read_all_crosses_chunks() {
        let mut fs = MemStorage::new();
        let data: Vec<u8> = (0..600).map(|i| (i % 251) as u8).collect();
        fs.put_file("big.bin", data.clone());
        assert_eq!(read_all(&mut fs, "big.bin").expect("reads"), data);
    }
}
