//! The file-per-key record backend.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use memmap2::{Mmap, MmapOptions};

use crate::record::Mode;

/// State of an open file-backend record: one plain file named by the unit
/// index. `commit` closes the handle; there is no compression.
pub(crate) struct FileRecord {
    path: PathBuf,
    file: Option<File>,
    mode: Mode,
}

impl FileRecord {
    pub(crate) fn open(path: PathBuf, mode: Mode) -> Result<Self, String> {
        let file = match mode {
            Mode::Read => File::open(&path),
            Mode::Write => OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path),
        };
        match file {
            Ok(file) => Ok(Self {
                path,
                file: Some(file),
                mode,
            }),
            Err(e) => Err(format!("cannot open {}: {e}", path.display())),
        }
    }

    pub(crate) fn read(&mut self, max: usize) -> Vec<u8> {
        let Some(file) = self.file.as_mut() else {
            return Vec::new();
        };
        let mut buf = vec![0_u8; max];
        let mut filled = 0;
        while filled < max {
            match file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(_) => break,
            }
        }
        buf.truncate(filled);
        buf
    }

    pub(crate) fn read_all(&mut self) -> Vec<u8> {
        let Some(file) = self.file.as_mut() else {
            return Vec::new();
        };
        let mut buf = Vec::new();
        let _ = file.read_to_end(&mut buf);
        buf
    }

    pub(crate) fn write(&mut self, data: &[u8]) -> usize {
        if self.mode != Mode::Write {
            return 0;
        }
        match self.file.as_mut() {
            Some(file) => match file.write_all(data) {
                Ok(()) => data.len(),
                Err(_) => 0,
            },
            None => 0,
        }
    }

    pub(crate) fn pos(&mut self) -> u64 {
        self.file
            .as_mut()
            .and_then(|f| f.stream_position().ok())
            .unwrap_or(0)
    }

    pub(crate) fn seek(&mut self, pos: u64) -> bool {
        self.file
            .as_mut()
            .map(|f| f.seek(SeekFrom::Start(pos)).is_ok())
            .unwrap_or(false)
    }

    pub(crate) fn size(&mut self) -> u64 {
        self.file
            .as_ref()
            .and_then(|f| f.metadata().ok())
            .map(|m| m.len())
            .unwrap_or(0)
    }

    /// Memory-maps the unread remainder of the file (from the current
    /// position to the end). Returns `None` for empty remainders or on any
    /// mapping failure; callers fall back to [`read_all`](Self::read_all).
    pub(crate) fn map_remaining(&mut self) -> Option<Mmap> {
        let offset = self.pos();
        let len = self.size().checked_sub(offset)?;
        if len == 0 {
            return None;
        }
        let file = self.file.as_ref()?;
        // SAFETY: the record file is exclusively owned by the session that
        // wrote it and is superseded (rewritten under a fresh handle), never
        // mutated in place, so the mapping stays stable for its lifetime.
        let map = unsafe {
            MmapOptions::new()
                .offset(offset)
                .len(len as usize)
                .map(file)
        };
        match map {
            Ok(map) => Some(map),
            Err(e) => {
                log::debug!("failed to map {}: {e}", self.path.display());
                None
            }
        }
    }

    pub(crate) fn commit(&mut self) {
        // Closing the handle is all a finalized file write needs.
        self.file = None;
    }

    pub(crate) fn flush(&mut self) -> bool {
        match self.file.as_mut() {
            Some(file) => file.sync_all().is_ok(),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("1");

        let mut rec = FileRecord::open(path.clone(), Mode::Write).unwrap();
        assert_eq!(rec.write(b"hello"), 5);
        rec.commit();

        let mut rec = FileRecord::open(path, Mode::Read).unwrap();
        assert_eq!(rec.read_all(), b"hello");
    }

    #[test]
    fn open_missing_for_read_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(FileRecord::open(dir.path().join("absent"), Mode::Read).is_err());
    }

    #[test]
    fn read_ignores_write_calls() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("2");
        std::fs::write(&path, b"data").unwrap();

        let mut rec = FileRecord::open(path, Mode::Read).unwrap();
        assert_eq!(rec.write(b"nope"), 0);
        assert_eq!(rec.read_all(), b"data");
    }

    #[test]
    fn map_remaining_covers_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("3");
        std::fs::write(&path, b"headertailbytes").unwrap();

        let mut rec = FileRecord::open(path, Mode::Read).unwrap();
        assert_eq!(rec.read(6), b"header");
        let map = rec.map_remaining().unwrap();
        assert_eq!(&map[..], b"tailbytes");
    }

    #[test]
    fn map_remaining_empty_tail_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("4");
        std::fs::write(&path, b"all").unwrap();

        let mut rec = FileRecord::open(path, Mode::Read).unwrap();
        let _ = rec.read_all();
        assert!(rec.map_remaining().is_none());
    }
}
