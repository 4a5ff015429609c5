//! The backend-independent record handle.

use memmap2::Mmap;
use strata_common::UnitIndex;

use crate::db::DbRecord;
use crate::file::FileRecord;
use crate::store::{BackendKind, Store};

/// How a record is being accessed.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Mode {
    /// Read an existing record.
    Read,
    /// Write a fresh record, superseding any previous one.
    Write,
}

enum Inner<'s> {
    Closed,
    File(FileRecord),
    Db(DbRecord<'s>),
}

/// A handle to one unit record in the backend store.
///
/// Obtained from [`Store::record`], then driven through
/// `open / read / write / seek / commit`. Failures do not panic and do not
/// poison the store: they are retained as an error string on the handle
/// (see [`error`](Self::error)) and subsequent operations degrade to empty
/// reads or ignored writes, so callers can skip the affected unit and
/// continue.
pub struct Record<'s> {
    store: &'s Store,
    index: UnitIndex,
    mode: Option<Mode>,
    inner: Inner<'s>,
    error: Option<String>,
}

impl<'s> Record<'s> {
    pub(crate) fn new(store: &'s Store, index: UnitIndex) -> Self {
        Self {
            store,
            index,
            mode: None,
            inner: Inner::Closed,
            error: None,
        }
    }

    /// The unit index this record belongs to.
    pub fn index(&self) -> UnitIndex {
        self.index
    }

    /// Opens the record for reading or writing. Returns `false` (with the
    /// reason retained on the handle) if the record cannot be opened.
    pub fn open(&mut self, mode: Mode) -> bool {
        self.error = None;
        let opened = match self.store.kind() {
            BackendKind::Files => {
                FileRecord::open(self.store.record_path(self.index), mode).map(Inner::File)
            }
            BackendKind::Database => {
                DbRecord::open(self.store, self.index, mode).map(Inner::Db)
            }
        };
        match opened {
            Ok(inner) => {
                self.inner = inner;
                self.mode = Some(mode);
                if mode == Mode::Read {
                    self.store.note_read();
                }
                true
            }
            Err(reason) => {
                self.inner = Inner::Closed;
                self.mode = None;
                self.error = Some(reason);
                false
            }
        }
    }

    /// Reads up to `max` bytes from the current position.
    pub fn read(&mut self, max: usize) -> Vec<u8> {
        match &mut self.inner {
            Inner::Closed => Vec::new(),
            Inner::File(rec) => rec.read(max),
            Inner::Db(rec) => rec.read(max),
        }
    }

    /// Reads everything from the current position to the end.
    pub fn read_all(&mut self) -> Vec<u8> {
        match &mut self.inner {
            Inner::Closed => Vec::new(),
            Inner::File(rec) => rec.read_all(),
            Inner::Db(rec) => rec.read_all(),
        }
    }

    /// Reads a little-endian `u32`, or `None` if four bytes are not there.
    pub fn read_u32(&mut self) -> Option<u32> {
        let bytes = self.read(4);
        Some(u32::from_le_bytes(bytes.try_into().ok()?))
    }

    /// Appends bytes to the record body. Returns the number of bytes
    /// accepted (0 when not open for writing).
    pub fn write(&mut self, data: &[u8]) -> usize {
        match &mut self.inner {
            Inner::Closed => 0,
            Inner::File(rec) => rec.write(data),
            Inner::Db(rec) => rec.write(data),
        }
    }

    /// Writes a little-endian `u32`.
    pub fn write_u32(&mut self, value: u32) -> usize {
        self.write(&value.to_le_bytes())
    }

    /// Current read/write position.
    pub fn pos(&mut self) -> u64 {
        match &mut self.inner {
            Inner::Closed => 0,
            Inner::File(rec) => rec.pos(),
            Inner::Db(rec) => rec.pos(),
        }
    }

    /// Repositions the read cursor. Returns `false` when out of range.
    pub fn seek(&mut self, pos: u64) -> bool {
        match &mut self.inner {
            Inner::Closed => false,
            Inner::File(rec) => rec.seek(pos),
            Inner::Db(rec) => rec.seek(pos),
        }
    }

    /// Total size of the record body.
    pub fn size(&mut self) -> u64 {
        match &mut self.inner {
            Inner::Closed => 0,
            Inner::File(rec) => rec.size(),
            Inner::Db(rec) => rec.size(),
        }
    }

    /// Memory-maps the unread tail of the record. Only the file backend can
    /// map; the database backend returns `None` and callers read instead.
    pub fn map_remaining(&mut self) -> Option<Mmap> {
        match &mut self.inner {
            Inner::File(rec) => rec.map_remaining(),
            _ => None,
        }
    }

    /// Finalizes the handle: completes a write (the new record atomically
    /// supersedes the old one) or releases a read. The handle is closed
    /// afterwards.
    pub fn commit(&mut self) {
        let mode = self.mode;
        match &mut self.inner {
            Inner::Closed => {}
            Inner::File(rec) => {
                rec.commit();
                if mode == Some(Mode::Write) {
                    self.store.note_write();
                }
            }
            Inner::Db(rec) => match rec.commit() {
                Ok(()) => {
                    if mode == Some(Mode::Write) {
                        self.store.note_write();
                    }
                }
                Err(reason) => self.error = Some(reason),
            },
        }
        self.inner = Inner::Closed;
        self.mode = None;
    }

    /// Forces durability of the backend (database sync / file sync).
    pub fn flush(&mut self) -> bool {
        match &mut self.inner {
            Inner::Closed => true,
            Inner::File(rec) => rec.flush(),
            Inner::Db(rec) => rec.flush(),
        }
    }

    /// The retained error of the most recent failed operation, if any.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }
}
