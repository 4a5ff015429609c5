//! The per-session store handle and backend selection.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use strata_common::UnitIndex;

use crate::db::DbEnv;
use crate::error::StoreError;
use crate::record::Record;

/// Which persistence backend a session uses for unit records.
///
/// Both backends satisfy the same [`Record`] contract and produce
/// byte-identical payloads on read-back; the choice is a deployment concern
/// (many small files vs. one database file with compressed values).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BackendKind {
    /// One file per unit index under the session base directory.
    Files,
    /// A single shared LMDB environment with LZ4-compressed values.
    Database,
}

/// The per-session store: base directory, backend selection, and the
/// lazily-opened shared database environment.
///
/// One `Store` exists per session base directory. The database environment
/// is opened at most once, on first use; a failed open is remembered and
/// reported on every subsequent record handle rather than retried in a loop.
pub struct Store {
    base: PathBuf,
    kind: BackendKind,
    db: OnceLock<Result<DbEnv, String>>,
    writes: AtomicU64,
    reads: AtomicU64,
}

impl Store {
    /// Opens (creating if necessary) the store rooted at `base`.
    pub fn open(base: &Path, kind: BackendKind) -> Result<Self, StoreError> {
        std::fs::create_dir_all(base).map_err(|e| StoreError::Io {
            path: base.to_path_buf(),
            source: e,
        })?;
        Ok(Self {
            base: base.to_path_buf(),
            kind,
            db: OnceLock::new(),
            writes: AtomicU64::new(0),
            reads: AtomicU64::new(0),
        })
    }

    /// Returns the backend kind this store was opened with.
    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    /// Returns the session base directory.
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Returns the path of the legacy/flat file for a unit record.
    ///
    /// With the file backend this is the record itself; with the database
    /// backend it is only consulted by the one-time migration path.
    pub fn record_path(&self, index: UnitIndex) -> PathBuf {
        self.base.join(index.as_raw().to_string())
    }

    /// Creates a record handle for the given unit index. The handle is inert
    /// until [`Record::open`] is called.
    pub fn record(&self, index: UnitIndex) -> Record<'_> {
        Record::new(self, index)
    }

    /// Returns `true` if a record exists for the given index in the active
    /// backend (the database backend does not consult legacy files here).
    pub fn exists(&self, index: UnitIndex) -> bool {
        match self.kind {
            BackendKind::Files => self.record_path(index).exists(),
            BackendKind::Database => match self.db() {
                Ok(db) => db.contains(&Self::db_key(index)),
                Err(_) => false,
            },
        }
    }

    /// Removes the record for the given index. Returns `true` if a record
    /// was removed. With the database backend a leftover legacy file is
    /// removed as well.
    pub fn remove(&self, index: UnitIndex) -> bool {
        match self.kind {
            BackendKind::Files => std::fs::remove_file(self.record_path(index)).is_ok(),
            BackendKind::Database => {
                let removed = match self.db() {
                    Ok(db) => db.delete(&Self::db_key(index)).unwrap_or(false),
                    Err(reason) => {
                        log::warn!("cannot remove record {index}: {reason}");
                        false
                    }
                };
                let _ = std::fs::remove_file(self.record_path(index));
                removed
            }
        }
    }

    /// Forces durability of everything committed so far (database sync; the
    /// file backend relies on filesystem durability and reports success).
    pub fn flush(&self) -> bool {
        match self.kind {
            BackendKind::Files => true,
            BackendKind::Database => match self.db() {
                Ok(db) => db.sync(),
                Err(_) => false,
            },
        }
    }

    /// Number of record commits performed through this store. Serves as the
    /// observable proxy for "did storing actually write anything".
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub(crate) fn note_write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of record read-opens performed through this store. Lets tests
    /// verify that concurrent lazy loads hit the backend exactly once.
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub(crate) fn note_read(&self) {
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    /// The database key for a unit record (decimal ASCII of the index).
    pub(crate) fn db_key(index: UnitIndex) -> Vec<u8> {
        index.as_raw().to_string().into_bytes()
    }

    /// Returns the shared database environment, opening it on first use.
    /// The open happens at most once per store; concurrent first uses are
    /// serialized by the cell.
    pub(crate) fn db(&self) -> Result<&DbEnv, String> {
        let slot = self
            .db
            .get_or_init(|| DbEnv::open(&self.base).map_err(|e| e.to_string()));
        match slot {
            Ok(env) => Ok(env),
            Err(reason) => Err(reason.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Mode;

    fn file_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), BackendKind::Files).unwrap();
        (dir, store)
    }

    fn db_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), BackendKind::Database).unwrap();
        (dir, store)
    }

    fn write_record(store: &Store, index: u32, data: &[u8]) {
        let mut record = store.record(UnitIndex::from_raw(index));
        assert!(record.open(Mode::Write));
        assert_eq!(record.write(data), data.len());
        record.commit();
        assert!(record.error().is_none(), "{:?}", record.error());
    }

    fn read_record(store: &Store, index: u32) -> Vec<u8> {
        let mut record = store.record(UnitIndex::from_raw(index));
        assert!(record.open(Mode::Read));
        let data = record.read_all();
        record.commit();
        data
    }

    #[test]
    fn file_backend_roundtrip() {
        let (_dir, store) = file_store();
        write_record(&store, 3, b"scope table bytes");
        assert!(store.exists(UnitIndex::from_raw(3)));
        assert_eq!(read_record(&store, 3), b"scope table bytes");
    }

    #[test]
    fn db_backend_roundtrip() {
        let (_dir, store) = db_store();
        write_record(&store, 3, b"scope table bytes");
        assert!(store.exists(UnitIndex::from_raw(3)));
        assert_eq!(read_record(&store, 3), b"scope table bytes");
    }

    #[test]
    fn db_backend_large_value_roundtrip() {
        // Above the compression threshold; stored form may be compressed or
        // raw, read-back must be byte-identical either way.
        let (_dir, store) = db_store();
        let data: Vec<u8> = (0..50_000).map(|i| (i % 7) as u8).collect();
        write_record(&store, 9, &data);
        assert_eq!(read_record(&store, 9), data);
    }

    #[test]
    fn db_backend_incompressible_value_roundtrip() {
        let (_dir, store) = db_store();
        // A pseudo-random byte soup that LZ4 cannot shrink.
        let mut state = 0x9e37_79b9_u32;
        let data: Vec<u8> = (0..4096)
            .map(|_| {
                state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                (state >> 24) as u8
            })
            .collect();
        write_record(&store, 10, &data);
        assert_eq!(read_record(&store, 10), data);
    }

    #[test]
    fn missing_record_reads_empty() {
        let (_dir, store) = db_store();
        let mut record = store.record(UnitIndex::from_raw(42));
        assert!(!record.open(Mode::Read));
        assert!(record.error().is_some());
    }

    #[test]
    fn remove_deletes_record() {
        let (_dir, store) = db_store();
        write_record(&store, 5, b"payload");
        assert!(store.exists(UnitIndex::from_raw(5)));
        assert!(store.remove(UnitIndex::from_raw(5)));
        assert!(!store.exists(UnitIndex::from_raw(5)));
    }

    #[test]
    fn remove_missing_returns_false() {
        let (_dir, store) = file_store();
        assert!(!store.remove(UnitIndex::from_raw(99)));
    }

    #[test]
    fn write_count_advances_per_commit() {
        let (_dir, store) = db_store();
        assert_eq!(store.write_count(), 0);
        write_record(&store, 1, b"a");
        assert_eq!(store.write_count(), 1);
        write_record(&store, 2, b"b");
        assert_eq!(store.write_count(), 2);
    }

    #[test]
    fn migration_ingests_legacy_file() {
        let (_dir, store) = db_store();
        // A record written by the legacy file backend.
        std::fs::write(store.record_path(UnitIndex::from_raw(7)), b"legacy body").unwrap();

        assert_eq!(read_record(&store, 7), b"legacy body");
        // The legacy file is gone and the database now owns the record.
        assert!(!store.record_path(UnitIndex::from_raw(7)).exists());
        assert!(store.exists(UnitIndex::from_raw(7)));
    }

    #[test]
    fn overwrite_supersedes_record() {
        let (_dir, store) = db_store();
        write_record(&store, 4, b"first version");
        write_record(&store, 4, b"second version, longer than the first");
        assert_eq!(read_record(&store, 4), b"second version, longer than the first");
    }

    #[test]
    fn seek_and_partial_reads() {
        let (_dir, store) = file_store();
        write_record(&store, 11, b"0123456789");

        let mut record = store.record(UnitIndex::from_raw(11));
        assert!(record.open(Mode::Read));
        assert_eq!(record.read(4), b"0123");
        assert_eq!(record.pos(), 4);
        assert!(record.seek(8));
        assert_eq!(record.read_all(), b"89");
        record.commit();
    }
}
