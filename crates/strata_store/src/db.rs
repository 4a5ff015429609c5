//! The transactional database backend: one LMDB environment per session,
//! LZ4-compressed values, map growth, and legacy-file migration.

use std::path::Path;
use std::sync::Mutex;

use heed3::types::Bytes;
use heed3::{CompactionOption, Database, EnvFlags, EnvOpenOptions};

use strata_common::UnitIndex;

use crate::error::StoreError;
use crate::record::Mode;
use crate::store::Store;

/// Initial database map size: 64 MiB, doubled on demand.
const INITIAL_MAP_SIZE: usize = 64 * 1024 * 1024;

/// Named databases reserved for the index namespaces.
const MAX_NAMED_DBS: u32 = 4;

/// Values at or below this size are never compressed.
const COMPRESS_THRESHOLD: usize = 16;

/// Size of the `[u32 original][u32 compressed]` framing header.
const FRAME_HEADER: usize = 8;

/// The shared LMDB environment of one session, opened lazily exactly once.
pub(crate) struct DbEnv {
    env: heed3::Env,
    main: Database<Bytes, Bytes>,
    map_size: Mutex<usize>,
}

impl DbEnv {
    /// Opens the environment in the session base directory.
    ///
    /// The environment is opened with `NO_SYNC`: integrity is maintained
    /// across crashes, only the final transactions may be lost, which is
    /// acceptable for a cache of self-generated data. [`sync`](Self::sync)
    /// forces durability at cleanup time.
    pub(crate) fn open(base: &Path) -> Result<Self, StoreError> {
        let existing = std::fs::metadata(base.join("data.mdb"))
            .map(|m| m.len() as usize)
            .unwrap_or(0);
        let map_size = round_to_page(existing.max(INITIAL_MAP_SIZE));

        let mut options = EnvOpenOptions::new();
        options.map_size(map_size).max_dbs(MAX_NAMED_DBS);
        // SAFETY: NO_SYNC only relaxes durability of the final transactions;
        // it cannot corrupt the database or produce torn reads.
        unsafe {
            options.flags(EnvFlags::NO_SYNC);
        }
        // SAFETY: the session directory is process-exclusive; no other code
        // in this process maps the same environment file.
        let env = unsafe { options.open(base)? };

        let mut wtxn = env.write_txn()?;
        let main: Database<Bytes, Bytes> = env.create_database(&mut wtxn, None)?;
        wtxn.commit()?;

        log::debug!("opened record database at {} (map {map_size} B)", base.display());
        Ok(Self {
            env,
            main,
            map_size: Mutex::new(map_size),
        })
    }

    pub(crate) fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let rtxn = self.env.read_txn()?;
        Ok(self.main.get(&rtxn, key)?.map(<[u8]>::to_vec))
    }

    /// Stores a value, doubling the map size and retrying when the map is
    /// full (the backend cannot shrink an existing map, so growth is the
    /// only direction).
    pub(crate) fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        loop {
            match self.try_put(key, value) {
                Err(heed3::Error::Mdb(heed3::MdbError::MapFull)) => self.grow()?,
                other => return other.map_err(StoreError::from),
            }
        }
    }

    fn try_put(&self, key: &[u8], value: &[u8]) -> Result<(), heed3::Error> {
        let mut wtxn = self.env.write_txn()?;
        self.main.put(&mut wtxn, key, value)?;
        wtxn.commit()
    }

    fn grow(&self) -> Result<(), StoreError> {
        let mut size = self.map_size.lock().unwrap();
        *size *= 2;
        log::debug!("growing record database map to {} B", *size);
        // SAFETY: resizing is only reachable from the write path, which the
        // store-wide write lock serializes; no transaction of ours is active.
        unsafe { self.env.resize(*size)? };
        Ok(())
    }

    pub(crate) fn delete(&self, key: &[u8]) -> Result<bool, StoreError> {
        let mut wtxn = self.env.write_txn()?;
        let removed = self.main.delete(&mut wtxn, key)?;
        wtxn.commit()?;
        Ok(removed)
    }

    pub(crate) fn contains(&self, key: &[u8]) -> bool {
        let Ok(rtxn) = self.env.read_txn() else {
            return false;
        };
        matches!(self.main.get(&rtxn, key), Ok(Some(_)))
    }

    pub(crate) fn sync(&self) -> bool {
        match self.env.force_sync() {
            Ok(()) => true,
            Err(e) => {
                log::warn!("database sync failed: {e}");
                false
            }
        }
    }

    pub(crate) fn env(&self) -> &heed3::Env {
        &self.env
    }
}

fn round_to_page(size: usize) -> usize {
    (size + 0xFFF) & !0xFFF
}

/// Compresses a value for storage.
///
/// Values above the threshold are LZ4-compressed behind an 8-byte framing
/// header holding the original and compressed sizes; the compressed form is
/// used only when it is actually smaller than the raw form plus the header.
pub(crate) fn compress_value(raw: &[u8]) -> Vec<u8> {
    if raw.len() > COMPRESS_THRESHOLD {
        let compressed = lz4_flex::block::compress(raw);
        if compressed.len() + FRAME_HEADER < raw.len() {
            let mut out = Vec::with_capacity(FRAME_HEADER + compressed.len());
            out.extend_from_slice(&(raw.len() as u32).to_le_bytes());
            out.extend_from_slice(&(compressed.len() as u32).to_le_bytes());
            out.extend_from_slice(&compressed);
            return out;
        }
        log::debug!(
            "compression not worthwhile: {} raw vs {} compressed",
            raw.len(),
            compressed.len()
        );
    }
    raw.to_vec()
}

/// Reverses [`compress_value`]. A framing header is only possible when the
/// stored value exceeds 8 bytes; anything that does not parse and decompress
/// cleanly is treated as a raw value.
pub(crate) fn decompress_value(stored: &[u8]) -> Vec<u8> {
    if stored.len() > FRAME_HEADER {
        let original = u32::from_le_bytes(stored[0..4].try_into().unwrap()) as usize;
        let compressed = u32::from_le_bytes(stored[4..8].try_into().unwrap()) as usize;
        if original > 0 && compressed == stored.len() - FRAME_HEADER {
            if let Ok(out) = lz4_flex::block::decompress(&stored[FRAME_HEADER..], original) {
                if out.len() == original {
                    return out;
                }
            }
        }
    }
    stored.to_vec()
}

/// State of an open database-backend record. Reads cache the (decompressed)
/// value on first access; writes buffer into `value` and compress + store on
/// `commit`.
pub(crate) struct DbRecord<'s> {
    store: &'s Store,
    index: UnitIndex,
    key: Vec<u8>,
    mode: Mode,
    value: Vec<u8>,
    cursor: usize,
    loaded: bool,
}

impl<'s> DbRecord<'s> {
    pub(crate) fn open(store: &'s Store, index: UnitIndex, mode: Mode) -> Result<Self, String> {
        let db = store.db()?;
        let key = Store::db_key(index);

        let mut record = Self {
            store,
            index,
            key,
            mode,
            value: Vec::new(),
            cursor: 0,
            loaded: false,
        };

        if mode == Mode::Read && !db.contains(&record.key) {
            if !record.migrate_from_file()? {
                return Err(format!("no record #{index} in database"));
            }
        }
        Ok(record)
    }

    /// One-time migration: a read miss in the database falls back to the
    /// legacy per-file store, ingests the content, and deletes the file.
    fn migrate_from_file(&mut self) -> Result<bool, String> {
        let path = self.store.record_path(self.index);
        let content = match std::fs::read(&path) {
            Ok(content) => content,
            Err(_) => return Ok(false),
        };
        log::debug!("migrating legacy record {}", path.display());

        let db = self.store.db()?;
        db.put(&self.key, &compress_value(&content))
            .map_err(|e| e.to_string())?;
        let _ = std::fs::remove_file(&path);

        self.value = content;
        self.cursor = 0;
        self.loaded = true;
        Ok(true)
    }

    /// Fetches and decompresses the stored value on first access.
    fn ensure_value(&mut self) -> Result<(), String> {
        if self.loaded {
            return Ok(());
        }
        let db = self.store.db()?;
        match db.get(&self.key).map_err(|e| e.to_string())? {
            Some(stored) => {
                self.value = decompress_value(&stored);
                self.cursor = 0;
                self.loaded = true;
                Ok(())
            }
            None => Err(format!("record #{} vanished while reading", self.index)),
        }
    }

    pub(crate) fn read(&mut self, max: usize) -> Vec<u8> {
        if self.mode != Mode::Read || self.ensure_value().is_err() {
            return Vec::new();
        }
        let end = (self.cursor + max).min(self.value.len());
        let out = self.value[self.cursor..end].to_vec();
        self.cursor = end;
        out
    }

    pub(crate) fn read_all(&mut self) -> Vec<u8> {
        if self.mode != Mode::Read || self.ensure_value().is_err() {
            return Vec::new();
        }
        let out = self.value[self.cursor..].to_vec();
        self.cursor = self.value.len();
        out
    }

    pub(crate) fn write(&mut self, data: &[u8]) -> usize {
        if self.mode != Mode::Write {
            return 0;
        }
        self.value.extend_from_slice(data);
        data.len()
    }

    pub(crate) fn pos(&self) -> u64 {
        self.cursor as u64
    }

    pub(crate) fn seek(&mut self, pos: u64) -> bool {
        if self.mode == Mode::Read && self.ensure_value().is_err() {
            return false;
        }
        if pos as usize <= self.value.len() {
            self.cursor = pos as usize;
            true
        } else {
            false
        }
    }

    pub(crate) fn size(&mut self) -> u64 {
        if self.mode == Mode::Read {
            let _ = self.ensure_value();
        }
        self.value.len() as u64
    }

    pub(crate) fn commit(&mut self) -> Result<(), String> {
        if self.mode != Mode::Write {
            // Releasing a read just drops the cached value.
            self.value = Vec::new();
            self.cursor = 0;
            self.loaded = false;
            return Ok(());
        }
        let db = self.store.db()?;
        let stored = compress_value(&self.value);
        db.put(&self.key, &stored).map_err(|e| e.to_string())?;
        self.value = Vec::new();
        self.cursor = 0;
        Ok(())
    }

    pub(crate) fn flush(&mut self) -> bool {
        match self.store.db() {
            Ok(db) => db.sync(),
            Err(_) => false,
        }
    }
}

/// Compacts the database of a closed session directory in place.
///
/// Copies the environment with compaction into a sibling file, swaps it over
/// the original, and returns the number of bytes reclaimed. Requires that no
/// live environment is open on the directory; the shutdown path calls this
/// after the store has been dropped. Degrades to 0 reclaimed on any failure.
pub fn compact(base: &Path) -> Result<u64, StoreError> {
    let data = base.join("data.mdb");
    let before = match std::fs::metadata(&data) {
        Ok(meta) => meta.len(),
        Err(_) => return Ok(0),
    };

    let mut options = EnvOpenOptions::new();
    options
        .map_size(round_to_page(before as usize))
        .max_dbs(MAX_NAMED_DBS);
    // SAFETY: the caller guarantees the session store is closed; nothing
    // else in this process maps the environment file.
    let env = match unsafe { options.open(base) } {
        Ok(env) => env,
        Err(e) => {
            log::warn!("compaction skipped, cannot reopen {}: {e}", base.display());
            return Ok(0);
        }
    };

    let tmp = base.join("data.mdb.compact");
    env.copy_to_path(&tmp, CompactionOption::Enabled)?;
    drop(env);

    let after = std::fs::metadata(&tmp).map(|m| m.len()).unwrap_or(before);
    std::fs::rename(&tmp, &data).map_err(|e| StoreError::Io {
        path: data,
        source: e,
    })?;
    Ok(before.saturating_sub(after))
}
