//! Environment records and the two on-disk environment indices.
//!
//! An environment record is the lightweight identity/freshness metadata of a
//! unit: enough to decide "is this the right unit for this path and parsing
//! configuration" and to walk the import graph during cleanup, without ever
//! touching the unit's payload. Records live in two index namespaces layered
//! over the backend store: `env-lists` maps a file path to the unit indices
//! known for it, `env-info` maps a unit index to its record.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use strata_common::{ContentHash, UnitIndex};
use strata_lock::WriteGuard;
use strata_store::{IndexStore, Store};

/// How many records a soft store-all pass writes between write-lock yields.
const STORE_BATCH: usize = 100;

/// The persisted identity/freshness metadata of one unit.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct EnvRecord {
    /// The unit this record describes.
    pub unit: UnitIndex,
    /// Path of the source file the unit was parsed from.
    pub path: String,
    /// `true` for a lightweight include-proxy unit, `false` for a full
    /// content unit. One file may have both.
    pub proxy: bool,
    /// Feature-completeness flags the unit was parsed with.
    pub features: u32,
    /// Content hash of the source at parse time (staleness input).
    pub content_hash: ContentHash,
    /// Set by the scheduler when the unit is known to be out of date.
    pub stale: bool,
    /// Import summary used by cleanup without loading the unit.
    pub imports: Vec<UnitIndex>,
    /// Importer summary (reverse edges) used by cleanup.
    pub importers: Vec<UnitIndex>,
}

impl EnvRecord {
    /// Whether this unit needs a reparse before it can be trusted.
    pub fn needs_update(&self) -> bool {
        self.stale
    }
}

/// A loaded environment record with its dirty flag.
///
/// Entries are shared (`Arc`) between the manager's two in-memory maps and
/// the registry's per-unit attachment; the cleanup pass scavenges entries
/// whose only remaining holders are the manager maps themselves.
pub struct EnvEntry {
    record: Mutex<EnvRecord>,
    dirty: AtomicBool,
}

impl EnvEntry {
    fn new(record: EnvRecord, dirty: bool) -> Arc<Self> {
        Arc::new(Self {
            record: Mutex::new(record),
            dirty: AtomicBool::new(dirty),
        })
    }

    /// A snapshot of the record.
    pub fn record(&self) -> EnvRecord {
        self.record.lock().unwrap().clone()
    }

    /// The unit this entry describes.
    pub fn unit(&self) -> UnitIndex {
        self.record.lock().unwrap().unit
    }

    /// The path this entry describes.
    pub fn path(&self) -> String {
        self.record.lock().unwrap().path.clone()
    }

    /// Whether the entry describes an include-proxy unit.
    pub fn is_proxy(&self) -> bool {
        self.record.lock().unwrap().proxy
    }

    /// Whether the described unit is known to be out of date.
    pub fn needs_update(&self) -> bool {
        self.record.lock().unwrap().stale
    }

    /// Mutates the record and marks the entry dirty (it will be persisted
    /// by the next cleanup pass).
    pub fn update(&self, f: impl FnOnce(&mut EnvRecord)) {
        f(&mut self.record.lock().unwrap());
        self.dirty.store(true, Ordering::Relaxed);
    }

    fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Relaxed)
    }
}

/// The in-memory fast path plus the two on-disk environment indices.
pub struct EnvironmentManager {
    by_path: Mutex<HashMap<String, Vec<Arc<EnvEntry>>>>,
    by_index: Mutex<HashMap<u32, Arc<EnvEntry>>>,
    lists: IndexStore,
    info: IndexStore,
}

fn info_key(index: UnitIndex) -> Vec<u8> {
    index.as_raw().to_string().into_bytes()
}

fn decode_list(bytes: &[u8]) -> Vec<UnitIndex> {
    bincode::serde::decode_from_slice::<Vec<u32>, _>(bytes, bincode::config::standard())
        .map(|(list, _)| list.into_iter().map(UnitIndex::from_raw).collect())
        .unwrap_or_default()
}

fn encode_list(list: &[UnitIndex]) -> Vec<u8> {
    let raw: Vec<u32> = list.iter().map(|i| i.as_raw()).collect();
    bincode::serde::encode_to_vec(&raw, bincode::config::standard()).unwrap_or_default()
}

impl EnvironmentManager {
    /// Creates the manager over the session store.
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            by_path: Mutex::new(HashMap::new()),
            by_index: Mutex::new(HashMap::new()),
            lists: IndexStore::open(Arc::clone(&store), "env-lists"),
            info: IndexStore::open(store, "env-info"),
        }
    }

    /// Registers a freshly created record (fast path: memory only until the
    /// next cleanup pass persists it).
    pub fn add(&self, record: EnvRecord) -> Arc<EnvEntry> {
        let index = record.unit;
        let path = record.path.clone();
        let entry = EnvEntry::new(record, true);

        let mut by_index = self.by_index.lock().unwrap();
        if by_index.contains_key(&index.as_raw()) {
            // Double registration means removeEnvironment was skipped.
            debug_assert!(false, "environment for unit {index} registered twice");
            log::error!("environment for unit {index} registered twice, replacing");
        }
        by_index.insert(index.as_raw(), Arc::clone(&entry));
        drop(by_index);

        self.by_path
            .lock()
            .unwrap()
            .entry(path)
            .or_default()
            .push(Arc::clone(&entry));
        entry
    }

    /// Removes the record for `index` from memory and, eagerly, from both
    /// on-disk indices (the list merge in `store_all` only ever adds).
    pub fn remove(&self, index: UnitIndex) {
        let entry = self.by_index.lock().unwrap().remove(&index.as_raw());
        if let Some(entry) = &entry {
            let path = entry.path();
            let mut by_path = self.by_path.lock().unwrap();
            if let Some(entries) = by_path.get_mut(&path) {
                entries.retain(|e| !Arc::ptr_eq(e, entry));
                if entries.is_empty() {
                    by_path.remove(&path);
                }
            }
        }

        // On-disk list: drop the index from its path entry.
        let path = match &entry {
            Some(entry) => Some(entry.path()),
            None => self
                .info
                .get(&info_key(index))
                .and_then(|bytes| decode_record(&bytes))
                .map(|record| record.path),
        };
        if let Some(path) = path {
            if let Some(bytes) = self.lists.get(path.as_bytes()) {
                let mut list = decode_list(&bytes);
                let before = list.len();
                list.retain(|i| *i != index);
                if list.len() != before {
                    let result = if list.is_empty() {
                        self.lists.delete(path.as_bytes()).map(|_| ())
                    } else {
                        self.lists.put(path.as_bytes(), &encode_list(&list))
                    };
                    if let Err(e) = result {
                        log::warn!("cannot update path list for {path}: {e}");
                    }
                }
            }
        }

        if let Err(e) = self.info.delete(&info_key(index)) {
            log::warn!("cannot drop environment record {index}: {e}");
        }
    }

    /// Returns the already-loaded entry for `index`, if any.
    pub fn find(&self, index: UnitIndex) -> Option<Arc<EnvEntry>> {
        self.by_index.lock().unwrap().get(&index.as_raw()).cloned()
    }

    /// Loads the entry for `index`, consulting the on-disk index on a miss.
    pub fn load(&self, index: UnitIndex) -> Option<Arc<EnvEntry>> {
        if let Some(entry) = self.find(index) {
            return Some(entry);
        }
        let record = decode_record(&self.info.get(&info_key(index))?)?;

        let mut by_index = self.by_index.lock().unwrap();
        // Re-check under the map lock so two racing loads share one entry.
        if let Some(entry) = by_index.get(&index.as_raw()) {
            return Some(Arc::clone(entry));
        }
        let path = record.path.clone();
        let entry = EnvEntry::new(record, false);
        by_index.insert(index.as_raw(), Arc::clone(&entry));
        drop(by_index);

        self.by_path
            .lock()
            .unwrap()
            .entry(path)
            .or_default()
            .push(Arc::clone(&entry));
        Some(entry)
    }

    /// All entries known for `path`: the persisted list first, then
    /// in-memory entries that have not reached the on-disk index yet.
    pub fn records_for_path(&self, path: &str) -> Vec<Arc<EnvEntry>> {
        let mut entries: Vec<Arc<EnvEntry>> = Vec::new();

        if let Some(bytes) = self.lists.get(path.as_bytes()) {
            for index in decode_list(&bytes) {
                match self.load(index) {
                    Some(entry) => entries.push(entry),
                    None => log::debug!("no environment record for stored unit {index}"),
                }
            }
        }

        let by_path = self.by_path.lock().unwrap();
        if let Some(memory) = by_path.get(path) {
            for entry in memory {
                if !entries.iter().any(|e| Arc::ptr_eq(e, entry)) {
                    entries.push(Arc::clone(entry));
                }
            }
        }
        entries
    }

    /// Persists every dirty record and merges the per-path lists.
    ///
    /// During a soft pass (`atomic == false`) the write lock is released and
    /// re-acquired every [`STORE_BATCH`] records to bound UI-blocking
    /// latency, tolerating a temporarily inconsistent on-disk state.
    pub fn store_all(&self, guard: &mut WriteGuard<'_>, atomic: bool) {
        let paths: Vec<String> = self.by_path.lock().unwrap().keys().cloned().collect();
        let mut written = 0_usize;

        for path in paths {
            let entries: Vec<Arc<EnvEntry>> = self
                .by_path
                .lock()
                .unwrap()
                .get(&path)
                .cloned()
                .unwrap_or_default();

            for entry in &entries {
                if !entry.is_dirty() {
                    continue;
                }
                let record = entry.record();
                match bincode::serde::encode_to_vec(&record, bincode::config::standard()) {
                    Ok(bytes) => {
                        if let Err(e) = self.info.put(&info_key(record.unit), &bytes) {
                            log::warn!("cannot store environment record {}: {e}", record.unit);
                            continue;
                        }
                        entry.dirty.store(false, Ordering::Relaxed);
                        written += 1;
                    }
                    Err(e) => {
                        log::warn!("cannot encode environment record {}: {e}", record.unit)
                    }
                }

                if !atomic && written % STORE_BATCH == 0 && written != 0 {
                    guard.unlock();
                    guard.lock();
                }
            }

            self.store_list(&path, &entries);

            if !atomic {
                guard.unlock();
                guard.lock();
            }
        }
    }

    /// Merges the in-memory unit list for `path` into the on-disk list.
    /// Merging only ever adds: removals happen eagerly in [`remove`](Self::remove).
    fn store_list(&self, path: &str, entries: &[Arc<EnvEntry>]) {
        let mut merged: Vec<UnitIndex> = entries.iter().map(|e| e.unit()).collect();

        if let Some(bytes) = self.lists.get(path.as_bytes()) {
            let old = decode_list(&bytes);
            let mut added = false;
            for index in &old {
                if !merged.contains(index) {
                    merged.push(*index);
                    added = true;
                }
            }
            if !added && old.len() == merged.len() {
                return;
            }
        }

        if let Err(e) = self.lists.put(path.as_bytes(), &encode_list(&merged)) {
            log::warn!("cannot store path list for {path}: {e}");
        }
    }

    /// Drops entries that are held only by the index structure itself (the
    /// manager's two maps), reclaiming memory on full cleanup passes. Dirty
    /// entries are kept until they have been persisted.
    pub fn scavenge(&self) {
        let mut by_index = self.by_index.lock().unwrap();
        let mut by_path = self.by_path.lock().unwrap();

        let scavengable: Vec<u32> = by_index
            .iter()
            .filter(|(_, entry)| Arc::strong_count(entry) == 2 && !entry.is_dirty())
            .map(|(index, _)| *index)
            .collect();

        for index in scavengable {
            if let Some(entry) = by_index.remove(&index) {
                let path = entry.path();
                if let Some(entries) = by_path.get_mut(&path) {
                    entries.retain(|e| !Arc::ptr_eq(e, &entry));
                    if entries.is_empty() {
                        by_path.remove(&path);
                    }
                }
            }
        }
    }

    /// Every unit index with a persisted environment record.
    pub fn all_stored_indices(&self) -> Vec<UnitIndex> {
        self.info
            .keys()
            .into_iter()
            .filter_map(|key| {
                std::str::from_utf8(&key)
                    .ok()
                    .and_then(|s| s.parse::<u32>().ok())
            })
            .map(UnitIndex::from_raw)
            .collect()
    }

    /// Every unit index with an environment record, loaded or only
    /// persisted.
    pub fn all_known_indices(&self) -> Vec<UnitIndex> {
        let mut indices: Vec<UnitIndex> = self
            .by_index
            .lock()
            .unwrap()
            .keys()
            .map(|raw| UnitIndex::from_raw(*raw))
            .collect();
        for index in self.all_stored_indices() {
            if !indices.contains(&index) {
                indices.push(index);
            }
        }
        indices
    }

    /// Loads a persisted record without keeping an entry in memory.
    pub fn stored_record(&self, index: UnitIndex) -> Option<EnvRecord> {
        if let Some(entry) = self.find(index) {
            return Some(entry.record());
        }
        decode_record(&self.info.get(&info_key(index))?)
    }

    /// Flushes both index namespaces (relevant for the file backend).
    pub fn flush(&self) {
        if let Err(e) = self.lists.flush() {
            log::warn!("cannot flush path lists: {e}");
        }
        if let Err(e) = self.info.flush() {
            log::warn!("cannot flush environment records: {e}");
        }
    }
}

fn decode_record(bytes: &[u8]) -> Option<EnvRecord> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .ok()
        .map(|(record, _)| record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_lock::StoreLock;
    use strata_store::BackendKind;

    fn manager() -> (tempfile::TempDir, EnvironmentManager) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path(), BackendKind::Database).unwrap());
        (dir, EnvironmentManager::new(store))
    }

    fn record(index: u32, path: &str, proxy: bool) -> EnvRecord {
        EnvRecord {
            unit: UnitIndex::from_raw(index),
            path: path.to_string(),
            proxy,
            features: 0,
            content_hash: ContentHash::from_bytes(path.as_bytes()),
            stale: false,
            imports: Vec::new(),
            importers: Vec::new(),
        }
    }

    fn store_all(manager: &EnvironmentManager, lock: &StoreLock) {
        let mut guard = WriteGuard::with_timeout(lock, None);
        manager.store_all(&mut guard, true);
    }

    #[test]
    fn add_and_find() {
        let (_dir, manager) = manager();
        manager.add(record(1, "/a.cpp", false));

        let entry = manager.find(UnitIndex::from_raw(1)).unwrap();
        assert_eq!(entry.path(), "/a.cpp");
        assert!(!entry.is_proxy());
    }

    #[test]
    fn records_for_path_includes_unpersisted() {
        let (_dir, manager) = manager();
        manager.add(record(1, "/a.cpp", false));
        manager.add(record(2, "/a.cpp", true));
        manager.add(record(3, "/b.cpp", false));

        let entries = manager.records_for_path("/a.cpp");
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn store_all_persists_and_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path(), BackendKind::Database).unwrap());
        let lock = StoreLock::new();

        {
            let manager = EnvironmentManager::new(Arc::clone(&store));
            manager.add(record(1, "/a.cpp", false));
            manager.add(record(2, "/a.cpp", true));
            store_all(&manager, &lock);
            manager.flush();
        }

        // A fresh manager over the same store sees the persisted indices.
        let manager = EnvironmentManager::new(store);
        let entries = manager.records_for_path("/a.cpp");
        assert_eq!(entries.len(), 2);
        let loaded = manager.load(UnitIndex::from_raw(2)).unwrap();
        assert!(loaded.is_proxy());
    }

    #[test]
    fn remove_is_eager_on_disk() {
        let (_dir, manager) = manager();
        let lock = StoreLock::new();
        manager.add(record(1, "/a.cpp", false));
        manager.add(record(2, "/a.cpp", true));
        store_all(&manager, &lock);

        manager.remove(UnitIndex::from_raw(1));
        assert!(manager.find(UnitIndex::from_raw(1)).is_none());
        assert!(manager.stored_record(UnitIndex::from_raw(1)).is_none());

        let entries = manager.records_for_path("/a.cpp");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].unit(), UnitIndex::from_raw(2));
    }

    #[test]
    fn list_merge_unions_with_disk() {
        let (_dir, manager) = manager();
        let lock = StoreLock::new();

        manager.add(record(1, "/a.cpp", false));
        store_all(&manager, &lock);

        // Forget the in-memory side, register a second unit for the path,
        // and store again: the list must contain both.
        manager.scavenge();
        manager.add(record(2, "/a.cpp", true));
        store_all(&manager, &lock);

        let entries = manager.records_for_path("/a.cpp");
        let mut indices: Vec<u32> = entries.iter().map(|e| e.unit().as_raw()).collect();
        indices.sort_unstable();
        assert_eq!(indices, vec![1, 2]);
    }

    #[test]
    fn scavenge_keeps_referenced_and_dirty_entries() {
        let (_dir, manager) = manager();
        let lock = StoreLock::new();

        let held = manager.add(record(1, "/a.cpp", false));
        manager.add(record(2, "/b.cpp", false));
        let dirty = manager.add(record(3, "/c.cpp", false));
        store_all(&manager, &lock);
        dirty.update(|r| r.stale = true);
        drop(dirty);

        manager.scavenge();

        // Entry 1 is held externally, entry 3 is dirty again; only entry 2
        // was held by the manager alone and stored.
        assert!(manager.find(UnitIndex::from_raw(1)).is_some());
        assert!(manager.find(UnitIndex::from_raw(2)).is_none());
        assert!(manager.find(UnitIndex::from_raw(3)).is_some());
        drop(held);

        // Still loadable from disk after scavenging.
        assert!(manager.load(UnitIndex::from_raw(2)).is_some());
    }

    #[test]
    fn stale_flag_roundtrips() {
        let (_dir, manager) = manager();
        let lock = StoreLock::new();

        let entry = manager.add(record(1, "/a.cpp", false));
        entry.update(|r| r.stale = true);
        store_all(&manager, &lock);
        drop(entry);
        manager.scavenge();

        let reloaded = manager.load(UnitIndex::from_raw(1)).unwrap();
        assert!(reloaded.needs_update());
    }
}
