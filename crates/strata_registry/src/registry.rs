//! The process-wide table of loaded units.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use strata_common::{ContentHash, Ident, Interner, ItemRef, UnitIndex};
use strata_lock::StoreLock;
use strata_store::Store;
use strata_unit::{KindRegistry, Unit, UnitContext};

use crate::cleanup::ParsePause;
use crate::environment::{EnvEntry, EnvRecord, EnvironmentManager};

/// Slot-table growth chunk: over-allocate to amortize resize cost.
const SLOT_CHUNK: usize = 100;

/// Sleep between polls while another thread is loading the same unit.
const LOAD_WAIT: Duration = Duration::from_millis(50);

/// The registry of loaded units and the context object every component
/// hangs off: the global content lock, the backend store, the kind
/// registry, the interner, and the environment manager.
///
/// Lock discipline: the [`StoreLock`] protects unit *content*; the small
/// mutexes here protect *table* mutation only and are held briefly, never
/// across I/O (the one deliberate exception being the page-in performed
/// under a unit's own load mutex).
pub struct Registry {
    lock: StoreLock,
    store: Arc<Store>,
    kinds: Arc<KindRegistry>,
    interner: Arc<Interner>,
    env: EnvironmentManager,

    /// Dense slot table indexed by unit index, grown in chunks.
    slots: Mutex<Vec<Option<Arc<Unit>>>>,
    /// Resident units per interned path (a path may have several: proxy and
    /// content variants, stale versions).
    by_path: Mutex<HashMap<Ident, Vec<Arc<Unit>>>>,
    /// Environment entries attached to resident units.
    attached: Mutex<HashMap<u32, Arc<EnvEntry>>>,
    /// Pin counts: units backing open documents are never evicted.
    pins: Mutex<HashMap<u32, u32>>,
    /// Recycled indices available for reuse (persisted across sessions).
    free_indices: Mutex<Vec<u32>>,
    /// Monotonic fallback counter (persisted in the static data file).
    next_index: AtomicU32,
    /// Indices currently being loaded (double-load guard).
    loading: Mutex<HashSet<u32>>,

    /// Serializes cleanup passes.
    pub(crate) cleanup_mutex: Mutex<()>,
    pub(crate) cleanup_disabled: AtomicBool,
    pub(crate) destroyed: AtomicBool,
    /// Pause latches of external parser jobs.
    pub(crate) parse_pauses: Mutex<Vec<Arc<ParsePause>>>,
}

impl Registry {
    pub(crate) fn new(
        store: Arc<Store>,
        kinds: Arc<KindRegistry>,
        free_indices: Vec<u32>,
        next_index: u32,
    ) -> Self {
        Self {
            lock: StoreLock::new(),
            env: EnvironmentManager::new(Arc::clone(&store)),
            store,
            kinds,
            interner: Arc::new(Interner::new()),
            slots: Mutex::new(Vec::new()),
            by_path: Mutex::new(HashMap::new()),
            attached: Mutex::new(HashMap::new()),
            pins: Mutex::new(HashMap::new()),
            free_indices: Mutex::new(free_indices),
            next_index: AtomicU32::new(next_index.max(1)),
            loading: Mutex::new(HashSet::new()),
            cleanup_mutex: Mutex::new(()),
            cleanup_disabled: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            parse_pauses: Mutex::new(Vec::new()),
        }
    }

    /// The global content lock.
    pub fn lock(&self) -> &StoreLock {
        &self.lock
    }

    /// The session's backend store.
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// The session's item kind registry.
    pub fn kinds(&self) -> &Arc<KindRegistry> {
        &self.kinds
    }

    /// The session's string interner.
    pub fn interner(&self) -> &Arc<Interner> {
        &self.interner
    }

    /// The environment manager.
    pub fn environment(&self) -> &EnvironmentManager {
        &self.env
    }

    /// The context item access needs.
    pub fn ctx(&self) -> UnitContext<'_> {
        UnitContext {
            store: &self.store,
            kinds: &self.kinds,
        }
    }

    /// Allocates a unit index: recycled indices first, then the monotonic
    /// counter. Before handing out a recycled index the allocator verifies
    /// no backend record exists there (corruption guard) and retries with a
    /// different index if one does.
    pub fn new_unit_index(&self) -> UnitIndex {
        loop {
            let recycled = self.free_indices.lock().unwrap().pop();
            match recycled {
                Some(raw) => {
                    let index = UnitIndex::from_raw(raw);
                    if self.store.exists(index) {
                        log::warn!(
                            "recycled index {index} still has a backend record, discarding it"
                        );
                        continue;
                    }
                    return index;
                }
                None => {
                    return UnitIndex::from_raw(self.next_index.fetch_add(1, Ordering::Relaxed))
                }
            }
        }
    }

    pub(crate) fn next_index_value(&self) -> u32 {
        self.next_index.load(Ordering::Relaxed)
    }

    pub(crate) fn free_indices_snapshot(&self) -> Vec<u32> {
        self.free_indices.lock().unwrap().clone()
    }

    /// Registers a parser-produced unit. The unit becomes resident and
    /// visible to lookups; its environment record is attached separately
    /// via [`attach_environment`](Self::attach_environment).
    pub fn register_unit(&self, unit: Arc<Unit>) {
        let index = unit.index();
        let raw = index.as_raw() as usize;

        {
            let mut slots = self.slots.lock().unwrap();
            if slots.len() <= raw {
                slots.resize(raw + SLOT_CHUNK, None);
            }
            if slots[raw].is_some() {
                debug_assert!(false, "unit index {index} registered twice");
                log::error!("unit index {index} registered twice, replacing the resident unit");
            }
            slots[raw] = Some(Arc::clone(&unit));
        }

        let path_ident = self.interner.get_or_intern(&unit.path());
        self.by_path
            .lock()
            .unwrap()
            .entry(path_ident)
            .or_default()
            .push(Arc::clone(&unit));

        self.rebuild_importer_edges(&unit);
    }

    /// Reconstructs reverse import edges around a newly resident unit.
    fn rebuild_importer_edges(&self, unit: &Arc<Unit>) {
        let index = unit.index();

        // This unit is an importer of each resident import target.
        for target in unit.imports() {
            if let Some(target_unit) = self.resident_unit(target) {
                target_unit.add_importer(index);
            }
        }

        // Resident units that import this one are its importers.
        for other in self.all_resident_units() {
            if other.index() != index && other.imports().contains(&index) {
                unit.add_importer(other.index());
            }
        }
    }

    /// Attaches identity/freshness metadata to a registered unit.
    pub fn attach_environment(&self, unit: &Unit, record: EnvRecord) {
        debug_assert_eq!(record.unit, unit.index());
        if self.env.find(unit.index()).is_some() {
            // Already attached; replacing requires an explicit remove first.
            log::debug!("environment for unit {} already attached", unit.index());
            return;
        }
        let entry = self.env.add(record);
        self.attached
            .lock()
            .unwrap()
            .insert(unit.index().as_raw(), entry);
    }

    /// Replaces the environment record of a registered unit (a reparse
    /// under a changed parsing configuration).
    pub fn update_environment(&self, unit: &Unit, record: EnvRecord) {
        self.env.remove(unit.index());
        self.attached.lock().unwrap().remove(&unit.index().as_raw());
        self.attach_environment(unit, record);
    }

    /// Whether the unit `index` is currently resident.
    pub fn is_resident(&self, index: UnitIndex) -> bool {
        self.resident_unit(index).is_some()
    }

    /// The resident unit at `index`, if any.
    pub fn resident_unit(&self, index: UnitIndex) -> Option<Arc<Unit>> {
        self.slots
            .lock()
            .unwrap()
            .get(index.as_raw() as usize)?
            .clone()
    }

    /// Snapshot of every resident unit.
    pub fn all_resident_units(&self) -> Vec<Arc<Unit>> {
        self.slots
            .lock()
            .unwrap()
            .iter()
            .flatten()
            .cloned()
            .collect()
    }

    /// Every path with at least one resident unit.
    pub fn all_paths(&self) -> Vec<String> {
        self.by_path
            .lock()
            .unwrap()
            .keys()
            .map(|ident| self.interner.resolve(*ident).to_string())
            .collect()
    }

    /// Pins a unit: non-zero pin counts exempt it from eviction (a pinned
    /// unit backs an open document or an in-flight lookup result).
    pub fn pin(&self, index: UnitIndex) {
        *self.pins.lock().unwrap().entry(index.as_raw()).or_insert(0) += 1;
    }

    /// Releases one pin.
    pub fn unpin(&self, index: UnitIndex) {
        let mut pins = self.pins.lock().unwrap();
        match pins.get_mut(&index.as_raw()) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                pins.remove(&index.as_raw());
            }
            None => log::warn!("unpin of unit {index} which is not pinned"),
        }
    }

    /// Indices of all currently pinned units.
    pub(crate) fn pinned_indices(&self) -> Vec<UnitIndex> {
        self.pins
            .lock()
            .unwrap()
            .keys()
            .map(|raw| UnitIndex::from_raw(*raw))
            .collect()
    }

    /// Loads the unit `index` (and, transitively, its imports) from disk.
    ///
    /// Two threads loading the same index perform exactly one backend load:
    /// the second observes the in-flight load and waits for the first.
    pub fn load(&self, index: UnitIndex) -> Option<Arc<Unit>> {
        let mut loaded = HashSet::new();
        self.load_inner(index, &mut loaded);
        self.resident_unit(index)
    }

    fn load_inner(&self, index: UnitIndex, loaded: &mut HashSet<u32>) {
        loop {
            if self.is_resident(index) {
                return;
            }
            {
                let mut loading = self.loading.lock().unwrap();
                if !loading.contains(&index.as_raw()) {
                    loading.insert(index.as_raw());
                    break;
                }
            }
            // Another thread is loading this unit; wait for it to finish.
            log::debug!("waiting for another thread to load unit {index}");
            std::thread::sleep(LOAD_WAIT);
        }
        loaded.insert(index.as_raw());

        log::debug!("loading unit {index}");
        let unit = Unit::load(&self.ctx(), index).map(Arc::new);
        if let Some(unit) = &unit {
            if let Some(entry) = self.env.load(index) {
                self.attached
                    .lock()
                    .unwrap()
                    .insert(index.as_raw(), entry);
            }
            self.register_unit(Arc::clone(unit));

            // Load the imported units as well, so the import structure is
            // complete; the `loaded` set breaks import cycles.
            for import in unit.imports() {
                if !loaded.contains(&import.as_raw()) && !self.is_resident(import) {
                    self.load_inner(import, loaded);
                }
            }
        }

        self.loading.lock().unwrap().remove(&index.as_raw());
    }

    /// Finds the unit for a document path, preferring resident units.
    ///
    /// Lookup order: (1) resident units whose environment record matches the
    /// proxy flag; (2) stored units known to the environment index, loading
    /// the first match; (3) any resident unit for the path whose environment
    /// record is simply absent. Requires at least the read lock.
    pub fn unit_for_path(&self, path: &str, proxy: bool) -> Option<Arc<Unit>> {
        debug_assert!(
            self.lock.current_thread_has_read_lock()
                || self.lock.current_thread_has_write_lock()
        );
        if self.destroyed.load(Ordering::Relaxed) {
            return None;
        }

        let records = self.env.records_for_path(path);
        for entry in &records {
            if entry.is_proxy() == proxy {
                if let Some(unit) = self.resident_unit(entry.unit()) {
                    return Some(unit);
                }
            }
        }
        for entry in &records {
            if entry.is_proxy() == proxy {
                if let Some(unit) = self.load(entry.unit()) {
                    return Some(unit);
                }
            }
        }

        // Permissive fallback kept for compatibility: accept any resident
        // unit for the path that has no environment record at all. This can
        // hand back a unit from a stale parsing configuration.
        let ident = self.interner.get_or_intern(path);
        let resident = self.by_path.lock().unwrap().get(&ident).cloned();
        resident?.into_iter().find(|unit| {
            match self.env.find(unit.index()) {
                Some(entry) => entry.is_proxy() == proxy,
                None => true,
            }
        })
    }

    /// The source path of `index`, from the resident unit if there is one,
    /// falling back to a header-only load.
    pub fn path_for_index(&self, index: UnitIndex) -> Option<String> {
        if let Some(unit) = self.resident_unit(index) {
            return Some(unit.path());
        }
        strata_unit::load_path(&self.store, index)
    }

    /// The import list of `index` without materializing items: from the
    /// resident unit, or from a header-only load.
    pub fn imports_for_index(&self, index: UnitIndex) -> Vec<UnitIndex> {
        if let Some(unit) = self.resident_unit(index) {
            return unit.imports();
        }
        strata_unit::load_imports(&self.store, index).unwrap_or_default()
    }

    /// The importer summary of `index` without loading the unit: live
    /// reverse edges for resident units, the environment record's persisted
    /// summary otherwise.
    pub fn importers_for_index(&self, index: UnitIndex) -> Vec<UnitIndex> {
        if let Some(unit) = self.resident_unit(index) {
            return unit.importers();
        }
        self.env
            .stored_record(index)
            .map(|record| record.importers)
            .unwrap_or_default()
    }

    /// Resolves a weak cross-unit declaration reference, loading the target
    /// unit if needed. `None` means "gone": the unit or item was deleted.
    pub fn resolve_declaration(
        &self,
        item_ref: ItemRef,
    ) -> Option<strata_unit::Item<strata_unit::DeclarationData>> {
        let unit = self
            .resident_unit(item_ref.unit)
            .or_else(|| self.load(item_ref.unit))?;
        unit.declaration(&self.ctx(), item_ref.item)
    }

    /// Resolves a weak cross-unit scope reference, loading the target unit
    /// if needed.
    pub fn resolve_scope(
        &self,
        item_ref: ItemRef,
    ) -> Option<strata_unit::Item<strata_unit::ScopeData>> {
        let unit = self
            .resident_unit(item_ref.unit)
            .or_else(|| self.load(item_ref.unit))?;
        unit.scope(&self.ctx(), item_ref.item)
    }

    /// Removes a unit entirely: from disk, from the environment indices,
    /// and from memory; its index goes back to the free list. Requires the
    /// write lock.
    pub fn remove_unit(&self, unit: &Arc<Unit>) {
        debug_assert!(self.lock.current_thread_has_write_lock());
        let index = unit.index();

        unit.delete_on_disk(&self.ctx());
        self.env.remove(index);
        self.remove_from_memory(unit);
        self.free_indices.lock().unwrap().push(index.as_raw());
    }

    /// Unlinks a resident unit from every in-memory table (does not touch
    /// its on-disk record). Requires the write lock.
    pub(crate) fn remove_from_memory(&self, unit: &Arc<Unit>) {
        let index = unit.index();

        if self.pins.lock().unwrap().remove(&index.as_raw()).is_some() {
            // Happens during shutdown, when everything is unloaded.
            log::debug!("removed still-pinned unit {index}");
        }

        let path_ident = self.interner.get_or_intern(&unit.path());
        {
            let mut by_path = self.by_path.lock().unwrap();
            if let Some(units) = by_path.get_mut(&path_ident) {
                units.retain(|u| !Arc::ptr_eq(u, unit));
                if units.is_empty() {
                    by_path.remove(&path_ident);
                }
            }
        }

        self.attached.lock().unwrap().remove(&index.as_raw());

        for target in unit.imports() {
            if let Some(target_unit) = self.resident_unit(target) {
                target_unit.remove_importer(index);
            }
        }

        let mut slots = self.slots.lock().unwrap();
        if let Some(slot) = slots.get_mut(index.as_raw() as usize) {
            *slot = None;
        }
    }

    /// Registers a parser pause latch consulted by cleanup passes.
    pub fn register_parse_pause(&self, pause: Arc<ParsePause>) {
        self.parse_pauses.lock().unwrap().push(pause);
    }

    /// Disables (or re-enables) persistent storage; with cleanup disabled,
    /// nothing is written to disk and nothing is evicted.
    pub fn disable_persistent_storage(&self, disable: bool) {
        self.cleanup_disabled.store(disable, Ordering::Relaxed);
    }

    /// Builds a content-unit environment record for a freshly parsed unit.
    /// Convenience for the common parser hand-off.
    pub fn environment_record_for(
        &self,
        unit: &Unit,
        content_hash: ContentHash,
        proxy: bool,
    ) -> EnvRecord {
        EnvRecord {
            unit: unit.index(),
            path: unit.path(),
            proxy,
            features: unit.features(),
            content_hash,
            stale: false,
            imports: unit.imports(),
            importers: unit.importers(),
        }
    }
}
