//! Session lifecycle: explicit open/shutdown, persisted session state.
//!
//! All process-wide state (the lock, the store, the registry, the interner)
//! lives in an explicitly constructed [`Session`] with `open`/`shutdown`
//! lifecycle calls rather than implicit lazy statics, so test setup and
//! teardown stay deterministic. One session owns one base directory; the
//! directory is safe to delete wholesale to force a full rebuild.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use strata_lock::WriteGuard;
use strata_store::{db, BackendKind, Store, StoreError};
use strata_unit::KindRegistry;

use crate::cleanup::{CleanupThread, PauseMode, SOFT_CLEANUP_STEPS};
use crate::registry::Registry;

/// Marker file present while a cleanup pass may have left the on-disk state
/// inconsistent. Found at open time, it means a crash mid-pass: the cache is
/// discarded and rebuilt from source.
const MARKER_FILE: &str = "cleanup-in-progress";

/// Fixed-size file holding process-wide static configuration.
const STATIC_FILE: &str = "session_static";

/// Flat file listing recycled unit indices (little-endian `u32`s).
const FREELIST_FILE: &str = "available_indices";

const STATIC_MAGIC: [u8; 4] = *b"STR1";
const STATIC_VERSION: u32 = 1;

/// Seconds between periodic background cleanup passes.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(200);

/// Final-cleanup compaction stops once a pass reclaims less than this.
const FINAL_CLEANUP_THRESHOLD: u64 = 1024;

/// Hard cap on final-cleanup passes, bounding shutdown latency.
const MAX_FINAL_CLEANUP_PASSES: u32 = 100;

/// Cap on stored units examined for staleness during shutdown.
const MAX_STALE_CHECK_UNITS: usize = 2000;

/// Configuration of a session.
pub struct SessionConfig {
    /// Base directory all persisted state lives under.
    pub base_dir: PathBuf,
    /// Which record backend to use.
    pub backend: BackendKind,
    /// Whether to run the periodic background cleanup thread.
    pub background_cleanup: bool,
    /// The item kind registry (language integrations register their custom
    /// declaration kinds here before opening the session).
    pub kinds: KindRegistry,
}

impl SessionConfig {
    /// A default configuration: database backend, background cleanup on,
    /// built-in item kinds.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            backend: BackendKind::Database,
            background_cleanup: true,
            kinds: KindRegistry::with_builtin_kinds(),
        }
    }
}

/// One active working session over one base directory.
pub struct Session {
    registry: Arc<Registry>,
    cleanup_thread: Option<CleanupThread>,
    base: PathBuf,
}

impl Session {
    /// Opens (creating or recovering if necessary) the session.
    pub fn open(config: SessionConfig) -> Result<Self, StoreError> {
        let base = config.base_dir.clone();

        // Self-healing: a leftover marker means a soft cleanup pass died
        // mid-flight and the persisted cache may be inconsistent. Discard it
        // wholesale; the next full parse rebuilds everything.
        if base.join(MARKER_FILE).exists() {
            log::warn!(
                "found an interrupted cleanup, discarding the cache at {}",
                base.display()
            );
            if let Err(e) = std::fs::remove_dir_all(&base) {
                log::warn!("cannot discard {}: {e}", base.display());
            }
        }

        let store = Arc::new(Store::open(&base, config.backend)?);
        let (next_index, _interner_entries) = read_static_data(&base);
        let free_indices = read_free_indices(&base);

        let registry = Arc::new(Registry::new(
            store,
            Arc::new(config.kinds),
            free_indices,
            next_index,
        ));

        let cleanup_thread = config
            .background_cleanup
            .then(|| CleanupThread::start(Arc::clone(&registry), CLEANUP_INTERVAL));

        Ok(Self {
            registry,
            cleanup_thread,
            base,
        })
    }

    /// The registry (and through it the lock, store, and environment).
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Flushes everything to disk now without shutting down.
    pub fn store_to_disk(&self) {
        self.registry.store_to_disk();
    }

    /// Shuts the session down: stops the background thread, drops stored
    /// units that are known stale, runs a final full cleanup, and compacts
    /// the backend in bounded passes. Returns the bytes reclaimed by
    /// compaction.
    pub fn shutdown(mut self) -> u64 {
        log::debug!("shutting down session at {}", self.base.display());

        if let Some(thread) = self.cleanup_thread.take() {
            thread.stop();
        }

        self.remove_stale_units();
        self.registry.cleanup(SOFT_CLEANUP_STEPS, PauseMode::Blocking);
        self.registry
            .destroyed
            .store(true, std::sync::atomic::Ordering::Relaxed);

        let base = self.base.clone();
        drop(self.registry);

        // Final cleanup: ask the backend to reclaim unused space until a
        // pass stops paying off, with a hard pass cap to bound latency.
        let mut total_reclaimed = 0_u64;
        for pass in 0..MAX_FINAL_CLEANUP_PASSES {
            let reclaimed = match db::compact(&base) {
                Ok(reclaimed) => reclaimed,
                Err(e) => {
                    log::warn!("final cleanup failed: {e}");
                    break;
                }
            };
            total_reclaimed += reclaimed;
            if reclaimed < FINAL_CLEANUP_THRESHOLD {
                break;
            }
            if pass + 1 == MAX_FINAL_CLEANUP_PASSES {
                log::warn!(
                    "stopping final cleanup after {MAX_FINAL_CLEANUP_PASSES} passes \
                     (last reclaimed {reclaimed} B)"
                );
            }
        }
        log::debug!("final cleanup reclaimed {total_reclaimed} B");
        total_reclaimed
    }

    /// Removes stored units whose environment records say they are out of
    /// date. Bounded: at most [`MAX_STALE_CHECK_UNITS`] records are checked.
    fn remove_stale_units(&self) {
        let registry = &self.registry;
        let mut write = WriteGuard::with_timeout(registry.lock(), None);
        debug_assert!(write.locked());

        let mut checked = 0_usize;
        for index in registry.environment().all_known_indices() {
            if checked >= MAX_STALE_CHECK_UNITS {
                break;
            }
            checked += 1;

            let Some(record) = registry.environment().stored_record(index) else {
                continue;
            };
            if !record.needs_update() {
                continue;
            }
            log::debug!("dropping out-of-date unit {index} for {}", record.path);
            let unit = match registry.resident_unit(index) {
                Some(unit) => Some(unit),
                None => registry.load(index),
            };
            match unit {
                Some(unit) => registry.remove_unit(&unit),
                None => {
                    // The record exists but the unit does not load; drop the
                    // orphaned metadata.
                    registry.environment().remove(index);
                }
            }
        }
        write.unlock();
    }
}

pub(crate) fn marker_path(base: &Path) -> PathBuf {
    base.join(MARKER_FILE)
}

/// Reads the static configuration file: `(next unit index, interner
/// entries)`. Missing or malformed files read as defaults.
fn read_static_data(base: &Path) -> (u32, u32) {
    let bytes = match std::fs::read(base.join(STATIC_FILE)) {
        Ok(bytes) => bytes,
        Err(_) => return (1, 0),
    };
    if bytes.len() != 16 || bytes[0..4] != STATIC_MAGIC {
        log::warn!("ignoring malformed static data file");
        return (1, 0);
    }
    let version = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
    if version != STATIC_VERSION {
        return (1, 0);
    }
    let next_index = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
    let interner_entries = u32::from_le_bytes(bytes[12..16].try_into().unwrap());
    (next_index.max(1), interner_entries)
}

/// Reads the recycled-index list. Trailing partial entries are dropped.
fn read_free_indices(base: &Path) -> Vec<u32> {
    let bytes = match std::fs::read(base.join(FREELIST_FILE)) {
        Ok(bytes) => bytes,
        Err(_) => return Vec::new(),
    };
    bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes(chunk.try_into().unwrap()))
        .collect()
}

/// Persists the static configuration and the recycled-index list. Called at
/// the end of every cleanup pass.
pub(crate) fn persist_session_state(registry: &Registry) {
    let base = registry.store().base();

    let mut bytes = Vec::with_capacity(16);
    bytes.extend_from_slice(&STATIC_MAGIC);
    bytes.extend_from_slice(&STATIC_VERSION.to_le_bytes());
    bytes.extend_from_slice(&registry.next_index_value().to_le_bytes());
    bytes.extend_from_slice(&(registry.interner().len() as u32).to_le_bytes());
    if let Err(e) = std::fs::write(base.join(STATIC_FILE), &bytes) {
        log::warn!("cannot write static data: {e}");
    }

    let free = registry.free_indices_snapshot();
    let mut bytes = Vec::with_capacity(free.len() * 4);
    for index in free {
        bytes.extend_from_slice(&index.to_le_bytes());
    }
    if let Err(e) = std::fs::write(base.join(FREELIST_FILE), &bytes) {
        log::warn!("cannot write the recycled index list: {e}");
    }
}
