//! The periodic cleanup engine.
//!
//! A cleanup pass persists all in-memory environment records, stores every
//! dirty resident unit, and evicts units that are neither pinned nor
//! transitively imported by a pinned unit. "Soft" passes release the write
//! lock between batches to bound UI-blocking latency, tolerating a
//! temporarily inconsistent on-disk state (a marker file makes a crash
//! mid-pass detectable, and the cache is discarded on the next start).

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use strata_lock::WriteGuard;
use strata_unit::Unit;

use crate::registry::Registry;
use crate::session;

/// Soft cleanup iterations run before the final atomic pass.
pub(crate) const SOFT_CLEANUP_STEPS: u32 = 1;

/// Sleep while the write lock is yielded so readers get a realistic chance.
const YIELD_SLEEP: Duration = Duration::from_micros(500);

/// How cleanup interacts with ongoing external parser jobs.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PauseMode {
    /// Don't touch the parser latches (used by nested soft passes which
    /// already paused them).
    None,
    /// Pause all parsers and block until they yield. Used at shutdown.
    Blocking,
    /// Best effort: abort the cleanup if any parser is mid-job. Used by the
    /// periodic background pass.
    Try,
}

/// A pause latch shared with one external parser job queue.
///
/// The parser brackets each job with [`begin_parse`](Self::begin_parse) /
/// [`end_parse`](Self::end_parse); the cleanup engine pauses the latch to
/// keep new jobs from starting while it rewrites on-disk state.
pub struct ParsePause {
    paused: AtomicBool,
    active: AtomicU32,
}

impl ParsePause {
    /// Creates an unpaused latch.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            paused: AtomicBool::new(false),
            active: AtomicU32::new(0),
        })
    }

    /// Tries to enter a parse job. Returns `false` while paused; the caller
    /// retries later.
    pub fn begin_parse(&self) -> bool {
        if self.paused.load(Ordering::Acquire) {
            return false;
        }
        self.active.fetch_add(1, Ordering::AcqRel);
        if self.paused.load(Ordering::Acquire) {
            // Lost the race against a pause; back out.
            self.active.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        true
    }

    /// Leaves a parse job entered with [`begin_parse`](Self::begin_parse).
    pub fn end_parse(&self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }

    /// Pauses unless a job is mid-flight.
    pub(crate) fn try_pause(&self) -> bool {
        self.paused.store(true, Ordering::Release);
        if self.active.load(Ordering::Acquire) != 0 {
            self.paused.store(false, Ordering::Release);
            return false;
        }
        true
    }

    /// Pauses, waiting for in-flight jobs to finish.
    pub(crate) fn pause_blocking(&self) {
        self.paused.store(true, Ordering::Release);
        while self.active.load(Ordering::Acquire) != 0 {
            std::thread::sleep(YIELD_SLEEP);
        }
    }

    /// Lifts the pause.
    pub(crate) fn resume(&self) {
        self.paused.store(false, Ordering::Release);
    }
}

impl Registry {
    /// Runs a cleanup: `retries` soft passes followed by one atomic pass.
    ///
    /// Per-unit failures are logged and skipped; a single bad unit never
    /// aborts the pass. Concurrent cleanups are serialized; the calling
    /// thread must hold neither side of the store lock.
    pub fn cleanup(&self, retries: u32, pause: PauseMode) {
        if self.cleanup_disabled.load(Ordering::Relaxed) {
            return;
        }
        let _serialize = self.cleanup_mutex.lock().unwrap();
        if self.destroyed.load(Ordering::Relaxed) || self.cleanup_disabled.load(Ordering::Relaxed)
        {
            return;
        }
        self.cleanup_pass(retries, pause);
    }

    fn cleanup_pass(&self, retries: u32, pause: PauseMode) {
        debug_assert!(
            !self.lock().current_thread_has_read_lock()
                && !self.lock().current_thread_has_write_lock()
        );
        let mut write = WriteGuard::with_timeout(self.lock(), None);

        // Stop the parsers first, so little changes underneath the soft
        // passes and the final atomic pass has little left to write.
        let mut paused: Vec<Arc<ParsePause>> = Vec::new();
        if pause != PauseMode::None {
            let latches = self.parse_pauses.lock().unwrap().clone();
            write.unlock();
            for latch in latches {
                match pause {
                    PauseMode::Try => {
                        if !latch.try_pause() {
                            log::debug!("aborting cleanup, a parser job is still running");
                            for resumed in &paused {
                                resumed.resume();
                            }
                            return;
                        }
                    }
                    PauseMode::Blocking => latch.pause_blocking(),
                    PauseMode::None => unreachable!(),
                }
                paused.push(latch);
            }
            write.lock();
            log::debug!("starting cleanup (retries {retries})");
        }

        // While the marker exists, the on-disk state may be inconsistent;
        // finding it at session open discards the cache.
        let marker = session::marker_path(self.store().base());
        if !marker.exists() {
            if let Err(e) = std::fs::write(&marker, b"cleanup in progress\n") {
                log::warn!("cannot write cleanup marker: {e}");
            }
        }

        self.environment().store_all(&mut write, retries == 0);

        let mut work = self.all_resident_units();
        for unit in &work {
            self.store_unit_logged(unit);
            if retries > 0 {
                // Give readers a chance between units during soft passes.
                write.unlock();
                std::thread::sleep(YIELD_SLEEP);
                write.lock();
            }
        }

        self.evict_unreferenced(&mut work, retries, &mut write);

        if retries == 0 {
            // Full passes additionally reclaim environment entries that are
            // held only by the index structure itself.
            self.environment().scavenge();
        }

        session::persist_session_state(self);
        self.environment().flush();
        self.store().flush();

        if retries > 0 {
            write.unlock();
            self.cleanup_pass(retries - 1, PauseMode::None);
        } else if let Err(e) = std::fs::remove_file(&marker) {
            log::warn!("cannot remove cleanup marker: {e}");
        }

        for latch in paused {
            latch.resume();
        }
    }

    /// Forces everything to disk now (a full blocking cleanup).
    pub fn store_to_disk(&self) {
        self.cleanup(0, PauseMode::Blocking);
    }

    fn store_unit_logged(&self, unit: &Arc<Unit>) {
        if let Err(e) = unit.store(&self.ctx()) {
            // One broken unit must not abort the pass.
            log::warn!("skipping unit {}: {e}", unit.index());
        }
    }

    /// Evicts every unit that is not pinned and not transitively imported
    /// by a pinned unit.
    ///
    /// Computed iteratively: units become evictable as their resident
    /// importers go away. Since import graphs may contain cycles, a scan
    /// that finds unreferenced units but can make no progress falls back to
    /// evicting the whole remaining unreferenced batch atomically, breaking
    /// the cycle deliberately rather than never reclaiming memory.
    fn evict_unreferenced(
        &self,
        work: &mut Vec<Arc<Unit>>,
        retries: u32,
        write: &mut WriteGuard<'_>,
    ) {
        let mut unload_all_unreferenced = retries == 0;

        loop {
            let mut unloaded_one = false;
            let mut had_unloadable = 0_usize;

            let mut position = 0;
            while position < work.len() {
                let unit = Arc::clone(&work[position]);

                // Pinned units and everything they transitively import are
                // off limits. Recomputed per unit: the lock may have been
                // yielded since the last check.
                let protected = self.protected_set();
                if protected.contains(&unit.index().as_raw()) {
                    work.remove(position);
                    continue;
                }
                had_unloadable += 1;

                // Unloading a unit that a resident unit still imports would
                // leave a dangling edge; only the atomic fallback may do it.
                let imported_by_resident = unit
                    .importers()
                    .iter()
                    .any(|importer| self.is_resident(*importer));
                if imported_by_resident && !unload_all_unreferenced {
                    position += 1;
                    continue;
                }

                // The lock may have been yielded since this unit was stored;
                // storing again is a cheap no-op when nothing changed.
                self.store_unit_logged(&unit);
                self.remove_from_memory(&unit);
                work.remove(position);
                unloaded_one = true;

                if !unload_all_unreferenced {
                    write.unlock();
                    std::thread::sleep(YIELD_SLEEP);
                    write.lock();
                }
            }

            if !unloaded_one {
                if had_unloadable > 0 && !unload_all_unreferenced {
                    log::debug!(
                        "{had_unloadable} unreferenced units form a cycle, unloading atomically"
                    );
                    unload_all_unreferenced = true;
                    continue;
                }
                break;
            }
        }
    }

    /// The indices of all pinned units plus everything they transitively
    /// import (resident units only).
    fn protected_set(&self) -> HashSet<u32> {
        let mut protected = HashSet::new();
        let mut stack = self.pinned_indices();
        while let Some(index) = stack.pop() {
            if !protected.insert(index.as_raw()) {
                continue;
            }
            if let Some(unit) = self.resident_unit(index) {
                for import in unit.imports() {
                    if self.is_resident(import) {
                        stack.push(import);
                    }
                }
            }
        }
        protected
    }
}

/// The background thread running periodic soft cleanups.
pub(crate) struct CleanupThread {
    stop: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl CleanupThread {
    /// Spawns the thread; every `interval` it runs one soft, best-effort
    /// pass (skipped entirely while parsers are busy).
    pub(crate) fn start(registry: Arc<Registry>, interval: Duration) -> Self {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let shared = Arc::clone(&stop);

        let handle = std::thread::Builder::new()
            .name("strata-cleanup".to_string())
            .spawn(move || loop {
                let (stopped, wake) = &*shared;
                let guard = stopped.lock().unwrap();
                let (guard, _) = wake
                    .wait_timeout_while(guard, interval, |stopped| !*stopped)
                    .unwrap();
                if *guard {
                    break;
                }
                drop(guard);
                registry.cleanup(SOFT_CLEANUP_STEPS, PauseMode::Try);
            });

        match handle {
            Ok(handle) => Self {
                stop,
                handle: Some(handle),
            },
            Err(e) => {
                log::error!("cannot spawn the cleanup thread: {e}");
                Self { stop, handle: None }
            }
        }
    }

    /// Stops the thread and waits for it to exit.
    pub(crate) fn stop(mut self) {
        let (stopped, wake) = &*self.stop;
        *stopped.lock().unwrap() = true;
        wake.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
