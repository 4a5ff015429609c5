//! The reader/writer lock with per-thread recursion tracking.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Microseconds slept between checks while spin-waiting for the lock.
const SPIN_SLEEP: Duration = Duration::from_micros(500);

/// Process-wide source of lock instance ids (thread-local recursion tables
/// are keyed by these, so independent sessions don't share state).
static NEXT_LOCK_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide source of lightweight thread ids. 0 means "no thread".
static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_ID: Cell<u64> = const { Cell::new(0) };
    /// Per-thread reader recursion, keyed by lock instance id.
    static READER_RECURSION: RefCell<HashMap<u64, u32>> = RefCell::new(HashMap::new());
}

/// Returns a stable nonzero id for the calling thread.
fn current_thread_id() -> u64 {
    THREAD_ID.with(|id| {
        if id.get() == 0 {
            id.set(NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed));
        }
        id.get()
    })
}

/// The global reader/writer lock for semantic unit content.
///
/// Any read of unit content requires at least a read lock; any mutation
/// requires the write lock. Both are recursive per thread. Acquisition spins
/// with a short sleep and fails after the given timeout, which callers must
/// treat as a recoverable "not available now" condition, never as fatal.
///
/// A thread that holds the write lock may additionally take read locks, but
/// requesting the write lock while holding only a read lock is an error
/// (it would self-deadlock) and fails immediately.
pub struct StoreLock {
    /// Instance id keying the thread-local reader recursion table.
    id: u64,

    /// The thread currently holding the write lock, or 0. Protected by
    /// `writer_recursion`: it may only be set by the thread that successfully
    /// raised `writer_recursion` from 0 to 1.
    writer: AtomicU64,

    /// How often the current writer holds the write lock recursively.
    writer_recursion: AtomicU32,

    /// Sum of all threads' reader recursion counts.
    total_readers: AtomicU32,
}

impl StoreLock {
    /// Creates a new, unlocked store lock.
    pub fn new() -> Self {
        Self {
            id: NEXT_LOCK_ID.fetch_add(1, Ordering::Relaxed),
            writer: AtomicU64::new(0),
            writer_recursion: AtomicU32::new(0),
            total_readers: AtomicU32::new(0),
        }
    }

    fn own_reader_recursion(&self) -> u32 {
        READER_RECURSION.with(|map| map.borrow().get(&self.id).copied().unwrap_or(0))
    }

    fn change_own_reader_recursion(&self, delta: i32) {
        READER_RECURSION.with(|map| {
            let mut map = map.borrow_mut();
            let entry = map.entry(self.id).or_insert(0);
            let updated = entry
                .checked_add_signed(delta)
                .expect("reader recursion went negative");
            if updated == 0 {
                map.remove(&self.id);
            } else {
                *entry = updated;
            }
        });
        if delta >= 0 {
            self.total_readers.fetch_add(delta as u32, Ordering::SeqCst);
        } else {
            self.total_readers
                .fetch_sub(delta.unsigned_abs(), Ordering::SeqCst);
        }
    }

    /// Acquires the lock for reading, spinning up to `timeout` (`None` waits
    /// forever). Returns `false` on timeout.
    ///
    /// The calling thread's reader recursion is raised *before* checking for
    /// a writer: this is what prevents any new writer from succeeding while
    /// the reader is active, including this thread's own re-entrant reads
    /// under its write lock.
    pub fn acquire_read(&self, timeout: Option<Duration>) -> bool {
        self.change_own_reader_recursion(1);

        let writer = self.writer.load(Ordering::Acquire);
        if writer == 0 || writer == current_thread_id() {
            // Either there is no writer, or we hold the write lock ourselves.
            return true;
        }

        let started = Instant::now();
        while self.writer.load(Ordering::Acquire) != 0 {
            match timeout {
                Some(limit) if started.elapsed() >= limit => {
                    self.change_own_reader_recursion(-1);
                    log::warn!(
                        "read lock timed out after {:.1}s",
                        started.elapsed().as_secs_f64()
                    );
                    return false;
                }
                _ => std::thread::sleep(SPIN_SLEEP),
            }
        }

        true
    }

    /// Releases one level of the calling thread's read lock.
    pub fn release_read(&self) {
        self.change_own_reader_recursion(-1);
    }

    /// Returns `true` if the calling thread holds at least one read lock.
    pub fn current_thread_has_read_lock(&self) -> bool {
        self.own_reader_recursion() > 0
    }

    /// Acquires the lock for writing, spinning up to `timeout` (`None` waits
    /// forever). Returns `false` on timeout.
    ///
    /// Requesting the write lock while holding a read lock is a bug (it can
    /// never succeed and would self-deadlock): it asserts in debug builds
    /// and fails immediately in release builds.
    pub fn acquire_write(&self, timeout: Option<Duration>) -> bool {
        debug_assert_eq!(
            self.own_reader_recursion(),
            0,
            "write lock requested while holding a read lock"
        );
        if self.own_reader_recursion() != 0 {
            return false;
        }

        let me = current_thread_id();
        if self.writer.load(Ordering::Relaxed) == me {
            // Already the writer: just raise the recursion count.
            self.writer_recursion.fetch_add(1, Ordering::Relaxed);
            return true;
        }

        let started = Instant::now();
        loop {
            if self.total_readers.load(Ordering::SeqCst) == 0
                && self
                    .writer_recursion
                    .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
            {
                // No other writer can exist now: we raised the recursion
                // count from 0 to 1, which is what protects the writer slot.
                self.writer.store(me, Ordering::Release);
                if self.total_readers.load(Ordering::SeqCst) == 0 {
                    return true;
                }
                // Readers slipped in between the check and the claim.
                // Release the claim and keep spinning.
                self.writer.store(0, Ordering::Relaxed);
                self.writer_recursion.store(0, Ordering::Release);
            }

            match timeout {
                Some(limit) if started.elapsed() >= limit => {
                    log::warn!(
                        "write lock timed out after {:.1}s",
                        started.elapsed().as_secs_f64()
                    );
                    return false;
                }
                _ => std::thread::sleep(SPIN_SLEEP),
            }
        }
    }

    /// Releases one level of the calling thread's write lock. The writer slot
    /// is cleared only when the recursion count reaches zero.
    pub fn release_write(&self) {
        debug_assert!(self.current_thread_has_write_lock());

        // The order matters: writer_recursion protects writer.
        if self.writer_recursion.load(Ordering::Relaxed) == 1 {
            self.writer.store(0, Ordering::Relaxed);
            self.writer_recursion.store(0, Ordering::Release);
        } else {
            self.writer_recursion.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Returns `true` if the calling thread holds the write lock.
    pub fn current_thread_has_write_lock(&self) -> bool {
        self.writer.load(Ordering::Relaxed) == current_thread_id()
    }
}

impl Default for StoreLock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn read_lock_recursion() {
        let lock = StoreLock::new();
        assert!(lock.acquire_read(None));
        assert!(lock.acquire_read(None));
        assert!(lock.current_thread_has_read_lock());
        lock.release_read();
        assert!(lock.current_thread_has_read_lock());
        lock.release_read();
        assert!(!lock.current_thread_has_read_lock());
    }

    #[test]
    fn write_lock_recursion() {
        let lock = StoreLock::new();
        assert!(lock.acquire_write(None));
        assert!(lock.acquire_write(None));
        assert!(lock.current_thread_has_write_lock());
        lock.release_write();
        assert!(lock.current_thread_has_write_lock());
        lock.release_write();
        assert!(!lock.current_thread_has_write_lock());
    }

    #[test]
    fn writer_may_take_read_lock() {
        let lock = StoreLock::new();
        assert!(lock.acquire_write(None));
        assert!(lock.acquire_read(Some(Duration::from_millis(100))));
        lock.release_read();
        lock.release_write();
    }

    #[test]
    #[cfg(not(debug_assertions))]
    fn write_while_reading_fails() {
        let lock = StoreLock::new();
        assert!(lock.acquire_read(None));
        assert!(!lock.acquire_write(Some(Duration::from_millis(10))));
        lock.release_read();
    }

    #[test]
    fn read_times_out_against_writer() {
        let lock = Arc::new(StoreLock::new());
        assert!(lock.acquire_write(None));

        let contender = Arc::clone(&lock);
        let handle = std::thread::spawn(move || {
            let acquired = contender.acquire_read(Some(Duration::from_millis(50)));
            assert!(!acquired);
            // The failed acquisition must have rolled its recursion back.
            assert!(!contender.current_thread_has_read_lock());
        });
        handle.join().unwrap();

        lock.release_write();
    }

    #[test]
    fn write_times_out_against_reader() {
        let lock = Arc::new(StoreLock::new());
        assert!(lock.acquire_read(None));

        let contender = Arc::clone(&lock);
        let handle = std::thread::spawn(move || {
            assert!(!contender.acquire_write(Some(Duration::from_millis(50))));
        });
        handle.join().unwrap();

        lock.release_read();
    }

    #[test]
    fn independent_locks_do_not_share_recursion() {
        let a = StoreLock::new();
        let b = StoreLock::new();
        assert!(a.acquire_read(None));
        assert!(!b.current_thread_has_read_lock());
        // b must still grant a write lock to this thread.
        assert!(b.acquire_write(Some(Duration::from_millis(100))));
        b.release_write();
        a.release_read();
    }

    /// Mutual-exclusion stress test: no two threads ever hold the
    /// write lock at once, and no write overlaps any read. Writers bump a
    /// plain (non-atomic within the critical section) counter pair; readers
    /// verify the pair is always consistent.
    #[test]
    fn stress_mutual_exclusion() {
        const WRITERS: usize = 4;
        const READERS: usize = 8;
        const ROUNDS: usize = 200;

        struct Shared {
            lock: StoreLock,
            a: AtomicU64,
            b: AtomicU64,
        }
        let shared = Arc::new(Shared {
            lock: StoreLock::new(),
            a: AtomicU64::new(0),
            b: AtomicU64::new(0),
        });

        let mut handles = Vec::new();
        for _ in 0..WRITERS {
            let s = Arc::clone(&shared);
            handles.push(std::thread::spawn(move || {
                for _ in 0..ROUNDS {
                    assert!(s.lock.acquire_write(None));
                    // Tear the pair apart on purpose; readers must never
                    // observe the intermediate state.
                    let v = s.a.load(Ordering::Relaxed);
                    s.a.store(v + 1, Ordering::Relaxed);
                    std::thread::yield_now();
                    s.b.store(v + 1, Ordering::Relaxed);
                    s.lock.release_write();
                }
            }));
        }
        for _ in 0..READERS {
            let s = Arc::clone(&shared);
            handles.push(std::thread::spawn(move || {
                for _ in 0..ROUNDS {
                    assert!(s.lock.acquire_read(None));
                    let a = s.a.load(Ordering::Relaxed);
                    let b = s.b.load(Ordering::Relaxed);
                    assert_eq!(a, b, "observed a torn write under read lock");
                    s.lock.release_read();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(
            shared.a.load(Ordering::Relaxed),
            (WRITERS * ROUNDS) as u64,
            "a writer update was lost"
        );
    }
}
