//! Scoped guards that acquire on construction and release on drop.

use crate::lock::StoreLock;
use rand::Rng;
use std::time::Duration;

/// Picks the default guard timeout: 10–12 seconds, randomized per instance
/// so that concurrently blocked competitors do not all expire simultaneously
/// (there is always one that waits the longest).
fn default_timeout() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(10_000..=12_000))
}

/// RAII guard for the read side of a [`StoreLock`].
///
/// Acquires on construction and releases on drop (or explicit
/// [`unlock`](Self::unlock)). Construction with [`new`](Self::new) uses the
/// randomized default timeout; callers that need different behavior use
/// [`with_timeout`](Self::with_timeout). Always check [`locked`](Self::locked)
/// before touching unit content: a timed-out guard holds nothing.
pub struct ReadGuard<'a> {
    lock: &'a StoreLock,
    locked: bool,
    timeout: Option<Duration>,
}

impl<'a> ReadGuard<'a> {
    /// Acquires a read lock with the randomized default timeout.
    pub fn new(lock: &'a StoreLock) -> Self {
        Self::with_timeout(lock, Some(default_timeout()))
    }

    /// Acquires a read lock with an explicit timeout (`None` waits forever).
    pub fn with_timeout(lock: &'a StoreLock, timeout: Option<Duration>) -> Self {
        let mut guard = Self {
            lock,
            locked: false,
            timeout,
        };
        guard.lock();
        guard
    }

    /// Returns `true` if the guard currently holds the lock.
    pub fn locked(&self) -> bool {
        self.locked
    }

    /// Re-acquires the lock after an explicit [`unlock`](Self::unlock).
    /// Returns whether the lock is held afterwards.
    pub fn lock(&mut self) -> bool {
        if self.locked {
            return true;
        }
        self.locked = self.lock.acquire_read(self.timeout);
        debug_assert!(
            self.locked || self.timeout.is_some(),
            "untimed read acquisition cannot fail"
        );
        self.locked
    }

    /// Releases the lock early, before the guard is dropped.
    pub fn unlock(&mut self) {
        if self.locked {
            self.lock.release_read();
            self.locked = false;
        }
    }
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.unlock();
    }
}

/// RAII guard for the write side of a [`StoreLock`].
///
/// Same shape as [`ReadGuard`]. The cleanup engine uses the explicit
/// [`unlock`](Self::unlock)/[`lock`](Self::lock) pair to yield the write
/// lock between batches during soft passes.
pub struct WriteGuard<'a> {
    lock: &'a StoreLock,
    locked: bool,
    timeout: Option<Duration>,
}

impl<'a> WriteGuard<'a> {
    /// Acquires the write lock with the randomized default timeout.
    pub fn new(lock: &'a StoreLock) -> Self {
        Self::with_timeout(lock, Some(default_timeout()))
    }

    /// Acquires the write lock with an explicit timeout (`None` waits forever).
    pub fn with_timeout(lock: &'a StoreLock, timeout: Option<Duration>) -> Self {
        let mut guard = Self {
            lock,
            locked: false,
            timeout,
        };
        guard.lock();
        guard
    }

    /// Returns `true` if the guard currently holds the lock.
    pub fn locked(&self) -> bool {
        self.locked
    }

    /// Re-acquires the lock after an explicit [`unlock`](Self::unlock).
    /// Returns whether the lock is held afterwards.
    pub fn lock(&mut self) -> bool {
        if self.locked {
            return true;
        }
        self.locked = self.lock.acquire_write(self.timeout);
        debug_assert!(
            self.locked || self.timeout.is_some(),
            "untimed write acquisition cannot fail"
        );
        self.locked
    }

    /// Releases the lock early, before the guard is dropped.
    pub fn unlock(&mut self) {
        if self.locked {
            self.lock.release_write();
            self.locked = false;
        }
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.unlock();
    }
}
