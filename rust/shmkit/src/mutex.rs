//! A three-state futex mutex.
//!
//! The lock is a single `u32`, so it can be embedded in any structure that
//! lives in shared memory. All-zero bytes are an unlocked mutex.

use crate::error::Result;
use crate::futex::{futex_wait, futex_wake};
use crate::sync::{AtomicU32, Ordering};

/// Nobody holds the lock.
pub const UNLOCKED: u32 = 0;
/// Held, and nobody is (known to be) waiting.
pub const LOCKED: u32 = 1;
/// Held, and at least one thread may be sleeping on the word.
pub const CONTENDED: u32 = 2;

/// Mutual exclusion on a futex word.
///
/// Unlike `std::sync::Mutex`, this guards no data of its own: it protects
/// whatever the surrounding shared structure says it protects. The futex
/// calls are not process-private, so two processes mapping the same bytes
/// exclude each other.
#[repr(C)]
pub struct Mutex {
    word: AtomicU32,
}

#[cfg(not(loom))]
static_assertions::assert_eq_size!(Mutex, u32);

impl Mutex {
    pub fn new() -> Self {
        Self {
            word: AtomicU32::new(UNLOCKED),
        }
    }

    /// Block until the lock is acquired.
    pub fn lock(&self) -> Result<MutexGuard<'_>> {
        self.lock_raw()?;
        Ok(MutexGuard { mutex: self })
    }

    /// Acquire the lock if it is free right now.
    pub fn try_lock(&self) -> Option<MutexGuard<'_>> {
        self.word
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| MutexGuard { mutex: self })
    }

    /// Whether some thread currently holds the lock.
    pub fn is_locked(&self) -> bool {
        self.word.load(Ordering::Relaxed) != UNLOCKED
    }

    pub(crate) fn lock_raw(&self) -> Result<()> {
        let mut state = match self.word.compare_exchange(
            UNLOCKED,
            LOCKED,
            Ordering::Acquire,
            Ordering::Relaxed,
        ) {
            Ok(_) => return Ok(()),
            Err(state) => state,
        };

        // Slow path. From here on we always leave the word at CONTENDED, so
        // whoever unlocks after us knows to issue a wake.
        if state != CONTENDED {
            state = self.word.swap(CONTENDED, Ordering::Acquire);
        }
        while state != UNLOCKED {
            futex_wait(&self.word, CONTENDED)?;
            state = self.word.swap(CONTENDED, Ordering::Acquire);
        }
        Ok(())
    }

    pub(crate) fn unlock_raw(&self) -> Result<()> {
        if self.word.fetch_sub(1, Ordering::Release) == LOCKED {
            return Ok(());
        }
        self.word.store(UNLOCKED, Ordering::Release);
        futex_wake(&self.word, 1)
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Mutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mutex")
            .field("state", &self.word.load(Ordering::Relaxed))
            .finish()
    }
}

/// Holds a [`Mutex`] locked until dropped.
#[must_use = "the mutex is unlocked as soon as the guard is dropped"]
pub struct MutexGuard<'a> {
    mutex: &'a Mutex,
}

impl<'a> MutexGuard<'a> {
    /// The mutex this guard holds.
    pub fn mutex(&self) -> &'a Mutex {
        self.mutex
    }

    /// Release the lock, surfacing a failed wake instead of logging it.
    pub fn unlock(self) -> Result<()> {
        let mutex = self.mutex;
        std::mem::forget(self);
        mutex.unlock_raw()
    }
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.mutex.unlock_raw() {
            tracing::warn!(%err, "failed to wake a mutex waiter");
        }
    }
}

impl std::fmt::Debug for MutexGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutexGuard").field("mutex", self.mutex).finish()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn try_lock_fails_while_held() {
        let mutex = Mutex::new();
        let guard = mutex.lock().unwrap();
        assert!(mutex.is_locked());
        assert!(mutex.try_lock().is_none());
        drop(guard);
        assert!(!mutex.is_locked());
        assert!(mutex.try_lock().is_some());
    }

    #[test]
    fn explicit_unlock_releases() {
        let mutex = Mutex::new();
        mutex.lock().unwrap().unlock().unwrap();
        assert!(!mutex.is_locked());
    }

    #[test]
    fn zeroed_bytes_are_an_unlocked_mutex() {
        let owner = crate::HeapRegion::new_zeroed(64);
        let region = owner.region();
        let mutex: &Mutex = unsafe { region.get(0) };
        assert!(!mutex.is_locked());
        let _guard = mutex.lock().unwrap();
        assert!(mutex.is_locked());
    }
}
