//! Futex condition variables.
//!
//! A [`Condition`] is three words: a command word the waiters sleep on, a
//! count of registered waiters, and a gate [`Mutex`] that serialises
//! signallers. It holds no pointers and all-zero bytes are a valid condition
//! with no waiters, so it can be placed in shared memory next to the mutex it
//! is used with.
//!
//! Delivery is synchronous: `signal` does not return until the command has
//! been consumed and the word is back to `SLEEP`. Signals sent while nobody
//! waits are dropped.

use crate::error::Result;
use crate::futex::{futex_wait, futex_wake, futex_wake_all};
use crate::mutex::{Mutex, MutexGuard};
use crate::sync::{AtomicU32, Ordering, spin_loop, thread};

const SLEEP: u32 = 0;
const NOTIFY_ONE: u32 = 1;
const NOTIFY_ALL: u32 = 2;
/// A `NOTIFY_ONE` has been taken and the taker is still releasing its count.
const CLAIMED: u32 = 3;

/// Busy polls before a waiting party starts yielding its time slice.
const SPIN_LIMIT: u32 = 128;

/// What a [`Condition::signal`] delivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Command {
    /// Wake exactly one registered waiter.
    NotifyOne = NOTIFY_ONE,
    /// Wake every registered waiter.
    NotifyAll = NOTIFY_ALL,
}

/// The raw wait/signal primitive.
#[repr(C)]
pub struct Condition {
    command: AtomicU32,
    waiters: AtomicU32,
    gate: Mutex,
}

#[cfg(not(loom))]
static_assertions::assert_eq_size!(Condition, [u32; 3]);

impl Condition {
    pub fn new() -> Self {
        Self {
            command: AtomicU32::new(SLEEP),
            waiters: AtomicU32::new(0),
            gate: Mutex::new(),
        }
    }

    /// Number of threads currently registered in [`wait`](Self::wait).
    pub fn waiters(&self) -> u32 {
        self.waiters.load(Ordering::Acquire)
    }

    /// Deliver `command` to the registered waiters and wait until it has
    /// been consumed. A no-op when nobody waits.
    pub fn signal(&self, command: Command) -> Result<()> {
        let _gate = self.gate.lock()?;
        if self.waiters.load(Ordering::Acquire) == 0 {
            return Ok(());
        }

        self.command.store(command as u32, Ordering::Release);
        match command {
            Command::NotifyOne => futex_wake(&self.command, 1)?,
            Command::NotifyAll => futex_wake_all(&self.command)?,
        }

        let mut spins = 0;
        while self.command.load(Ordering::Acquire) != SLEEP {
            backoff(&mut spins);
        }
        Ok(())
    }

    /// Release `guard`, sleep until signalled, then re-acquire the mutex.
    ///
    /// Wake-ups may be spurious from the caller's point of view (a
    /// `NotifyAll` meant for an earlier generation of waiters), so callers
    /// re-check their condition; see [`ConditionVariable::wait_until`].
    pub fn wait<'a>(&self, guard: MutexGuard<'a>) -> Result<MutexGuard<'a>> {
        let mutex = guard.mutex();
        self.waiters.fetch_add(1, Ordering::AcqRel);
        if let Err(err) = guard.unlock() {
            self.waiters.fetch_sub(1, Ordering::AcqRel);
            return Err(err);
        }

        if let Err(err) = self.await_command() {
            self.waiters.fetch_sub(1, Ordering::AcqRel);
            return Err(err);
        }
        mutex.lock()
    }

    /// Block until a command for this waiter arrives and consume it. On
    /// return this waiter is no longer counted.
    fn await_command(&self) -> Result<()> {
        let mut spins = 0;
        loop {
            while self.command.load(Ordering::Acquire) == SLEEP {
                futex_wait(&self.command, SLEEP)?;
            }

            match self.command.load(Ordering::Acquire) {
                NOTIFY_ONE => {
                    if self
                        .command
                        .compare_exchange(NOTIFY_ONE, CLAIMED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        // Drop out of the count before the signaller can see
                        // SLEEP, so its next signal counts only live waiters.
                        self.waiters.fetch_sub(1, Ordering::AcqRel);
                        self.command.store(SLEEP, Ordering::Release);
                        return Ok(());
                    }
                }
                NOTIFY_ALL => {
                    if self.waiters.fetch_sub(1, Ordering::AcqRel) == 1 {
                        self.command.store(SLEEP, Ordering::Release);
                    }
                    return Ok(());
                }
                // Someone else claimed a NOTIFY_ONE; it resets the word shortly.
                _ => backoff(&mut spins),
            }
        }
    }
}

impl Default for Condition {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Condition")
            .field("command", &self.command.load(Ordering::Relaxed))
            .field("waiters", &self.waiters.load(Ordering::Relaxed))
            .finish()
    }
}

#[inline]
fn backoff(spins: &mut u32) {
    if *spins < SPIN_LIMIT {
        *spins += 1;
        spin_loop();
    } else {
        thread::yield_now();
    }
}

/// A condition variable with the usual monitor vocabulary.
///
/// Placeable in shared memory for the same reasons as [`Condition`].
#[repr(C)]
#[derive(Debug, Default)]
pub struct ConditionVariable {
    inner: Condition,
}

impl ConditionVariable {
    pub fn new() -> Self {
        Self {
            inner: Condition::new(),
        }
    }

    /// Sleep until notified. The guard's mutex is released while asleep and
    /// held again on return.
    pub fn wait<'a>(&self, guard: MutexGuard<'a>) -> Result<MutexGuard<'a>> {
        self.inner.wait(guard)
    }

    /// Sleep until `ready` returns true. `ready` is only ever evaluated with
    /// the mutex held, and is checked before the first sleep.
    pub fn wait_until<'a, F>(&self, mut guard: MutexGuard<'a>, mut ready: F) -> Result<MutexGuard<'a>>
    where
        F: FnMut() -> bool,
    {
        while !ready() {
            guard = self.inner.wait(guard)?;
        }
        Ok(guard)
    }

    pub fn notify_one(&self) -> Result<()> {
        self.inner.signal(Command::NotifyOne)
    }

    pub fn notify_all(&self) -> Result<()> {
        self.inner.signal(Command::NotifyAll)
    }

    pub fn waiters(&self) -> u32 {
        self.inner.waiters()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn signal_without_waiters_is_dropped() {
        let cond = Condition::new();
        cond.signal(Command::NotifyOne).unwrap();
        cond.signal(Command::NotifyAll).unwrap();
        assert_eq!(cond.waiters(), 0);
    }

    #[test]
    fn waiter_resumes_with_the_mutex_held() {
        struct Shared {
            mutex: Mutex,
            cond: ConditionVariable,
            ready: AtomicBool,
        }
        let shared = Arc::new(Shared {
            mutex: Mutex::new(),
            cond: ConditionVariable::new(),
            ready: AtomicBool::new(false),
        });

        let waiter = {
            let shared = Arc::clone(&shared);
            std::thread::spawn(move || {
                let guard = shared.mutex.lock().unwrap();
                let guard = shared
                    .cond
                    .wait_until(guard, || shared.ready.load(Ordering::Relaxed))
                    .unwrap();
                assert!(shared.mutex.is_locked());
                drop(guard);
            })
        };

        {
            let _guard = shared.mutex.lock().unwrap();
            shared.ready.store(true, Ordering::Relaxed);
        }
        shared.cond.notify_one().unwrap();
        waiter.join().unwrap();
        assert_eq!(shared.cond.waiters(), 0);
    }
}
