use crate::condition::ConditionVariable;
use crate::error::Result;
use crate::mutex::Mutex;
use crate::sync::{AtomicU32, Ordering};

/// An event that lets one waiter through per [`set`](Self::set) and then
/// closes again.
///
/// Setting an event that is already set does nothing; sets are not counted.
/// Built only from futex primitives, so it can live in shared memory (zeroed
/// bytes are an unset event).
#[repr(C)]
#[derive(Debug, Default)]
pub struct AutoResetEvent {
    mutex: Mutex,
    cond: ConditionVariable,
    set: AtomicU32,
}

impl AutoResetEvent {
    pub fn new() -> Self {
        Self {
            mutex: Mutex::new(),
            cond: ConditionVariable::new(),
            set: AtomicU32::new(0),
        }
    }

    /// Open the event, releasing one current or future waiter.
    pub fn set(&self) -> Result<()> {
        let guard = self.mutex.lock()?;
        self.set.store(1, Ordering::Relaxed);
        drop(guard);
        self.cond.notify_one()
    }

    /// Block until the event is set, then reset it.
    pub fn wait_one(&self) -> Result<()> {
        let guard = self.mutex.lock()?;
        let guard = self
            .cond
            .wait_until(guard, || self.set.load(Ordering::Relaxed) != 0)?;
        self.set.store(0, Ordering::Relaxed);
        drop(guard);
        Ok(())
    }

    pub fn is_set(&self) -> bool {
        self.set.load(Ordering::Relaxed) != 0
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn set_before_wait_is_not_lost() {
        let event = AutoResetEvent::new();
        event.set().unwrap();
        event.set().unwrap();
        assert!(event.is_set());
        event.wait_one().unwrap();
        assert!(!event.is_set());
    }
}
