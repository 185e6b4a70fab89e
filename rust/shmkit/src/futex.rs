//! Raw wait/wake on a 32-bit word.
//!
//! The calls use the non-private futex operations: the word may
//! live in a mapping shared by several processes, and a private futex would
//! only ever match waiters in the calling process.

use crate::error::Result;
use crate::sync::AtomicU32;

/// Sleep while `*word == expected`.
///
/// Returns `Ok` on a wake-up, on a spurious return, and when the word no
/// longer held `expected` at call time. Callers always re-check their own
/// condition afterwards.
#[cfg(all(target_os = "linux", not(loom)))]
pub fn futex_wait(word: &AtomicU32, expected: u32) -> Result<()> {
    // SAFETY: word is a valid, aligned u32 for the duration of the call; a
    // null timeout means wait indefinitely.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAIT,
            expected,
            std::ptr::null::<libc::timespec>(),
        )
    };
    if rc == -1 {
        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EAGAIN) | Some(libc::EINTR) => {}
            _ => {
                return Err(crate::Error::SystemCall {
                    call: "futex(FUTEX_WAIT)",
                    source: err,
                });
            }
        }
    }
    Ok(())
}

/// Wake up to `count` waiters blocked on `word`.
#[cfg(all(target_os = "linux", not(loom)))]
pub fn futex_wake(word: &AtomicU32, count: u32) -> Result<()> {
    let count = count.min(i32::MAX as u32) as libc::c_int;
    // SAFETY: word is a valid, aligned u32 for the duration of the call.
    let rc = unsafe { libc::syscall(libc::SYS_futex, word.as_ptr(), libc::FUTEX_WAKE, count) };
    if rc == -1 {
        return Err(crate::Error::last_os_error("futex(FUTEX_WAKE)"));
    }
    Ok(())
}

// Loom has no kernel to park on. Yielding while the word still matches lets
// the model scheduler run the thread that will change it.
#[cfg(loom)]
pub fn futex_wait(word: &AtomicU32, expected: u32) -> Result<()> {
    use crate::sync::Ordering;
    if word.load(Ordering::Acquire) == expected {
        crate::sync::thread::yield_now();
    }
    Ok(())
}

#[cfg(loom)]
pub fn futex_wake(_word: &AtomicU32, _count: u32) -> Result<()> {
    Ok(())
}

#[cfg(all(not(target_os = "linux"), not(loom)))]
pub fn futex_wait(_word: &AtomicU32, _expected: u32) -> Result<()> {
    Err(crate::Error::UnsupportedPlatform("futex wait"))
}

#[cfg(all(not(target_os = "linux"), not(loom)))]
pub fn futex_wake(_word: &AtomicU32, _count: u32) -> Result<()> {
    Err(crate::Error::UnsupportedPlatform("futex wake"))
}

/// Wake every waiter blocked on `word`.
#[inline]
pub fn futex_wake_all(word: &AtomicU32) -> Result<()> {
    futex_wake(word, i32::MAX as u32)
}

#[cfg(all(test, target_os = "linux", not(loom)))]
mod tests {
    use super::*;
    use crate::sync::Ordering;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn wait_returns_immediately_on_mismatch() {
        let word = AtomicU32::new(5);
        futex_wait(&word, 4).unwrap();
    }

    #[test]
    fn wake_without_waiters_is_fine() {
        let word = AtomicU32::new(0);
        futex_wake(&word, 1).unwrap();
        futex_wake_all(&word).unwrap();
    }

    #[test]
    fn wake_releases_a_sleeper() {
        let word = Arc::new(AtomicU32::new(0));
        let sleeper = {
            let word = Arc::clone(&word);
            std::thread::spawn(move || {
                while word.load(Ordering::Acquire) == 0 {
                    futex_wait(&word, 0).unwrap();
                }
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        word.store(1, Ordering::Release);
        futex_wake(&word, 1).unwrap();
        sleeper.join().unwrap();
    }
}
