//! Mutex and condition behaviour under real threads.

use std::cell::UnsafeCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use shmkit::{AutoResetEvent, ConditionVariable, Mutex};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct Counter {
    mutex: Mutex,
    value: UnsafeCell<u64>,
}

// SAFETY: value is only touched with the mutex held.
unsafe impl Sync for Counter {}

#[test]
fn mutex_serialises_increments() {
    init_tracing();
    const THREADS: usize = 8;
    const ROUNDS: u64 = 100_000;

    let counter = Arc::new(Counter {
        mutex: Mutex::new(),
        value: UnsafeCell::new(0),
    });

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let counter = Arc::clone(&counter);
            thread::spawn(move || {
                for _ in 0..ROUNDS {
                    let _guard = counter.mutex.lock().unwrap();
                    unsafe { *counter.value.get() += 1 };
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(unsafe { *counter.value.get() }, THREADS as u64 * ROUNDS);
    assert!(!counter.mutex.is_locked());
}

struct Monitor {
    mutex: Mutex,
    cond: ConditionVariable,
}

fn wait_for_waiters(cond: &ConditionVariable, expected: u32) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while cond.waiters() != expected {
        assert!(Instant::now() < deadline, "waiters never registered");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn notify_one_wakes_exactly_one() {
    init_tracing();
    const WAITERS: usize = 4;

    let monitor = Arc::new(Monitor {
        mutex: Mutex::new(),
        cond: ConditionVariable::new(),
    });
    let woken = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..WAITERS)
        .map(|_| {
            let monitor = Arc::clone(&monitor);
            let woken = Arc::clone(&woken);
            thread::spawn(move || {
                let guard = monitor.mutex.lock().unwrap();
                let guard = monitor.cond.wait(guard).unwrap();
                woken.fetch_add(1, Ordering::SeqCst);
                drop(guard);
            })
        })
        .collect();

    wait_for_waiters(&monitor.cond, WAITERS as u32);
    monitor.cond.notify_one().unwrap();
    thread::sleep(Duration::from_millis(100));
    assert_eq!(woken.load(Ordering::SeqCst), 1);
    assert_eq!(monitor.cond.waiters(), WAITERS as u32 - 1);

    monitor.cond.notify_all().unwrap();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(woken.load(Ordering::SeqCst), WAITERS);
    assert_eq!(monitor.cond.waiters(), 0);
}

#[test]
fn back_to_back_notify_one_wakes_each_waiter() {
    init_tracing();
    const WAITERS: usize = 6;

    let monitor = Arc::new(Monitor {
        mutex: Mutex::new(),
        cond: ConditionVariable::new(),
    });

    let handles: Vec<_> = (0..WAITERS)
        .map(|_| {
            let monitor = Arc::clone(&monitor);
            thread::spawn(move || {
                let guard = monitor.mutex.lock().unwrap();
                drop(monitor.cond.wait(guard).unwrap());
            })
        })
        .collect();

    wait_for_waiters(&monitor.cond, WAITERS as u32);
    for _ in 0..WAITERS {
        monitor.cond.notify_one().unwrap();
    }
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(monitor.cond.waiters(), 0);
}

#[test]
fn predicate_wait_ignores_unrelated_notifications() {
    init_tracing();
    let monitor = Arc::new(Monitor {
        mutex: Mutex::new(),
        cond: ConditionVariable::new(),
    });
    let ready = Arc::new(AtomicBool::new(false));
    let returned = Arc::new(AtomicBool::new(false));

    let waiter = {
        let monitor = Arc::clone(&monitor);
        let ready = Arc::clone(&ready);
        let returned = Arc::clone(&returned);
        thread::spawn(move || {
            let guard = monitor.mutex.lock().unwrap();
            let guard = monitor
                .cond
                .wait_until(guard, || ready.load(Ordering::SeqCst))
                .unwrap();
            returned.store(true, Ordering::SeqCst);
            drop(guard);
        })
    };

    wait_for_waiters(&monitor.cond, 1);
    for _ in 0..5 {
        monitor.cond.notify_all().unwrap();
        wait_for_waiters(&monitor.cond, 1);
        assert!(!returned.load(Ordering::SeqCst));
    }

    {
        let _guard = monitor.mutex.lock().unwrap();
        ready.store(true, Ordering::SeqCst);
    }
    monitor.cond.notify_one().unwrap();
    waiter.join().unwrap();
    assert!(returned.load(Ordering::SeqCst));
}

#[test]
fn auto_reset_event_releases_one_waiter_per_set() {
    init_tracing();
    let event = Arc::new(AutoResetEvent::new());
    let passed = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..3)
        .map(|_| {
            let event = Arc::clone(&event);
            let passed = Arc::clone(&passed);
            thread::spawn(move || {
                event.wait_one().unwrap();
                passed.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect();

    for expected in 1..=3 {
        event.set().unwrap();
        let deadline = Instant::now() + Duration::from_secs(10);
        while passed.load(Ordering::SeqCst) < expected {
            assert!(Instant::now() < deadline, "set did not release a waiter");
            thread::sleep(Duration::from_millis(1));
        }
        thread::sleep(Duration::from_millis(20));
        assert_eq!(passed.load(Ordering::SeqCst), expected);
    }

    for handle in handles {
        handle.join().unwrap();
    }
}
