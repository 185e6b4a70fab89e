#![cfg(all(test, loom))]

use crate::condition::ConditionVariable;
use crate::mutex::Mutex;
use crate::region::HeapRegion;
use crate::queue::SyncSharedQueue;
use crate::sync::{AtomicU32, Ordering, thread};
use loom::sync::Arc;

#[test]
fn mutex_excludes() {
    loom::model(|| {
        let mutex = Arc::new(Mutex::new());
        let inside = Arc::new(AtomicU32::new(0));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let mutex = mutex.clone();
                let inside = inside.clone();
                thread::spawn(move || {
                    let _guard = mutex.lock().unwrap();
                    assert_eq!(inside.fetch_add(1, Ordering::Relaxed), 0);
                    inside.fetch_sub(1, Ordering::Relaxed);
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert!(!mutex.is_locked());
    });
}

#[test]
fn notify_one_releases_the_waiter() {
    loom::model(|| {
        let mutex = Arc::new(Mutex::new());
        let cond = Arc::new(ConditionVariable::new());
        let ready = Arc::new(AtomicU32::new(0));

        let waiter = {
            let mutex = mutex.clone();
            let cond = cond.clone();
            let ready = ready.clone();
            thread::spawn(move || {
                let guard = mutex.lock().unwrap();
                let guard = cond
                    .wait_until(guard, || ready.load(Ordering::Relaxed) == 1)
                    .unwrap();
                drop(guard);
            })
        };

        {
            let _guard = mutex.lock().unwrap();
            ready.store(1, Ordering::Relaxed);
        }
        cond.notify_one().unwrap();

        waiter.join().unwrap();
        assert_eq!(cond.waiters(), 0);
    });
}

#[test]
fn queue_hands_values_across_threads() {
    loom::model(|| {
        let owner = Arc::new(HeapRegion::new_zeroed(4096));
        let queue = unsafe { SyncSharedQueue::<u32, 2>::init(owner.region(), 0) }.unwrap();
        let queue = Arc::new(queue);

        let producer = {
            let queue = queue.clone();
            let owner = owner.clone();
            thread::spawn(move || {
                let _keep = owner;
                queue.push(1).unwrap();
                queue.push(2).unwrap();
            })
        };

        assert_eq!(queue.pop().unwrap(), 1);
        assert_eq!(queue.pop().unwrap(), 2);
        producer.join().unwrap();
    });
}
