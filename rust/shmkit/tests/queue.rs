//! Shared queues across threads, through named shared memory.

use std::thread;

use shmkit::{AccessMode, CyclicBuffer, HeapRegion, NamedQueue, NamedQueueOwner, SyncSharedQueue};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn unique(tag: &str) -> String {
    format!("shmkit-queue-{}-{}", std::process::id(), tag)
}

#[test]
fn ring_accepts_capacity_minus_one() {
    let mut ring = CyclicBuffer::<u32, 16>::new();
    let mut accepted = 0;
    while ring.write(accepted) {
        accepted += 1;
    }
    assert_eq!(accepted, 15);
    for expected in 0..15 {
        assert_eq!(ring.read(), Some(expected));
    }
    assert!(ring.is_empty());
}

#[test]
fn blocking_push_waits_for_space() {
    init_tracing();
    let backing = HeapRegion::new_zeroed(SyncSharedQueue::<u64, 4>::chunk_size());
    let queue = unsafe { SyncSharedQueue::<u64, 4>::init(backing.region(), 0) }.unwrap();

    thread::scope(|s| {
        s.spawn(|| {
            for value in 0..1000u64 {
                queue.push(value).unwrap();
            }
        });
        for expected in 0..1000u64 {
            assert_eq!(queue.pop().unwrap(), expected);
        }
    });
    assert!(queue.is_empty().unwrap());
}

#[test]
fn many_producers_and_consumers_lose_nothing() {
    init_tracing();
    const PRODUCERS: u64 = 4;
    const PER_PRODUCER: u64 = 2_000;

    let backing = HeapRegion::new_zeroed(SyncSharedQueue::<u64, 8>::chunk_size());
    let queue = unsafe { SyncSharedQueue::<u64, 8>::init(backing.region(), 0) }.unwrap();

    let total: u64 = thread::scope(|s| {
        for p in 0..PRODUCERS {
            let queue = &queue;
            s.spawn(move || {
                for i in 0..PER_PRODUCER {
                    queue.push(p * PER_PRODUCER + i + 1).unwrap();
                }
            });
        }
        let consumers: Vec<_> = (0..2)
            .map(|_| {
                let queue = &queue;
                s.spawn(move || {
                    let mut sum = 0u64;
                    for _ in 0..PRODUCERS * PER_PRODUCER / 2 {
                        sum += queue.pop().unwrap();
                    }
                    sum
                })
            })
            .collect();
        consumers.into_iter().map(|c| c.join().unwrap()).sum()
    });

    let n = PRODUCERS * PER_PRODUCER;
    assert_eq!(total, n * (n + 1) / 2);
}

#[test]
fn named_queue_preserves_fifo_order() {
    init_tracing();
    let name = unique("fifo");
    let owner = NamedQueueOwner::<i32>::create(&name, AccessMode::ReadWrite, 0).unwrap();
    assert!(owner.object().created());

    let writer = {
        let name = name.clone();
        thread::spawn(move || {
            let queue = NamedQueue::<i32>::attach(&name, AccessMode::ReadWrite, 0).unwrap();
            for value in (0..=10_000).rev() {
                queue.push(value).unwrap();
            }
        })
    };

    let mut expected = 10_000;
    loop {
        let value = owner.pop().unwrap();
        assert_eq!(value, expected);
        if value == 0 {
            break;
        }
        expected -= 1;
    }
    writer.join().unwrap();
}

#[test]
fn queue_at_an_offset_shares_the_object() {
    init_tracing();
    let name = unique("offset");
    let offset = 3 * 4096 + 128;
    let owner = NamedQueueOwner::<u16, 32>::create(&name, AccessMode::ReadWrite, offset).unwrap();
    let attached = NamedQueue::<u16, 32>::attach(&name, AccessMode::ReadWrite, offset).unwrap();

    assert!(owner.try_push(7).unwrap());
    assert_eq!(attached.try_pop().unwrap(), Some(7));
    assert_eq!(attached.try_pop().unwrap(), None);
    assert!(
        owner.object().len().unwrap() >= offset + SyncSharedQueue::<u16, 32>::chunk_size()
    );
}

#[test]
fn owner_unlinks_on_drop() {
    let name = unique("unlink");
    let owner = NamedQueueOwner::<u8, 4>::create(&name, AccessMode::ReadWrite, 0).unwrap();
    {
        let attached = NamedQueue::<u8, 4>::attach(&name, AccessMode::ReadWrite, 0).unwrap();
        attached.push(1).unwrap();
    }
    // Dropping the attacher left the name in place.
    assert_eq!(owner.pop().unwrap(), 1);
    drop(owner);
    assert!(shmkit::shm::unlink_name(&name).is_err());
}
