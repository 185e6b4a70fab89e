//! Blocking FIFO queues that live in shared memory.
//!
//! A queue is one contiguous block: a [`CyclicBuffer`], the [`Mutex`] that
//! guards it and two [`ConditionVariable`]s (space available, data
//! available). The block holds no pointers, so every process that maps the
//! same bytes sees the same queue.
//!
//! Construction is split by role. [`SyncSharedQueue::init`] and
//! [`NamedQueueOwner`] write a fresh block; [`SyncSharedQueue::attach`] and
//! [`NamedQueue`] only reinterpret bytes someone else initialised.

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::mem::size_of;
use core::ops::Deref;
use core::ptr::addr_of_mut;

use crate::condition::ConditionVariable;
use crate::cyclic::CyclicBuffer;
use crate::error::{Error, Result};
use crate::mutex::Mutex;
use crate::region::Region;
use crate::shm::{AccessMode, SharedObject, SharedRegion};

/// Slots per queue when nothing else is specified.
pub const DEFAULT_QUEUE_CAPACITY: usize = 128;

#[repr(C)]
struct QueueBlock<T: Copy, const N: usize> {
    buffer: UnsafeCell<CyclicBuffer<T, N>>,
    mutex: Mutex,
    not_full: ConditionVariable,
    not_empty: ConditionVariable,
}

/// A view of a queue block at `offset` in `region`.
pub struct SyncSharedQueue<T: Copy, const N: usize = DEFAULT_QUEUE_CAPACITY> {
    region: Region,
    offset: usize,
    _marker: PhantomData<T>,
}

// SAFETY: every access to the buffer happens under the block's mutex.
unsafe impl<T: Copy + Send, const N: usize> Send for SyncSharedQueue<T, N> {}
unsafe impl<T: Copy + Send, const N: usize> Sync for SyncSharedQueue<T, N> {}

impl<T: Copy, const N: usize> SyncSharedQueue<T, N> {
    /// Bytes one queue block occupies.
    pub const fn chunk_size() -> usize {
        size_of::<QueueBlock<T, N>>()
    }

    /// Usable capacity (one slot is sacrificed).
    pub const fn capacity() -> usize {
        CyclicBuffer::<T, N>::capacity()
    }

    /// Build a fresh, empty queue at `offset`.
    ///
    /// # Safety
    ///
    /// The region must outlive every view of this queue, and no other
    /// process or thread may be using a queue at that offset while it is
    /// being initialised.
    pub unsafe fn init(region: Region, offset: usize) -> Result<Self> {
        check_placement::<QueueBlock<T, N>>(region, offset)?;
        let block = region.offset(offset) as *mut QueueBlock<T, N>;
        // SAFETY: placement was checked above and we are the only user.
        unsafe {
            CyclicBuffer::init_in_place(UnsafeCell::raw_get(addr_of_mut!((*block).buffer)));
            addr_of_mut!((*block).mutex).write(Mutex::new());
            addr_of_mut!((*block).not_full).write(ConditionVariable::new());
            addr_of_mut!((*block).not_empty).write(ConditionVariable::new());
        }
        tracing::trace!(offset, slots = N, "initialised shared queue");
        Ok(Self {
            region,
            offset,
            _marker: PhantomData,
        })
    }

    /// View a queue that was initialised by someone else (or bytes that are
    /// still all zero, which read as an empty queue).
    ///
    /// # Safety
    ///
    /// The bytes at `offset` must hold a queue of the same `T` and `N`, and
    /// the region must outlive every view of it.
    pub unsafe fn attach(region: Region, offset: usize) -> Result<Self> {
        check_placement::<QueueBlock<T, N>>(region, offset)?;
        tracing::trace!(offset, slots = N, "attached shared queue");
        Ok(Self {
            region,
            offset,
            _marker: PhantomData,
        })
    }

    #[inline]
    fn block(&self) -> &QueueBlock<T, N> {
        // SAFETY: placement was checked at construction and the contract of
        // init/attach keeps the bytes alive and initialised.
        unsafe { self.region.get::<QueueBlock<T, N>>(self.offset) }
    }

    /// Append `value`, sleeping while the queue is full.
    pub fn push(&self, value: T) -> Result<()> {
        let block = self.block();
        let guard = block.mutex.lock()?;
        // SAFETY (both closures and the write): the mutex is held.
        let guard = block
            .not_full
            .wait_until(guard, || !unsafe { &*block.buffer.get() }.is_full())?;
        unsafe { (*block.buffer.get()).write(value) };
        block.not_empty.notify_one()?;
        drop(guard);
        Ok(())
    }

    /// Take the oldest element, sleeping while the queue is empty.
    pub fn pop(&self) -> Result<T> {
        let block = self.block();
        let guard = block.mutex.lock()?;
        let guard = block
            .not_empty
            .wait_until(guard, || !unsafe { &*block.buffer.get() }.is_empty())?;
        // SAFETY: the mutex is held.
        let value = unsafe { (*block.buffer.get()).read() };
        let Some(value) = value else {
            return Err(Error::precondition("queue drained while its mutex was held"));
        };
        block.not_full.notify_one()?;
        drop(guard);
        Ok(value)
    }

    /// Append `value` unless the queue is full. Takes the mutex but never
    /// waits on a condition.
    pub fn try_push(&self, value: T) -> Result<bool> {
        let block = self.block();
        let guard = block.mutex.lock()?;
        // SAFETY: the mutex is held.
        if !unsafe { (*block.buffer.get()).write(value) } {
            return Ok(false);
        }
        block.not_empty.notify_one()?;
        drop(guard);
        Ok(true)
    }

    /// Take the oldest element if there is one.
    pub fn try_pop(&self) -> Result<Option<T>> {
        let block = self.block();
        let guard = block.mutex.lock()?;
        // SAFETY: the mutex is held.
        let value = unsafe { (*block.buffer.get()).read() };
        if value.is_some() {
            block.not_full.notify_one()?;
        }
        drop(guard);
        Ok(value)
    }

    pub fn len(&self) -> Result<usize> {
        let block = self.block();
        let _guard = block.mutex.lock()?;
        // SAFETY: the mutex is held.
        Ok(unsafe { &*block.buffer.get() }.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Offset of the block inside its region.
    pub fn offset(&self) -> usize {
        self.offset
    }
}

impl<T: Copy, const N: usize> std::fmt::Debug for SyncSharedQueue<T, N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncSharedQueue")
            .field("offset", &self.offset)
            .field("slots", &N)
            .finish()
    }
}

fn check_placement<B>(region: Region, offset: usize) -> Result<()> {
    let fits = offset
        .checked_add(size_of::<B>())
        .is_some_and(|end| end <= region.len());
    if !fits {
        return Err(Error::precondition(format!(
            "queue of {} bytes at offset {} overruns a region of {} bytes",
            size_of::<B>(),
            offset,
            region.len()
        )));
    }
    if !region.fits::<B>(offset) {
        return Err(Error::precondition(format!(
            "queue at offset {} is misaligned",
            offset
        )));
    }
    Ok(())
}

/// The creating side of a queue in a named shared memory object.
///
/// Initialises the block on creation and unlinks the name when dropped.
pub struct NamedQueueOwner<T: Copy, const N: usize = DEFAULT_QUEUE_CAPACITY> {
    queue: SyncSharedQueue<T, N>,
    _mapping: SharedRegion,
    object: SharedObject,
}

impl<T: Copy, const N: usize> NamedQueueOwner<T, N> {
    /// Open (or create) `name`, size it to hold a queue at `offset`, map it
    /// and initialise the queue.
    ///
    /// Create the owner before any attacher starts pushing: initialisation
    /// resets whatever the block held.
    pub fn create(name: &str, mode: AccessMode, offset: usize) -> Result<Self> {
        let (object, mapping) = open_and_map::<T, N>(name, mode, offset)?;
        // SAFETY: the mapping lives in this struct next to the view.
        let queue = unsafe { SyncSharedQueue::init(mapping.region(), 0)? };
        tracing::debug!(name, offset, slots = N, "created named queue");
        Ok(Self {
            queue,
            _mapping: mapping,
            object,
        })
    }

    pub fn object(&self) -> &SharedObject {
        &self.object
    }
}

impl<T: Copy, const N: usize> Deref for NamedQueueOwner<T, N> {
    type Target = SyncSharedQueue<T, N>;

    fn deref(&self) -> &Self::Target {
        &self.queue
    }
}

impl<T: Copy, const N: usize> Drop for NamedQueueOwner<T, N> {
    fn drop(&mut self) {
        if let Err(err) = self.object.unlink() {
            tracing::warn!(%err, "failed to unlink named queue");
        }
    }
}

/// An attaching side of a named queue. Never initialises or unlinks.
pub struct NamedQueue<T: Copy, const N: usize = DEFAULT_QUEUE_CAPACITY> {
    queue: SyncSharedQueue<T, N>,
    _mapping: SharedRegion,
    _object: SharedObject,
}

impl<T: Copy, const N: usize> NamedQueue<T, N> {
    pub fn attach(name: &str, mode: AccessMode, offset: usize) -> Result<Self> {
        let (object, mapping) = open_and_map::<T, N>(name, mode, offset)?;
        // SAFETY: the mapping lives in this struct next to the view.
        let queue = unsafe { SyncSharedQueue::attach(mapping.region(), 0)? };
        tracing::debug!(name, offset, "attached named queue");
        Ok(Self {
            queue,
            _mapping: mapping,
            _object: object,
        })
    }
}

impl<T: Copy, const N: usize> Deref for NamedQueue<T, N> {
    type Target = SyncSharedQueue<T, N>;

    fn deref(&self) -> &Self::Target {
        &self.queue
    }
}

fn open_and_map<T: Copy, const N: usize>(
    name: &str,
    mode: AccessMode,
    offset: usize,
) -> Result<(SharedObject, SharedRegion)> {
    let chunk = SyncSharedQueue::<T, N>::chunk_size();
    let object = SharedObject::open(name, mode)?;
    let end = offset
        .checked_add(chunk)
        .ok_or_else(|| Error::precondition("queue end overflows"))?;
    object.allocate(end)?;
    let mapping = object.map(offset, chunk, mode)?;
    Ok((object, mapping))
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::region::HeapRegion;

    #[test]
    fn zeroed_bytes_read_as_an_empty_queue() {
        let owner = HeapRegion::new_zeroed(SyncSharedQueue::<u32, 8>::chunk_size());
        let queue = unsafe { SyncSharedQueue::<u32, 8>::attach(owner.region(), 0) }.unwrap();
        assert!(queue.is_empty().unwrap());
        assert_eq!(queue.try_pop().unwrap(), None);
        assert!(queue.try_push(5).unwrap());
        assert_eq!(queue.pop().unwrap(), 5);
    }

    #[test]
    fn try_push_reports_full() {
        let owner = HeapRegion::new_zeroed(4096);
        let queue = unsafe { SyncSharedQueue::<u64, 4>::init(owner.region(), 0) }.unwrap();
        assert!(queue.try_push(1).unwrap());
        assert!(queue.try_push(2).unwrap());
        assert!(queue.try_push(3).unwrap());
        assert!(!queue.try_push(4).unwrap());
        assert_eq!(queue.len().unwrap(), 3);
    }

    #[test]
    fn placement_is_checked() {
        let owner = HeapRegion::new_zeroed(64);
        let region = owner.region();
        let too_small = unsafe { SyncSharedQueue::<u64, 16>::init(region, 0) };
        assert!(matches!(too_small, Err(Error::Precondition(_))));

        let big = HeapRegion::new_zeroed(4096);
        let misaligned = unsafe { SyncSharedQueue::<u64, 4>::attach(big.region(), 1) };
        assert!(matches!(misaligned, Err(Error::Precondition(_))));
    }

    #[test]
    fn views_of_one_block_share_state() {
        let owner = HeapRegion::new_zeroed(4096);
        let a = unsafe { SyncSharedQueue::<u32, 8>::init(owner.region(), 64) }.unwrap();
        let b = unsafe { SyncSharedQueue::<u32, 8>::attach(owner.region(), 64) }.unwrap();
        a.push(11).unwrap();
        a.push(12).unwrap();
        assert_eq!(b.pop().unwrap(), 11);
        assert_eq!(b.try_pop().unwrap(), Some(12));
        assert!(a.is_empty().unwrap());
    }
}
