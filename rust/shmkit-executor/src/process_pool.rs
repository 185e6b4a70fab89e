//! Workers as forked processes, fed through shared memory.
//!
//! One named object holds everything the workers need:
//!
//! ```text
//! +---------+---------+-----+-----------+---------------------------+
//! | queue 0 | queue 1 | ... | (padding) | task arena (buddy heap)   |
//! +---------+---------+-----+-----------+---------------------------+
//! 0         stride                      arena_offset (page aligned)
//! ```
//!
//! A task is a block in the arena: a header with the state word,
//! the mutex and condition variable its waiter sleeps on, and the failure
//! reason, followed by the function and its arguments. Queues carry arena
//! offsets, never pointers.
//!
//! Only the pool allocates from the arena. Workers are forked from the pool
//! after it has been built, so the function pointers stored in a task block
//! are valid in every worker; this is also why task arguments must be
//! `Copy` data without pointers into the parent's private memory.

use std::alloc::Layout;
use std::cell::{Cell, UnsafeCell};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use parking_lot::{Mutex as LocalMutex, RwLock};
use shmkit::shm::page_size;
use shmkit::{
    AccessMode, BuddyHeap, ConditionVariable, Mutex, Region, SharedObject, SharedRegion,
    SyncSharedQueue,
};

use crate::config::{DEFAULT_QUEUE_CAPACITY, MAX_FAILURE_REASON, ProcessPoolConfig};
use crate::process::{ChildOutput, ChildProcess, spawn_with};
use crate::task::{TaskError, TaskState};
use crate::worker::{WorkItem, WorkSource, run_worker};

/// A worker's queue of task offsets.
pub type TaskQueue = SyncSharedQueue<u64, DEFAULT_QUEUE_CAPACITY>;

/// Queues start on cache line boundaries.
const QUEUE_ALIGN: usize = 64;

type RunFn = unsafe fn(NonNull<TaskHeader>) -> Result<(), TaskError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
enum TaskKind {
    Work = 0,
    Terminate = 1,
}

#[repr(C)]
struct TaskHeader {
    state: AtomicU32,
    kind: TaskKind,
    mutex: Mutex,
    done: ConditionVariable,
    run: RunFn,
    /// Guarded by `mutex`, as is `reason`.
    reason_len: AtomicU32,
    reason: UnsafeCell<[u8; MAX_FAILURE_REASON]>,
}

static_assertions::const_assert!(MAX_FAILURE_REASON <= u32::MAX as usize);

impl TaskHeader {
    fn new(kind: TaskKind, run: RunFn) -> Self {
        Self {
            state: AtomicU32::new(TaskState::Created as u32),
            kind,
            mutex: Mutex::new(),
            done: ConditionVariable::new(),
            run,
            reason_len: AtomicU32::new(0),
            reason: UnsafeCell::new([0; MAX_FAILURE_REASON]),
        }
    }

    /// An unknown raw value reads as `Canceled`.
    fn state(&self) -> TaskState {
        TaskState::from_raw(self.state.load(Ordering::Acquire)).unwrap_or(TaskState::Canceled)
    }

    /// Caller holds `mutex`.
    unsafe fn reason(&self) -> String {
        let len = self.reason_len.load(Ordering::Relaxed) as usize;
        // SAFETY: the mutex is held, so nobody writes the bytes.
        let bytes = unsafe { &*self.reason.get() };
        String::from_utf8_lossy(&bytes[..len.min(MAX_FAILURE_REASON)]).into_owned()
    }

    /// Caller holds `mutex`.
    unsafe fn set_reason(&self, reason: &str) {
        let reason = truncate_reason(reason);
        // SAFETY: the mutex is held, so nobody reads the bytes.
        let bytes = unsafe { &mut *self.reason.get() };
        bytes[..reason.len()].copy_from_slice(reason.as_bytes());
        self.reason_len.store(reason.len() as u32, Ordering::Relaxed);
    }
}

fn truncate_reason(reason: &str) -> &str {
    if reason.len() <= MAX_FAILURE_REASON {
        return reason;
    }
    let mut end = MAX_FAILURE_REASON;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}

#[repr(C)]
struct TaskBlock<A, E> {
    header: TaskHeader,
    func: fn(A) -> Result<(), E>,
    args: A,
}

/// # Safety
///
/// `header` must be the header of a live `TaskBlock<A, E>`.
unsafe fn trampoline<A: Copy, E: Into<TaskError>>(
    header: NonNull<TaskHeader>,
) -> Result<(), TaskError> {
    // SAFETY: the header is the first field of a repr(C) TaskBlock<A, E>.
    let block = unsafe { header.cast::<TaskBlock<A, E>>().as_ref() };
    (block.func)(block.args).map_err(Into::into)
}

unsafe fn run_nothing(_: NonNull<TaskHeader>) -> Result<(), TaskError> {
    Ok(())
}

/// Where everything sits inside the pool's shared object.
#[derive(Debug, Clone, Copy)]
struct PoolLayout {
    stride: usize,
    arena_offset: usize,
    arena_size: usize,
    total: usize,
}

impl PoolLayout {
    fn new(workers: usize, arena_size: usize, page: usize) -> shmkit::Result<Self> {
        let overflow = || shmkit::Error::Precondition("process pool layout overflows".to_owned());
        let stride = TaskQueue::chunk_size().next_multiple_of(QUEUE_ALIGN);
        let queues_end = workers.checked_mul(stride).ok_or_else(overflow)?;
        let arena_offset = queues_end
            .checked_next_multiple_of(page)
            .ok_or_else(overflow)?;
        let total = arena_offset.checked_add(arena_size).ok_or_else(overflow)?;
        Ok(Self {
            stride,
            arena_offset,
            arena_size,
            total,
        })
    }

    fn queue_offset(&self, index: usize) -> usize {
        index * self.stride
    }

    fn arena(&self, region: Region) -> shmkit::Result<Region> {
        region
            .sub_region(self.arena_offset, self.arena_size)
            .ok_or_else(|| shmkit::Error::Precondition("arena lies outside the mapping".to_owned()))
    }
}

/// A task block in a [`ProcessPool`]'s arena. The block is freed when the
/// task is dropped, after waiting for it if it was submitted.
pub struct ProcessTask<'p> {
    pool: &'p ProcessPool,
    header: NonNull<TaskHeader>,
    submitted: Cell<bool>,
}

static_assertions::assert_not_impl_any!(ProcessTask<'static>: Send, Sync);

impl ProcessTask<'_> {
    fn header(&self) -> &TaskHeader {
        // SAFETY: the block stays allocated until self is dropped.
        unsafe { self.header.as_ref() }
    }

    pub fn state(&self) -> TaskState {
        self.header().state()
    }

    /// Block until the task has completed or been canceled. A task that was
    /// never pushed cannot finish, so waiting on it is an error.
    pub fn wait(&self) -> Result<(), TaskError> {
        if !self.submitted.get() {
            return Err(TaskError::new("task was never submitted"));
        }
        let header = self.header();
        let guard = header.mutex.lock()?;
        let guard = header.done.wait_until(guard, || header.state().is_finished())?;
        let outcome = match header.state() {
            // SAFETY: the mutex is held.
            TaskState::Canceled => Err(TaskError::new(unsafe { header.reason() })),
            _ => Ok(()),
        };
        drop(guard);
        outcome
    }
}

impl std::fmt::Debug for ProcessTask<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessTask")
            .field("state", &self.state())
            .field("kind", &self.header().kind)
            .field("submitted", &self.submitted.get())
            .finish()
    }
}

impl Drop for ProcessTask<'_> {
    fn drop(&mut self) {
        // Taking the mutex also waits out a worker still inside `finish`.
        if self.submitted.get() {
            let header = self.header();
            let finished = header
                .mutex
                .lock()
                .and_then(|guard| header.done.wait_until(guard, || header.state().is_finished()));
            if let Err(err) = finished {
                tracing::warn!(%err, "leaking task block that could not be awaited");
                return;
            }
        }
        if let Err(err) = self.pool.heap.deallocate(self.header.cast()) {
            tracing::warn!(%err, "failed to free task block");
        }
    }
}

/// The worker-side view of a task popped off a queue.
struct TaskRef {
    header: NonNull<TaskHeader>,
}

impl TaskRef {
    fn header(&self) -> &TaskHeader {
        // SAFETY: the pool keeps the block allocated until the task has
        // finished and its mutex has been released.
        unsafe { self.header.as_ref() }
    }
}

impl WorkItem for TaskRef {
    fn is_terminate(&self) -> bool {
        self.header().kind == TaskKind::Terminate
    }

    fn execute(&self) -> Result<(), TaskError> {
        let header = self.header();
        header
            .state
            .store(TaskState::Running as u32, Ordering::Release);
        // SAFETY: `run` was stored together with the block it belongs to.
        unsafe { (header.run)(self.header) }
    }

    fn finish(&self, outcome: Result<(), TaskError>) {
        let header = self.header();
        let guard = match header.mutex.lock() {
            Ok(guard) => guard,
            Err(err) => {
                tracing::warn!(%err, "cannot lock task to record its outcome");
                return;
            }
        };
        let state = match outcome {
            Ok(()) => TaskState::Completed,
            Err(err) => {
                // SAFETY: the mutex is held.
                unsafe { header.set_reason(err.reason()) };
                TaskState::Canceled
            }
        };
        header.state.store(state as u32, Ordering::Release);
        // Notify before unlocking: the waiter may free the block as soon as
        // it owns the mutex again.
        if let Err(err) = header.done.notify_all() {
            tracing::warn!(%err, "failed to wake task waiters");
        }
        drop(guard);
    }
}

/// A worker process's end of its queue.
struct QueueSource {
    queue: TaskQueue,
    arena: Region,
}

impl WorkSource for QueueSource {
    type Item = TaskRef;

    fn next_item(&self) -> shmkit::Result<TaskRef> {
        let offset = self.queue.pop()?;
        let offset = usize::try_from(offset)
            .ok()
            .filter(|&offset| self.arena.fits::<TaskHeader>(offset))
            .ok_or_else(|| {
                shmkit::Error::Precondition(format!("task offset {} is not in the arena", offset))
            })?;
        let ptr = self.arena.offset(offset) as *mut TaskHeader;
        Ok(TaskRef {
            // SAFETY: `fits` checked the offset against a non-null base.
            header: unsafe { NonNull::new_unchecked(ptr) },
        })
    }
}

/// Body of a forked worker: attach to the pool by name and serve queue
/// `index` until told to stop.
fn worker_main(name: &str, index: usize, layout: PoolLayout) -> shmkit::Result<usize> {
    let object = SharedObject::open(name, AccessMode::ReadWrite)?;
    let mapping = object.map(0, layout.total, AccessMode::ReadWrite)?;
    let region = mapping.region();
    // SAFETY: the pool initialised this queue before forking us, and the
    // mapping outlives the source.
    let queue = unsafe { TaskQueue::attach(region, layout.queue_offset(index))? };
    let source = QueueSource {
        queue,
        arena: layout.arena(region)?,
    };
    run_worker(index, &source)
}

/// A pool of forked worker processes. The pool owns the shared object: it
/// initialises the queues and the arena, and unlinks the name when dropped.
pub struct ProcessPool {
    heap: BuddyHeap,
    queues: Vec<TaskQueue>,
    /// `children[i]` serves `queues[i]`.
    children: LocalMutex<Vec<ChildProcess>>,
    next: AtomicUsize,
    /// Read-held while a task is queued; `stop` queues its sentinels under
    /// the write lock.
    stopped: RwLock<bool>,
    config: ProcessPoolConfig,
    _mapping: SharedRegion,
    object: SharedObject,
}

impl ProcessPool {
    pub fn create(config: ProcessPoolConfig) -> shmkit::Result<Self> {
        if config.workers == 0 {
            return Err(shmkit::Error::Precondition(
                "a process pool needs at least one worker".to_owned(),
            ));
        }
        let layout = PoolLayout::new(config.workers, config.arena_size, page_size()?)?;
        let object = SharedObject::open(&config.name, AccessMode::ReadWrite)?;
        // Someone else's queues and arena live there; leave them alone.
        if !object.created() {
            return Err(shmkit::Error::Precondition(format!(
                "shared object {} already exists",
                config.name
            )));
        }

        let (mapping, queues, heap) = match init_shared(&object, config.workers, &layout) {
            Ok(parts) => parts,
            Err(err) => {
                if let Err(unlink_err) = object.unlink() {
                    tracing::warn!(err = %unlink_err, "failed to unlink pool object");
                }
                return Err(err);
            }
        };

        let pool = Self {
            heap,
            queues,
            children: LocalMutex::new(Vec::with_capacity(config.workers)),
            next: AtomicUsize::new(0),
            stopped: RwLock::new(false),
            config,
            _mapping: mapping,
            object,
        };

        // On failure, dropping the pool stops the workers spawned so far.
        // Nobody reads a worker's output, so it goes where ours does.
        for index in 0..pool.config.workers {
            let name = pool.config.name.clone();
            let child = spawn_with(ChildOutput::Inherited, move || {
                match worker_main(&name, index, layout) {
                    Ok(_) => 0,
                    Err(err) => {
                        tracing::warn!(worker = index, %err, "worker failed");
                        1
                    }
                }
            })?;
            tracing::debug!(worker = index, pid = child.pid(), "spawned worker process");
            pool.children.lock().push(child);
        }

        tracing::debug!(
            name = %pool.config.name,
            workers = pool.config.workers,
            arena = pool.heap.arena_len(),
            "process pool started"
        );
        Ok(pool)
    }

    /// Copy `func` and `args` into a new task block in the arena.
    pub fn make_task<A, E>(
        &self,
        func: fn(A) -> Result<(), E>,
        args: A,
    ) -> shmkit::Result<ProcessTask<'_>>
    where
        A: Copy + Send + 'static,
        E: Into<TaskError> + 'static,
    {
        let ptr = self
            .heap
            .allocate(Layout::new::<TaskBlock<A, E>>())?
            .cast::<TaskBlock<A, E>>();
        // SAFETY: the block is freshly allocated, large and aligned enough,
        // and not yet visible to any worker.
        unsafe {
            ptr.as_ptr().write(TaskBlock {
                header: TaskHeader::new(TaskKind::Work, trampoline::<A, E>),
                func,
                args,
            });
        }
        Ok(self.task_at(ptr.cast()))
    }

    /// A sentinel that makes the worker which pops it exit.
    pub fn make_terminate_task(&self) -> shmkit::Result<ProcessTask<'_>> {
        let ptr = self
            .heap
            .allocate(Layout::new::<TaskHeader>())?
            .cast::<TaskHeader>();
        // SAFETY: as in make_task.
        unsafe { ptr.as_ptr().write(TaskHeader::new(TaskKind::Terminate, run_nothing)) };
        Ok(self.task_at(ptr))
    }

    fn task_at(&self, header: NonNull<TaskHeader>) -> ProcessTask<'_> {
        ProcessTask {
            pool: self,
            header,
            submitted: Cell::new(false),
        }
    }

    /// Hand `task` to the next worker in round-robin order.
    pub fn push_task(&self, task: &ProcessTask<'_>) -> shmkit::Result<()> {
        if !std::ptr::eq(task.pool, self) {
            return Err(shmkit::Error::Precondition(
                "task belongs to another pool".to_owned(),
            ));
        }
        let stopped = self.stopped.read();
        if *stopped {
            return Err(shmkit::Error::Precondition("process pool is stopped".to_owned()));
        }
        if task.submitted.get() {
            return Err(shmkit::Error::Precondition(
                "task was already submitted".to_owned(),
            ));
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.queues.len();
        let queued = self.enqueue(index, task);
        drop(stopped);
        queued
    }

    fn enqueue(&self, index: usize, task: &ProcessTask<'_>) -> shmkit::Result<()> {
        let offset = self
            .heap
            .offset_of(task.header.cast())
            .ok_or_else(|| shmkit::Error::Precondition("task is not in the arena".to_owned()))?;
        self.queues[index].push(offset as u64)?;
        task.submitted.set(true);
        Ok(())
    }

    /// The queue feeding worker `index`.
    pub fn queue(&self, index: usize) -> shmkit::Result<&TaskQueue> {
        self.queues.get(index).ok_or_else(|| {
            shmkit::Error::Precondition(format!(
                "queue {} requested from a pool of {}",
                index,
                self.queues.len()
            ))
        })
    }

    pub fn pool_size(&self) -> usize {
        self.queues.len()
    }

    /// The task arena.
    pub fn heap(&self) -> &BuddyHeap {
        &self.heap
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Send every worker a terminate sentinel and reap the workers, which
    /// exit once they have acknowledged it. Work queued before the sentinel
    /// still runs. Idempotent.
    pub fn stop(&self) -> shmkit::Result<()> {
        let mut children = self.children.lock();
        let sentinels = {
            let mut stopped = self.stopped.write();
            if *stopped {
                return Ok(());
            }
            *stopped = true;
            (0..children.len())
                .map(|index| -> shmkit::Result<ProcessTask<'_>> {
                    let sentinel = self.make_terminate_task()?;
                    self.enqueue(index, &sentinel)?;
                    Ok(sentinel)
                })
                .collect::<shmkit::Result<Vec<_>>>()?
        };
        for child in children.iter_mut() {
            let status = child.wait()?;
            if !status.success() {
                tracing::warn!(pid = child.pid(), %status, "worker exited abnormally");
            }
        }
        children.clear();
        // No worker is left to touch the blocks.
        for (index, sentinel) in sentinels.iter().enumerate() {
            if !sentinel.state().is_finished() {
                tracing::warn!(worker = index, "worker exited without acknowledging");
                sentinel.submitted.set(false);
            }
        }
        tracing::debug!(name = %self.config.name, "process pool stopped");
        Ok(())
    }
}

fn init_shared(
    object: &SharedObject,
    workers: usize,
    layout: &PoolLayout,
) -> shmkit::Result<(SharedRegion, Vec<TaskQueue>, BuddyHeap)> {
    object.allocate(layout.total)?;
    let mapping = object.map(0, layout.total, AccessMode::ReadWrite)?;
    let region = mapping.region();
    let queues = (0..workers)
        // SAFETY: the mapping is stored in the pool next to the queues, and
        // no worker exists yet.
        .map(|index| unsafe { TaskQueue::init(region, layout.queue_offset(index)) })
        .collect::<shmkit::Result<Vec<_>>>()?;
    // SAFETY: as above; only the pool allocates from the arena.
    let heap = unsafe { BuddyHeap::over_region(layout.arena(region)?)? };
    Ok((mapping, queues, heap))
}

impl Drop for ProcessPool {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            tracing::warn!(%err, "failed to stop process pool");
        }
        if let Err(err) = self.object.unlink() {
            tracing::warn!(%err, "failed to unlink pool object");
        }
    }
}

impl std::fmt::Debug for ProcessPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessPool")
            .field("name", &self.config.name)
            .field("workers", &self.queues.len())
            .field("stopped", &*self.stopped.read())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_puts_the_arena_on_a_page() {
        let layout = PoolLayout::new(3, 1 << 16, 4096).unwrap();
        assert_eq!(layout.stride % QUEUE_ALIGN, 0);
        assert!(layout.stride >= TaskQueue::chunk_size());
        assert_eq!(layout.arena_offset % 4096, 0);
        assert!(layout.arena_offset >= 3 * layout.stride);
        assert_eq!(layout.total, layout.arena_offset + (1 << 16));
        assert_eq!(layout.queue_offset(2), 2 * layout.stride);
    }

    #[test]
    fn layout_rejects_overflow() {
        assert!(PoolLayout::new(usize::MAX, 1, 4096).is_err());
    }

    #[test]
    fn reasons_are_cut_on_char_boundaries() {
        assert_eq!(truncate_reason("short"), "short");
        let long = "é".repeat(MAX_FAILURE_REASON);
        let cut = truncate_reason(&long);
        assert!(cut.len() <= MAX_FAILURE_REASON);
        assert_eq!(cut.len() % 2, 0);
        assert!(cut.chars().all(|c| c == 'é'));
    }

    #[test]
    fn header_records_a_reason_under_its_lock() {
        let header = TaskHeader::new(TaskKind::Work, run_nothing);
        let guard = header.mutex.lock().unwrap();
        unsafe { header.set_reason("disk full") };
        assert_eq!(unsafe { header.reason() }, "disk full");
        drop(guard);
        assert_eq!(header.state(), TaskState::Created);
    }

    fn double(x: u32) -> Result<(), TaskError> {
        if x == 0 {
            return Err(TaskError::new("zero"));
        }
        Ok(())
    }

    #[test]
    fn trampoline_calls_through_the_block() {
        let mut block = TaskBlock {
            header: TaskHeader::new(TaskKind::Work, trampoline::<u32, TaskError>),
            func: double,
            args: 0u32,
        };
        let header = NonNull::from(&mut block).cast::<TaskHeader>();
        let run = block.header.run;
        assert_eq!(unsafe { run(header) }.unwrap_err().reason(), "zero");
        block.args = 4;
        assert!(unsafe { run(header) }.is_ok());
    }
}
