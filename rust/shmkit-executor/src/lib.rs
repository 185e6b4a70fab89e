//! Worker pools on top of shmkit.
//!
//! Two executors share one worker loop ([`run_worker`]) and one task state
//! machine ([`TaskState`]):
//!
//! - [`ThreadPool`]: worker threads, each fed by an in-process
//!   [`SyncQueue`]. Tasks are boxed closures.
//! - [`ProcessPool`]: forked worker processes, each fed by a
//!   [`shmkit::SyncSharedQueue`] in one named shared memory object. Tasks
//!   are a function pointer plus `Copy` arguments, stored in a buddy-allocated
//!   arena in the same object.
//!
//! Either way `push_task` spreads tasks round robin over the workers, and a
//! task's `wait` returns the [`TaskError`] it was canceled with. Errors and
//! panics in a task cancel that task and never take the worker down.
//!
//! ```no_run
//! use shmkit_executor::{ProcessPool, ProcessPoolConfig, TaskError};
//!
//! fn square(n: u64) -> Result<(), TaskError> {
//!     if n.checked_mul(n).is_none() {
//!         return Err(TaskError::new("overflow"));
//!     }
//!     Ok(())
//! }
//!
//! # fn main() -> shmkit::Result<()> {
//! let pool = ProcessPool::create(ProcessPoolConfig::new("squares"))?;
//! let task = pool.make_task(square, 12)?;
//! pool.push_task(&task)?;
//! assert!(task.wait().is_ok());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod executor;
pub mod process;
pub mod process_pool;
pub mod sync_queue;
pub mod task;
pub mod thread_pool;
pub mod worker;

pub use config::{
    DEFAULT_ARENA_SIZE, DEFAULT_QUEUE_CAPACITY, MAX_FAILURE_REASON, ProcessPoolConfig,
    ThreadPoolConfig,
};
pub use executor::Executor;
pub use process::{
    ChildOutput, ChildProcess, PANIC_EXIT_CODE, spawn, spawn_command, spawn_with,
};
pub use process_pool::{ProcessPool, ProcessTask, TaskQueue};
pub use sync_queue::SyncQueue;
pub use task::{TaskError, TaskState};
pub use thread_pool::{ThreadPool, ThreadTask};
pub use worker::{WorkItem, WorkSource, run_worker};
