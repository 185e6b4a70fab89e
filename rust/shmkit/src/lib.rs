//! Synchronisation and allocation primitives that work across processes.
//!
//! Everything that has to be shared lives in a plain byte [`Region`] and
//! holds no pointers, so a structure written by one process can be used by
//! any other process that maps the same bytes.
//!
//! # Primitives
//!
//! - [`Mutex`]: a three-state futex lock in a single `u32`
//! - [`Condition`] / [`ConditionVariable`]: futex wait/notify, layered on
//!   the mutex
//! - [`AutoResetEvent`]: a one-waiter-per-set event
//! - [`CyclicBuffer`] / [`SyncSharedQueue`]: a bounded ring and the blocking
//!   queue built from it
//! - [`BuddyTree`] / [`BuddyHeap`]: power-of-two block allocation over an
//!   arena, with metadata packed into a [`SymbolArray`]
//! - [`SharedObject`] / [`SharedRegion`]: named POSIX shared memory
//!
//! # Owners and attachers
//!
//! Whoever creates a shared structure initialises it (`init`, `create`)
//! and is the only one who tears it down. Everybody else attaches
//! (`attach`) and only reinterprets the bytes.
//!
//! # Loom Testing
//!
//! The futex algorithms are model checked with loom:
//!
//! ```text
//! RUSTFLAGS="--cfg loom" cargo test -p shmkit --release loom
//! ```

pub mod buddy;
pub mod condition;
pub mod cyclic;
pub mod error;
pub mod event;
pub mod futex;
pub mod heap;
pub mod mutex;
pub mod queue;
pub mod region;
pub mod shm;
pub mod symbol;
pub mod sync;

pub use buddy::{BuddyTree, CellStatus, MAX_TOP_LEVEL};
pub use condition::{Command, Condition, ConditionVariable};
pub use cyclic::CyclicBuffer;
pub use error::{Error, Result};
pub use event::AutoResetEvent;
pub use heap::{BuddyHeap, Heap};
pub use mutex::{Mutex, MutexGuard};
pub use queue::{DEFAULT_QUEUE_CAPACITY, NamedQueue, NamedQueueOwner, SyncSharedQueue};
pub use region::{HeapRegion, Region};
pub use shm::{Access, AccessMode, Permissions, SharedObject, SharedRegion};
pub use symbol::SymbolArray;

#[cfg(all(test, loom))]
mod loom_tests;
