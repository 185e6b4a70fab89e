use std::sync::atomic::{AtomicUsize, Ordering};

/// Slots in each process-pool worker queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = shmkit::DEFAULT_QUEUE_CAPACITY;

/// Bytes of task storage in a process pool's arena.
pub const DEFAULT_ARENA_SIZE: usize = 1024 * 1024;

/// Longest failure reason a process task can carry back; longer reasons are
/// truncated at a character boundary.
pub const MAX_FAILURE_REASON: usize = 256;

/// Configuration for a [`ThreadPool`](crate::ThreadPool).
#[derive(Debug, Clone)]
pub struct ThreadPoolConfig {
    /// Number of worker threads. Must be at least one.
    pub workers: usize,
    /// Workers are named `{prefix}_{index}`.
    pub thread_name_prefix: String,
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            thread_name_prefix: "async-exec".to_owned(),
        }
    }
}

/// Numbers default pool names within this process.
static NEXT_POOL: AtomicUsize = AtomicUsize::new(0);

/// Configuration for a [`ProcessPool`](crate::ProcessPool).
#[derive(Debug, Clone)]
pub struct ProcessPoolConfig {
    /// Name of the shared memory object holding the queues and the arena.
    /// The pool creates it and fails if it already exists.
    pub name: String,
    /// Number of worker processes. Must be at least one.
    pub workers: usize,
    /// Bytes of task storage. Only the largest power of two that fits is
    /// used.
    pub arena_size: usize,
}

impl ProcessPoolConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

impl Default for ProcessPoolConfig {
    /// Each default configuration gets a name no other default
    /// configuration in this process shares.
    fn default() -> Self {
        Self {
            name: format!(
                "shmkit-pool-{}-{}",
                std::process::id(),
                NEXT_POOL.fetch_add(1, Ordering::Relaxed)
            ),
            workers: 2,
            arena_size: DEFAULT_ARENA_SIZE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_pool_names_are_unique() {
        let first = ProcessPoolConfig::default();
        let second = ProcessPoolConfig::default();
        assert_ne!(first.name, second.name);
        assert!(first.name.starts_with(&format!("shmkit-pool-{}-", std::process::id())));
    }
}
