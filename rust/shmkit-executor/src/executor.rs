use crate::process_pool::{ProcessPool, ProcessTask};
use crate::thread_pool::{ThreadPool, ThreadTask};

/// What both pools have in common.
pub trait Executor {
    /// The task handle this pool accepts.
    type Task<'a>
    where
        Self: 'a;

    /// Queue `task` on the next worker.
    fn push_task<'a>(&'a self, task: &Self::Task<'a>) -> shmkit::Result<()>;

    /// Stop every worker after the work already queued. Idempotent.
    fn stop(&self) -> shmkit::Result<()>;

    /// Number of workers.
    fn pool_size(&self) -> usize;
}

impl Executor for ThreadPool {
    type Task<'a> = ThreadTask;

    fn push_task<'a>(&'a self, task: &ThreadTask) -> shmkit::Result<()> {
        ThreadPool::push_task(self, task)
    }

    fn stop(&self) -> shmkit::Result<()> {
        ThreadPool::stop(self)
    }

    fn pool_size(&self) -> usize {
        ThreadPool::pool_size(self)
    }
}

impl Executor for ProcessPool {
    type Task<'a> = ProcessTask<'a>;

    fn push_task<'a>(&'a self, task: &ProcessTask<'a>) -> shmkit::Result<()> {
        ProcessPool::push_task(self, task)
    }

    fn stop(&self) -> shmkit::Result<()> {
        ProcessPool::stop(self)
    }

    fn pool_size(&self) -> usize {
        ProcessPool::pool_size(self)
    }
}
