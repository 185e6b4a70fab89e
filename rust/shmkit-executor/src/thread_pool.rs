use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex, RwLock};

use crate::config::ThreadPoolConfig;
use crate::sync_queue::SyncQueue;
use crate::task::{TaskError, TaskState};
use crate::worker::{WorkItem, WorkSource, run_worker};

type Body = Box<dyn FnOnce() -> Result<(), TaskError> + Send + 'static>;

struct Status {
    state: TaskState,
    failure: Option<TaskError>,
}

struct TaskShared {
    status: Mutex<Status>,
    finished: Condvar,
    body: Mutex<Option<Body>>,
    submitted: AtomicBool,
    terminate: bool,
}

/// A task for a [`ThreadPool`]. Clones refer to the same task.
#[derive(Clone)]
pub struct ThreadTask {
    shared: Arc<TaskShared>,
}

impl ThreadTask {
    fn new(body: Option<Body>, terminate: bool) -> Self {
        Self {
            shared: Arc::new(TaskShared {
                status: Mutex::new(Status {
                    state: TaskState::Created,
                    failure: None,
                }),
                finished: Condvar::new(),
                body: Mutex::new(body),
                submitted: AtomicBool::new(false),
                terminate,
            }),
        }
    }

    pub fn state(&self) -> TaskState {
        self.shared.status.lock().state
    }

    /// Block until the task has completed or been canceled. A task that was
    /// never pushed cannot finish, so waiting on it is an error.
    pub fn wait(&self) -> Result<(), TaskError> {
        if !self.shared.submitted.load(Ordering::Acquire) {
            return Err(TaskError::new("task was never submitted"));
        }
        let mut status = self.shared.status.lock();
        while !status.state.is_finished() {
            self.shared.finished.wait(&mut status);
        }
        match status.state {
            TaskState::Canceled => Err(status
                .failure
                .clone()
                .unwrap_or_else(|| TaskError::new("canceled"))),
            _ => Ok(()),
        }
    }
}

impl std::fmt::Debug for ThreadTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadTask")
            .field("state", &self.state())
            .field("terminate", &self.shared.terminate)
            .finish()
    }
}

impl WorkItem for ThreadTask {
    fn is_terminate(&self) -> bool {
        self.shared.terminate
    }

    fn execute(&self) -> Result<(), TaskError> {
        self.shared.status.lock().state = TaskState::Running;
        let body = self.shared.body.lock().take();
        match body {
            Some(body) => body(),
            None => Ok(()),
        }
    }

    fn finish(&self, outcome: Result<(), TaskError>) {
        let mut status = self.shared.status.lock();
        match outcome {
            Ok(()) => status.state = TaskState::Completed,
            Err(err) => {
                status.state = TaskState::Canceled;
                status.failure = Some(err);
            }
        }
        self.shared.finished.notify_all();
    }
}

impl WorkSource for SyncQueue<ThreadTask> {
    type Item = ThreadTask;

    fn next_item(&self) -> shmkit::Result<ThreadTask> {
        Ok(self.pop())
    }
}

/// A fixed set of worker threads, each draining its own queue.
pub struct ThreadPool {
    queues: Vec<Arc<SyncQueue<ThreadTask>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    next: AtomicUsize,
    /// Held for reading while a task is queued, so no task lands behind the
    /// sentinels `stop` queues under the write lock.
    stopped: RwLock<bool>,
}

impl ThreadPool {
    pub fn new(config: ThreadPoolConfig) -> shmkit::Result<Self> {
        if config.workers == 0 {
            return Err(shmkit::Error::Precondition(
                "a thread pool needs at least one worker".to_owned(),
            ));
        }

        let mut queues = Vec::with_capacity(config.workers);
        let mut workers = Vec::with_capacity(config.workers);
        for index in 0..config.workers {
            let queue = Arc::new(SyncQueue::new());
            let source = Arc::clone(&queue);
            let handle = std::thread::Builder::new()
                .name(format!("{}_{}", config.thread_name_prefix, index))
                .spawn(move || {
                    if let Err(err) = run_worker(index, &*source) {
                        tracing::warn!(worker = index, %err, "worker stopped early");
                    }
                })
                .map_err(|source| shmkit::Error::SystemCall {
                    call: "thread spawn",
                    source,
                })?;
            queues.push(queue);
            workers.push(handle);
        }
        tracing::debug!(workers = config.workers, "thread pool started");

        Ok(Self {
            queues,
            workers: Mutex::new(workers),
            next: AtomicUsize::new(0),
            stopped: RwLock::new(false),
        })
    }

    /// Wrap `body` in a task. Nothing runs until it is pushed.
    pub fn make_task<F, E>(&self, body: F) -> ThreadTask
    where
        F: FnOnce() -> Result<(), E> + Send + 'static,
        E: Into<TaskError>,
    {
        ThreadTask::new(Some(Box::new(move || body().map_err(Into::into))), false)
    }

    /// A sentinel that makes the worker which pops it exit.
    pub fn make_terminate_task(&self) -> ThreadTask {
        ThreadTask::new(None, true)
    }

    /// Hand `task` to the next worker in round-robin order.
    pub fn push_task(&self, task: &ThreadTask) -> shmkit::Result<()> {
        let stopped = self.stopped.read();
        if *stopped {
            return Err(shmkit::Error::Precondition("thread pool is stopped".to_owned()));
        }
        if task.shared.submitted.swap(true, Ordering::AcqRel) {
            return Err(shmkit::Error::Precondition(
                "task was already submitted".to_owned(),
            ));
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.queues.len();
        self.queues[index].push(task.clone());
        drop(stopped);
        Ok(())
    }

    /// The queue feeding worker `index`.
    pub fn queue(&self, index: usize) -> shmkit::Result<&SyncQueue<ThreadTask>> {
        self.queues.get(index).map(|queue| &**queue).ok_or_else(|| {
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

    /// Let every worker finish what is already queued, then join them.
    /// Idempotent.
    pub fn stop(&self) -> shmkit::Result<()> {
        {
            let mut stopped = self.stopped.write();
            if *stopped {
                return Ok(());
            }
            *stopped = true;
            for queue in &self.queues {
                let sentinel = self.make_terminate_task();
                sentinel.shared.submitted.store(true, Ordering::Release);
                queue.push(sentinel);
            }
        }
        // A worker exits right after acknowledging its sentinel, so joining
        // is the wait. Workers retired earlier leave theirs unread.
        for handle in self.workers.lock().drain(..) {
            if handle.join().is_err() {
                tracing::warn!("worker thread panicked");
            }
        }
        tracing::debug!("thread pool stopped");
        Ok(())
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            tracing::warn!(%err, "failed to stop thread pool");
        }
    }
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("workers", &self.queues.len())
            .field("stopped", &*self.stopped.read())
            .finish()
    }
}
