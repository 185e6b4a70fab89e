//! The loop every worker runs, whether it is a thread or a forked process.

use std::panic::{AssertUnwindSafe, catch_unwind};

use crate::task::TaskError;

/// One unit of work as seen by a worker.
pub trait WorkItem {
    /// Whether this is the sentinel that tells the worker to exit.
    fn is_terminate(&self) -> bool;

    /// Mark the task running and run its body.
    fn execute(&self) -> Result<(), TaskError>;

    /// Record the outcome (`Completed` or `Canceled`) and wake waiters.
    fn finish(&self, outcome: Result<(), TaskError>);
}

/// Where a worker gets its next item from.
pub trait WorkSource {
    type Item: WorkItem;

    /// Block until an item is available.
    fn next_item(&self) -> shmkit::Result<Self::Item>;
}

/// Run items from `source` until a terminate sentinel arrives. Task errors
/// and panics are recorded on the task and never end the loop; only a
/// failure to receive from the source does. Returns the number of tasks run.
pub fn run_worker<S: WorkSource>(index: usize, source: &S) -> shmkit::Result<usize> {
    tracing::debug!(worker = index, "worker started");
    let mut executed = 0;
    loop {
        let item = source.next_item()?;
        if item.is_terminate() {
            item.finish(Ok(()));
            break;
        }

        let outcome = match catch_unwind(AssertUnwindSafe(|| item.execute())) {
            Ok(outcome) => outcome,
            Err(payload) => Err(TaskError::from_panic(&*payload)),
        };
        if let Err(err) = &outcome {
            tracing::debug!(worker = index, reason = err.reason(), "task canceled");
        }
        item.finish(outcome);
        executed += 1;
    }
    tracing::debug!(worker = index, executed, "worker exiting");
    Ok(executed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    enum Script {
        Ok,
        Fail(&'static str),
        Panic,
        Stop,
    }

    struct Recorded<'a> {
        script: Script,
        log: &'a RefCell<Vec<Result<(), TaskError>>>,
    }

    impl WorkItem for Recorded<'_> {
        fn is_terminate(&self) -> bool {
            matches!(self.script, Script::Stop)
        }

        fn execute(&self) -> Result<(), TaskError> {
            match self.script {
                Script::Ok | Script::Stop => Ok(()),
                Script::Fail(reason) => Err(TaskError::new(reason)),
                Script::Panic => panic!("exploded"),
            }
        }

        fn finish(&self, outcome: Result<(), TaskError>) {
            self.log.borrow_mut().push(outcome);
        }
    }

    struct Scripted<'a> {
        items: RefCell<Vec<Script>>,
        log: &'a RefCell<Vec<Result<(), TaskError>>>,
    }

    impl<'a> WorkSource for Scripted<'a> {
        type Item = Recorded<'a>;

        fn next_item(&self) -> shmkit::Result<Recorded<'a>> {
            let script = self.items.borrow_mut().remove(0);
            Ok(Recorded {
                script,
                log: self.log,
            })
        }
    }

    #[test]
    fn failures_are_recorded_and_the_loop_survives() {
        let log = RefCell::new(Vec::new());
        let source = Scripted {
            items: RefCell::new(vec![
                Script::Ok,
                Script::Fail("bad input"),
                Script::Panic,
                Script::Ok,
                Script::Stop,
                Script::Ok,
            ]),
            log: &log,
        };

        assert_eq!(run_worker(0, &source).unwrap(), 4);
        let log = log.borrow();
        assert_eq!(log.len(), 5);
        assert!(log[0].is_ok());
        assert_eq!(log[1].as_ref().unwrap_err().reason(), "bad input");
        assert_eq!(log[2].as_ref().unwrap_err().reason(), "exploded");
        assert!(log[3].is_ok());
        assert!(log[4].is_ok());
        // The item after the sentinel was never taken.
        assert_eq!(source.items.borrow().len(), 1);
    }
}
