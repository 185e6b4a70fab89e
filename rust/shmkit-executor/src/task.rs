use std::any::Any;

/// Lifecycle of a task.
///
/// `Created -> Running -> Completed`, or `Canceled` from either of the first
/// two. A task never leaves `Completed` or `Canceled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TaskState {
    Created = 0,
    Running = 1,
    Completed = 2,
    Canceled = 3,
}

impl TaskState {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Created),
            1 => Some(Self::Running),
            2 => Some(Self::Completed),
            3 => Some(Self::Canceled),
            _ => None,
        }
    }

    /// `Completed` or `Canceled`.
    #[inline]
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Canceled)
    }
}

/// Why a task ended up `Canceled`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskError {
    reason: String,
}

impl TaskError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Describe a panic payload caught at the worker boundary.
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let reason = if let Some(message) = payload.downcast_ref::<&'static str>() {
            (*message).to_owned()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            "task panicked".to_owned()
        };
        Self { reason }
    }
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task canceled: {}", self.reason)
    }
}

impl std::error::Error for TaskError {}

impl From<String> for TaskError {
    fn from(reason: String) -> Self {
        Self::new(reason)
    }
}

impl From<&str> for TaskError {
    fn from(reason: &str) -> Self {
        Self::new(reason)
    }
}

impl From<shmkit::Error> for TaskError {
    fn from(err: shmkit::Error) -> Self {
        Self::new(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_states_round_trip() {
        for state in [
            TaskState::Created,
            TaskState::Running,
            TaskState::Completed,
            TaskState::Canceled,
        ] {
            assert_eq!(TaskState::from_raw(state as u32), Some(state));
        }
        assert_eq!(TaskState::from_raw(9), None);
        assert!(!TaskState::Running.is_finished());
        assert!(TaskState::Canceled.is_finished());
    }

    #[test]
    fn panic_payloads_become_reasons() {
        let caught = std::panic::catch_unwind(|| panic!("boom {}", 7)).unwrap_err();
        assert_eq!(TaskError::from_panic(&*caught).reason(), "boom 7");

        let caught = std::panic::catch_unwind(|| panic!("static")).unwrap_err();
        assert_eq!(TaskError::from_panic(&*caught).reason(), "static");
    }
}
