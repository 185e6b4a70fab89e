use std::io;

/// Errors raised by the allocator, the futex primitives and the shared
/// memory plumbing.
#[derive(Debug)]
pub enum Error {
    /// No free block of `2^log2_size` bytes exists and none can be split off.
    OutOfMemory { log2_size: u32 },
    /// The offset does not name a block that is currently allocated.
    InvalidFree { offset: usize },
    /// The kernel wait/wake facility needed by a futex primitive is missing.
    UnsupportedPlatform(&'static str),
    /// An OS call failed.
    SystemCall {
        call: &'static str,
        source: io::Error,
    },
    /// A caller broke the contract of an operation.
    Precondition(String),
}

impl Error {
    /// Capture `errno` for a failed OS call.
    pub(crate) fn last_os_error(call: &'static str) -> Self {
        Self::SystemCall {
            call,
            source: io::Error::last_os_error(),
        }
    }

    pub(crate) fn precondition(message: impl Into<String>) -> Self {
        Self::Precondition(message.into())
    }

    /// The raw OS error code, if this wraps a failed OS call.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::SystemCall { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OutOfMemory { log2_size } => {
                write!(f, "out of memory: no free block of 2^{} bytes", log2_size)
            }
            Self::InvalidFree { offset } => {
                write!(f, "invalid free: no allocated block at offset {}", offset)
            }
            Self::UnsupportedPlatform(what) => {
                write!(f, "{} is not supported on this platform", what)
            }
            Self::SystemCall { call, source } => write!(f, "{} failed: {}", call, source),
            Self::Precondition(message) => write!(f, "precondition violated: {}", message),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::SystemCall { source, .. } => Some(source),
            _ => None,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
