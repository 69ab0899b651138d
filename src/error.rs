//! Error types for edgeflow.

use crate::memory::MemoryTarget;
use thiserror::Error;

/// Result type alias using edgeflow's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for edgeflow operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Physical memory allocation failed.
    #[error("allocation of {size} bytes on {target} failed: {reason}")]
    AllocationFailed {
        /// Requested memory target.
        target: MemoryTarget,
        /// Requested size in bytes.
        size: usize,
        /// What went wrong.
        reason: String,
    },

    /// Mapping or cache maintenance failed.
    #[error("mapping failed: {0}")]
    MappingFailed(String),

    /// No live allocation matches a buffer id.
    #[error("attach to buffer {id:#x} failed: {reason}")]
    AttachFailed {
        /// Buffer id (physical address) that was looked up.
        id: u64,
        /// What went wrong.
        reason: String,
    },

    /// Invalid input to an allocator, pool, or planner.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration and buffer layout disagree.
    #[error("configuration mismatch: {0}")]
    ConfigMismatch(String),

    /// The pool has not been activated (or was deactivated).
    #[error("buffer pool is not active")]
    PoolInactive,

    /// Operation is not allowed in the current lifecycle state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A dispatcher reported a failure from its compute domain.
    #[error("dispatch failed: {0}")]
    Dispatch(#[from] DispatchError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}

impl Error {
    /// The dispatcher taxonomy value carried by this error, if any.
    pub fn dispatch_error(&self) -> Option<DispatchError> {
        match self {
            Error::Dispatch(e) => Some(*e),
            _ => None,
        }
    }
}

/// Uniform failure taxonomy returned by every dispatcher.
///
/// Compute domains report POSIX-style status codes. Dispatchers translate
/// them with [`DispatchError::from_errno`] so callers only ever see this
/// closed set.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatchError {
    /// The domain's submission queue is full.
    #[error("queue is full")]
    QueueFull,
    /// The job was lost in the transport or the driver.
    #[error("message lost in transport or driver")]
    MessageLost,
    /// The job does not satisfy the runtime's preconditions.
    #[error("malformed job")]
    MalformedJob,
    /// The executed operator raised an exception.
    #[error("operator raised an exception")]
    OperatorException,
    /// A model or shared library file is missing.
    #[error("missing model or library artifact")]
    MissingArtifact,
    /// The job did not complete in time.
    #[error("timed out waiting for completion")]
    Timeout,
    /// The driver handle is invalid.
    #[error("driver handle error")]
    DriverHandleError,
    /// The operation is not supported by the domain.
    #[error("operation not supported")]
    Unsupported,
    /// The domain rejected an argument.
    #[error("invalid argument")]
    InvalidArgument,
    /// Unrecognized status code.
    #[error("unknown error")]
    Unknown,
}

impl DispatchError {
    /// Every taxonomy value, `Unknown` last.
    pub const ALL: [DispatchError; 10] = [
        DispatchError::QueueFull,
        DispatchError::MessageLost,
        DispatchError::MalformedJob,
        DispatchError::OperatorException,
        DispatchError::MissingArtifact,
        DispatchError::Timeout,
        DispatchError::DriverHandleError,
        DispatchError::Unsupported,
        DispatchError::InvalidArgument,
        DispatchError::Unknown,
    ];

    /// Translate a domain status code.
    pub fn from_errno(errno: i32) -> Self {
        match errno {
            libc::EAGAIN => DispatchError::QueueFull,
            libc::EBADMSG => DispatchError::MessageLost,
            libc::EBADRQC => DispatchError::MalformedJob,
            libc::ECANCELED => DispatchError::OperatorException,
            libc::ENOENT => DispatchError::MissingArtifact,
            libc::ETIMEDOUT => DispatchError::Timeout,
            libc::EBADFD => DispatchError::DriverHandleError,
            libc::ENOSYS => DispatchError::Unsupported,
            libc::EINVAL => DispatchError::InvalidArgument,
            _ => DispatchError::Unknown,
        }
    }

    /// The status code a domain uses to report this failure.
    pub fn errno(self) -> i32 {
        match self {
            DispatchError::QueueFull => libc::EAGAIN,
            DispatchError::MessageLost => libc::EBADMSG,
            DispatchError::MalformedJob => libc::EBADRQC,
            DispatchError::OperatorException => libc::ECANCELED,
            DispatchError::MissingArtifact => libc::ENOENT,
            DispatchError::Timeout => libc::ETIMEDOUT,
            DispatchError::DriverHandleError => libc::EBADFD,
            DispatchError::Unsupported => libc::ENOSYS,
            DispatchError::InvalidArgument => libc::EINVAL,
            DispatchError::Unknown => libc::EIO,
        }
    }

    /// Short label used in metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            DispatchError::QueueFull => "queue_full",
            DispatchError::MessageLost => "message_lost",
            DispatchError::MalformedJob => "malformed_job",
            DispatchError::OperatorException => "operator_exception",
            DispatchError::MissingArtifact => "missing_artifact",
            DispatchError::Timeout => "timeout",
            DispatchError::DriverHandleError => "driver_handle",
            DispatchError::Unsupported => "unsupported",
            DispatchError::InvalidArgument => "invalid_argument",
            DispatchError::Unknown => "unknown",
        }
    }
}
