//! Error taxonomy shared by every layer of the HAL core

use thiserror::Error;

/// Errors surfaced by the orchestration core.
///
/// Every variant carries a human readable context string; callers that need to
/// branch should use [`HalError::kind`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HalError {
    /// Malformed caller input. Never retried.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Lookup miss (entity, frame, template, selector timeout).
    #[error("not found: {0}")]
    NotFound(String),

    /// Structural or ordering violation.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// A buffer pool has nothing left to hand out.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// A bounded wait elapsed.
    #[error("timed out: {0}")]
    TimedOut(String),

    /// Unrecoverable driver/ISP condition.
    #[error("fatal hardware error: {0}")]
    Fatal(String),
}

/// Fieldless mirror of [`HalError`] for matching on the kind only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    InvalidOperation,
    ResourceExhausted,
    TimedOut,
    Fatal,
}

impl HalError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HalError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            HalError::NotFound(_) => ErrorKind::NotFound,
            HalError::InvalidOperation(_) => ErrorKind::InvalidOperation,
            HalError::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            HalError::TimedOut(_) => ErrorKind::TimedOut,
            HalError::Fatal(_) => ErrorKind::Fatal,
        }
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        HalError::InvalidArgument(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        HalError::NotFound(msg.into())
    }

    pub fn invalid_operation(msg: impl Into<String>) -> Self {
        HalError::InvalidOperation(msg.into())
    }

    pub fn exhausted(msg: impl Into<String>) -> Self {
        HalError::ResourceExhausted(msg.into())
    }

    pub fn timed_out(msg: impl Into<String>) -> Self {
        HalError::TimedOut(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        HalError::Fatal(msg.into())
    }
}

pub type Result<T, E = HalError> = std::result::Result<T, E>;
