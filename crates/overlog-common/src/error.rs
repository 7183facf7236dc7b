//! Error types for overlog
//!
//! Every component returns [`Error`]. The enum is `Clone` because one
//! failure is routinely delivered to many parties: a tainted metadata
//! store repeats its fault to every later caller, and a failed flush is
//! reported to every request parked on it.

use std::sync::Arc;
use thiserror::Error;

/// Common result type for overlog operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for overlog
#[derive(Clone, Debug, Error)]
pub enum Error {
    // Persisted metadata errors
    #[error("log structure fault: {0}")]
    StructureFault(String),

    #[error("checksum mismatch at offset {offset}: expected {expected:#018x}, got {actual:#018x}")]
    ChecksumMismatch { offset: u64, expected: u64, actual: u64 },

    // Capacity errors
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    // Lookup errors
    #[error("not found: {0}")]
    NotFound(String),

    // Caller errors
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // Container lifecycle errors
    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("name collision: {0}")]
    Collision(String),

    // Lifecycle state errors
    #[error("shutdown pending: {0}")]
    ShutdownPending(String),

    #[error("operation cancelled")]
    Cancelled,

    // I/O errors
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    // Internal errors
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl Error {
    /// Create a log structure fault
    pub fn structure_fault(msg: impl Into<String>) -> Self {
        Self::StructureFault(msg.into())
    }

    /// Create a resource exhausted error
    pub fn resource_exhausted(msg: impl Into<String>) -> Self {
        Self::ResourceExhausted(msg.into())
    }

    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create an already exists error
    pub fn already_exists(msg: impl Into<String>) -> Self {
        Self::AlreadyExists(msg.into())
    }

    /// Create a collision error
    pub fn collision(msg: impl Into<String>) -> Self {
        Self::Collision(msg.into())
    }

    /// Create a shutdown pending error
    pub fn shutdown_pending(msg: impl Into<String>) -> Self {
        Self::ShutdownPending(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this error means persisted metadata is corrupt
    #[must_use]
    pub const fn is_structure_fault(&self) -> bool {
        matches!(self, Self::StructureFault(_) | Self::ChecksumMismatch { .. })
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// Check if this error reports a name that is already taken
    #[must_use]
    pub fn is_already_exists(&self) -> bool {
        match self {
            Self::AlreadyExists(_) | Self::Collision(_) => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::AlreadyExists,
            _ => false,
        }
    }

    /// Check if this is a retryable error
    ///
    /// Nothing inside overlog retries; callers use this to decide.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ResourceExhausted(_) => true,
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::Interrupted | std::io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }
}
