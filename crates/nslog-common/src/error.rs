//! Error types for nslog
//!
//! Every fallible operation on the log, the metadata services and the view
//! returns one of these kinds synchronously. Nothing retries internally.

use thiserror::Error;

/// Common result type for nslog operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for nslog
#[derive(Debug, Error)]
pub enum Error {
    // Lookup errors
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not empty: {0}")]
    NotEmpty(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    // Log format errors
    #[error("corrupted log at offset {offset}: {reason}")]
    Corruption { offset: u64, reason: String },

    #[error("size exceeded: need {needed} bytes, {available} available")]
    SizeExceeded { needed: usize, available: usize },

    // Configuration errors
    #[error("missing configuration key: {0}")]
    ConfigMissing(String),

    #[error("invalid configuration value for {key}: {value}")]
    ConfigInvalid { key: String, value: String },

    // OS boundary
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a not found error
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Create an already exists error
    pub fn already_exists(what: impl Into<String>) -> Self {
        Self::AlreadyExists(what.into())
    }

    /// Create an invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create a corruption error for the record at `offset`
    pub fn corruption(offset: u64, reason: impl Into<String>) -> Self {
        Self::Corruption {
            offset,
            reason: reason.into(),
        }
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Check if this error means the on-disk data cannot be trusted
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corruption { .. } | Self::SizeExceeded { .. })
    }

    /// POSIX error code for callers that speak errno
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Self::NotFound(_) => libc::ENOENT,
            Self::AlreadyExists(_) => libc::EEXIST,
            Self::NotEmpty(_) => libc::ENOTEMPTY,
            Self::PermissionDenied(_) => libc::EPERM,
            Self::InvalidState(_) => libc::EBUSY,
            Self::Corruption { .. } => libc::EFAULT,
            Self::SizeExceeded { .. } => libc::EOVERFLOW,
            Self::ConfigMissing(_) | Self::ConfigInvalid { .. } => libc::EINVAL,
            Self::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}
