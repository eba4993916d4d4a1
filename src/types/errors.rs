//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation and provide
//! clear error messages with context. Quota-specific kinds are recoverable
//! outcomes; only `Storage` and `Io` are infrastructure failures.

use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error enum for the quota engine.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed quota value (anything below the `-1` unlimited sentinel).
    #[error("invalid limit: {0}")]
    InvalidLimit(String),

    /// Allocation would break the parent-capacity invariant.
    #[error("capacity violation: {0}")]
    CapacityViolation(String),

    /// Consumption blocked by an active emergency stop.
    #[error("emergency stopped: {0}")]
    EmergencyStopped(String),

    /// Consumption would exceed the effective limit.
    #[error("quota exceeded: {message} (headroom {headroom})")]
    QuotaExceeded { message: String, headroom: u64 },

    /// Non-positive consumption amount.
    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    /// Unknown id during lookup or ancestor resolution.
    #[error("entity not found: {0}")]
    EntityNotFound(String),

    /// Malformed request or operation not applicable to the entity.
    #[error("validation error: {0}")]
    Validation(String),

    /// Cooperative cancellation of an administrative operation.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// State store unavailable (retryable infrastructure failure).
    #[error("storage unavailable: {0}")]
    Storage(String),

    /// Internal errors.
    #[error("internal error: {0}")]
    Internal(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Stable wire code reported over IPC.
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidLimit(_) => "INVALID_LIMIT",
            Error::CapacityViolation(_) => "CAPACITY_VIOLATION",
            Error::EmergencyStopped(_) => "EMERGENCY_STOPPED",
            Error::QuotaExceeded { .. } => "QUOTA_EXCEEDED",
            Error::InvalidAmount(_) => "INVALID_AMOUNT",
            Error::EntityNotFound(_) => "NOT_FOUND",
            Error::Validation(_) => "INVALID_ARGUMENT",
            Error::Cancelled(_) => "CANCELLED",
            Error::Storage(_) | Error::Io(_) => "UNAVAILABLE",
            Error::Internal(_) | Error::Serialization(_) => "INTERNAL",
        }
    }

    /// True for infrastructure failures a caller may retry as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Storage(_) | Error::Io(_))
    }

    /// Remaining headroom for `QuotaExceeded`, used by clients for backoff.
    pub fn headroom(&self) -> Option<u64> {
        match self {
            Error::QuotaExceeded { headroom, .. } => Some(*headroom),
            _ => None,
        }
    }
}

// Convenience constructors
impl Error {
    pub fn invalid_limit(msg: impl Into<String>) -> Self {
        Self::InvalidLimit(msg.into())
    }

    pub fn capacity_violation(msg: impl Into<String>) -> Self {
        Self::CapacityViolation(msg.into())
    }

    pub fn emergency_stopped(msg: impl Into<String>) -> Self {
        Self::EmergencyStopped(msg.into())
    }

    pub fn quota_exceeded(msg: impl Into<String>, headroom: u64) -> Self {
        Self::QuotaExceeded {
            message: msg.into(),
            headroom,
        }
    }

    pub fn invalid_amount(msg: impl Into<String>) -> Self {
        Self::InvalidAmount(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::EntityNotFound(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}
