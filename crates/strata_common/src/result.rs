//! Common result and error types for the Strata store.

/// The standard result type for fallible internal operations.
///
/// `Err` indicates an unrecoverable internal error (a bug in Strata), not an
/// expected runtime condition. Expected failures (lock timeouts, backend
/// I/O errors, missing records) are modeled by the owning crate's error
/// enums or by fail-safe `Option` returns, and never through this type.
pub type StrataResult<T> = Result<T, InternalError>;

/// An internal invariant violation indicating a bug in Strata.
///
/// These errors should never occur during normal operation. Call sites log
/// them at error level in release builds and assert on them in debug builds.
#[derive(Debug, thiserror::Error)]
#[error("internal store error: {message}")]
pub struct InternalError {
    /// Description of the internal error.
    pub message: String,
}

impl InternalError {
    /// Creates a new internal error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<String> for InternalError {
    fn from(message: String) -> Self {
        Self { message }
    }
}
