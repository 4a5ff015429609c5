//! Error types for backend store operations.

use std::path::PathBuf;

/// Errors that can occur while persisting or loading records.
///
/// Most store operations are fail-safe at the call site: errors become empty
/// reads or skipped units rather than hard failures. This enum is used for
/// internal propagation within the store subsystem and for the few
/// operations (session open, namespace creation) whose failure is
/// surfaced to the caller.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// An I/O error occurred while reading or writing store files.
    #[error("store I/O error at {path}: {source}")]
    Io {
        /// The path that caused the error.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// The embedded database backend reported an error.
    #[error("database backend error: {reason}")]
    Backend {
        /// Description of the backend failure.
        reason: String,
    },

    /// A serialization or deserialization error occurred.
    #[error("serialization error: {reason}")]
    Serialization {
        /// Description of the serialization failure.
        reason: String,
    },
}

impl From<heed3::Error> for StoreError {
    fn from(err: heed3::Error) -> Self {
        StoreError::Backend {
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_display() {
        let err = StoreError::Io {
            path: PathBuf::from("/tmp/strata/7"),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
        };
        let msg = err.to_string();
        assert!(msg.contains("store I/O error"));
        assert!(msg.contains("/tmp/strata/7"));
    }

    #[test]
    fn backend_error_display() {
        let err = StoreError::Backend {
            reason: "map full".to_string(),
        };
        assert!(err.to_string().contains("map full"));
    }

    #[test]
    fn serialization_error_display() {
        let err = StoreError::Serialization {
            reason: "truncated input".to_string(),
        };
        assert!(err.to_string().contains("truncated input"));
    }
}
