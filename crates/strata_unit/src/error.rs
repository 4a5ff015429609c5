//! Error types for unit serialization and loading.

use strata_common::UnitIndex;

/// Errors that can occur while storing or loading a unit.
///
/// Load paths are fail-safe where possible (a missing or corrupt record
/// reads as "no unit"); this enum carries the cases that `store` and
/// `ensure_loaded` must report to their caller so that a cleanup pass can
/// log and skip the affected unit.
#[derive(Debug, thiserror::Error)]
pub enum UnitError {
    /// The backend record could not be opened, written, or committed.
    #[error("backend failure for unit {index}: {reason}")]
    Backend {
        /// The unit whose record failed.
        index: UnitIndex,
        /// Description of the backend failure.
        reason: String,
    },

    /// An item payload or the unit header failed to (de)serialize.
    #[error("serialization failure for unit {index}: {reason}")]
    Serialization {
        /// The unit being serialized.
        index: UnitIndex,
        /// Description of the serialization failure.
        reason: String,
    },

    /// The stored record is structurally damaged (truncated tables, offsets
    /// pointing outside the arena).
    #[error("corrupt record for unit {index}: {reason}")]
    Corrupt {
        /// The unit whose record is damaged.
        index: UnitIndex,
        /// Description of the damage.
        reason: String,
    },
}
