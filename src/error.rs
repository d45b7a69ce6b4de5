//! Error types surfaced by the history store.

use std::io;

/// Errors surfaced by [`crate::LogFile`], [`crate::GsnAllocator`],
/// [`crate::GsnIndex`], and [`crate::HistoryFacade`].
///
/// A corrupt line and lock contention are deliberately absent from this
/// enum: a corrupt line is logged and skipped (it never reaches the
/// caller), and lock contention is not an error — callers simply block
/// until the advisory lock is available.
#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    /// A filesystem call (open, write, fsync, rename, lock) failed.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// A record could not be encoded into a single round-trippable JSON line.
    #[error("failed to serialise record: {0}")]
    Serialisation(#[from] serde_json::Error),

    /// The caller's record was not a JSON object at the top level.
    #[error("record must be a JSON object: {reason}")]
    Schema {
        /// Human-readable description of what was found instead.
        reason: String,
    },
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, HistoryError>;
