//! Error types for the storage and sync engine.

use thiserror::Error;

use crate::records::{BlockId, FolderId};

/// Errors that can occur in storage and sync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The connection to the remote store was lost mid-operation; no state
    /// change should be assumed to have happened.
    #[error("operation aborted: connection lost")]
    Aborted,

    /// A transient condition; the caller should retry later with backoff.
    #[error("operation deferred: {0}")]
    Defer(String),

    /// The operation no longer makes sense (target vanished); treated as
    /// success with no effect by mutation machinery.
    #[error("operation moot: {0}")]
    Moot(String),

    /// Retries exhausted or an unrecoverable condition; surfaced as a hard
    /// error.
    #[error("giving up: {0}")]
    GiveUp(String),

    /// The persistence substrate failed.
    #[error("persistence error: {0}")]
    Persist(String),

    /// A block the directory knows about could not be loaded.
    #[error("missing block {block} in folder {folder}")]
    MissingBlock {
        /// Folder owning the directory entry.
        folder: FolderId,
        /// The block id that failed to load.
        block: BlockId,
    },

    /// Serialization of a block payload failed.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl Error {
    /// Whether this error is the transient kind that mutation operations
    /// re-queue instead of failing.
    #[must_use]
    pub const fn is_deferrable(&self) -> bool {
        matches!(self, Self::Defer(_))
    }
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
