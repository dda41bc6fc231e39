//! Error types for tasklink-store operations.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// The error type for tasklink-store operations.
#[derive(Debug, Error)]
pub enum Error {
    /// IO error occurred while reading or writing.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization error for a queued payload.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A queued write failed terminally.
    #[error("write to {} failed after {retry_count} retries: {source}", path.display())]
    WriteFailed {
        /// Target file of the failed write.
        path: PathBuf,
        /// Number of retries attempted before giving up.
        retry_count: u32,
        /// The last I/O error observed.
        #[source]
        source: io::Error,
    },

    /// The flush machinery itself failed while writing this operation's batch.
    #[error("flush aborted while writing {}: {reason}", path.display())]
    FlushAborted {
        /// Target file of the aborted batch.
        path: PathBuf,
        /// Description of the failure.
        reason: String,
    },

    /// The queue has been shut down and accepts no new writes.
    #[error("write queue is shut down")]
    QueueClosed,

    /// The operation was still pending when shutdown gave up draining.
    #[error("write to {} abandoned during shutdown after {retry_count} retries", path.display())]
    Abandoned {
        /// Target file of the abandoned write.
        path: PathBuf,
        /// Number of retries the operation had consumed.
        retry_count: u32,
    },

    /// The completion handle was dropped without being settled.
    #[error("write completion channel closed before the operation settled")]
    CompletionLost,
}

impl Error {
    /// Retry count attached to a terminal write error, if any.
    #[must_use]
    pub fn retry_count(&self) -> Option<u32> {
        match self {
            Self::WriteFailed { retry_count, .. } | Self::Abandoned { retry_count, .. } => {
                Some(*retry_count)
            }
            _ => None,
        }
    }
}

/// A specialized Result type for tasklink-store operations.
pub type Result<T> = std::result::Result<T, Error>;
