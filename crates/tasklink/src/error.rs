//! Error types for tasklink operations.
//!
//! Every error maps onto a small taxonomy through [`Error::kind`], which is
//! what callers use to decide whether to retry, wait, or ask the user to fix
//! something.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use thiserror::Error;

/// The error type for tasklink operations.
#[derive(Debug, Error)]
pub enum Error {
    /// IO error occurred.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The durable write layer failed.
    #[error("Storage error: {0}")]
    Store(#[from] tasklink_store::Error),

    /// A persisted document could not be (de)serialized.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// No `.tasklink/` directory was found.
    #[error("Not a tasklink repository (or any parent). Run 'tasklink init' first.")]
    NotInitialized,

    /// Input rejected before any work was done.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Task not found.
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// No unresolved conflict matches the request.
    #[error("No unresolved {conflict_type} conflict for task {task_id}")]
    ConflictNotFound {
        /// Task the conflict was looked up for.
        task_id: String,
        /// Requested conflict type.
        conflict_type: String,
    },

    /// The requested strategy is not offered for this conflict type.
    #[error("Strategy '{strategy}' is not available for {conflict_type} conflicts")]
    StrategyUnavailable {
        /// Requested strategy.
        strategy: String,
        /// Conflict type it was requested for.
        conflict_type: String,
    },

    /// A conflict was moved through an illegal lifecycle step.
    #[error("Invalid conflict transition from {from} to {to}")]
    InvalidTransition {
        /// Current phase.
        from: String,
        /// Requested phase.
        to: String,
    },

    /// Another sync pass holds the in-progress flag.
    #[error("A sync is already in progress (started {started_at})")]
    SyncInProgress {
        /// When the running pass started.
        started_at: DateTime<Utc>,
    },

    /// The resolution history is empty (for the requested task).
    #[error("Nothing to undo")]
    NothingToUndo,

    /// GitHub rejected the credentials.
    #[error("GitHub authentication failed: {0}")]
    Authentication(String),

    /// The credentials lack permission for the operation.
    #[error("GitHub authorization failed: {0}")]
    Authorization(String),

    /// The API rate limit is exhausted.
    #[error("GitHub rate limit exceeded{}", .reset_at.map(|t| format!(" (resets at {t})")).unwrap_or_default())]
    RateLimited {
        /// When the limit resets, if GitHub said.
        reset_at: Option<DateTime<Utc>>,
    },

    /// Transport failure or server-side error.
    #[error("Network error: {0}")]
    Network(String),

    /// GitHub answered with an unexpected status.
    #[error("GitHub API error ({status}): {message}")]
    Remote {
        /// HTTP status code.
        status: u16,
        /// Response body or summary.
        message: String,
    },
}

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad input or state; fix and retry.
    Validation,
    /// Transport or server failure.
    Network,
    /// Missing or invalid token.
    Authentication,
    /// Token lacks permission.
    Authorization,
    /// API quota exhausted.
    RateLimit,
    /// Local persistence failure.
    FileWrite,
    /// Anything else.
    Unknown,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Network => "network",
            ErrorKind::Authentication => "authentication",
            ErrorKind::Authorization => "authorization",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::FileWrite => "file_write",
            ErrorKind::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

impl Error {
    /// Taxonomy bucket for this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_)
            | Error::NotInitialized
            | Error::Validation(_)
            | Error::TaskNotFound(_)
            | Error::ConflictNotFound { .. }
            | Error::StrategyUnavailable { .. }
            | Error::InvalidTransition { .. }
            | Error::SyncInProgress { .. }
            | Error::NothingToUndo => ErrorKind::Validation,
            Error::Network(_) => ErrorKind::Network,
            Error::Authentication(_) => ErrorKind::Authentication,
            Error::Authorization(_) => ErrorKind::Authorization,
            Error::RateLimited { .. } => ErrorKind::RateLimit,
            Error::Io(_) | Error::Store(_) => ErrorKind::FileWrite,
            Error::Json(_) | Error::Remote { .. } => ErrorKind::Unknown,
        }
    }

    /// Whether repeating the operation may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self.kind() {
            ErrorKind::Network | ErrorKind::RateLimit => true,
            ErrorKind::FileWrite => self.has_transient_io_cause(),
            _ => false,
        }
    }

    /// Whether an immediate retry may succeed (rate limits need to wait).
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self.kind() {
            ErrorKind::Network => true,
            ErrorKind::FileWrite => self.has_transient_io_cause(),
            _ => false,
        }
    }

    fn has_transient_io_cause(&self) -> bool {
        use tasklink_store::queue::is_retriable;

        match self {
            Error::Io(e) | Error::Store(tasklink_store::Error::Io(e)) => is_retriable(e),
            Error::Store(tasklink_store::Error::WriteFailed { source, .. }) => is_retriable(source),
            _ => false,
        }
    }

    /// A message telling the user what to do about the error.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self.kind() {
            ErrorKind::Authentication => {
                "GitHub rejected the token. Set github.token in .tasklink/config.yaml \
                 or export GITHUB_TOKEN with a valid personal access token."
                    .to_string()
            }
            ErrorKind::Authorization => {
                "The GitHub token cannot access this repository. Grant it the 'repo' scope \
                 (or Issues read/write for fine-grained tokens)."
                    .to_string()
            }
            ErrorKind::RateLimit => format!("{self}. Wait for the reset and run the sync again."),
            ErrorKind::Network => format!("{self}. Check your connection and try again."),
            ErrorKind::FileWrite => {
                format!("{self}. Check that .tasklink/ is writable and the disk is not full.")
            }
            ErrorKind::Validation | ErrorKind::Unknown => self.to_string(),
        }
    }
}

/// A specialized Result type for tasklink operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::path::PathBuf;

    #[rstest]
    #[case::validation(Error::Validation("bad".into()), ErrorKind::Validation, false, false)]
    #[case::network(Error::Network("reset".into()), ErrorKind::Network, true, true)]
    #[case::auth(Error::Authentication("401".into()), ErrorKind::Authentication, false, false)]
    #[case::authz(Error::Authorization("403".into()), ErrorKind::Authorization, false, false)]
    #[case::rate(Error::RateLimited { reset_at: None }, ErrorKind::RateLimit, true, false)]
    #[case::remote(Error::Remote { status: 418, message: "teapot".into() }, ErrorKind::Unknown, false, false)]
    fn test_error_taxonomy(
        #[case] error: Error,
        #[case] kind: ErrorKind,
        #[case] retryable: bool,
        #[case] transient: bool,
    ) {
        assert_eq!(error.kind(), kind);
        assert_eq!(error.is_retryable(), retryable);
        assert_eq!(error.is_transient(), transient);
    }

    #[test]
    fn test_file_write_retryable_only_for_transient_causes() {
        let busy = Error::Store(tasklink_store::Error::WriteFailed {
            path: PathBuf::from("tasks.json"),
            retry_count: 3,
            source: io::Error::from(io::ErrorKind::ResourceBusy),
        });
        let invalid = Error::Io(io::Error::from(io::ErrorKind::InvalidData));

        assert_eq!(busy.kind(), ErrorKind::FileWrite);
        assert!(busy.is_retryable());
        assert!(!invalid.is_retryable());
    }

    #[test]
    fn test_user_message_is_actionable() {
        let msg = Error::Authentication("bad credentials".into()).user_message();
        assert!(msg.contains("GITHUB_TOKEN"));
    }

    #[test]
    fn test_error_kind_display() {
        assert_eq!(ErrorKind::RateLimit.to_string(), "rate_limit");
        assert_eq!(ErrorKind::FileWrite.to_string(), "file_write");
    }
}
