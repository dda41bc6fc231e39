//! Remote issue tracker abstraction.
//!
//! The sync engine talks to GitHub only through the [`IssueTracker`] trait.
//! [`GitHubClient`] implements it over the REST API; `MockTracker` (behind
//! the `test-util` feature) implements it in memory for tests.
//!
//! # Test Utilities
//!
//! ```toml
//! [dev-dependencies]
//! tasklink = { version = "...", features = ["test-util"] }
//! ```
//!
//! ```rust,ignore
//! use tasklink::github::{IssueTracker, MockTracker};
//!
//! let tracker = MockTracker::new();
//! let issue = tracker.seed_issue("Existing issue");
//! ```

pub mod body;
mod client;
#[cfg(any(test, feature = "test-util"))]
mod mock;

pub use client::GitHubClient;
#[cfg(any(test, feature = "test-util"))]
pub use mock::{MockTracker, TrackerCall};

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// State of a remote issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueState {
    /// Open issue
    Open,
    /// Closed issue
    Closed,
}

impl fmt::Display for IssueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IssueState::Open => write!(f, "open"),
            IssueState::Closed => write!(f, "closed"),
        }
    }
}

/// An issue as seen on the remote tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteIssue {
    /// Issue number
    pub number: u64,
    /// Title
    pub title: String,
    /// Markdown body
    #[serde(default)]
    pub body: String,
    /// Open or closed
    pub state: IssueState,
    /// Label names
    #[serde(default)]
    pub labels: Vec<String>,
    /// Assignee logins
    #[serde(default)]
    pub assignees: Vec<String>,
    /// Milestone title
    #[serde(default)]
    pub milestone: Option<String>,
    /// Last modification on the remote side
    pub updated_at: DateTime<Utc>,
    /// Browser URL
    #[serde(default)]
    pub html_url: String,
}

/// Fields sent when creating or updating an issue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IssueDraft {
    /// Title
    pub title: String,
    /// Markdown body
    pub body: String,
    /// Label names
    pub labels: Vec<String>,
    /// Assignee logins; `None` leaves assignees untouched on update
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignees: Option<Vec<String>>,
    /// Target state; `None` leaves the state untouched
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<IssueState>,
}

/// A repository milestone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Milestone {
    /// Milestone number
    pub number: u64,
    /// Milestone title
    pub title: String,
}

/// Core API rate limit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitStatus {
    /// Requests allowed per window
    pub limit: u32,
    /// Requests left in the current window
    pub remaining: u32,
    /// When the window resets
    pub reset_at: DateTime<Utc>,
}

/// Result of an access check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoAccess {
    /// `owner/repo`
    pub full_name: String,
    /// Whether the token can write issues
    pub can_push: bool,
}

/// Remote issue tracker operations used by sync.
///
/// Implementations map HTTP failures onto [`crate::error::Error`] so callers
/// can branch on [`crate::error::Error::kind`].
#[async_trait]
pub trait IssueTracker: Send + Sync {
    /// Fetch an issue. Returns `None` if it does not exist (or was deleted).
    async fn get_issue(&self, number: u64) -> Result<Option<RemoteIssue>>;

    /// Create an issue.
    async fn create_issue(&self, draft: &IssueDraft) -> Result<RemoteIssue>;

    /// Replace the fields of an existing issue.
    async fn update_issue(&self, number: u64, draft: &IssueDraft) -> Result<RemoteIssue>;

    /// Label names defined in the repository.
    async fn list_labels(&self) -> Result<Vec<String>>;

    /// Logins that can be assigned issues.
    async fn list_assignees(&self) -> Result<Vec<String>>;

    /// Open milestones.
    async fn list_milestones(&self) -> Result<Vec<Milestone>>;

    /// Current core rate limit.
    async fn rate_limit(&self) -> Result<RateLimitStatus>;

    /// Check that the repository exists and the token can use it.
    async fn verify_access(&self) -> Result<RepoAccess>;
}
