//! Configuration management for tasklink.
//!
//! Configuration lives in `.tasklink/config.yaml`. Every section has
//! defaults, so a partial file (or an empty one) is valid.
//!
//! ```yaml
//! github:
//!   enabled: true
//!   owner: acme
//!   repo: widgets
//!   token: ""            # falls back to $GITHUB_TOKEN
//!   subtask_mode: checklist
//!   features:
//!     sync_milestones: false
//!     sync_projects: false
//!     sync_assignees: true
//! write_queue:
//!   max_wait_ms: 150
//!   max_batch_size: 10
//! sync:
//!   max_backups: 5
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tasklink_store::queue::WriteQueueConfig;
use tokio::fs;

/// Environment variable consulted when `github.token` is empty.
pub const TOKEN_ENV_VAR: &str = "GITHUB_TOKEN";

/// Default REST API base URL.
pub const DEFAULT_API_BASE: &str = "https://api.github.com";

/// Maximum length GitHub allows for an owner or repository name.
const MAX_NAME_LENGTH: usize = 100;

/// Top-level configuration file structure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TasklinkConfig {
    /// GitHub binding
    pub github: GitHubConfig,

    /// Write queue tuning
    pub write_queue: WriteQueueSettings,

    /// Sync state durability
    pub sync: SyncSettings,
}

/// How subtasks are represented on GitHub.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskMode {
    /// Rendered as a checklist in the parent issue body
    #[default]
    Checklist,

    /// Each subtask becomes its own issue
    SeparateIssues,
}

/// Optional sync features.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GitHubFeatures {
    /// Sync milestones
    pub sync_milestones: bool,

    /// Sync project boards
    pub sync_projects: bool,

    /// Sync the task assignee with the first issue assignee
    pub sync_assignees: bool,
}

impl Default for GitHubFeatures {
    fn default() -> Self {
        Self {
            sync_milestones: false,
            sync_projects: false,
            sync_assignees: true,
        }
    }
}

/// GitHub repository binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GitHubConfig {
    /// Whether sync is turned on
    pub enabled: bool,

    /// Repository owner (user or organization)
    pub owner: String,

    /// Repository name
    pub repo: String,

    /// Personal access token
    #[serde(skip_serializing_if = "String::is_empty")]
    pub token: String,

    /// Subtask representation
    pub subtask_mode: SubtaskMode,

    /// Optional features
    pub features: GitHubFeatures,

    /// REST API base URL (GitHub Enterprise installs differ)
    pub api_base: String,
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            owner: String::new(),
            repo: String::new(),
            token: String::new(),
            subtask_mode: SubtaskMode::default(),
            features: GitHubFeatures::default(),
            api_base: DEFAULT_API_BASE.to_string(),
        }
    }
}

impl GitHubConfig {
    /// Enabled with an owner, repository and token.
    pub fn is_configured(&self) -> bool {
        self.enabled && !self.owner.is_empty() && !self.repo.is_empty() && !self.token.is_empty()
    }

    /// `owner/repo`, when both are set.
    pub fn repository(&self) -> Option<String> {
        if self.owner.is_empty() || self.repo.is_empty() {
            None
        } else {
            Some(format!("{}/{}", self.owner, self.repo))
        }
    }
}

/// Write queue settings as written in YAML (milliseconds).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteQueueSettings {
    /// Longest wait before pending writes are flushed
    pub max_wait_ms: u64,

    /// Pending writes that trigger an immediate flush
    pub max_batch_size: usize,

    /// Retries for transient I/O failures
    pub max_retries: u32,

    /// Keep queue metrics
    pub enable_metrics: bool,

    /// Flush automatically on size and time triggers
    pub enable_auto_flush: bool,
}

impl Default for WriteQueueSettings {
    fn default() -> Self {
        let defaults = WriteQueueConfig::default();
        Self {
            max_wait_ms: u64::try_from(defaults.max_wait.as_millis()).unwrap_or(150),
            max_batch_size: defaults.max_batch_size,
            max_retries: defaults.max_retries,
            enable_metrics: defaults.enable_metrics,
            enable_auto_flush: defaults.enable_auto_flush,
        }
    }
}

impl WriteQueueSettings {
    /// Convert to the queue's runtime configuration.
    pub fn to_queue_config(&self) -> WriteQueueConfig {
        WriteQueueConfig {
            max_wait: Duration::from_millis(self.max_wait_ms),
            max_batch_size: self.max_batch_size,
            max_retries: self.max_retries,
            enable_metrics: self.enable_metrics,
            enable_auto_flush: self.enable_auto_flush,
        }
    }
}

/// Sync state durability settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Back up the state file before each full save
    pub backup_enabled: bool,

    /// Backups kept before the oldest is pruned
    pub max_backups: usize,

    /// Restore from the newest valid backup when the state file is corrupt
    pub auto_recovery: bool,

    /// Operation history entries kept
    pub history_max_entries: usize,

    /// Age in days after which history and resolved conflicts are trimmed
    pub history_max_age_days: u32,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            backup_enabled: true,
            max_backups: 5,
            auto_recovery: true,
            history_max_entries: 100,
            history_max_age_days: 30,
        }
    }
}

impl TasklinkConfig {
    /// Load configuration from a file and apply environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not valid YAML, or
    /// fails validation.
    pub async fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).await?;
        let mut config: Self = if content.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(&content).map_err(|e| Error::Config(e.to_string()))?
        };
        config.apply_token_override(std::env::var(TOKEN_ENV_VAR).ok());
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a file.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub async fn save(&self, path: &Path) -> Result<()> {
        let content =
            serde_yaml::to_string(self).map_err(|e| Error::Config(format!("YAML error: {e}")))?;
        fs::write(path, content).await?;
        Ok(())
    }

    /// Use `token` when the configured token is empty.
    pub fn apply_token_override(&mut self, token: Option<String>) {
        if self.github.token.is_empty()
            && let Some(token) = token.filter(|t| !t.trim().is_empty())
        {
            self.github.token = token.trim().to_string();
        }
    }

    /// Check the values that would otherwise fail later and less clearly.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` describing the first invalid value.
    pub fn validate(&self) -> Result<()> {
        if self.github.enabled {
            validate_repo_name("owner", &self.github.owner)?;
            validate_repo_name("repo", &self.github.repo)?;
        }
        if self.write_queue.max_batch_size == 0 {
            return Err(Error::Config(
                "write_queue.max_batch_size must be greater than 0".to_string(),
            ));
        }
        if self.sync.history_max_entries == 0 {
            return Err(Error::Config(
                "sync.history_max_entries must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Validate an owner or repository name.
///
/// GitHub allows ASCII letters, digits, `-`, `_` and `.` (the latter two not
/// in owner names, but we accept them for simplicity).
pub fn validate_repo_name(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::Config(format!("github.{field} must be set when sync is enabled")));
    }
    if value.len() > MAX_NAME_LENGTH {
        return Err(Error::Config(format!(
            "github.{field} cannot exceed {MAX_NAME_LENGTH} characters"
        )));
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(Error::Config(format!(
            "github.{field} may only contain letters, digits, '-', '_' and '.'"
        )));
    }
    Ok(())
}
