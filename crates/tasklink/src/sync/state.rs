//! Persisted sync state.
//!
//! [`GitHubSyncStateFile`] is the aggregate stored in
//! `.tasklink/github-sync-state.json`: task-to-issue mappings, detected
//! conflicts, per-task change metadata and a bounded operation history.
//!
//! Two invariants hold for every saved state:
//!
//! 1. every conflict's `(task_id, issue_number)` has a matching mapping;
//! 2. every mapping with status `conflict` has at least one unresolved
//!    conflict.
//!
//! The first is checked by [`GitHubSyncStateFile::validate`]; a state that
//! fails it is treated as corrupt. The second is restored by
//! [`GitHubSyncStateFile::repair_mapping_status`].

use crate::hashing::record_id;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Current state file format version.
pub const STATE_VERSION: &str = "1.0.0";

/// Direction of the last successful sync for a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    /// Local changes pushed to GitHub
    ToGithub,
    /// Remote changes pulled from GitHub
    FromGithub,
    /// Both sides touched
    Bidirectional,
}

/// Health of a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MappingStatus {
    /// Both sides agree
    Synced,
    /// Needs another pass
    Pending,
    /// Has unresolved conflicts
    Conflict,
    /// Last attempt failed
    Error,
}

impl fmt::Display for MappingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MappingStatus::Synced => "synced",
            MappingStatus::Pending => "pending",
            MappingStatus::Conflict => "conflict",
            MappingStatus::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// Link between a local task (or subtask unit) and a GitHub issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMapping {
    /// Local task id
    pub task_id: String,
    /// Linked issue number
    pub issue_number: u64,
    /// Repository owner
    pub owner: String,
    /// Repository name
    pub repo: String,
    /// Last successful sync
    pub last_synced_at: DateTime<Utc>,
    /// Direction of the last sync
    pub last_sync_direction: SyncDirection,
    /// Mapping health
    pub status: MappingStatus,
}

/// Kind of disagreement between a task and its issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    /// Titles differ
    TitleMismatch,
    /// Descriptions differ
    DescriptionMismatch,
    /// Open/closed state differs
    StatusMismatch,
    /// Assignees differ
    AssigneeMismatch,
    /// Label sets differ
    LabelMismatch,
    /// The issue no longer exists
    DeletedOnGithub,
    /// The task no longer exists
    DeletedLocally,
}

impl ConflictType {
    /// All conflict types.
    pub const ALL: [ConflictType; 7] = [
        ConflictType::TitleMismatch,
        ConflictType::DescriptionMismatch,
        ConflictType::StatusMismatch,
        ConflictType::AssigneeMismatch,
        ConflictType::LabelMismatch,
        ConflictType::DeletedOnGithub,
        ConflictType::DeletedLocally,
    ];

    /// Whether one side no longer exists.
    pub fn is_deletion(self) -> bool {
        matches!(self, ConflictType::DeletedOnGithub | ConflictType::DeletedLocally)
    }

    /// Snake-case name as stored on disk.
    pub fn as_str(self) -> &'static str {
        match self {
            ConflictType::TitleMismatch => "title_mismatch",
            ConflictType::DescriptionMismatch => "description_mismatch",
            ConflictType::StatusMismatch => "status_mismatch",
            ConflictType::AssigneeMismatch => "assignee_mismatch",
            ConflictType::LabelMismatch => "label_mismatch",
            ConflictType::DeletedOnGithub => "deleted_on_github",
            ConflictType::DeletedLocally => "deleted_locally",
        }
    }
}

impl fmt::Display for ConflictType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A field value on either side of a conflict.
///
/// Serialized untagged: `null`, a string, or an array of strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    /// No value (field unset, or the whole item is gone)
    #[default]
    Absent,
    /// Scalar text
    Text(String),
    /// List of names
    List(Vec<String>),
}

impl FieldValue {
    /// Text value, if this is one.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// List value, if this is one.
    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            FieldValue::List(items) => Some(items),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Absent => write!(f, "(none)"),
            FieldValue::Text(s) => write!(f, "{s}"),
            FieldValue::List(items) => write!(f, "[{}]", items.join(", ")),
        }
    }
}

/// Resolution strategy for a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Keep the local value
    PreferLocal,
    /// Keep the remote value
    PreferRemote,
    /// Combine both values
    Merge,
    /// Use a value supplied by the user
    Manual,
}

impl fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResolutionStrategy::PreferLocal => "prefer_local",
            ResolutionStrategy::PreferRemote => "prefer_remote",
            ResolutionStrategy::Merge => "merge",
            ResolutionStrategy::Manual => "manual",
        };
        write!(f, "{s}")
    }
}

/// A detected disagreement for one field of one mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConflict {
    /// Local task id
    pub task_id: String,
    /// Linked issue number
    pub issue_number: u64,
    /// What disagrees
    #[serde(rename = "type")]
    pub conflict_type: ConflictType,
    /// Local side
    pub local_value: FieldValue,
    /// Remote side
    pub remote_value: FieldValue,
    /// When the conflict was first seen
    pub detected_at: DateTime<Utc>,
    /// Strategy used to resolve it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution_strategy: Option<ResolutionStrategy>,
    /// Whether it has been resolved
    #[serde(default)]
    pub resolved: bool,
    /// When it was resolved
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl SyncConflict {
    /// New unresolved conflict.
    pub fn new(
        task_id: impl Into<String>,
        issue_number: u64,
        conflict_type: ConflictType,
        local_value: FieldValue,
        remote_value: FieldValue,
        detected_at: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            issue_number,
            conflict_type,
            local_value,
            remote_value,
            detected_at,
            resolution_strategy: None,
            resolved: false,
            resolved_at: None,
        }
    }
}

/// Change tracking baseline for one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeMetadata {
    /// Task `updated_at` at the last sync
    pub local_updated_at: DateTime<Utc>,
    /// Issue `updated_at` at the last sync
    #[serde(default)]
    pub remote_updated_at: Option<DateTime<Utc>>,
    /// Last time either side was checked
    pub last_checked_at: DateTime<Utc>,
    /// Local side has changes to push
    #[serde(default)]
    pub has_local_changes: bool,
    /// Remote side has changes to pull
    #[serde(default)]
    pub has_remote_changes: bool,
    /// Content hash of the task at the last sync
    pub local_hash: String,
    /// Content hash of the issue at the last sync
    #[serde(default)]
    pub remote_hash: Option<String>,
}

/// Kind of recorded sync operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOperation {
    /// Issue created
    Create,
    /// Issue updated
    Update,
    /// Remote changes applied locally
    Pull,
    /// Issue closed
    Close,
    /// Conflict detected
    ConflictDetected,
    /// Conflict resolved
    ConflictResolved,
    /// Mapping removed
    MappingRemoved,
}

/// One entry of the operation history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOperationRecord {
    /// Record id
    pub id: String,
    /// Task the operation concerned
    pub task_id: String,
    /// Issue the operation concerned
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue_number: Option<u64>,
    /// What happened
    pub operation: SyncOperation,
    /// Which way data moved
    pub direction: SyncDirection,
    /// When it happened
    pub timestamp: DateTime<Utc>,
    /// Whether it succeeded
    pub success: bool,
    /// Failure description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Metadata about the most recent state backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupInfo {
    /// Backup file
    pub backup_path: String,
    /// When it was taken
    pub created_at: DateTime<Utc>,
    /// Mappings in the backed-up state
    pub mapping_count: usize,
    /// Format version of the backed-up state
    pub version: String,
}

/// The sync state aggregate for one repository binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitHubSyncStateFile {
    /// Format version
    pub version: String,
    /// Repository owner
    pub owner: String,
    /// Repository name
    pub repo: String,
    /// Mappings keyed by task id
    #[serde(default)]
    pub mappings: BTreeMap<String, SyncMapping>,
    /// Detected conflicts, resolved ones included until trimmed
    #[serde(default)]
    pub conflicts: Vec<SyncConflict>,
    /// Change baselines keyed by task id
    #[serde(default)]
    pub change_metadata: BTreeMap<String, ChangeMetadata>,
    /// Bounded operation history, oldest first
    #[serde(default)]
    pub operation_history: Vec<SyncOperationRecord>,
    /// End of the last sync pass
    #[serde(default)]
    pub last_sync_at: Option<DateTime<Utc>>,
    /// Whether a pass is running
    #[serde(default)]
    pub sync_in_progress: bool,
    /// When the running pass started
    #[serde(default)]
    pub sync_started_at: Option<DateTime<Utc>>,
    /// Error of the last pass
    #[serde(default)]
    pub last_sync_error: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last save
    pub updated_at: DateTime<Utc>,
    /// Most recent backup
    #[serde(default)]
    pub last_backup: Option<BackupInfo>,
}

impl GitHubSyncStateFile {
    /// Fresh, empty state.
    pub fn new(owner: impl Into<String>, repo: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            version: STATE_VERSION.to_string(),
            owner: owner.into(),
            repo: repo.into(),
            mappings: BTreeMap::new(),
            conflicts: Vec::new(),
            change_metadata: BTreeMap::new(),
            operation_history: Vec::new(),
            last_sync_at: None,
            sync_in_progress: false,
            sync_started_at: None,
            last_sync_error: None,
            created_at: now,
            updated_at: now,
            last_backup: None,
        }
    }

    /// Check that every conflict belongs to an existing mapping.
    ///
    /// # Errors
    ///
    /// Returns a description of the first orphaned conflict.
    pub fn validate(&self) -> Result<(), String> {
        for conflict in &self.conflicts {
            match self.mappings.get(&conflict.task_id) {
                Some(m) if m.issue_number == conflict.issue_number => {}
                Some(m) => {
                    return Err(format!(
                        "conflict for task {} references issue #{} but the mapping points to #{}",
                        conflict.task_id, conflict.issue_number, m.issue_number
                    ));
                }
                None => {
                    return Err(format!(
                        "conflict for task {} has no mapping",
                        conflict.task_id
                    ));
                }
            }
        }
        Ok(())
    }

    /// Downgrade `conflict` mappings without unresolved conflicts to `pending`.
    ///
    /// Returns the number of mappings changed.
    pub fn repair_mapping_status(&mut self) -> usize {
        let mut repaired = 0;
        for mapping in self.mappings.values_mut() {
            if mapping.status == MappingStatus::Conflict
                && !self
                    .conflicts
                    .iter()
                    .any(|c| !c.resolved && c.task_id == mapping.task_id)
            {
                mapping.status = MappingStatus::Pending;
                repaired += 1;
            }
        }
        repaired
    }

    /// Unresolved conflicts, in detection order.
    pub fn unresolved_conflicts(&self) -> impl Iterator<Item = &SyncConflict> {
        self.conflicts.iter().filter(|c| !c.resolved)
    }

    /// Whether the task has any unresolved conflict.
    pub fn has_unresolved(&self, task_id: &str) -> bool {
        self.unresolved_conflicts().any(|c| c.task_id == task_id)
    }

    /// Record a conflict, refreshing the values of an identical unresolved
    /// one instead of adding a duplicate. Marks the mapping as `conflict`.
    ///
    /// Returns `true` if the conflict is new.
    pub fn upsert_conflict(&mut self, conflict: SyncConflict) -> bool {
        if let Some(mapping) = self.mappings.get_mut(&conflict.task_id) {
            mapping.status = MappingStatus::Conflict;
        }
        if let Some(existing) = self.conflicts.iter_mut().find(|c| {
            !c.resolved && c.task_id == conflict.task_id && c.conflict_type == conflict.conflict_type
        }) {
            existing.local_value = conflict.local_value;
            existing.remote_value = conflict.remote_value;
            existing.issue_number = conflict.issue_number;
            return false;
        }
        self.conflicts.push(conflict);
        true
    }

    /// Insert or replace the mapping for its task.
    pub fn upsert_mapping(&mut self, mapping: SyncMapping) {
        self.mappings.insert(mapping.task_id.clone(), mapping);
    }

    /// Remove a mapping together with its conflicts and change metadata.
    pub fn remove_mapping(&mut self, task_id: &str) -> Option<SyncMapping> {
        let removed = self.mappings.remove(task_id)?;
        self.conflicts.retain(|c| c.task_id != task_id);
        self.change_metadata.remove(task_id);
        Some(removed)
    }

    /// Append an operation to the history.
    pub fn record_operation(
        &mut self,
        task_id: &str,
        issue_number: Option<u64>,
        operation: SyncOperation,
        direction: SyncDirection,
        error: Option<String>,
    ) {
        let sequence = self.operation_history.len() as u64;
        self.operation_history.push(SyncOperationRecord {
            id: record_id("op", task_id, sequence),
            task_id: task_id.to_string(),
            issue_number,
            operation,
            direction,
            timestamp: Utc::now(),
            success: error.is_none(),
            error,
        });
    }
}

/// Bound the operation history and drop old resolved conflicts.
///
/// Keeps at most `max_entries` history records, none older than `max_age`
/// relative to `now`. Resolved conflicts resolved before the cutoff are
/// removed as well.
pub fn trim_history(
    state: &mut GitHubSyncStateFile,
    max_entries: usize,
    max_age: TimeDelta,
    now: DateTime<Utc>,
) {
    let cutoff = now - max_age;
    state.operation_history.retain(|r| r.timestamp >= cutoff);
    if state.operation_history.len() > max_entries {
        let excess = state.operation_history.len() - max_entries;
        state.operation_history.drain(..excess);
    }
    state
        .conflicts
        .retain(|c| !(c.resolved && c.resolved_at.is_some_and(|at| at < cutoff)));
}
