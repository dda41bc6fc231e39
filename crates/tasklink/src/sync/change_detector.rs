//! Local and remote change detection.
//!
//! The detector never talks to GitHub. The orchestrator fetches an issue (or
//! decides not to) and passes what it saw as a [`RemoteObservation`]; the
//! detector compares both sides with the baseline recorded in
//! [`ChangeMetadata`] at the last sync.

use super::state::{ChangeMetadata, ConflictType, FieldValue, GitHubSyncStateFile, SyncConflict, SyncMapping};
use crate::domain::{Priority, Subtask, Task, TaskStatus};
use crate::github::body::extract_description;
use crate::github::{IssueState, RemoteIssue};
use crate::hashing::content_hash;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// What the caller knows about the remote side of a mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteObservation {
    /// The issue was not fetched
    NotChecked,
    /// The issue was fetched and does not exist
    Missing,
    /// The issue was fetched
    Present {
        /// Remote modification time
        updated_at: DateTime<Utc>,
        /// Hash from [`remote_hash`]
        hash: String,
    },
}

impl RemoteObservation {
    /// Observation for a fetched issue.
    pub fn of(issue: &RemoteIssue) -> Self {
        RemoteObservation::Present {
            updated_at: issue.updated_at,
            hash: remote_hash(issue),
        }
    }
}

/// Change state of one sync unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeState {
    /// No mapping yet
    Unmapped,
    /// Nothing changed on either side
    InSync,
    /// Only the task changed
    LocalChanged,
    /// Only the issue changed
    RemoteChanged,
    /// Both changed; a conflict candidate
    BothChanged,
    /// The issue is gone
    DeletedOnGitHub,
    /// The task is gone
    DeletedLocally,
}

impl fmt::Display for ChangeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChangeState::Unmapped => "unmapped",
            ChangeState::InSync => "in_sync",
            ChangeState::LocalChanged => "local_changed",
            ChangeState::RemoteChanged => "remote_changed",
            ChangeState::BothChanged => "both_changed",
            ChangeState::DeletedOnGitHub => "deleted_on_github",
            ChangeState::DeletedLocally => "deleted_locally",
        };
        write!(f, "{s}")
    }
}

/// Counts of units waiting to be pushed or pulled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingChanges {
    /// Units with local changes (unmapped units included)
    pub local_changes: usize,
    /// Units with known remote changes
    pub remote_changes: usize,
}

#[derive(Serialize)]
struct LocalFields<'a> {
    title: &'a str,
    description: &'a str,
    details: Option<&'a str>,
    status: TaskStatus,
    priority: Priority,
    dependencies: &'a [String],
    labels: Vec<&'a str>,
    assignee: Option<&'a str>,
    subtasks: &'a [Subtask],
}

#[derive(Serialize)]
struct RemoteFields<'a> {
    title: &'a str,
    description: String,
    state: IssueState,
    labels: Vec<&'a str>,
    assignee: Option<&'a str>,
}

fn sorted(items: &[String]) -> Vec<&str> {
    let mut out: Vec<&str> = items.iter().map(String::as_str).collect();
    out.sort_unstable();
    out.dedup();
    out
}

/// Content hash of the fields of a task that reach GitHub.
pub fn local_hash(task: &Task) -> String {
    content_hash(&LocalFields {
        title: &task.title,
        description: task.description.trim_end(),
        details: task.details.as_deref(),
        status: task.status,
        priority: task.priority,
        dependencies: &task.dependencies,
        labels: sorted(&task.labels),
        assignee: task.assignee.as_deref(),
        subtasks: &task.subtasks,
    })
}

/// Content hash of the fields of an issue that sync compares.
pub fn remote_hash(issue: &RemoteIssue) -> String {
    content_hash(&RemoteFields {
        title: &issue.title,
        description: extract_description(&issue.body),
        state: issue.state,
        labels: sorted(&issue.labels),
        assignee: issue.assignees.first().map(String::as_str),
    })
}

/// Fresh baseline for a unit that was just synced.
pub fn snapshot(task: &Task, issue: Option<&RemoteIssue>) -> ChangeMetadata {
    ChangeMetadata {
        local_updated_at: task.updated_at,
        remote_updated_at: issue.map(|i| i.updated_at),
        last_checked_at: Utc::now(),
        has_local_changes: false,
        has_remote_changes: false,
        local_hash: local_hash(task),
        remote_hash: issue.map(remote_hash),
    }
}

/// Compares tasks and issues against their sync baselines.
#[derive(Debug, Clone, Copy)]
pub struct ChangeDetector {
    sync_assignees: bool,
}

impl Default for ChangeDetector {
    fn default() -> Self {
        Self::new(true)
    }
}

impl ChangeDetector {
    /// Detector; `sync_assignees` controls whether assignees are compared.
    pub fn new(sync_assignees: bool) -> Self {
        Self { sync_assignees }
    }

    /// Whether the task differs from its baseline.
    ///
    /// A task with no baseline counts as changed.
    pub fn local_changed(&self, task: &Task, metadata: Option<&ChangeMetadata>) -> bool {
        metadata.is_none_or(|m| {
            m.has_local_changes
                || m.local_updated_at != task.updated_at
                || m.local_hash != local_hash(task)
        })
    }

    /// Whether the observed issue differs from its baseline.
    pub fn remote_changed(&self, metadata: Option<&ChangeMetadata>, remote: &RemoteObservation) -> bool {
        let Some(m) = metadata else {
            return false;
        };
        match remote {
            RemoteObservation::NotChecked => m.has_remote_changes,
            RemoteObservation::Missing => true,
            RemoteObservation::Present { updated_at, hash } => {
                m.has_remote_changes
                    || m.remote_updated_at != Some(*updated_at)
                    || m.remote_hash.as_deref() != Some(hash.as_str())
            }
        }
    }

    /// Classify one unit.
    pub fn detect(
        &self,
        task: Option<&Task>,
        mapping: Option<&SyncMapping>,
        metadata: Option<&ChangeMetadata>,
        remote: &RemoteObservation,
    ) -> ChangeState {
        if mapping.is_none() {
            return ChangeState::Unmapped;
        }
        let Some(task) = task else {
            return ChangeState::DeletedLocally;
        };
        if *remote == RemoteObservation::Missing {
            return ChangeState::DeletedOnGitHub;
        }
        match (self.local_changed(task, metadata), self.remote_changed(metadata, remote)) {
            (false, false) => ChangeState::InSync,
            (true, false) => ChangeState::LocalChanged,
            (false, true) => ChangeState::RemoteChanged,
            (true, true) => ChangeState::BothChanged,
        }
    }

    /// Field-level conflicts between a task and its issue.
    ///
    /// Fields that agree produce nothing, so an empty result means a
    /// both-changed pair converged on the same content.
    pub fn classify(&self, task: &Task, issue: &RemoteIssue) -> Vec<SyncConflict> {
        let now = Utc::now();
        let mut conflicts = Vec::new();
        let mut push = |conflict_type, local: FieldValue, remote: FieldValue| {
            conflicts.push(SyncConflict::new(&task.id, issue.number, conflict_type, local, remote, now));
        };

        if task.title != issue.title {
            push(
                ConflictType::TitleMismatch,
                FieldValue::Text(task.title.clone()),
                FieldValue::Text(issue.title.clone()),
            );
        }

        let remote_description = extract_description(&issue.body);
        if task.description.trim_end() != remote_description {
            push(
                ConflictType::DescriptionMismatch,
                FieldValue::Text(task.description.clone()),
                FieldValue::Text(remote_description),
            );
        }

        let local_closed = task.is_closed();
        if local_closed != (issue.state == IssueState::Closed) {
            push(
                ConflictType::StatusMismatch,
                FieldValue::Text(task.status.to_string()),
                FieldValue::Text(issue.state.to_string()),
            );
        }

        if self.sync_assignees {
            let remote_assignee = issue.assignees.first();
            if task.assignee.as_ref() != remote_assignee {
                push(
                    ConflictType::AssigneeMismatch,
                    task.assignee.clone().map_or(FieldValue::Absent, FieldValue::Text),
                    remote_assignee.cloned().map_or(FieldValue::Absent, FieldValue::Text),
                );
            }
        }

        let local_labels = sorted(&task.labels);
        let remote_labels = sorted(&issue.labels);
        if local_labels != remote_labels {
            push(
                ConflictType::LabelMismatch,
                FieldValue::List(local_labels.into_iter().map(str::to_string).collect()),
                FieldValue::List(remote_labels.into_iter().map(str::to_string).collect()),
            );
        }

        conflicts
    }

    /// Count pending changes across `units` for status reporting.
    ///
    /// Uses recorded remote flags only; nothing is fetched.
    pub fn summarize(&self, units: &[Task], state: &GitHubSyncStateFile) -> PendingChanges {
        let mut pending = PendingChanges::default();
        for unit in units {
            let metadata = state.change_metadata.get(&unit.id);
            if !state.mappings.contains_key(&unit.id) || self.local_changed(unit, metadata) {
                pending.local_changes += 1;
            }
            if metadata.is_some_and(|m| m.has_remote_changes) {
                pending.remote_changes += 1;
            }
        }
        pending
    }
}
