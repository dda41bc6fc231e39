//! Conflict resolution, batch resolution, previews and undo.
//!
//! Resolving a conflict only changes the sync state: the conflict is marked
//! resolved, the mapping leaves the `conflict` status once nothing is left
//! open, and the value that won is returned as
//! [`ResolutionResult::applied_value`]. Callers write that value into the
//! local task with [`apply_value`]; the next push carries it to GitHub.
//!
//! Every resolution is recorded in a [`ResolutionHistory`] persisted next to
//! the sync state, which is what [`ConflictResolver::undo_last`] rewinds.

use super::conflict::{ConflictKey, ConflictPhase, RiskLevel, analyze, policy_for};
use super::diff::{merge_lines, merge_lists};
use super::state::{
    ChangeMetadata, ConflictType, FieldValue, GitHubSyncStateFile, MappingStatus, ResolutionStrategy,
    SyncConflict, SyncDirection, SyncMapping, SyncOperation,
};
use crate::domain::{Task, TaskStatus};
use crate::error::{Error, Result};
use crate::github::IssueState;
use crate::hashing::record_id;
use crate::storage::persist_json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tasklink_store::{Invalidation, WriteQueue, read_if_exists};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Resolution history file name inside `.tasklink/`.
pub const HISTORY_FILE_NAME: &str = "resolution-history.json";

/// Resolution history entries kept for undo.
pub const MAX_HISTORY_ENTRIES: usize = 200;

const HISTORY_VERSION: u32 = 1;

/// A requested resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Strategy to apply
    pub strategy: ResolutionStrategy,
    /// Value for [`ResolutionStrategy::Manual`]
    pub value: Option<FieldValue>,
}

impl Resolution {
    /// Resolution with a non-manual strategy.
    pub fn new(strategy: ResolutionStrategy) -> Self {
        Self { strategy, value: None }
    }

    /// Manual resolution with a user-supplied value.
    pub fn manual(value: FieldValue) -> Self {
        Self {
            strategy: ResolutionStrategy::Manual,
            value: Some(value),
        }
    }
}

/// Outcome of resolving one conflict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionResult {
    /// Task id
    pub task_id: String,
    /// Issue number
    pub issue_number: u64,
    /// Conflict type
    pub conflict_type: ConflictType,
    /// Strategy applied
    pub strategy: ResolutionStrategy,
    /// Value that won; to be written into the local task
    pub applied_value: FieldValue,
    /// Resolved by `sync --force`
    pub forced: bool,
    /// Mapping status afterwards, `None` if the mapping was removed
    pub mapping_status: Option<MappingStatus>,
    /// Whether the local side must be pushed
    pub push_required: bool,
}

/// Strategy selection for [`ConflictResolver::resolve_all`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStrategy {
    /// Each conflict's recommended strategy; high-risk conflicts are skipped
    Recommended,
    /// Local wins everywhere
    PreferLocal,
    /// Remote wins everywhere
    PreferRemote,
}

/// Options for [`ConflictResolver::resolve_all`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOptions {
    /// Stop at the first failure
    pub stop_on_error: bool,
    /// Only produce previews
    pub dry_run: bool,
}

/// A conflict left unresolved by a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedConflict {
    /// Task id
    pub task_id: String,
    /// Conflict type
    pub conflict_type: ConflictType,
    /// `skipped` when left for the user, `analyzed` when resolving failed
    pub phase: ConflictPhase,
    /// Why it was skipped or failed
    pub reason: String,
}

/// Outcome of a batch resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResolutionResult {
    /// Resolved conflicts
    pub resolved: Vec<ResolutionResult>,
    /// Conflicts left for the user
    pub skipped: Vec<SkippedConflict>,
    /// Conflicts that failed to resolve
    pub failed: Vec<SkippedConflict>,
    /// Previews, for dry runs
    pub previews: Vec<PreviewResult>,
    /// Whether this was a dry run
    pub dry_run: bool,
}

/// What a resolution would do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewResult {
    /// Task id
    pub task_id: String,
    /// Conflict type
    pub conflict_type: ConflictType,
    /// Strategy previewed
    pub strategy: ResolutionStrategy,
    /// Local value now
    pub before_local: FieldValue,
    /// Remote value now
    pub before_remote: FieldValue,
    /// Value afterwards, on both sides
    pub after: FieldValue,
    /// Human-readable consequences
    pub impacts: Vec<String>,
}

/// One recorded resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    /// Entry id
    pub id: String,
    /// Task id
    pub task_id: String,
    /// Issue number
    pub issue_number: u64,
    /// Conflict type
    pub conflict_type: ConflictType,
    /// Strategy applied
    pub strategy: ResolutionStrategy,
    /// Resolved by `sync --force`
    #[serde(default)]
    pub forced: bool,
    /// The conflict as it was before resolution
    pub previous: SyncConflict,
    /// Value that won
    pub applied_value: FieldValue,
    /// Mapping removed by the resolution, restored on undo
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub removed_mapping: Option<SyncMapping>,
    /// When it was resolved
    pub resolved_at: DateTime<Utc>,
}

/// Persisted resolution history, oldest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionHistory {
    /// Format version
    pub version: u32,
    /// Entries
    #[serde(default)]
    pub entries: Vec<HistoryEntry>,
}

impl Default for ResolutionHistory {
    fn default() -> Self {
        Self {
            version: HISTORY_VERSION,
            entries: Vec::new(),
        }
    }
}

impl ResolutionHistory {
    fn push(&mut self, entry: HistoryEntry) {
        self.entries.push(entry);
        if self.entries.len() > MAX_HISTORY_ENTRIES {
            let excess = self.entries.len() - MAX_HISTORY_ENTRIES;
            self.entries.drain(..excess);
        }
    }
}

/// Write a resolved value into a task. Returns whether the task changed.
///
/// Deletion conflicts carry no field value and leave the task untouched.
pub fn apply_value(task: &mut Task, conflict_type: ConflictType, value: &FieldValue) -> bool {
    let changed = match (conflict_type, value) {
        (ConflictType::TitleMismatch, FieldValue::Text(title)) if task.title != *title => {
            task.title.clone_from(title);
            true
        }
        (ConflictType::DescriptionMismatch, FieldValue::Text(text)) if task.description != *text => {
            task.description.clone_from(text);
            true
        }
        (ConflictType::StatusMismatch, FieldValue::Text(status)) => match parse_status(status, task.status) {
            Some(next) if next != task.status => {
                task.status = next;
                true
            }
            _ => false,
        },
        (ConflictType::AssigneeMismatch, FieldValue::Text(login)) if task.assignee.as_ref() != Some(login) => {
            task.assignee = Some(login.clone());
            true
        }
        (ConflictType::AssigneeMismatch, FieldValue::Absent) if task.assignee.is_some() => {
            task.assignee = None;
            true
        }
        (ConflictType::LabelMismatch, FieldValue::List(labels)) if task.labels != *labels => {
            task.labels.clone_from(labels);
            true
        }
        _ => false,
    };
    if changed {
        task.touch();
    }
    changed
}

/// Status a task should take for a status value.
///
/// Task statuses map directly; issue states only change the task when the
/// open/closed sense differs (`closed` means done, `open` means pending).
fn parse_status(value: &str, current: TaskStatus) -> Option<TaskStatus> {
    if let Ok(status) = value.parse::<TaskStatus>() {
        return Some(status);
    }
    match value.trim().to_lowercase().as_str() {
        "closed" if !current.is_closed() => Some(TaskStatus::Done),
        "open" if current.is_closed() => Some(TaskStatus::Pending),
        "closed" | "open" => Some(current),
        _ => None,
    }
}

/// Issue state for a status value, if it names one.
pub fn issue_state_for(value: &FieldValue) -> Option<IssueState> {
    let text = value.as_text()?;
    match text.parse::<TaskStatus>() {
        Ok(status) if status.is_closed() => Some(IssueState::Closed),
        Ok(_) => Some(IssueState::Open),
        Err(_) => match text.trim().to_lowercase().as_str() {
            "closed" => Some(IssueState::Closed),
            "open" => Some(IssueState::Open),
            _ => None,
        },
    }
}

fn validate_manual(conflict_type: ConflictType, value: &FieldValue) -> Result<()> {
    let ok = match conflict_type {
        ConflictType::TitleMismatch => value.as_text().is_some_and(|t| !t.trim().is_empty()),
        ConflictType::DescriptionMismatch => value.as_text().is_some(),
        ConflictType::StatusMismatch => issue_state_for(value).is_some(),
        ConflictType::AssigneeMismatch => matches!(value, FieldValue::Text(_) | FieldValue::Absent),
        ConflictType::LabelMismatch => value.as_list().is_some(),
        ConflictType::DeletedOnGithub | ConflictType::DeletedLocally => true,
    };
    if ok {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "manual value {value} is not valid for a {conflict_type} conflict"
        )))
    }
}

/// Value a strategy produces for a conflict, without touching any state.
///
/// # Errors
///
/// Returns [`Error::StrategyUnavailable`] if the policy does not offer the
/// strategy, or [`Error::Validation`] for a missing or ill-typed manual
/// value.
pub fn resolved_value(conflict: &SyncConflict, resolution: &Resolution) -> Result<FieldValue> {
    let policy = policy_for(conflict.conflict_type);
    if !policy.allows(resolution.strategy) {
        return Err(Error::StrategyUnavailable {
            strategy: resolution.strategy.to_string(),
            conflict_type: conflict.conflict_type.to_string(),
        });
    }

    match resolution.strategy {
        ResolutionStrategy::PreferLocal => Ok(conflict.local_value.clone()),
        ResolutionStrategy::PreferRemote => Ok(conflict.remote_value.clone()),
        ResolutionStrategy::Merge => match (&conflict.local_value, &conflict.remote_value) {
            (FieldValue::Text(l), FieldValue::Text(r)) => Ok(FieldValue::Text(merge_lines(l, r))),
            (FieldValue::List(l), FieldValue::List(r)) => Ok(FieldValue::List(merge_lists(l, r))),
            _ => Err(Error::Validation(format!(
                "cannot merge {} with {}",
                conflict.local_value, conflict.remote_value
            ))),
        },
        ResolutionStrategy::Manual => {
            let value = resolution
                .value
                .clone()
                .ok_or_else(|| Error::Validation("manual resolution requires a value".to_string()))?;
            validate_manual(conflict.conflict_type, &value)?;
            Ok(value)
        }
    }
}

/// Whether a resolution of a deletion conflict unlinks the task from its
/// issue.
///
/// `deleted_locally` resolved in favour of the local side keeps the mapping
/// until the next push has closed the issue.
fn removes_mapping(conflict_type: ConflictType, strategy: ResolutionStrategy) -> bool {
    match conflict_type {
        ConflictType::DeletedOnGithub => true,
        ConflictType::DeletedLocally => strategy == ResolutionStrategy::Manual,
        _ => false,
    }
}

fn describe_impacts(conflict: &SyncConflict, strategy: ResolutionStrategy, after: &FieldValue) -> Vec<String> {
    let task = &conflict.task_id;
    let issue = conflict.issue_number;
    match (conflict.conflict_type, strategy) {
        (ConflictType::DeletedOnGithub, ResolutionStrategy::PreferLocal) => vec![
            format!("Mapping between task {task} and issue #{issue} will be removed"),
            format!("Task {task} will be recreated on GitHub at the next sync"),
        ],
        (ConflictType::DeletedOnGithub, ResolutionStrategy::PreferRemote) => vec![
            format!("Mapping between task {task} and issue #{issue} will be removed"),
            format!("Local task {task} will be deleted"),
        ],
        (ConflictType::DeletedLocally, ResolutionStrategy::PreferLocal) => {
            vec![format!("Issue #{issue} will be closed and unlinked at the next sync")]
        }
        (ConflictType::DeletedLocally, ResolutionStrategy::PreferRemote) => vec![
            format!("Local task {task} will be restored from issue #{issue}"),
            "Remaining fields will be pulled at the next two-way sync".to_string(),
        ],
        (ConflictType::DeletedOnGithub | ConflictType::DeletedLocally, _) => {
            vec![format!("Mapping between task {task} and issue #{issue} will be removed")]
        }
        (conflict_type, _) => {
            let mut impacts = Vec::new();
            if *after != conflict.local_value {
                impacts.push(format!("Local {conflict_type} of task {task} will change to {after}"));
            }
            if *after != conflict.remote_value {
                impacts.push(format!("Issue #{issue} will be updated at the next sync"));
            }
            if impacts.is_empty() {
                impacts.push("No data changes".to_string());
            }
            impacts
        }
    }
}

/// Preview a resolution without changing anything.
///
/// # Errors
///
/// See [`resolved_value`].
pub fn preview(conflict: &SyncConflict, resolution: &Resolution) -> Result<PreviewResult> {
    let after = resolved_value(conflict, resolution)?;
    Ok(PreviewResult {
        task_id: conflict.task_id.clone(),
        conflict_type: conflict.conflict_type,
        strategy: resolution.strategy,
        before_local: conflict.local_value.clone(),
        before_remote: conflict.remote_value.clone(),
        impacts: describe_impacts(conflict, resolution.strategy, &after),
        after,
    })
}

/// Resolves conflicts and keeps the undo history.
pub struct ConflictResolver {
    path: PathBuf,
    queue: Arc<WriteQueue>,
    history: Mutex<Option<ResolutionHistory>>,
}

impl std::fmt::Debug for ConflictResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConflictResolver")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl ConflictResolver {
    /// Resolver keeping its history in `tasklink_dir`.
    pub fn new(tasklink_dir: &Path, queue: Arc<WriteQueue>) -> Self {
        Self {
            path: tasklink_dir.join(HISTORY_FILE_NAME),
            queue,
            history: Mutex::new(None),
        }
    }

    async fn loaded<'a>(
        &self,
        slot: &'a mut Option<ResolutionHistory>,
    ) -> Result<&'a mut ResolutionHistory> {
        if slot.is_none() {
            let history = match read_if_exists(&self.path).await? {
                Some(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                    warn!(path = %self.path.display(), error = %e, "Unreadable resolution history, starting over");
                    ResolutionHistory::default()
                }),
                None => ResolutionHistory::default(),
            };
            *slot = Some(history);
        }
        Ok(slot.get_or_insert_with(ResolutionHistory::default))
    }

    /// Recorded resolutions, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the history file cannot be read.
    pub async fn history(&self) -> Result<Vec<HistoryEntry>> {
        let mut slot = self.history.lock().await;
        Ok(self.loaded(&mut slot).await?.entries.clone())
    }

    /// Resolve one unresolved conflict.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConflictNotFound`] if no unresolved conflict matches
    /// `key`, the errors of [`resolved_value`], or a history write failure.
    pub async fn resolve(
        &self,
        state: &mut GitHubSyncStateFile,
        key: &ConflictKey,
        resolution: &Resolution,
    ) -> Result<ResolutionResult> {
        self.resolve_inner(state, key, resolution, false).await
    }

    /// Resolve with `prefer_local` on behalf of `sync --force`.
    ///
    /// # Errors
    ///
    /// See [`resolve`](Self::resolve).
    pub async fn resolve_forced(
        &self,
        state: &mut GitHubSyncStateFile,
        key: &ConflictKey,
    ) -> Result<ResolutionResult> {
        self.resolve_inner(state, key, &Resolution::new(ResolutionStrategy::PreferLocal), true)
            .await
    }

    async fn resolve_inner(
        &self,
        state: &mut GitHubSyncStateFile,
        key: &ConflictKey,
        resolution: &Resolution,
        forced: bool,
    ) -> Result<ResolutionResult> {
        let index = state
            .conflicts
            .iter()
            .position(|c| key.matches(c))
            .ok_or_else(|| Error::ConflictNotFound {
                task_id: key.task_id.clone(),
                conflict_type: key.conflict_type.to_string(),
            })?;
        let previous = state.conflicts[index].clone();
        ConflictPhase::of(&previous)
            .advance(ConflictPhase::Analyzed)?
            .advance(ConflictPhase::Resolved)?;
        let applied_value = resolved_value(&previous, resolution)?;
        let now = Utc::now();

        // Staged on a copy; `state` only changes once the history entry is on disk.
        let mut staged = state.clone();
        let conflict = &mut staged.conflicts[index];
        conflict.resolved = true;
        conflict.resolution_strategy = Some(resolution.strategy);
        conflict.resolved_at = Some(now);

        let removed_mapping = if removes_mapping(previous.conflict_type, resolution.strategy) {
            staged.remove_mapping(&previous.task_id)
        } else {
            if !staged.has_unresolved(&previous.task_id)
                && let Some(mapping) = staged.mappings.get_mut(&previous.task_id)
                && mapping.status == MappingStatus::Conflict
            {
                mapping.status = MappingStatus::Pending;
            }
            None
        };

        let push_required = removed_mapping.is_none()
            && !previous.conflict_type.is_deletion()
            && applied_value != previous.remote_value;
        if push_required {
            flag_local_changes(&mut staged, &previous.task_id, now);
        }

        staged.record_operation(
            &previous.task_id,
            Some(previous.issue_number),
            SyncOperation::ConflictResolved,
            SyncDirection::Bidirectional,
            None,
        );

        let result = ResolutionResult {
            task_id: previous.task_id.clone(),
            issue_number: previous.issue_number,
            conflict_type: previous.conflict_type,
            strategy: resolution.strategy,
            applied_value: applied_value.clone(),
            forced,
            mapping_status: staged.mappings.get(&previous.task_id).map(|m| m.status),
            push_required,
        };

        let mut slot = self.history.lock().await;
        let history = self.loaded(&mut slot).await?;
        let sequence = history.entries.len() as u64;
        let mut next = history.clone();
        next.push(HistoryEntry {
            id: record_id("res", &previous.task_id, sequence),
            task_id: previous.task_id.clone(),
            issue_number: previous.issue_number,
            conflict_type: previous.conflict_type,
            strategy: resolution.strategy,
            forced,
            previous,
            applied_value,
            removed_mapping,
            resolved_at: now,
        });
        persist_json(&self.queue, &self.path, &next, Invalidation::none()).await?;
        *history = next;
        *state = staged;

        info!(
            task_id = %result.task_id,
            conflict_type = %result.conflict_type,
            strategy = %result.strategy,
            forced,
            "Conflict resolved"
        );
        Ok(result)
    }

    /// Resolve every unresolved conflict with one batch strategy.
    ///
    /// Failures are collected in the result rather than returned.
    pub async fn resolve_all(
        &self,
        state: &mut GitHubSyncStateFile,
        strategy: BatchStrategy,
        options: BatchOptions,
    ) -> BatchResolutionResult {
        let mut result = BatchResolutionResult {
            dry_run: options.dry_run,
            ..BatchResolutionResult::default()
        };
        let pending: Vec<SyncConflict> = state.unresolved_conflicts().cloned().collect();

        for conflict in pending {
            let analysis = analyze(&conflict);
            let chosen = match strategy {
                BatchStrategy::Recommended if analysis.risk == RiskLevel::High => None,
                BatchStrategy::Recommended => analysis.recommended,
                BatchStrategy::PreferLocal => Some(ResolutionStrategy::PreferLocal),
                BatchStrategy::PreferRemote => Some(ResolutionStrategy::PreferRemote),
            };
            let Some(chosen) = chosen else {
                let skipped = ConflictPhase::of(&conflict)
                    .advance(ConflictPhase::Analyzed)
                    .and_then(|phase| phase.advance(ConflictPhase::Skipped));
                match skipped {
                    Ok(phase) => result.skipped.push(SkippedConflict {
                        task_id: conflict.task_id.clone(),
                        conflict_type: conflict.conflict_type,
                        phase,
                        reason: format!("{} risk, needs a manual decision", analysis.risk),
                    }),
                    Err(e) => result.failed.push(SkippedConflict {
                        task_id: conflict.task_id.clone(),
                        conflict_type: conflict.conflict_type,
                        phase: ConflictPhase::of(&conflict),
                        reason: e.to_string(),
                    }),
                }
                continue;
            };
            let resolution = Resolution::new(chosen);

            let outcome = if options.dry_run {
                preview(&conflict, &resolution).map(|p| result.previews.push(p))
            } else {
                self.resolve(state, &ConflictKey::of(&conflict), &resolution)
                    .await
                    .map(|r| result.resolved.push(r))
            };

            if let Err(e) = outcome {
                debug!(task_id = %conflict.task_id, error = %e, "Batch resolution failed");
                result.failed.push(SkippedConflict {
                    task_id: conflict.task_id.clone(),
                    conflict_type: conflict.conflict_type,
                    phase: ConflictPhase::Analyzed,
                    reason: e.to_string(),
                });
                if options.stop_on_error {
                    break;
                }
            }
        }
        result
    }

    /// Undo the most recent resolution, optionally for one task.
    ///
    /// The conflict becomes unresolved again and its mapping returns to the
    /// `conflict` status. The returned entry's `previous.local_value` is
    /// the local value before resolution.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NothingToUndo`] if there is no matching entry, or
    /// [`Error::Validation`] if the mapping it needs no longer exists.
    pub async fn undo_last(
        &self,
        state: &mut GitHubSyncStateFile,
        task_id: Option<&str>,
    ) -> Result<HistoryEntry> {
        let mut slot = self.history.lock().await;
        let history = self.loaded(&mut slot).await?;
        let index = history
            .entries
            .iter()
            .rposition(|e| task_id.is_none_or(|id| e.task_id == id))
            .ok_or(Error::NothingToUndo)?;
        let entry = history.entries[index].clone();

        let mut staged = state.clone();
        if let Some(mapping) = &entry.removed_mapping {
            if !staged.mappings.contains_key(&entry.task_id) {
                staged.upsert_mapping(mapping.clone());
            }
        } else if !staged.mappings.contains_key(&entry.task_id) {
            return Err(Error::Validation(format!(
                "task {} is no longer linked to issue #{}; cannot undo",
                entry.task_id, entry.issue_number
            )));
        }

        let reopened = staged.conflicts.iter_mut().rev().find(|c| {
            c.resolved && c.task_id == entry.task_id && c.conflict_type == entry.conflict_type
        });
        match reopened {
            Some(conflict) => {
                conflict.resolved = false;
                conflict.resolution_strategy = None;
                conflict.resolved_at = None;
            }
            None => {
                staged.upsert_conflict(entry.previous.clone());
            }
        }
        if let Some(mapping) = staged.mappings.get_mut(&entry.task_id) {
            mapping.status = MappingStatus::Conflict;
        }

        let mut next = history.clone();
        next.entries.remove(index);
        persist_json(&self.queue, &self.path, &next, Invalidation::none()).await?;
        *history = next;
        *state = staged;
        info!(task_id = %entry.task_id, conflict_type = %entry.conflict_type, "Resolution undone");
        Ok(entry)
    }
}

fn flag_local_changes(state: &mut GitHubSyncStateFile, task_id: &str, now: DateTime<Utc>) {
    match state.change_metadata.get_mut(task_id) {
        Some(metadata) => metadata.has_local_changes = true,
        None => {
            state.change_metadata.insert(
                task_id.to_string(),
                ChangeMetadata {
                    local_updated_at: now,
                    remote_updated_at: None,
                    last_checked_at: now,
                    has_local_changes: true,
                    has_remote_changes: false,
                    local_hash: String::new(),
                    remote_hash: None,
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tasklink_store::WriteQueueConfig;
    use tempfile::TempDir;

    fn resolver(dir: &TempDir) -> ConflictResolver {
        ConflictResolver::new(dir.path(), Arc::new(WriteQueue::new(WriteQueueConfig::default())))
    }

    fn state_with(conflicts: Vec<SyncConflict>) -> GitHubSyncStateFile {
        let mut state = GitHubSyncStateFile::new("acme", "widgets");
        for conflict in conflicts {
            state.upsert_mapping(SyncMapping {
                task_id: conflict.task_id.clone(),
                issue_number: conflict.issue_number,
                owner: "acme".to_string(),
                repo: "widgets".to_string(),
                last_synced_at: Utc::now(),
                last_sync_direction: SyncDirection::ToGithub,
                status: MappingStatus::Synced,
            });
            state.upsert_conflict(conflict);
        }
        state
    }

    fn text_conflict(task_id: &str, conflict_type: ConflictType, local: &str, remote: &str) -> SyncConflict {
        SyncConflict::new(
            task_id,
            7,
            conflict_type,
            FieldValue::Text(local.to_string()),
            FieldValue::Text(remote.to_string()),
            Utc::now(),
        )
    }

    // ========== resolve ==========

    #[tokio::test]
    async fn test_prefer_local_resolves_and_records_history() {
        let dir = TempDir::new().unwrap();
        let resolver = resolver(&dir);
        let mut state = state_with(vec![text_conflict("1", ConflictType::TitleMismatch, "Local", "Remote")]);

        let result = resolver
            .resolve(
                &mut state,
                &ConflictKey::new("1", ConflictType::TitleMismatch),
                &Resolution::new(ResolutionStrategy::PreferLocal),
            )
            .await
            .unwrap();

        assert_eq!(result.applied_value, FieldValue::Text("Local".into()));
        assert!(result.push_required);
        assert_eq!(result.mapping_status, Some(MappingStatus::Pending));
        assert!(state.conflicts[0].resolved);
        assert!(state.change_metadata["1"].has_local_changes);

        let history = resolver.history().await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(!history[0].previous.resolved);
        assert!(dir.path().join(HISTORY_FILE_NAME).exists());
    }

    #[tokio::test]
    async fn test_mapping_stays_conflict_while_others_open() {
        let dir = TempDir::new().unwrap();
        let resolver = resolver(&dir);
        let mut state = state_with(vec![
            text_conflict("1", ConflictType::TitleMismatch, "a", "b"),
            text_conflict("1", ConflictType::DescriptionMismatch, "a", "b"),
        ]);

        let result = resolver
            .resolve(
                &mut state,
                &ConflictKey::new("1", ConflictType::TitleMismatch),
                &Resolution::new(ResolutionStrategy::PreferRemote),
            )
            .await
            .unwrap();

        assert_eq!(result.mapping_status, Some(MappingStatus::Conflict));
        assert!(!result.push_required);
    }

    #[tokio::test]
    async fn test_merge_descriptions_and_labels() {
        let dir = TempDir::new().unwrap();
        let resolver = resolver(&dir);
        let labels = SyncConflict::new(
            "2",
            8,
            ConflictType::LabelMismatch,
            FieldValue::List(vec!["bug".into()]),
            FieldValue::List(vec!["ui".into()]),
            Utc::now(),
        );
        let mut state = state_with(vec![
            text_conflict("1", ConflictType::DescriptionMismatch, "intro\nlocal", "intro\nremote"),
            labels,
        ]);

        let description = resolver
            .resolve(
                &mut state,
                &ConflictKey::new("1", ConflictType::DescriptionMismatch),
                &Resolution::new(ResolutionStrategy::Merge),
            )
            .await
            .unwrap();
        let labels = resolver
            .resolve(
                &mut state,
                &ConflictKey::new("2", ConflictType::LabelMismatch),
                &Resolution::new(ResolutionStrategy::Merge),
            )
            .await
            .unwrap();

        assert_eq!(description.applied_value, FieldValue::Text("intro\nlocal\nremote".into()));
        assert_eq!(labels.applied_value, FieldValue::List(vec!["bug".into(), "ui".into()]));
    }

    #[rstest]
    #[case::merge_title(ConflictType::TitleMismatch, Resolution::new(ResolutionStrategy::Merge))]
    #[case::manual_without_value(ConflictType::TitleMismatch, Resolution { strategy: ResolutionStrategy::Manual, value: None })]
    #[case::manual_wrong_kind(ConflictType::TitleMismatch, Resolution::manual(FieldValue::List(vec![])))]
    #[case::manual_bad_status(ConflictType::StatusMismatch, Resolution::manual(FieldValue::Text("maybe".into())))]
    #[tokio::test]
    async fn test_invalid_resolutions_change_nothing(#[case] conflict_type: ConflictType, #[case] resolution: Resolution) {
        let dir = TempDir::new().unwrap();
        let resolver = resolver(&dir);
        let mut state = state_with(vec![text_conflict("1", conflict_type, "a", "b")]);
        let before = state.clone();

        let result = resolver
            .resolve(&mut state, &ConflictKey::new("1", conflict_type), &resolution)
            .await;

        assert!(result.is_err());
        assert_eq!(state, before);
        assert!(resolver.history().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_conflict() {
        let dir = TempDir::new().unwrap();
        let mut state = state_with(vec![]);
        let result = resolver(&dir)
            .resolve(
                &mut state,
                &ConflictKey::new("1", ConflictType::TitleMismatch),
                &Resolution::new(ResolutionStrategy::PreferLocal),
            )
            .await;
        assert!(matches!(result, Err(Error::ConflictNotFound { .. })));
    }

    #[tokio::test]
    async fn test_manual_deletion_unlinks_mapping() {
        let dir = TempDir::new().unwrap();
        let resolver = resolver(&dir);
        let conflict = SyncConflict::new(
            "1",
            7,
            ConflictType::DeletedOnGithub,
            FieldValue::Text("Setup".into()),
            FieldValue::Absent,
            Utc::now(),
        );
        let mut state = state_with(vec![conflict]);

        let result = resolver
            .resolve(
                &mut state,
                &ConflictKey::new("1", ConflictType::DeletedOnGithub),
                &Resolution::manual(FieldValue::Absent),
            )
            .await
            .unwrap();

        assert_eq!(result.mapping_status, None);
        assert!(state.mappings.is_empty());
        assert!(state.validate().is_ok());

        // Undo restores both the mapping and the conflict
        let entry = resolver.undo_last(&mut state, Some("1")).await.unwrap();
        assert!(entry.removed_mapping.is_some());
        assert_eq!(state.mappings["1"].status, MappingStatus::Conflict);
        assert!(state.has_unresolved("1"));
        assert!(state.validate().is_ok());
    }

    // ========== history write failures ==========

    struct BrokenDisk;

    #[async_trait::async_trait]
    impl tasklink_store::FileWriter for BrokenDisk {
        async fn write(&self, _path: &Path, _bytes: &[u8]) -> std::io::Result<()> {
            Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "disk full"))
        }
    }

    fn broken_resolver(dir: &TempDir) -> ConflictResolver {
        let queue = WriteQueue::builder(WriteQueueConfig::default())
            .writer(Arc::new(BrokenDisk))
            .build();
        ConflictResolver::new(dir.path(), Arc::new(queue))
    }

    #[tokio::test]
    async fn test_failed_history_write_leaves_state_untouched() {
        let dir = TempDir::new().unwrap();
        let resolver = broken_resolver(&dir);
        let mut state = state_with(vec![text_conflict("1", ConflictType::TitleMismatch, "Local", "Remote")]);
        let before = state.clone();

        let result = resolver
            .resolve(
                &mut state,
                &ConflictKey::new("1", ConflictType::TitleMismatch),
                &Resolution::new(ResolutionStrategy::PreferLocal),
            )
            .await;

        assert!(result.is_err());
        assert_eq!(state, before);
        assert!(state.has_unresolved("1"));
        assert!(resolver.history().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_history_write_fails_batch_entry() {
        let dir = TempDir::new().unwrap();
        let resolver = broken_resolver(&dir);
        let mut state = state_with(vec![text_conflict("1", ConflictType::TitleMismatch, "a", "b")]);
        let before = state.clone();

        let result = resolver
            .resolve_all(&mut state, BatchStrategy::PreferRemote, BatchOptions::default())
            .await;

        assert!(result.resolved.is_empty());
        assert_eq!(result.failed.len(), 1);
        assert_eq!(result.failed[0].phase, ConflictPhase::Analyzed);
        assert_eq!(state, before);
    }

    // ========== batch ==========

    #[tokio::test]
    async fn test_recommended_batch_skips_high_risk() {
        let dir = TempDir::new().unwrap();
        let resolver = resolver(&dir);
        let deletion = SyncConflict::new(
            "2",
            9,
            ConflictType::DeletedLocally,
            FieldValue::Absent,
            FieldValue::Text("Gone".into()),
            Utc::now(),
        );
        let mut state = state_with(vec![text_conflict("1", ConflictType::TitleMismatch, "a", "b"), deletion]);

        let result = resolver
            .resolve_all(&mut state, BatchStrategy::Recommended, BatchOptions::default())
            .await;

        assert_eq!(result.resolved.len(), 1);
        assert_eq!(result.skipped.len(), 1);
        assert_eq!(result.skipped[0].conflict_type, ConflictType::DeletedLocally);
        assert_eq!(result.skipped[0].phase, ConflictPhase::Skipped);
        assert!(result.skipped[0].phase.is_terminal());
        assert!(state.has_unresolved("2"));
    }

    #[tokio::test]
    async fn test_dry_run_batch_only_previews() {
        let dir = TempDir::new().unwrap();
        let resolver = resolver(&dir);
        let mut state = state_with(vec![text_conflict("1", ConflictType::TitleMismatch, "a", "b")]);
        let before = state.clone();

        let result = resolver
            .resolve_all(
                &mut state,
                BatchStrategy::PreferRemote,
                BatchOptions {
                    dry_run: true,
                    ..BatchOptions::default()
                },
            )
            .await;

        assert!(result.dry_run);
        assert_eq!(result.previews.len(), 1);
        assert_eq!(result.previews[0].after, FieldValue::Text("b".into()));
        assert_eq!(state, before);
    }

    // ========== undo ==========

    #[tokio::test]
    async fn test_undo_reopens_conflict() {
        let dir = TempDir::new().unwrap();
        let resolver = resolver(&dir);
        let mut state = state_with(vec![text_conflict("1", ConflictType::TitleMismatch, "Local", "Remote")]);
        resolver
            .resolve(
                &mut state,
                &ConflictKey::new("1", ConflictType::TitleMismatch),
                &Resolution::new(ResolutionStrategy::PreferRemote),
            )
            .await
            .unwrap();

        let entry = resolver.undo_last(&mut state, None).await.unwrap();

        assert_eq!(entry.previous.local_value, FieldValue::Text("Local".into()));
        assert!(state.has_unresolved("1"));
        assert_eq!(state.mappings["1"].status, MappingStatus::Conflict);
        assert!(resolver.history().await.unwrap().is_empty());
        assert!(matches!(resolver.undo_last(&mut state, None).await, Err(Error::NothingToUndo)));
    }

    #[tokio::test]
    async fn test_history_survives_restart() {
        let dir = TempDir::new().unwrap();
        let mut state = state_with(vec![text_conflict("1", ConflictType::TitleMismatch, "a", "b")]);
        resolver(&dir)
            .resolve(
                &mut state,
                &ConflictKey::new("1", ConflictType::TitleMismatch),
                &Resolution::new(ResolutionStrategy::PreferLocal),
            )
            .await
            .unwrap();

        assert_eq!(resolver(&dir).history().await.unwrap().len(), 1);
    }

    // ========== apply_value ==========

    #[rstest]
    #[case::closed_from_remote("closed", TaskStatus::Pending, TaskStatus::Done)]
    #[case::open_reopens("open", TaskStatus::Done, TaskStatus::Pending)]
    #[case::open_keeps_progress("open", TaskStatus::InProgress, TaskStatus::InProgress)]
    #[case::task_status("review", TaskStatus::Pending, TaskStatus::Review)]
    fn test_apply_status(#[case] value: &str, #[case] from: TaskStatus, #[case] expected: TaskStatus) {
        let mut task = Task::new("1", "Setup");
        task.status = from;
        apply_value(&mut task, ConflictType::StatusMismatch, &FieldValue::Text(value.into()));
        assert_eq!(task.status, expected);
    }

    #[test]
    fn test_apply_fields() {
        let mut task = Task::new("1", "Setup");
        task.assignee = Some("alice".to_string());

        assert!(apply_value(&mut task, ConflictType::TitleMismatch, &FieldValue::Text("New".into())));
        assert!(apply_value(&mut task, ConflictType::AssigneeMismatch, &FieldValue::Absent));
        assert!(apply_value(
            &mut task,
            ConflictType::LabelMismatch,
            &FieldValue::List(vec!["ui".into()])
        ));
        assert!(!apply_value(&mut task, ConflictType::DeletedLocally, &FieldValue::Absent));

        assert_eq!(task.title, "New");
        assert_eq!(task.assignee, None);
        assert_eq!(task.labels, vec!["ui".to_string()]);
    }
}
