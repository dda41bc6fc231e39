//! The sync pass.
//!
//! A pass turns the local task list into sync units, detects what changed
//! on either side, stops on unresolved conflicts (unless forced), applies
//! remote-only changes to copies of the tasks, pushes creates and updates,
//! and finally saves the sync state once.
//!
//! Per-unit failures are collected in [`SyncResult::errors`]; one failing
//! task never aborts the rest of the batch.

use super::change_detector::{ChangeDetector, ChangeState, PendingChanges, RemoteObservation, snapshot};
use super::conflict::ConflictKey;
use super::resolution::{ConflictResolver, ResolutionResult, apply_value};
use super::state::{
    ConflictType, FieldValue, GitHubSyncStateFile, MappingStatus, ResolutionStrategy, SyncConflict,
    SyncDirection, SyncMapping, SyncOperation,
};
use super::state_store::SyncStateStore;
use crate::config::{GitHubConfig, SubtaskMode};
use crate::domain::Task;
use crate::error::{Error, ErrorKind, Result};
use crate::github::body::render_issue_body;
use crate::github::{IssueDraft, IssueState, IssueTracker, Milestone, RateLimitStatus, RemoteIssue};
use chrono::{DateTime, Utc};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Which directions a pass syncs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Push local changes only
    #[default]
    OneWay,
    /// Push local changes and pull remote ones
    TwoWay,
}

/// Options for one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncOptions {
    /// Direction
    pub mode: SyncMode,
    /// Plan only; no remote calls and no state writes
    pub dry_run: bool,
    /// Resolve conflicts with `prefer_local` instead of stopping
    pub force: bool,
    /// Override the configured subtask mode
    pub subtask_mode: Option<SubtaskMode>,
}

/// Kind of remote change a pass makes or plans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Create an issue
    Create,
    /// Update an issue
    Update,
    /// Close an issue whose task was deleted
    Close,
    /// Apply remote changes locally
    Pull,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActionKind::Create => "create",
            ActionKind::Update => "update",
            ActionKind::Close => "close",
            ActionKind::Pull => "pull",
        };
        write!(f, "{s}")
    }
}

/// An action a dry run would take.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedAction {
    /// Unit id
    pub task_id: String,
    /// Action
    pub action: ActionKind,
    /// Target issue, if it exists
    pub issue_number: Option<u64>,
    /// Issue title
    pub title: String,
}

/// A failure collected during a pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncError {
    /// Unit the failure belongs to; `None` for pass-level failures
    pub task_id: Option<String>,
    /// Taxonomy bucket
    pub kind: ErrorKind,
    /// Whether retrying later may succeed
    pub retryable: bool,
    /// Actionable message
    pub message: String,
}

impl SyncError {
    fn new(task_id: Option<&str>, error: &Error) -> Self {
        Self {
            task_id: task_id.map(str::to_string),
            kind: error.kind(),
            retryable: error.is_retryable(),
            message: error.user_message(),
        }
    }
}

/// Outcome of a pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    /// No errors and not blocked
    pub success: bool,
    /// Units examined
    pub tasks_processed: usize,
    /// Issues created
    pub tasks_created: usize,
    /// Issues updated (closes included)
    pub tasks_updated: usize,
    /// Units that failed
    pub tasks_failed: usize,
    /// Collected failures
    pub errors: Vec<SyncError>,
    /// Non-fatal notes
    pub warnings: Vec<String>,
    /// Whether this was a dry run
    pub dry_run: bool,
    /// Stopped by unresolved conflicts
    pub blocked: bool,
    /// Unresolved conflicts that blocked the pass
    pub conflicts: Vec<SyncConflict>,
    /// Actions a dry run would take
    pub planned: Vec<PlannedAction>,
    /// Tasks with remote changes applied, to be stored locally
    pub pulled: Vec<Task>,
    /// Conflicts resolved by `force`
    pub resolutions: Vec<ResolutionResult>,
}

impl SyncResult {
    fn new(dry_run: bool) -> Self {
        Self {
            dry_run,
            ..Self::default()
        }
    }

    fn fail(&mut self, task_id: Option<&str>, error: &Error) {
        warn!(task_id = task_id.unwrap_or("-"), error = %error, "Sync step failed");
        if task_id.is_some() {
            self.tasks_failed += 1;
        }
        self.errors.push(SyncError::new(task_id, error));
    }
}

/// Overall sync state for status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStateKind {
    /// Ready
    Idle,
    /// A pass is running
    InProgress,
    /// Unresolved conflicts exist
    Conflict,
    /// The last pass failed
    Error,
    /// GitHub sync is not set up
    NotConfigured,
}

impl fmt::Display for SyncStateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncStateKind::Idle => "idle",
            SyncStateKind::InProgress => "in_progress",
            SyncStateKind::Conflict => "conflict",
            SyncStateKind::Error => "error",
            SyncStateKind::NotConfigured => "not_configured",
        };
        write!(f, "{s}")
    }
}

/// Sync status report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    /// Enabled with repository and token
    pub configured: bool,
    /// `owner/repo`
    pub repository: Option<String>,
    /// End of the last pass
    pub last_sync_time: Option<DateTime<Utc>>,
    /// Overall state
    pub sync_state: SyncStateKind,
    /// Units with a mapping
    pub tasks_mapped: usize,
    /// Units without a mapping
    pub tasks_unmapped: usize,
    /// Unresolved conflicts
    pub conflicts: Vec<SyncConflict>,
    /// Pending change counts
    pub pending_changes: PendingChanges,
}

/// Result of checking the remote repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteCheck {
    /// `owner/repo` as GitHub reports it
    pub repository: String,
    /// Whether the token can write issues
    pub can_push: bool,
    /// Current rate limit
    pub rate_limit: RateLimitStatus,
    /// Repository labels
    pub labels: Vec<String>,
    /// Assignable users
    pub assignees: Vec<String>,
    /// Open milestones, when milestone sync is enabled
    pub milestones: Vec<Milestone>,
}

/// Work collected by detection.
#[derive(Default)]
struct Plan {
    creates: Vec<String>,
    updates: Vec<String>,
    closes: Vec<String>,
    pulls: Vec<(Task, RemoteIssue)>,
    in_sync: Vec<String>,
}

/// Drives sync passes against one repository.
pub struct SyncOrchestrator {
    config: GitHubConfig,
    tracker: Option<Arc<dyn IssueTracker>>,
    store: Arc<SyncStateStore>,
    resolver: Arc<ConflictResolver>,
    detector: ChangeDetector,
}

impl fmt::Debug for SyncOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncOrchestrator")
            .field("repository", &self.config.repository())
            .field("tracker", &self.tracker.as_ref().map(|_| "<dyn IssueTracker>"))
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

/// Expand tasks into sync units.
///
/// In `separate_issues` mode each subtask becomes its own unit after its
/// parent; in `checklist` mode subtasks stay inside the parent.
pub fn sync_units(tasks: &[Task], mode: SubtaskMode) -> Vec<Task> {
    let mut units = Vec::with_capacity(tasks.len());
    for task in tasks {
        units.push(task.clone());
        if mode == SubtaskMode::SeparateIssues {
            units.extend(task.subtasks.iter().map(|sub| task.subtask_unit(sub)));
        }
    }
    units
}

/// Order unit ids so that dependencies come first.
///
/// Dependencies outside `ids` are ignored. On a cycle the input order is
/// kept.
pub fn creation_order(ids: &[String], units: &HashMap<&str, &Task>) -> Vec<String> {
    let mut graph: DiGraph<&str, ()> = DiGraph::new();
    let nodes: HashMap<&str, NodeIndex> = ids.iter().map(|id| (id.as_str(), graph.add_node(id.as_str()))).collect();

    for id in ids {
        let Some(unit) = units.get(id.as_str()) else {
            continue;
        };
        for dep in &unit.dependencies {
            if let Some(&from) = nodes.get(dep.as_str()) {
                graph.add_edge(from, nodes[id.as_str()], ());
            }
        }
    }

    match toposort(&graph, None) {
        Ok(order) => order.into_iter().map(|n| graph[n].to_string()).collect(),
        Err(cycle) => {
            warn!(task_id = graph[cycle.node_id()], "Dependency cycle, creating issues in task order");
            ids.to_vec()
        }
    }
}

impl SyncOrchestrator {
    /// Orchestrator for `config`. `tracker` is `None` when sync is not
    /// configured.
    pub fn new(
        config: GitHubConfig,
        tracker: Option<Arc<dyn IssueTracker>>,
        store: Arc<SyncStateStore>,
        resolver: Arc<ConflictResolver>,
    ) -> Self {
        let detector = ChangeDetector::new(config.features.sync_assignees);
        Self {
            config,
            tracker,
            store,
            resolver,
            detector,
        }
    }

    fn tracker(&self) -> Option<&Arc<dyn IssueTracker>> {
        if self.config.is_configured() {
            self.tracker.as_ref()
        } else {
            None
        }
    }

    fn draft(&self, unit: &Task, mode: SubtaskMode, issue_numbers: &HashMap<String, u64>) -> IssueDraft {
        IssueDraft {
            title: unit.title.clone(),
            body: render_issue_body(unit, mode, issue_numbers),
            labels: unit.labels.clone(),
            assignees: self
                .config
                .features
                .sync_assignees
                .then(|| unit.assignee.iter().cloned().collect()),
            state: Some(if unit.is_closed() {
                IssueState::Closed
            } else {
                IssueState::Open
            }),
        }
    }

    fn mapping_for(&self, task_id: &str, issue: &RemoteIssue, direction: SyncDirection) -> SyncMapping {
        SyncMapping {
            task_id: task_id.to_string(),
            issue_number: issue.number,
            owner: self.config.owner.clone(),
            repo: self.config.repo.clone(),
            last_synced_at: Utc::now(),
            last_sync_direction: direction,
            status: MappingStatus::Synced,
        }
    }

    /// Run one sync pass over `tasks`.
    pub async fn sync_with_github(&self, tasks: &[Task], options: &SyncOptions) -> SyncResult {
        let mut result = SyncResult::new(options.dry_run);

        let Some(tracker) = self.tracker() else {
            result.fail(
                None,
                &Error::Validation(
                    "GitHub sync is not configured; set github.enabled, owner, repo and a token".to_string(),
                ),
            );
            return result;
        };
        if tasks.is_empty() {
            match self.store.load().await {
                Ok(state) if state.mappings.is_empty() => {
                    info!("No tasks to sync");
                    result.success = true;
                    return result;
                }
                // Every mapped task was deleted; detection turns them into conflicts
                Ok(_) => {}
                Err(e) => {
                    result.fail(None, &e);
                    return result;
                }
            }
        }
        if self.config.features.sync_milestones || self.config.features.sync_projects {
            result
                .warnings
                .push("Milestone and project sync are not supported and were skipped".to_string());
        }

        if !options.dry_run {
            if let Err(e) = self.preflight(tracker.as_ref()).await {
                result.fail(None, &e);
                return result;
            }
            if let Err(e) = self.store.begin_sync().await {
                result.fail(None, &e);
                return result;
            }
        }

        let outcome = self.run_pass(tracker.as_ref(), tasks, options, &mut result).await;
        if let Err(e) = &outcome {
            result.fail(None, e);
        }

        if !options.dry_run {
            let last_error = result.errors.first().map(|e| e.message.clone());
            if let Err(e) = self.store.end_sync(last_error).await {
                result.fail(None, &e);
            }
        }

        result.success = result.errors.is_empty() && !result.blocked;
        info!(
            processed = result.tasks_processed,
            created = result.tasks_created,
            updated = result.tasks_updated,
            failed = result.tasks_failed,
            pulled = result.pulled.len(),
            blocked = result.blocked,
            dry_run = result.dry_run,
            "Sync finished"
        );
        result
    }

    async fn preflight(&self, tracker: &dyn IssueTracker) -> Result<()> {
        let limit = tracker.rate_limit().await?;
        if limit.remaining == 0 {
            return Err(Error::RateLimited {
                reset_at: Some(limit.reset_at),
            });
        }
        debug!(remaining = limit.remaining, limit = limit.limit, "Rate limit ok");
        Ok(())
    }

    async fn run_pass(
        &self,
        tracker: &dyn IssueTracker,
        tasks: &[Task],
        options: &SyncOptions,
        result: &mut SyncResult,
    ) -> Result<()> {
        let mode = options.subtask_mode.unwrap_or(self.config.subtask_mode);
        let units = sync_units(tasks, mode);
        let by_id: HashMap<&str, &Task> = units.iter().map(|u| (u.id.as_str(), u)).collect();
        result.tasks_processed = units.len();

        let mut state = self.store.load().await?;
        let mut plan = self.detect(tracker, &units, &by_id, options, &mut state, result).await;

        let unresolved: Vec<SyncConflict> = state.unresolved_conflicts().cloned().collect();
        if !unresolved.is_empty() {
            if !options.force {
                warn!(count = unresolved.len(), "Unresolved conflicts, nothing pushed");
                result.warnings.push(format!(
                    "{} unresolved conflict(s); resolve them with 'tasklink conflicts resolve' or rerun with --force",
                    unresolved.len()
                ));
                result.blocked = true;
                result.conflicts = unresolved;
                if !options.dry_run {
                    self.store.save(&mut state).await?;
                }
                return Ok(());
            }
            self.force_resolve(&unresolved, &by_id, options, &mut state, &mut plan, result)
                .await;
        }

        self.apply_pulls(plan.pulls, &mut state, result);
        self.close_deleted(tracker, &plan.closes, options, &mut state, result).await;

        let mut issue_numbers: HashMap<String, u64> =
            state.mappings.values().map(|m| (m.task_id.clone(), m.issue_number)).collect();
        for id in creation_order(&plan.creates, &by_id) {
            let Some(unit) = by_id.get(id.as_str()) else {
                continue;
            };
            self.create(tracker, unit, mode, options, &mut issue_numbers, &mut state, result)
                .await;
        }
        for id in &plan.updates {
            let Some(unit) = by_id.get(id.as_str()) else {
                continue;
            };
            self.update(tracker, unit, mode, options, &issue_numbers, &mut state, result)
                .await;
        }
        for id in &plan.in_sync {
            if let Some(mapping) = state.mappings.get_mut(id) {
                mapping.status = MappingStatus::Synced;
            }
        }

        if !options.dry_run {
            self.store.save(&mut state).await?;
        }
        Ok(())
    }

    async fn detect(
        &self,
        tracker: &dyn IssueTracker,
        units: &[Task],
        by_id: &HashMap<&str, &Task>,
        options: &SyncOptions,
        state: &mut GitHubSyncStateFile,
        result: &mut SyncResult,
    ) -> Plan {
        let mut plan = Plan::default();
        let fetch = options.mode == SyncMode::TwoWay && !options.dry_run;

        let orphaned: Vec<SyncMapping> = state
            .mappings
            .values()
            .filter(|m| !by_id.contains_key(m.task_id.as_str()))
            .cloned()
            .collect();
        for mapping in orphaned {
            if close_pending(state, &mapping.task_id) {
                plan.closes.push(mapping.task_id.clone());
                continue;
            }
            let mut remote_value = FieldValue::Text(format!("#{}", mapping.issue_number));
            if fetch {
                match tracker.get_issue(mapping.issue_number).await {
                    Ok(Some(issue)) => remote_value = FieldValue::Text(issue.title),
                    Ok(None) => {
                        debug!(task_id = %mapping.task_id, "Task and issue both gone, unlinking");
                        state.remove_mapping(&mapping.task_id);
                        state.record_operation(
                            &mapping.task_id,
                            Some(mapping.issue_number),
                            SyncOperation::MappingRemoved,
                            SyncDirection::Bidirectional,
                            None,
                        );
                        continue;
                    }
                    Err(e) => {
                        result.fail(Some(&mapping.task_id), &e);
                        continue;
                    }
                }
            }
            record_conflict(
                state,
                SyncConflict::new(
                    &mapping.task_id,
                    mapping.issue_number,
                    ConflictType::DeletedLocally,
                    FieldValue::Absent,
                    remote_value,
                    Utc::now(),
                ),
            );
        }

        for unit in units {
            let Some(mapping) = state.mappings.get(&unit.id).cloned() else {
                plan.creates.push(unit.id.clone());
                continue;
            };

            let mut issue = None;
            let remote = if fetch {
                match tracker.get_issue(mapping.issue_number).await {
                    Ok(Some(found)) => {
                        let observation = RemoteObservation::of(&found);
                        issue = Some(found);
                        observation
                    }
                    Ok(None) => RemoteObservation::Missing,
                    Err(e) => {
                        result.fail(Some(&unit.id), &e);
                        continue;
                    }
                }
            } else {
                RemoteObservation::NotChecked
            };

            let metadata = state.change_metadata.get(&unit.id);
            let change = self.detector.detect(Some(unit), Some(&mapping), metadata, &remote);
            debug!(task_id = %unit.id, issue = mapping.issue_number, %change, "Detected");

            match (change, issue) {
                (ChangeState::InSync, _) => plan.in_sync.push(unit.id.clone()),
                (ChangeState::LocalChanged, _) | (ChangeState::BothChanged, None) => {
                    plan.updates.push(unit.id.clone());
                }
                (ChangeState::RemoteChanged, Some(issue)) => plan.pulls.push(((*unit).clone(), issue)),
                (ChangeState::RemoteChanged, None) => {
                    debug!(task_id = %unit.id, "Remote changes need a two-way sync");
                }
                (ChangeState::BothChanged, Some(issue)) => {
                    let conflicts = self.detector.classify(unit, &issue);
                    if conflicts.is_empty() {
                        // Both sides converged on the same content
                        state.change_metadata.insert(unit.id.clone(), snapshot(unit, Some(&issue)));
                        plan.in_sync.push(unit.id.clone());
                    }
                    for conflict in conflicts {
                        record_conflict(state, conflict);
                    }
                }
                (ChangeState::DeletedOnGitHub, _) => record_conflict(
                    state,
                    SyncConflict::new(
                        &unit.id,
                        mapping.issue_number,
                        ConflictType::DeletedOnGithub,
                        FieldValue::Text(unit.title.clone()),
                        FieldValue::Absent,
                        Utc::now(),
                    ),
                ),
                (ChangeState::Unmapped | ChangeState::DeletedLocally, _) => {}
            }
        }
        plan
    }

    async fn force_resolve(
        &self,
        unresolved: &[SyncConflict],
        by_id: &HashMap<&str, &Task>,
        options: &SyncOptions,
        state: &mut GitHubSyncStateFile,
        plan: &mut Plan,
        result: &mut SyncResult,
    ) {
        for conflict in unresolved {
            let task_id = conflict.task_id.clone();
            if options.dry_run {
                match conflict.conflict_type {
                    ConflictType::DeletedLocally => plan.closes.push(task_id),
                    ConflictType::DeletedOnGithub => plan.creates.push(task_id),
                    _ => plan.updates.push(task_id),
                }
                continue;
            }

            match self.resolver.resolve_forced(state, &ConflictKey::of(conflict)).await {
                Ok(resolution) => {
                    match resolution.conflict_type {
                        ConflictType::DeletedLocally => plan.closes.push(task_id),
                        ConflictType::DeletedOnGithub => plan.creates.push(task_id),
                        _ if by_id.contains_key(task_id.as_str()) => plan.updates.push(task_id),
                        _ => {}
                    }
                    result.resolutions.push(resolution);
                }
                Err(e) => result.fail(Some(&task_id), &e),
            }
        }
        plan.pulls.retain(|(task, _)| !state.has_unresolved(&task.id));
        dedup_preserving_order(&mut plan.creates);
        dedup_preserving_order(&mut plan.updates);
        dedup_preserving_order(&mut plan.closes);
        plan.updates.retain(|id| !plan.creates.contains(id));
    }

    fn apply_pulls(&self, pulls: Vec<(Task, RemoteIssue)>, state: &mut GitHubSyncStateFile, result: &mut SyncResult) {
        for (mut task, issue) in pulls {
            for conflict in self.detector.classify(&task, &issue) {
                apply_value(&mut task, conflict.conflict_type, &conflict.remote_value);
            }
            if result.dry_run {
                result.planned.push(PlannedAction {
                    task_id: task.id.clone(),
                    action: ActionKind::Pull,
                    issue_number: Some(issue.number),
                    title: issue.title.clone(),
                });
            } else {
                state.change_metadata.insert(task.id.clone(), snapshot(&task, Some(&issue)));
                state.upsert_mapping(self.mapping_for(&task.id, &issue, SyncDirection::FromGithub));
                state.record_operation(&task.id, Some(issue.number), SyncOperation::Pull, SyncDirection::FromGithub, None);
            }
            debug!(task_id = %task.id, issue = issue.number, "Pulled remote changes");
            result.pulled.push(task);
        }
    }

    async fn close_deleted(
        &self,
        tracker: &dyn IssueTracker,
        task_ids: &[String],
        options: &SyncOptions,
        state: &mut GitHubSyncStateFile,
        result: &mut SyncResult,
    ) {
        for task_id in task_ids {
            let Some(number) = state.mappings.get(task_id).map(|m| m.issue_number) else {
                continue;
            };
            if options.dry_run {
                result.planned.push(PlannedAction {
                    task_id: task_id.clone(),
                    action: ActionKind::Close,
                    issue_number: Some(number),
                    title: format!("#{number}"),
                });
                continue;
            }

            let closed = match tracker.get_issue(number).await {
                Ok(Some(issue)) if issue.state == IssueState::Closed => Ok(false),
                Ok(Some(issue)) => {
                    let draft = IssueDraft {
                        title: issue.title,
                        body: issue.body,
                        labels: issue.labels,
                        assignees: None,
                        state: Some(IssueState::Closed),
                    };
                    tracker.update_issue(number, &draft).await.map(|_| true)
                }
                Ok(None) => Ok(false),
                Err(e) => Err(e),
            };
            match closed {
                Ok(closed) => {
                    if closed {
                        result.tasks_updated += 1;
                        state.record_operation(task_id, Some(number), SyncOperation::Close, SyncDirection::ToGithub, None);
                    }
                    state.remove_mapping(task_id);
                    state.record_operation(
                        task_id,
                        Some(number),
                        SyncOperation::MappingRemoved,
                        SyncDirection::ToGithub,
                        None,
                    );
                    info!(task_id = %task_id, issue = number, "Closed issue of deleted task");
                }
                Err(e) => {
                    state.record_operation(
                        task_id,
                        Some(number),
                        SyncOperation::Close,
                        SyncDirection::ToGithub,
                        Some(e.to_string()),
                    );
                    result.fail(Some(task_id), &e);
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn create(
        &self,
        tracker: &dyn IssueTracker,
        unit: &Task,
        mode: SubtaskMode,
        options: &SyncOptions,
        issue_numbers: &mut HashMap<String, u64>,
        state: &mut GitHubSyncStateFile,
        result: &mut SyncResult,
    ) {
        if options.dry_run {
            result.planned.push(PlannedAction {
                task_id: unit.id.clone(),
                action: ActionKind::Create,
                issue_number: None,
                title: unit.title.clone(),
            });
            return;
        }

        let draft = self.draft(unit, mode, issue_numbers);
        match tracker.create_issue(&draft).await {
            Ok(issue) => {
                debug!(task_id = %unit.id, issue = issue.number, "Created issue");
                issue_numbers.insert(unit.id.clone(), issue.number);
                state.upsert_mapping(self.mapping_for(&unit.id, &issue, SyncDirection::ToGithub));
                state.change_metadata.insert(unit.id.clone(), snapshot(unit, Some(&issue)));
                state.record_operation(&unit.id, Some(issue.number), SyncOperation::Create, SyncDirection::ToGithub, None);
                result.tasks_created += 1;
            }
            Err(e) => {
                state.record_operation(&unit.id, None, SyncOperation::Create, SyncDirection::ToGithub, Some(e.to_string()));
                result.fail(Some(&unit.id), &e);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn update(
        &self,
        tracker: &dyn IssueTracker,
        unit: &Task,
        mode: SubtaskMode,
        options: &SyncOptions,
        issue_numbers: &HashMap<String, u64>,
        state: &mut GitHubSyncStateFile,
        result: &mut SyncResult,
    ) {
        let Some(number) = state.mappings.get(&unit.id).map(|m| m.issue_number) else {
            return;
        };
        if options.dry_run {
            result.planned.push(PlannedAction {
                task_id: unit.id.clone(),
                action: ActionKind::Update,
                issue_number: Some(number),
                title: unit.title.clone(),
            });
            return;
        }

        let draft = self.draft(unit, mode, issue_numbers);
        match tracker.update_issue(number, &draft).await {
            Ok(issue) => {
                debug!(task_id = %unit.id, issue = number, "Updated issue");
                state.upsert_mapping(self.mapping_for(&unit.id, &issue, SyncDirection::ToGithub));
                state.change_metadata.insert(unit.id.clone(), snapshot(unit, Some(&issue)));
                state.record_operation(&unit.id, Some(number), SyncOperation::Update, SyncDirection::ToGithub, None);
                result.tasks_updated += 1;
            }
            Err(e) => {
                if let Some(mapping) = state.mappings.get_mut(&unit.id) {
                    mapping.status = MappingStatus::Error;
                }
                state.record_operation(&unit.id, Some(number), SyncOperation::Update, SyncDirection::ToGithub, Some(e.to_string()));
                result.fail(Some(&unit.id), &e);
            }
        }
    }

    /// Report sync status. Pass `tasks` to count unmapped units and
    /// pending local changes.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync state cannot be read.
    pub async fn get_sync_status(&self, tasks: Option<&[Task]>) -> Result<SyncStatus> {
        let repository = self.config.repository();
        if !self.config.is_configured() {
            return Ok(SyncStatus {
                configured: false,
                repository,
                last_sync_time: None,
                sync_state: SyncStateKind::NotConfigured,
                tasks_mapped: 0,
                tasks_unmapped: tasks.map_or(0, <[Task]>::len),
                conflicts: Vec::new(),
                pending_changes: PendingChanges::default(),
            });
        }

        let state = self.store.load().await?;
        let conflicts: Vec<SyncConflict> = state.unresolved_conflicts().cloned().collect();
        let sync_state = if state.sync_in_progress {
            SyncStateKind::InProgress
        } else if !conflicts.is_empty() {
            SyncStateKind::Conflict
        } else if state.last_sync_error.is_some() {
            SyncStateKind::Error
        } else {
            SyncStateKind::Idle
        };

        let units = tasks.map(|t| sync_units(t, self.config.subtask_mode)).unwrap_or_default();
        let tasks_unmapped = units.iter().filter(|u| !state.mappings.contains_key(&u.id)).count();

        Ok(SyncStatus {
            configured: true,
            repository,
            last_sync_time: state.last_sync_at,
            sync_state,
            tasks_mapped: state.mappings.len(),
            tasks_unmapped,
            pending_changes: self.detector.summarize(&units, &state),
            conflicts,
        })
    }

    /// Check repository access and list what sync can use.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if sync is not configured, or the
    /// first remote failure.
    pub async fn verify_remote(&self) -> Result<RemoteCheck> {
        let tracker = self
            .tracker()
            .ok_or_else(|| Error::Validation("GitHub sync is not configured".to_string()))?;
        let access = tracker.verify_access().await?;
        let rate_limit = tracker.rate_limit().await?;
        let labels = tracker.list_labels().await?;
        let assignees = tracker.list_assignees().await?;
        let milestones = if self.config.features.sync_milestones {
            tracker.list_milestones().await?
        } else {
            Vec::new()
        };
        Ok(RemoteCheck {
            repository: access.full_name,
            can_push: access.can_push,
            rate_limit,
            labels,
            assignees,
            milestones,
        })
    }
}

/// Whether the task's deletion was resolved in favour of the local side and
/// the issue still needs closing.
fn close_pending(state: &GitHubSyncStateFile, task_id: &str) -> bool {
    state.conflicts.iter().any(|c| {
        c.resolved
            && c.task_id == task_id
            && c.conflict_type == ConflictType::DeletedLocally
            && c.resolution_strategy == Some(ResolutionStrategy::PreferLocal)
    })
}

fn record_conflict(state: &mut GitHubSyncStateFile, conflict: SyncConflict) {
    let task_id = conflict.task_id.clone();
    let issue_number = conflict.issue_number;
    let conflict_type = conflict.conflict_type;
    if state.upsert_conflict(conflict) {
        info!(task_id = %task_id, issue = issue_number, %conflict_type, "Conflict detected");
        state.record_operation(
            &task_id,
            Some(issue_number),
            SyncOperation::ConflictDetected,
            SyncDirection::Bidirectional,
            None,
        );
    }
}

fn dedup_preserving_order(ids: &mut Vec<String>) {
    let mut seen = HashSet::new();
    ids.retain(|id| seen.insert(id.clone()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Subtask;

    fn units(ids: &[(&str, &[&str])]) -> Vec<Task> {
        ids.iter()
            .map(|(id, deps)| {
                let mut task = Task::new(*id, format!("Task {id}"));
                task.dependencies = deps.iter().map(|d| (*d).to_string()).collect();
                task
            })
            .collect()
    }

    #[test]
    fn test_creation_order_puts_dependencies_first() {
        let tasks = units(&[("3", &["2"]), ("2", &["1"]), ("1", &[])]);
        let by_id: HashMap<&str, &Task> = tasks.iter().map(|t| (t.id.as_str(), t)).collect();
        let ids: Vec<String> = tasks.iter().map(|t| t.id.clone()).collect();

        assert_eq!(creation_order(&ids, &by_id), vec!["1", "2", "3"]);
    }

    #[test]
    fn test_creation_order_ignores_external_dependencies() {
        let tasks = units(&[("2", &["99"]), ("1", &[])]);
        let by_id: HashMap<&str, &Task> = tasks.iter().map(|t| (t.id.as_str(), t)).collect();
        let ids: Vec<String> = tasks.iter().map(|t| t.id.clone()).collect();

        let order = creation_order(&ids, &by_id);
        assert_eq!(order.len(), 2);
    }

    #[test]
    fn test_creation_order_survives_cycles() {
        let tasks = units(&[("1", &["2"]), ("2", &["1"])]);
        let by_id: HashMap<&str, &Task> = tasks.iter().map(|t| (t.id.as_str(), t)).collect();
        let ids: Vec<String> = tasks.iter().map(|t| t.id.clone()).collect();

        assert_eq!(creation_order(&ids, &by_id), ids);
    }

    #[test]
    fn test_sync_units_by_mode() {
        let mut task = Task::new("1", "Parent");
        task.subtasks.push(Subtask {
            id: 1,
            title: "Child".to_string(),
            description: String::new(),
            status: crate::domain::TaskStatus::Pending,
        });

        assert_eq!(sync_units(std::slice::from_ref(&task), SubtaskMode::Checklist).len(), 1);
        let separate = sync_units(&[task], SubtaskMode::SeparateIssues);
        assert_eq!(separate.len(), 2);
        assert_eq!(separate[1].id, "1.1");
    }

    #[test]
    fn test_dedup_preserving_order() {
        let mut ids = vec!["b".to_string(), "a".to_string(), "b".to_string()];
        dedup_preserving_order(&mut ids);
        assert_eq!(ids, vec!["b".to_string(), "a".to_string()]);
    }
}
