//! Command execution logic.
//!
//! Commands talk to the sync engine through [`App`]. The engine only
//! touches sync state; anything a resolution or pull changes on the local
//! side is written to `tasks.json` here.

use anyhow::{Result, bail};
use std::io;

use super::args::{ConflictsAction, ConflictsArgs, InitArgs, StatusArgs, SyncArgs, VerifyArgs};
use super::types::{BatchStrategyArg, ConflictTypeArg, StrategyArg};
use crate::app::App;
use crate::config::SubtaskMode;
use crate::domain::{Task, parse_subtask_unit_id};
use crate::error::Error;
use crate::output::{self, OutputConfig, OutputMode};
use crate::sync::conflict::{ConflictAnalysis, ConflictKey, analyze};
use crate::sync::resolution::{apply_value, preview};
use crate::sync::{
    BatchOptions, ConflictType, FieldValue, HistoryEntry, Resolution, ResolutionResult, ResolutionStrategy,
    SyncConflict, SyncMode, SyncOptions,
};

/// Execute the init command
pub async fn execute_init(args: &InitArgs, output_mode: OutputMode) -> Result<()> {
    use crate::commands::init;

    let current_dir = std::env::current_dir()?;
    let result = init::init(&current_dir).await?;

    match output_mode {
        OutputMode::Json => output::print_json(&serde_json::json!({
            "tasklink_dir": result.tasklink_dir.display().to_string(),
            "config_file": result.config_file.display().to_string(),
            "tasks_file": result.tasks_file.display().to_string(),
        }))?,
        OutputMode::Text if !args.quiet => {
            let config = OutputConfig::from_env();
            println!(
                "{} {}",
                output::success("Initialized tasklink in", &config),
                result.tasklink_dir.display()
            );
            println!("  Config: {}", result.config_file.display());
            println!("  Tasks:  {}", result.tasks_file.display());
            println!("Edit the github section of the config to enable sync.");
        }
        OutputMode::Text => {}
    }
    Ok(())
}

/// Execute the status command
pub async fn execute_status(app: &App, _args: &StatusArgs, output_mode: OutputMode) -> Result<()> {
    let tasks = app.tasks().tasks().await?;
    let status = app.orchestrator().get_sync_status(Some(&tasks)).await?;

    match output_mode {
        OutputMode::Json => output::print_json(&status)?,
        OutputMode::Text => output::write_status(&mut io::stdout().lock(), &status, &OutputConfig::from_env())?,
    }
    Ok(())
}

/// Execute the sync command
pub async fn execute_sync(app: &App, args: &SyncArgs, output_mode: OutputMode) -> Result<()> {
    let tasks = app.tasks().tasks().await?;
    let options = SyncOptions {
        mode: if args.two_way {
            SyncMode::TwoWay
        } else {
            SyncMode::OneWay
        },
        dry_run: args.dry_run,
        force: args.force,
        subtask_mode: args.separate_subtasks.then_some(SubtaskMode::SeparateIssues),
    };

    let result = app.orchestrator().sync_with_github(&tasks, &options).await;
    if !result.dry_run && !result.pulled.is_empty() {
        let applied = app.tasks().apply_pulled(&result.pulled).await?;
        tracing::debug!(applied, "Stored pulled tasks");
    }

    match output_mode {
        OutputMode::Json => output::print_json(&result)?,
        OutputMode::Text => output::write_sync_result(&mut io::stdout().lock(), &result, &OutputConfig::from_env())?,
    }

    if result.blocked {
        bail!("sync blocked by {} unresolved conflict(s)", result.conflicts.len());
    }
    if !result.success {
        bail!("sync finished with {} error(s)", result.errors.len());
    }
    Ok(())
}

/// Execute the verify command
pub async fn execute_verify(app: &App, _args: &VerifyArgs, output_mode: OutputMode) -> Result<()> {
    let check = app.orchestrator().verify_remote().await?;

    match output_mode {
        OutputMode::Json => output::print_json(&check)?,
        OutputMode::Text => {
            let config = OutputConfig::from_env();
            let access = if check.can_push {
                output::success("read/write", &config)
            } else {
                output::error("read-only", &config)
            };
            println!("{} ({access})", output::info(&check.repository, &config));
            println!(
                "Rate limit: {}/{} (resets {})",
                check.rate_limit.remaining,
                check.rate_limit.limit,
                check.rate_limit.reset_at.to_rfc3339()
            );
            println!("Labels: {}", check.labels.len());
            println!("Assignable users: {}", check.assignees.len());
            if !check.milestones.is_empty() {
                println!("Milestones: {}", check.milestones.len());
            }
        }
    }
    if !check.can_push {
        bail!("the token cannot write issues in {}", check.repository);
    }
    Ok(())
}

/// Execute the conflicts command
pub async fn execute_conflicts(app: &App, args: &ConflictsArgs, output_mode: OutputMode) -> Result<()> {
    match args.action.as_ref().unwrap_or(&ConflictsAction::List) {
        ConflictsAction::List => list_conflicts(app, output_mode).await,
        ConflictsAction::Resolve {
            task_id,
            conflict_type,
            strategy,
            value,
            preview,
        } => {
            resolve_conflict(
                app,
                task_id,
                *conflict_type,
                *strategy,
                value.as_deref(),
                *preview,
                output_mode,
            )
            .await
        }
        ConflictsAction::ResolveAll {
            strategy,
            dry_run,
            stop_on_error,
        } => resolve_all(app, *strategy, *dry_run, *stop_on_error, output_mode).await,
        ConflictsAction::Undo { task_id } => undo(app, task_id.as_deref(), output_mode).await,
        ConflictsAction::History => {
            let history = app.resolver().history().await?;
            match output_mode {
                OutputMode::Json => output::print_json(&history)?,
                OutputMode::Text => {
                    if history.is_empty() {
                        println!("No resolutions recorded");
                    }
                    for entry in history.iter().rev() {
                        println!(
                            "{} {} {} {}{}",
                            entry.resolved_at.to_rfc3339(),
                            entry.task_id,
                            entry.conflict_type,
                            entry.strategy,
                            if entry.forced { " (forced)" } else { "" }
                        );
                    }
                }
            }
            Ok(())
        }
    }
}

async fn list_conflicts(app: &App, output_mode: OutputMode) -> Result<()> {
    let state = app.state_store().load().await?;
    let conflicts: Vec<SyncConflict> = state.unresolved_conflicts().cloned().collect();

    match output_mode {
        OutputMode::Json => {
            let analyses: Vec<ConflictAnalysis> = conflicts.iter().map(analyze).collect();
            output::print_json(&analyses)?;
        }
        OutputMode::Text => output::write_conflicts(&mut io::stdout().lock(), &conflicts, &OutputConfig::from_env())?,
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn resolve_conflict(
    app: &App,
    task_id: &str,
    conflict_type: ConflictTypeArg,
    strategy: StrategyArg,
    value: Option<&str>,
    preview_only: bool,
    output_mode: OutputMode,
) -> Result<()> {
    let conflict_type = ConflictType::from(conflict_type);
    let strategy = ResolutionStrategy::from(strategy);
    let resolution = match (strategy, value) {
        (ResolutionStrategy::Manual, Some(raw)) => Resolution::manual(manual_value(conflict_type, raw)),
        (ResolutionStrategy::Manual, None) => {
            bail!("the manual strategy needs --value");
        }
        (strategy, _) => Resolution::new(strategy),
    };
    let key = ConflictKey::new(task_id, conflict_type);
    let mut state = app.state_store().load().await?;

    if preview_only {
        let conflict = state
            .conflicts
            .iter()
            .find(|c| key.matches(c))
            .ok_or_else(|| Error::ConflictNotFound {
                task_id: task_id.to_string(),
                conflict_type: conflict_type.to_string(),
            })?;
        let preview = preview(conflict, &resolution)?;
        match output_mode {
            OutputMode::Json => output::print_json(&preview)?,
            OutputMode::Text => {
                println!("{} -> {}", preview.before_local, preview.after);
                for impact in &preview.impacts {
                    println!("  - {impact}");
                }
            }
        }
        return Ok(());
    }

    let result = app.resolver().resolve(&mut state, &key, &resolution).await?;
    app.state_store().save(&mut state).await?;
    apply_resolution(app, &result).await?;

    match output_mode {
        OutputMode::Json => output::print_json(&result)?,
        OutputMode::Text => output::write_resolution(&mut io::stdout().lock(), &result, &OutputConfig::from_env())?,
    }
    Ok(())
}

async fn resolve_all(
    app: &App,
    strategy: BatchStrategyArg,
    dry_run: bool,
    stop_on_error: bool,
    output_mode: OutputMode,
) -> Result<()> {
    let mut state = app.state_store().load().await?;
    let options = BatchOptions { stop_on_error, dry_run };
    let result = app.resolver().resolve_all(&mut state, strategy.into(), options).await;

    if !dry_run && !result.resolved.is_empty() {
        app.state_store().save(&mut state).await?;
        for resolution in &result.resolved {
            apply_resolution(app, resolution).await?;
        }
    }

    match output_mode {
        OutputMode::Json => output::print_json(&result)?,
        OutputMode::Text => {
            let config = OutputConfig::from_env();
            let mut out = io::stdout().lock();
            for resolution in &result.resolved {
                output::write_resolution(&mut out, resolution, &config)?;
            }
            for preview in &result.previews {
                println!(
                    "{} {} {}: {} -> {}",
                    output::warning("would resolve", &config),
                    preview.task_id,
                    preview.conflict_type,
                    preview.before_local,
                    preview.after
                );
            }
            for skipped in &result.skipped {
                println!("{} {} {}: {}", output::warning("skipped", &config), skipped.task_id, skipped.conflict_type, skipped.reason);
            }
            for failed in &result.failed {
                println!("{} {} {}: {}", output::error("failed", &config), failed.task_id, failed.conflict_type, failed.reason);
            }
        }
    }
    if !result.failed.is_empty() {
        bail!("{} conflict(s) could not be resolved", result.failed.len());
    }
    Ok(())
}

async fn undo(app: &App, task_id: Option<&str>, output_mode: OutputMode) -> Result<()> {
    let mut state = app.state_store().load().await?;
    let entry = app.resolver().undo_last(&mut state, task_id).await?;
    app.state_store().save(&mut state).await?;
    revert_resolution(app, &entry).await?;

    match output_mode {
        OutputMode::Json => output::print_json(&entry)?,
        OutputMode::Text => output::write_undo(&mut io::stdout().lock(), &entry, &OutputConfig::from_env())?,
    }
    Ok(())
}

/// Parse a `--value` for the conflict's field.
fn manual_value(conflict_type: ConflictType, raw: &str) -> FieldValue {
    match conflict_type {
        ConflictType::LabelMismatch => {
            let mut labels: Vec<String> = raw
                .split(',')
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect();
            labels.sort();
            labels.dedup();
            FieldValue::List(labels)
        }
        ConflictType::AssigneeMismatch if raw.trim().is_empty() => FieldValue::Absent,
        _ => FieldValue::Text(raw.to_string()),
    }
}

/// Write a resolved value into the task or subtask behind `unit_id`.
async fn apply_to_unit(app: &App, unit_id: &str, conflict_type: ConflictType, value: &FieldValue) -> Result<bool> {
    match app.tasks().get(unit_id).await {
        Ok(mut task) => {
            if !apply_value(&mut task, conflict_type, value) {
                return Ok(false);
            }
            app.tasks().upsert(task).await?;
            Ok(true)
        }
        Err(Error::TaskNotFound(_)) => {
            let Some((parent_id, sub_id)) = parse_subtask_unit_id(unit_id) else {
                return Ok(false);
            };
            let parent = app.tasks().get(parent_id).await?;
            let Some(sub) = parent.subtasks.iter().find(|s| s.id == sub_id) else {
                return Ok(false);
            };
            let mut unit = parent.subtask_unit(sub);
            if !apply_value(&mut unit, conflict_type, value) {
                return Ok(false);
            }
            Ok(app.tasks().apply_pulled(&[unit]).await? > 0)
        }
        Err(e) => Err(e.into()),
    }
}

/// Carry a resolution over to `tasks.json`.
async fn apply_resolution(app: &App, result: &ResolutionResult) -> Result<()> {
    match (result.conflict_type, result.strategy) {
        (ConflictType::DeletedOnGithub, ResolutionStrategy::PreferRemote) => {
            app.tasks().remove(&result.task_id).await?;
        }
        (ConflictType::DeletedLocally, ResolutionStrategy::PreferRemote) => {
            let title = result.applied_value.as_text().unwrap_or(result.task_id.as_str());
            app.tasks().upsert(Task::new(result.task_id.clone(), title)).await?;
        }
        (conflict_type, _) if !conflict_type.is_deletion() => {
            apply_to_unit(app, &result.task_id, conflict_type, &result.applied_value).await?;
        }
        _ => {}
    }
    Ok(())
}

/// Undo what [`apply_resolution`] did locally.
async fn revert_resolution(app: &App, entry: &HistoryEntry) -> Result<()> {
    match (entry.conflict_type, entry.strategy) {
        (ConflictType::DeletedOnGithub, ResolutionStrategy::PreferRemote) => {
            if app.tasks().get(&entry.task_id).await.is_err() {
                let title = entry.previous.local_value.as_text().unwrap_or(entry.task_id.as_str());
                app.tasks().upsert(Task::new(entry.task_id.clone(), title)).await?;
            }
        }
        (ConflictType::DeletedLocally, ResolutionStrategy::PreferRemote) => {
            app.tasks().remove(&entry.task_id).await?;
        }
        (conflict_type, _) if !conflict_type.is_deletion() => {
            apply_to_unit(app, &entry.task_id, conflict_type, &entry.previous.local_value).await?;
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::labels_sorted(ConflictType::LabelMismatch, "ui, bug,,bug", FieldValue::List(vec!["bug".into(), "ui".into()]))]
    #[case::assignee_cleared(ConflictType::AssigneeMismatch, "  ", FieldValue::Absent)]
    #[case::assignee(ConflictType::AssigneeMismatch, "octocat", FieldValue::Text("octocat".into()))]
    #[case::title(ConflictType::TitleMismatch, "New title", FieldValue::Text("New title".into()))]
    fn test_manual_value(#[case] conflict_type: ConflictType, #[case] raw: &str, #[case] expected: FieldValue) {
        assert_eq!(manual_value(conflict_type, raw), expected);
    }
}
