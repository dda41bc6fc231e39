//! Output formatting for CLI commands.
//!
//! Every command prints either short colored text lines or, with `--json`,
//! one pretty JSON document on stdout.

use crate::sync::conflict::{ConflictAnalysis, analyze};
use crate::sync::{HistoryEntry, ResolutionResult, SyncConflict, SyncResult, SyncStateKind, SyncStatus};
use colored::Colorize;
use serde::Serialize;
use std::env;
use std::io::{self, Write};

/// Output format selected by the global `--json` flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Human-readable text format
    Text,
    /// JSON format for programmatic use
    Json,
}

/// Settings for text output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputConfig {
    /// Whether to use colors in output.
    pub use_colors: bool,
}

impl OutputConfig {
    /// Read `NO_COLOR` and `TASKLINK_COLOR` from the environment.
    ///
    /// Any `NO_COLOR` value disables colors (<https://no-color.org/>);
    /// `TASKLINK_COLOR=0` or `false` does the same.
    pub fn from_env() -> Self {
        let use_colors = env::var("NO_COLOR").is_err()
            && env::var("TASKLINK_COLOR")
                .map(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
                .unwrap_or(true);
        Self { use_colors }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self { use_colors: true }
    }
}

/// Green text.
pub fn success(text: &str, config: &OutputConfig) -> String {
    if !config.use_colors {
        return text.to_string();
    }
    text.green().to_string()
}

/// Red text.
pub fn error(text: &str, config: &OutputConfig) -> String {
    if !config.use_colors {
        return text.to_string();
    }
    text.red().to_string()
}

/// Yellow text.
pub fn warning(text: &str, config: &OutputConfig) -> String {
    if !config.use_colors {
        return text.to_string();
    }
    text.yellow().to_string()
}

/// Cyan text, for ids and issue numbers.
pub fn info(text: &str, config: &OutputConfig) -> String {
    if !config.use_colors {
        return text.to_string();
    }
    text.cyan().to_string()
}

fn dimmed(text: &str, config: &OutputConfig) -> String {
    if !config.use_colors {
        return text.to_string();
    }
    text.dimmed().to_string()
}

/// Print a value as pretty JSON.
pub fn print_json<T: Serialize + ?Sized>(value: &T) -> io::Result<()> {
    let stdout = io::stdout();
    let mut handle = stdout.lock();
    let json = serde_json::to_string_pretty(value).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writeln!(handle, "{json}")
}

fn state_label(state: SyncStateKind, config: &OutputConfig) -> String {
    let text = state.to_string();
    match state {
        SyncStateKind::Idle => success(&text, config),
        SyncStateKind::InProgress | SyncStateKind::NotConfigured => warning(&text, config),
        SyncStateKind::Conflict | SyncStateKind::Error => error(&text, config),
    }
}

/// Write a sync status report.
pub fn write_status<W: Write>(w: &mut W, status: &SyncStatus, config: &OutputConfig) -> io::Result<()> {
    writeln!(
        w,
        "{} {}",
        dimmed("Repository:", config),
        status.repository.as_deref().unwrap_or("(not set)")
    )?;
    writeln!(w, "{} {}", dimmed("State:", config), state_label(status.sync_state, config))?;
    if !status.configured {
        writeln!(
            w,
            "{}",
            warning("GitHub sync is not configured; edit .tasklink/config.yaml", config)
        )?;
        return Ok(());
    }
    let last = status
        .last_sync_time
        .map_or_else(|| "never".to_string(), |t| t.to_rfc3339());
    writeln!(w, "{} {last}", dimmed("Last sync:", config))?;
    writeln!(
        w,
        "{} {} mapped, {} unmapped",
        dimmed("Tasks:", config),
        status.tasks_mapped,
        status.tasks_unmapped
    )?;
    writeln!(
        w,
        "{} {} local, {} remote",
        dimmed("Pending:", config),
        status.pending_changes.local_changes,
        status.pending_changes.remote_changes
    )?;
    if !status.conflicts.is_empty() {
        writeln!(
            w,
            "{}",
            error(&format!("{} unresolved conflict(s)", status.conflicts.len()), config)
        )?;
    }
    Ok(())
}

/// Write the outcome of a sync pass.
pub fn write_sync_result<W: Write>(w: &mut W, result: &SyncResult, config: &OutputConfig) -> io::Result<()> {
    if result.dry_run {
        writeln!(w, "{}", warning("Dry run, nothing was changed", config))?;
        for action in &result.planned {
            let issue = action
                .issue_number
                .map(|n| format!(" #{n}"))
                .unwrap_or_default();
            writeln!(
                w,
                "  {:<7} {}{} {}",
                action.action.to_string(),
                info(&action.task_id, config),
                issue,
                action.title
            )?;
        }
    }
    if result.blocked {
        writeln!(w, "{}", error("Sync blocked by unresolved conflicts:", config))?;
        write_conflicts(w, &result.conflicts, config)?;
    }
    for resolution in &result.resolutions {
        writeln!(
            w,
            "{} {} {} ({})",
            warning("forced", config),
            info(&resolution.task_id, config),
            resolution.conflict_type,
            resolution.strategy
        )?;
    }
    for warning_text in &result.warnings {
        writeln!(w, "{} {warning_text}", warning("warning:", config))?;
    }
    for err in &result.errors {
        writeln!(
            w,
            "{} {}{}",
            error("error:", config),
            err.task_id.as_deref().map(|id| format!("[{id}] ")).unwrap_or_default(),
            err.message
        )?;
    }

    let summary = format!(
        "{} processed, {} created, {} updated, {} pulled, {} failed",
        result.tasks_processed,
        result.tasks_created,
        result.tasks_updated,
        result.pulled.len(),
        result.tasks_failed
    );
    if result.success {
        writeln!(w, "{}", success(&summary, config))
    } else {
        writeln!(w, "{}", error(&summary, config))
    }
}

/// Write a list of conflicts with their recommended strategy.
pub fn write_conflicts<W: Write>(w: &mut W, conflicts: &[SyncConflict], config: &OutputConfig) -> io::Result<()> {
    if conflicts.is_empty() {
        return writeln!(w, "{}", success("No unresolved conflicts", config));
    }
    for conflict in conflicts {
        let analysis: ConflictAnalysis = analyze(conflict);
        let recommended = analysis
            .recommended
            .map_or_else(|| "manual review".to_string(), |s| s.to_string());
        writeln!(
            w,
            "  {} #{} {} [{} risk, recommended: {}]",
            info(&conflict.task_id, config),
            conflict.issue_number,
            conflict.conflict_type,
            analysis.risk,
            recommended
        )?;
        writeln!(w, "    {} {}", dimmed("local: ", config), conflict.local_value)?;
        writeln!(w, "    {} {}", dimmed("remote:", config), conflict.remote_value)?;
    }
    Ok(())
}

/// Write the outcome of one resolution.
pub fn write_resolution<W: Write>(w: &mut W, result: &ResolutionResult, config: &OutputConfig) -> io::Result<()> {
    writeln!(
        w,
        "{} {} {} with {}",
        success("Resolved", config),
        info(&result.task_id, config),
        result.conflict_type,
        result.strategy
    )?;
    if result.push_required {
        writeln!(w, "  {}", dimmed("Local value wins; run 'tasklink sync' to push it", config))?;
    }
    Ok(())
}

/// Write the entry restored by an undo.
pub fn write_undo<W: Write>(w: &mut W, entry: &HistoryEntry, config: &OutputConfig) -> io::Result<()> {
    writeln!(
        w,
        "{} {} {} ({} undone)",
        success("Reopened", config),
        info(&entry.task_id, config),
        entry.conflict_type,
        entry.strategy
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::{ConflictType, FieldValue, PendingChanges};
    use chrono::Utc;

    const PLAIN: OutputConfig = OutputConfig { use_colors: false };

    fn render(f: impl FnOnce(&mut Vec<u8>) -> io::Result<()>) -> String {
        let mut buf = Vec::new();
        f(&mut buf).unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn test_plain_helpers_do_not_colorize() {
        assert_eq!(success("ok", &PLAIN), "ok");
        assert_eq!(error("bad", &PLAIN), "bad");
    }

    #[test]
    fn test_status_not_configured() {
        let status = SyncStatus {
            configured: false,
            repository: None,
            last_sync_time: None,
            sync_state: SyncStateKind::NotConfigured,
            tasks_mapped: 0,
            tasks_unmapped: 3,
            conflicts: Vec::new(),
            pending_changes: PendingChanges::default(),
        };
        let text = render(|w| write_status(w, &status, &PLAIN));
        assert!(text.contains("not_configured"));
        assert!(text.contains("not configured"));
    }

    #[test]
    fn test_conflict_listing_shows_recommendation() {
        let conflict = SyncConflict::new(
            "7",
            12,
            ConflictType::TitleMismatch,
            FieldValue::Text("Local".to_string()),
            FieldValue::Text("Remote".to_string()),
            Utc::now(),
        );
        let text = render(|w| write_conflicts(w, &[conflict], &PLAIN));
        assert!(text.contains("7 #12 title_mismatch"));
        assert!(text.contains("local:  Local"));
    }

    #[test]
    fn test_sync_result_summary() {
        let result = SyncResult {
            success: true,
            tasks_processed: 2,
            tasks_created: 2,
            ..SyncResult::default()
        };
        let text = render(|w| write_sync_result(w, &result, &PLAIN));
        assert!(text.contains("2 processed, 2 created, 0 updated, 0 pulled, 0 failed"));
    }
}
