//! CLI argument structs for all commands.

use clap::{Parser, Subcommand};

use super::types::{BatchStrategyArg, ConflictTypeArg, StrategyArg};

/// Arguments for the `init` command
#[derive(Parser, Debug, Clone)]
pub struct InitArgs {
    /// Suppress output messages
    #[arg(short, long)]
    pub quiet: bool,
}

/// Arguments for the `status` command
#[derive(Parser, Debug, Clone)]
pub struct StatusArgs {}

/// Arguments for the `sync` command
#[derive(Parser, Debug, Clone)]
pub struct SyncArgs {
    /// Also pull remote changes into local tasks
    #[arg(long)]
    pub two_way: bool,

    /// Show what would change without touching GitHub or local files
    #[arg(long)]
    pub dry_run: bool,

    /// Resolve unresolved conflicts in favour of local values
    #[arg(long)]
    pub force: bool,

    /// Create one issue per subtask instead of a checklist
    #[arg(long)]
    pub separate_subtasks: bool,
}

/// Arguments for the `verify` command
#[derive(Parser, Debug, Clone)]
pub struct VerifyArgs {}

/// Arguments for the `conflicts` command
#[derive(Parser, Debug, Clone)]
pub struct ConflictsArgs {
    /// Conflict action (defaults to `list`)
    #[command(subcommand)]
    pub action: Option<ConflictsAction>,
}

/// Conflict subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum ConflictsAction {
    /// List unresolved conflicts
    List,

    /// Resolve one conflict
    Resolve {
        /// Task id
        task_id: String,

        /// Conflict type
        #[arg(value_enum)]
        conflict_type: ConflictTypeArg,

        /// Resolution strategy
        #[arg(short, long, value_enum)]
        strategy: StrategyArg,

        /// Value for the manual strategy (comma-separated for labels)
        #[arg(long)]
        value: Option<String>,

        /// Show the outcome without resolving
        #[arg(long)]
        preview: bool,
    },

    /// Resolve all conflicts with one strategy
    ResolveAll {
        /// Batch strategy
        #[arg(short, long, value_enum, default_value = "recommended")]
        strategy: BatchStrategyArg,

        /// Show previews without resolving
        #[arg(long)]
        dry_run: bool,

        /// Stop at the first failure
        #[arg(long)]
        stop_on_error: bool,
    },

    /// Undo the most recent resolution
    Undo {
        /// Only consider resolutions of this task
        task_id: Option<String>,
    },

    /// Show recorded resolutions
    History,
}
