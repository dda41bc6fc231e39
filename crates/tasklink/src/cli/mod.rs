//! CLI argument parsing and command dispatch.
//!
//! # Commands
//!
//! - `init`: Initialize a tasklink repository
//! - `status`: Show GitHub sync status
//! - `sync`: Push tasks to GitHub issues (and pull with `--two-way`)
//! - `verify`: Check repository access and rate limit
//! - `conflicts`: List, resolve and undo sync conflicts
//!
//! # Global Flags
//!
//! - `--json`: Output in JSON format (applies to all commands)
//!
//! # Example
//!
//! ```bash
//! tasklink sync --dry-run
//! tasklink sync --two-way
//! tasklink conflicts resolve 7 title_mismatch --strategy prefer_remote
//! tasklink conflicts undo 7
//! ```

mod args;
mod execute;
mod types;

use anyhow::Result;
use clap::{Parser, Subcommand};

pub use args::{ConflictsAction, ConflictsArgs, InitArgs, StatusArgs, SyncArgs, VerifyArgs};
pub use types::{BatchStrategyArg, ConflictTypeArg, StrategyArg};

/// Tasklink - local tasks synchronized with GitHub issues
///
/// Tasks live in `.tasklink/tasks.json`; sync bookkeeping lives next to them.
#[derive(Parser, Debug)]
#[command(name = "tasklink")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output in JSON format for programmatic use
    #[arg(long, global = true)]
    pub json: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available commands
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Initialize a new tasklink repository
    ///
    /// Creates the `.tasklink/` directory with configuration and an empty
    /// task file.
    Init(InitArgs),

    /// Show GitHub sync status
    ///
    /// Reports mapped and unmapped tasks, pending changes and unresolved
    /// conflicts.
    Status(StatusArgs),

    /// Synchronize tasks with GitHub issues
    ///
    /// Creates issues for new tasks and updates changed ones. Stops on
    /// unresolved conflicts unless `--force` is given.
    Sync(SyncArgs),

    /// Check GitHub access
    Verify(VerifyArgs),

    /// Manage sync conflicts
    Conflicts(ConflictsArgs),
}

impl Cli {
    /// Parse CLI arguments from command line
    pub fn parse_args() -> Self {
        <Self as Parser>::parse()
    }

    /// Parse CLI arguments from an iterator (for testing)
    pub fn try_parse_from<I, T>(iter: I) -> std::result::Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        <Self as Parser>::try_parse_from(iter)
    }

    /// Execute the CLI command
    pub async fn execute(&self) -> Result<()> {
        use crate::app::App;
        use crate::output::OutputMode;

        let output_mode = if self.json {
            OutputMode::Json
        } else {
            OutputMode::Text
        };

        let Some(command) = &self.command else {
            println!("tasklink: no command given. Run 'tasklink --help' for usage.");
            return Ok(());
        };
        if let Commands::Init(args) = command {
            return execute::execute_init(args, output_mode).await;
        }

        let app = App::from_directory(&std::env::current_dir()?).await?;
        let outcome = match command {
            Commands::Init(_) => Ok(()),
            Commands::Status(args) => execute::execute_status(&app, args, output_mode).await,
            Commands::Sync(args) => execute::execute_sync(&app, args, output_mode).await,
            Commands::Verify(args) => execute::execute_verify(&app, args, output_mode).await,
            Commands::Conflicts(args) => execute::execute_conflicts(&app, args, output_mode).await,
        };
        app.shutdown().await;
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sync_flags() {
        let cli = Cli::try_parse_from(["tasklink", "sync", "--two-way", "--dry-run"]).unwrap();
        match cli.command {
            Some(Commands::Sync(args)) => {
                assert!(args.two_way);
                assert!(args.dry_run);
                assert!(!args.force);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_global_json_after_subcommand() {
        let cli = Cli::try_parse_from(["tasklink", "status", "--json"]).unwrap();
        assert!(cli.json);
    }

    #[test]
    fn test_parse_conflicts_resolve() {
        let cli = Cli::try_parse_from([
            "tasklink",
            "conflicts",
            "resolve",
            "7",
            "title",
            "--strategy",
            "prefer_remote",
        ])
        .unwrap();
        let Some(Commands::Conflicts(ConflictsArgs {
            action: Some(ConflictsAction::Resolve {
                task_id,
                conflict_type,
                strategy,
                value,
                preview,
            }),
        })) = cli.command
        else {
            panic!("expected conflicts resolve");
        };
        assert_eq!(task_id, "7");
        assert_eq!(conflict_type, ConflictTypeArg::TitleMismatch);
        assert_eq!(strategy, StrategyArg::PreferRemote);
        assert!(value.is_none());
        assert!(!preview);
    }

    #[test]
    fn test_parse_conflicts_defaults_to_list() {
        let cli = Cli::try_parse_from(["tasklink", "conflicts"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Commands::Conflicts(ConflictsArgs { action: None }))
        ));
    }

    #[test]
    fn test_rejects_unknown_strategy() {
        let result = Cli::try_parse_from([
            "tasklink",
            "conflicts",
            "resolve",
            "7",
            "title",
            "--strategy",
            "coin_flip",
        ]);
        assert!(result.is_err());
    }
}
