//! Application context for CLI command execution.
//!
//! `App` wires one repository together: configuration, the shared write
//! queue, the caches it invalidates, the task store and the sync engine.
//!
//! # Example
//!
//! ```no_run
//! use tasklink::app::App;
//! use std::path::Path;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> anyhow::Result<()> {
//!     let app = App::from_directory(Path::new(".")).await?;
//!     let status = app.orchestrator().get_sync_status(None).await?;
//!     println!("{:?}", status.sync_state);
//!     app.shutdown().await;
//!     Ok(())
//! }
//! ```

use crate::commands::init::{CONFIG_FILE_NAME, TASKLINK_DIR_NAME, TASKS_FILE_NAME, find_root};
use crate::config::TasklinkConfig;
use crate::domain::TaskFile;
use crate::error::{Error, Result};
use crate::github::{GitHubClient, IssueTracker};
use crate::storage::TaskStore;
use crate::sync::{ConflictResolver, GitHubSyncStateFile, SyncOrchestrator, SyncStateStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tasklink_store::{Cache, InvalidatorSet, WriteQueue};
use tracing::warn;

/// Application context for CLI operations.
pub struct App {
    tasklink_dir: PathBuf,
    config: TasklinkConfig,
    queue: Arc<WriteQueue>,
    tasks: TaskStore,
    state_store: Arc<SyncStateStore>,
    resolver: Arc<ConflictResolver>,
    orchestrator: SyncOrchestrator,
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("tasklink_dir", &self.tasklink_dir)
            .field("repository", &self.config.github.repository())
            .field("tasks", &self.tasks)
            .field("orchestrator", &self.orchestrator)
            .finish_non_exhaustive()
    }
}

impl App {
    /// Create an App from the given working directory.
    ///
    /// Searches up the directory tree for `.tasklink/`, loads the
    /// configuration and builds a GitHub client when sync is configured.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - No tasklink repository is found in the directory tree
    /// - Configuration cannot be loaded
    pub async fn from_directory(working_dir: &Path) -> Result<Self> {
        let root_dir = find_root(working_dir).ok_or(Error::NotInitialized)?;
        let tasklink_dir = root_dir.join(TASKLINK_DIR_NAME);
        let config = TasklinkConfig::load(&tasklink_dir.join(CONFIG_FILE_NAME)).await?;

        let tracker: Option<Arc<dyn IssueTracker>> = if config.github.is_configured() {
            match GitHubClient::new(&config.github) {
                Ok(client) => Some(Arc::new(client) as Arc<dyn IssueTracker>),
                Err(e) => {
                    warn!(error = %e, "GitHub client unavailable, sync disabled");
                    None
                }
            }
        } else {
            None
        };

        Ok(Self::assemble(tasklink_dir, config, tracker))
    }

    /// Build an App over `tasklink_dir` with an explicit tracker.
    ///
    /// Used by tests and embedders that bring their own [`IssueTracker`].
    pub fn with_tracker(
        tasklink_dir: impl Into<PathBuf>,
        config: TasklinkConfig,
        tracker: Arc<dyn IssueTracker>,
    ) -> Self {
        Self::assemble(tasklink_dir.into(), config, Some(tracker))
    }

    fn assemble(tasklink_dir: PathBuf, config: TasklinkConfig, tracker: Option<Arc<dyn IssueTracker>>) -> Self {
        let task_cache: Arc<Cache<TaskFile>> = Arc::new(Cache::default());
        let state_cache: Arc<Cache<GitHubSyncStateFile>> = Arc::new(Cache::default());
        let invalidators = InvalidatorSet::new()
            .with(task_cache.clone())
            .with(state_cache.clone());
        let queue = Arc::new(
            WriteQueue::builder(config.write_queue.to_queue_config())
                .invalidator(Arc::new(invalidators))
                .build(),
        );

        let tasks = TaskStore::new(tasklink_dir.join(TASKS_FILE_NAME), task_cache, queue.clone());
        let state_store = Arc::new(SyncStateStore::new(
            &tasklink_dir,
            config.github.owner.clone(),
            config.github.repo.clone(),
            config.sync.clone(),
            state_cache,
            queue.clone(),
        ));
        let resolver = Arc::new(ConflictResolver::new(&tasklink_dir, queue.clone()));
        let orchestrator = SyncOrchestrator::new(
            config.github.clone(),
            tracker,
            state_store.clone(),
            resolver.clone(),
        );

        Self {
            tasklink_dir,
            config,
            queue,
            tasks,
            state_store,
            resolver,
            orchestrator,
        }
    }

    /// Path of the `.tasklink` directory.
    pub fn tasklink_dir(&self) -> &Path {
        &self.tasklink_dir
    }

    /// Loaded configuration.
    pub fn config(&self) -> &TasklinkConfig {
        &self.config
    }

    /// Local task store.
    pub fn tasks(&self) -> &TaskStore {
        &self.tasks
    }

    /// Sync state store.
    pub fn state_store(&self) -> &SyncStateStore {
        &self.state_store
    }

    /// Conflict resolver.
    pub fn resolver(&self) -> &ConflictResolver {
        &self.resolver
    }

    /// Sync orchestrator.
    pub fn orchestrator(&self) -> &SyncOrchestrator {
        &self.orchestrator
    }

    /// Drain the write queue. Call once before exiting.
    pub async fn shutdown(&self) {
        let result = self.queue.shutdown().await;
        if !result.is_clean() {
            warn!(failed = result.failure_count, requeued = result.requeued_count, "Some writes did not complete");
        }
    }
}
