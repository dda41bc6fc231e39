//! Common test utilities shared across integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::process::{Command, Output};
use std::sync::Arc;
use tasklink::app::App;
use tasklink::config::{GitHubConfig, TasklinkConfig};
use tasklink::domain::Task;
use tasklink::github::MockTracker;
use tempfile::TempDir;

/// Run the tasklink binary in the specified directory
pub fn run_tasklink_in_dir(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_tasklink"))
        .args(args)
        .current_dir(dir)
        .env("NO_COLOR", "1")
        .env_remove("GITHUB_TOKEN")
        .env_remove("RUST_LOG")
        .output()
        .expect("Failed to execute tasklink")
}

/// A repository wired to an in-memory GitHub.
pub struct Harness {
    /// Keeps the scratch directory alive
    pub dir: TempDir,
    /// The in-memory tracker
    pub tracker: Arc<MockTracker>,
    /// Application context over `dir/.tasklink`
    pub app: App,
}

/// Config for `mock/repo` with fast queue flushes.
pub fn configured() -> TasklinkConfig {
    let mut config = TasklinkConfig::default();
    config.github = GitHubConfig {
        enabled: true,
        owner: "mock".to_string(),
        repo: "repo".to_string(),
        token: "test-token".to_string(),
        ..GitHubConfig::default()
    };
    config.write_queue.max_wait_ms = 5;
    config
}

/// Harness with `config`.
pub fn harness_with(config: TasklinkConfig) -> Harness {
    let dir = TempDir::new().expect("Failed to create temp directory");
    let tasklink_dir = dir.path().join(".tasklink");
    std::fs::create_dir_all(&tasklink_dir).expect("Failed to create .tasklink");
    let tracker = Arc::new(MockTracker::new());
    let app = App::with_tracker(tasklink_dir, config, tracker.clone());
    Harness { dir, tracker, app }
}

/// Harness with a configured repository.
pub fn harness() -> Harness {
    harness_with(configured())
}

/// Tasks `ids`, each depending on the listed ids.
pub fn tasks(entries: &[(&str, &[&str])]) -> Vec<Task> {
    entries
        .iter()
        .map(|(id, deps)| {
            let mut task = Task::new(*id, format!("Task {id}"));
            task.description = format!("Description of task {id}");
            task.dependencies = deps.iter().map(|d| (*d).to_string()).collect();
            task
        })
        .collect()
}
