//! Implementation of the `init` command.
//!
//! This module handles initialization of a new tasklink repository, creating
//! the `.tasklink/` directory structure with configuration and data files.

use crate::config::TasklinkConfig;
use crate::domain::TaskFile;
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use tokio::fs;

/// Name of the tasklink directory
pub const TASKLINK_DIR_NAME: &str = ".tasklink";

/// Name of the configuration file
pub const CONFIG_FILE_NAME: &str = "config.yaml";

/// Name of the tasks data file
pub const TASKS_FILE_NAME: &str = "tasks.json";

/// Name of the gitignore file within .tasklink
pub const GITIGNORE_FILE_NAME: &str = ".gitignore";

/// Maximum directory depth to traverse when searching for the tasklink root
pub const MAX_TRAVERSAL_DEPTH: usize = 256;

/// Result of the init command
#[derive(Debug)]
pub struct InitResult {
    /// Path to the created tasklink directory
    pub tasklink_dir: PathBuf,
    /// Path to the created config file
    pub config_file: PathBuf,
    /// Path to the created tasks file
    pub tasks_file: PathBuf,
    /// Path to the created gitignore file
    pub gitignore_file: PathBuf,
}

/// Initialize a new tasklink repository in the given directory.
///
/// # Errors
///
/// Returns an error if:
/// - The `.tasklink/` directory already exists
/// - File system operations fail
pub async fn init(base_dir: &Path) -> Result<InitResult> {
    let tasklink_dir = base_dir.join(TASKLINK_DIR_NAME);

    if tasklink_dir.exists() {
        return Err(Error::Config(format!(
            "Tasklink is already initialized in this directory. Found existing '{TASKLINK_DIR_NAME}'"
        )));
    }

    fs::create_dir_all(&tasklink_dir).await?;

    let config_file = tasklink_dir.join(CONFIG_FILE_NAME);
    TasklinkConfig::default().save(&config_file).await?;

    let tasks_file = tasklink_dir.join(TASKS_FILE_NAME);
    let mut empty = serde_json::to_vec_pretty(&TaskFile::default())?;
    empty.push(b'\n');
    fs::write(&tasks_file, empty).await?;

    let gitignore_file = tasklink_dir.join(GITIGNORE_FILE_NAME);
    let gitignore_content = "\
# Sync bookkeeping is machine-local; tasks.json and config.yaml are tracked
github-sync-state.json
github-sync-state.json.corrupt
resolution-history.json
backups/
*.tmp
";
    fs::write(&gitignore_file, gitignore_content).await?;

    tracing::info!(path = %tasklink_dir.display(), "Initialized tasklink repository");

    Ok(InitResult {
        tasklink_dir,
        config_file,
        tasks_file,
        gitignore_file,
    })
}

/// Check if a directory has been initialized with tasklink.
pub fn is_initialized(base_dir: &Path) -> bool {
    base_dir.join(TASKLINK_DIR_NAME).exists()
}

/// Find the tasklink root directory by searching up the directory tree.
///
/// Returns the directory containing `.tasklink/`, or `None` if none is found
/// before the filesystem root or the depth limit.
pub fn find_root(start_dir: &Path) -> Option<PathBuf> {
    let mut current = start_dir.to_path_buf();
    let mut depth = 0;

    loop {
        if current.join(TASKLINK_DIR_NAME).exists() {
            return Some(current);
        }

        depth += 1;
        if depth > MAX_TRAVERSAL_DEPTH || !current.pop() {
            return None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_init_creates_layout() {
        let temp_dir = TempDir::new().unwrap();

        let result = init(temp_dir.path()).await.unwrap();

        assert!(result.tasklink_dir.is_dir());
        assert!(result.config_file.exists());
        assert!(result.gitignore_file.exists());
        let tasks: TaskFile =
            serde_json::from_slice(&std::fs::read(&result.tasks_file).unwrap()).unwrap();
        assert!(tasks.tasks.is_empty());
    }

    #[tokio::test]
    async fn test_init_twice_fails() {
        let temp_dir = TempDir::new().unwrap();
        init(temp_dir.path()).await.unwrap();

        let err = init(temp_dir.path()).await.unwrap_err();
        assert!(err.to_string().contains("already initialized"));
    }

    #[tokio::test]
    async fn test_init_config_is_loadable() {
        let temp_dir = TempDir::new().unwrap();
        let result = init(temp_dir.path()).await.unwrap();

        let config = TasklinkConfig::load(&result.config_file).await.unwrap();
        assert!(!config.github.enabled);
    }

    #[tokio::test]
    async fn test_find_root_from_subdirectory() {
        let temp_dir = TempDir::new().unwrap();
        init(temp_dir.path()).await.unwrap();
        let nested = temp_dir.path().join("src").join("deep");
        std::fs::create_dir_all(&nested).unwrap();

        assert_eq!(find_root(&nested).as_deref(), Some(temp_dir.path()));
        assert!(is_initialized(temp_dir.path()));
    }

    #[test]
    fn test_find_root_none_when_missing() {
        let temp_dir = TempDir::new().unwrap();
        assert!(find_root(temp_dir.path()).is_none());
    }
}
