//! Local task storage.
//!
//! Tasks live in `.tasklink/tasks.json`. Reads go through a [`Cache`] under
//! the `tasks` namespace; writes go through the shared [`WriteQueue`], which
//! invalidates that namespace once the file has landed.

use crate::domain::{Task, TaskFile};
use crate::error::{Error, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tasklink_store::{Cache, CacheScope, Invalidation, WriteQueue, read_if_exists};
use tracing::{debug, trace};

/// Cache namespace for the task file.
pub const TASKS_NAMESPACE: &str = "tasks";

const TASKS_CACHE_KEY: &str = "tasks:file";

/// Queue `value` as pretty JSON and wait until it is on disk.
///
/// With auto-flush disabled nothing else drains the queue, so flush cycles
/// are driven here until the write settles. A write that keeps failing is
/// rejected after `max_retries + 1` cycles.
///
/// # Errors
///
/// Returns the write's terminal error.
pub async fn persist_json<T: Serialize + ?Sized>(
    queue: &WriteQueue,
    path: &Path,
    value: &T,
    invalidation: Invalidation,
) -> Result<()> {
    let handle = queue.enqueue_json(path, value, invalidation).await?;
    let receipt = if queue.config().enable_auto_flush {
        handle.wait().await?
    } else {
        let max_cycles = queue.config().max_retries.saturating_add(1);
        let wait = handle.wait();
        tokio::pin!(wait);
        let mut cycles = 0;
        loop {
            tokio::select! {
                biased;
                outcome = &mut wait => break outcome?,
                _ = queue.flush(), if cycles < max_cycles => {
                    cycles += 1;
                    trace!(cycles, "Flushed for pending write");
                }
            }
        }
    };
    debug!(path = %receipt.path.display(), bytes = receipt.bytes_written, retries = receipt.retry_count, "Persisted");
    Ok(())
}

/// Reads and writes the local task list.
pub struct TaskStore {
    path: PathBuf,
    cache: Arc<Cache<TaskFile>>,
    queue: Arc<WriteQueue>,
}

impl std::fmt::Debug for TaskStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskStore")
            .field("path", &self.path)
            .field("cached", &self.cache.contains(TASKS_CACHE_KEY))
            .finish_non_exhaustive()
    }
}

impl TaskStore {
    /// Store over `path`, sharing `cache` and `queue`.
    pub fn new(path: impl Into<PathBuf>, cache: Arc<Cache<TaskFile>>, queue: Arc<WriteQueue>) -> Self {
        Self {
            path: path.into(),
            cache,
            queue,
        }
    }

    /// Path of `tasks.json`.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the task file. A missing file is an empty task list.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub async fn load(&self) -> Result<TaskFile> {
        if let Some(file) = self.cache.get(TASKS_CACHE_KEY) {
            return Ok(file);
        }
        let file = match read_if_exists(&self.path).await? {
            Some(bytes) if !bytes.iter().all(u8::is_ascii_whitespace) => serde_json::from_slice(&bytes)?,
            _ => TaskFile::default(),
        };
        self.cache
            .set_scoped(TASKS_CACHE_KEY, file.clone(), CacheScope::namespace(TASKS_NAMESPACE));
        Ok(file)
    }

    /// All tasks.
    ///
    /// # Errors
    ///
    /// See [`load`](Self::load).
    pub async fn tasks(&self) -> Result<Vec<Task>> {
        Ok(self.load().await?.tasks)
    }

    /// Write the task file and wait for it to land.
    ///
    /// # Errors
    ///
    /// Returns the write's terminal error.
    pub async fn save(&self, file: &TaskFile) -> Result<()> {
        persist_json(&self.queue, &self.path, file, Invalidation::namespace(TASKS_NAMESPACE)).await
    }

    /// Look up one task.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TaskNotFound`] if no task has this id.
    pub async fn get(&self, id: &str) -> Result<Task> {
        self.load()
            .await?
            .get(id)
            .cloned()
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))
    }

    /// Insert a task or replace the one with the same id.
    ///
    /// # Errors
    ///
    /// Returns an error if loading or saving fails.
    pub async fn upsert(&self, task: Task) -> Result<()> {
        let mut file = self.load().await?;
        match file.get_mut(&task.id) {
            Some(existing) => *existing = task,
            None => file.tasks.push(task),
        }
        self.save(&file).await
    }

    /// Remove a task. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// Returns an error if loading or saving fails.
    pub async fn remove(&self, id: &str) -> Result<bool> {
        let mut file = self.load().await?;
        let before = file.tasks.len();
        file.tasks.retain(|t| t.id != id);
        if file.tasks.len() == before {
            return Ok(false);
        }
        self.save(&file).await?;
        Ok(true)
    }

    /// Merge tasks returned by a two-way sync.
    ///
    /// Pulled subtask units (`{parent}.{sub}`) update the matching subtask
    /// of their parent. Returns the number of tasks or subtasks changed.
    ///
    /// # Errors
    ///
    /// Returns an error if loading or saving fails.
    pub async fn apply_pulled(&self, pulled: &[Task]) -> Result<usize> {
        if pulled.is_empty() {
            return Ok(0);
        }
        let mut file = self.load().await?;
        let mut applied = 0;

        for unit in pulled {
            if let Some(task) = file.get_mut(&unit.id) {
                *task = unit.clone();
                applied += 1;
                continue;
            }
            let Some((parent_id, sub_id)) = crate::domain::parse_subtask_unit_id(&unit.id) else {
                debug!(task_id = %unit.id, "Pulled task no longer exists locally");
                continue;
            };
            if let Some(sub) = file
                .get_mut(parent_id)
                .and_then(|parent| parent.subtasks.iter_mut().find(|s| s.id == sub_id))
            {
                sub.title.clone_from(&unit.title);
                sub.description.clone_from(&unit.description);
                sub.status = unit.status;
                applied += 1;
            }
        }

        if applied > 0 {
            self.save(&file).await?;
        }
        Ok(applied)
    }
}
