//! Persistence for [`GitHubSyncStateFile`].
//!
//! Reads go through a cache under the `github-sync` namespace; writes go
//! through the shared write queue. A state file that cannot be parsed, or
//! that breaks the mapping invariant, is moved aside as `*.corrupt` and
//! replaced by the newest valid backup (or a fresh state).

use super::state::{BackupInfo, GitHubSyncStateFile, STATE_VERSION, trim_history};
use crate::config::SyncSettings;
use crate::error::{Error, Result};
use crate::storage::persist_json;
use chrono::{TimeDelta, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tasklink_store::{Cache, CacheScope, Invalidation, WriteQueue, read_if_exists, write_atomic};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Sync state file name inside `.tasklink/`.
pub const STATE_FILE_NAME: &str = "github-sync-state.json";

/// Cache namespace for the sync state.
pub const SYNC_NAMESPACE: &str = "github-sync";

/// Directory holding state backups, inside `.tasklink/`.
pub const BACKUP_DIR_NAME: &str = "backups";

/// Minutes after which an unfinished sync no longer blocks a new one.
pub const STALE_SYNC_MINUTES: i64 = 30;

const STATE_CACHE_KEY: &str = "github-sync:state";
const BACKUP_PREFIX: &str = "github-sync-state.";

/// Loads, saves and backs up the sync state.
pub struct SyncStateStore {
    path: PathBuf,
    backup_dir: PathBuf,
    owner: String,
    repo: String,
    settings: SyncSettings,
    cache: Arc<Cache<GitHubSyncStateFile>>,
    queue: Arc<WriteQueue>,
    lock: Mutex<()>,
}

impl std::fmt::Debug for SyncStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncStateStore")
            .field("path", &self.path)
            .field("repository", &format!("{}/{}", self.owner, self.repo))
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl SyncStateStore {
    /// Store for the state of `owner/repo` inside `tasklink_dir`.
    pub fn new(
        tasklink_dir: &Path,
        owner: impl Into<String>,
        repo: impl Into<String>,
        settings: SyncSettings,
        cache: Arc<Cache<GitHubSyncStateFile>>,
        queue: Arc<WriteQueue>,
    ) -> Self {
        Self {
            path: tasklink_dir.join(STATE_FILE_NAME),
            backup_dir: tasklink_dir.join(BACKUP_DIR_NAME),
            owner: owner.into(),
            repo: repo.into(),
            settings,
            cache,
            queue,
            lock: Mutex::new(()),
        }
    }

    /// Path of the state file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the state, recovering from corruption.
    ///
    /// A cache miss reads the file under the store lock, so a write cannot
    /// land between the read and the cache fill.
    ///
    /// # Errors
    ///
    /// Returns an error only for I/O failures; bad content is recovered.
    pub async fn load(&self) -> Result<GitHubSyncStateFile> {
        if let Some(state) = self.cache.get(STATE_CACHE_KEY) {
            return Ok(state);
        }
        let _guard = self.lock.lock().await;
        self.load_locked().await
    }

    /// [`load`](Self::load) for callers already holding the store lock.
    async fn load_locked(&self) -> Result<GitHubSyncStateFile> {
        if let Some(state) = self.cache.get(STATE_CACHE_KEY) {
            return Ok(state);
        }

        let state = match read_if_exists(&self.path).await? {
            None => GitHubSyncStateFile::new(&self.owner, &self.repo),
            Some(bytes) => match self.parse(&bytes) {
                Ok(state) => state,
                Err(reason) => self.recover(&reason).await?,
            },
        };

        self.cache
            .set_scoped(STATE_CACHE_KEY, state.clone(), CacheScope::namespace(SYNC_NAMESPACE));
        Ok(state)
    }

    fn parse(&self, bytes: &[u8]) -> std::result::Result<GitHubSyncStateFile, String> {
        let mut state: GitHubSyncStateFile =
            serde_json::from_slice(bytes).map_err(|e| format!("unreadable state file: {e}"))?;

        if state.version != STATE_VERSION {
            warn!(
                found = %state.version,
                expected = STATE_VERSION,
                "Sync state version mismatch, upgrading in memory"
            );
            state.version = STATE_VERSION.to_string();
        }
        if state.owner != self.owner || state.repo != self.repo {
            warn!(
                state_repo = %format!("{}/{}", state.owner, state.repo),
                configured = %format!("{}/{}", self.owner, self.repo),
                "Sync state belongs to a different repository"
            );
        }

        state.validate()?;
        let repaired = state.repair_mapping_status();
        if repaired > 0 {
            warn!(repaired, "Mappings marked as conflict without open conflicts reset to pending");
        }
        Ok(state)
    }

    async fn recover(&self, reason: &str) -> Result<GitHubSyncStateFile> {
        let corrupt = corrupt_path(&self.path);
        warn!(reason, preserved = %corrupt.display(), "Sync state is corrupt");
        fs::rename(&self.path, &corrupt).await?;

        if self.settings.auto_recovery
            && let Some(state) = self.restore_latest_backup().await?
        {
            return Ok(state);
        }
        warn!("No usable backup, starting from a fresh sync state");
        Ok(GitHubSyncStateFile::new(&self.owner, &self.repo))
    }

    /// Save the full aggregate.
    ///
    /// Repairs mapping statuses, trims history, stamps `updated_at`, backs up
    /// the previous file (when enabled) and waits for the write to land.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if a conflict has no mapping, or the
    /// write's terminal error.
    pub async fn save(&self, state: &mut GitHubSyncStateFile) -> Result<()> {
        let _guard = self.lock.lock().await;
        if self.settings.backup_enabled
            && let Some(info) = self.create_backup().await?
        {
            state.last_backup = Some(info);
        }
        self.write(state).await
    }

    /// Read-modify-write under the store lock. Nothing is written if `f`
    /// fails.
    ///
    /// # Errors
    ///
    /// Returns the error of `f`, loading or writing.
    pub async fn update<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut GitHubSyncStateFile) -> Result<T>,
    {
        let _guard = self.lock.lock().await;
        let mut state = self.load_locked().await?;
        let value = f(&mut state)?;
        self.write(&mut state).await?;
        Ok(value)
    }

    async fn write(&self, state: &mut GitHubSyncStateFile) -> Result<()> {
        state.repair_mapping_status();
        let max_age = TimeDelta::days(i64::from(self.settings.history_max_age_days));
        trim_history(state, self.settings.history_max_entries, max_age, Utc::now());
        state.validate().map_err(Error::Validation)?;
        state.updated_at = Utc::now();

        persist_json(&self.queue, &self.path, state, Invalidation::namespace(SYNC_NAMESPACE)).await?;
        debug!(mappings = state.mappings.len(), conflicts = state.conflicts.len(), "Sync state saved");
        Ok(())
    }

    /// Mark a sync pass as running.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SyncInProgress`] if another pass started less than
    /// [`STALE_SYNC_MINUTES`] ago.
    pub async fn begin_sync(&self) -> Result<()> {
        self.update(|state| {
            let now = Utc::now();
            if state.sync_in_progress {
                match state.sync_started_at {
                    Some(started_at) if now - started_at < TimeDelta::minutes(STALE_SYNC_MINUTES) => {
                        return Err(Error::SyncInProgress { started_at });
                    }
                    started_at => warn!(?started_at, "Taking over a stale sync"),
                }
            }
            state.sync_in_progress = true;
            state.sync_started_at = Some(now);
            Ok(())
        })
        .await
    }

    /// Clear the running flag and record the outcome.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be written.
    pub async fn end_sync(&self, error: Option<String>) -> Result<()> {
        self.update(|state| {
            state.sync_in_progress = false;
            state.sync_started_at = None;
            state.last_sync_at = Some(Utc::now());
            state.last_sync_error = error;
            Ok(())
        })
        .await
    }

    /// Copy the current state file into the backup directory and prune old
    /// backups. Returns `None` when there is no state file yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the copy fails.
    pub async fn create_backup(&self) -> Result<Option<BackupInfo>> {
        let Some(bytes) = read_if_exists(&self.path).await? else {
            return Ok(None);
        };
        let (mapping_count, version) = match serde_json::from_slice::<GitHubSyncStateFile>(&bytes) {
            Ok(state) => (state.mappings.len(), state.version),
            Err(_) => (0, "unknown".to_string()),
        };

        let created_at = Utc::now();
        let name = format!("{BACKUP_PREFIX}{}.json", created_at.format("%Y%m%dT%H%M%S%.9fZ"));
        let backup_path = self.backup_dir.join(name);
        fs::create_dir_all(&self.backup_dir).await?;
        write_atomic(&backup_path, &bytes).await?;
        debug!(path = %backup_path.display(), "Sync state backed up");

        self.prune_backups().await?;
        Ok(Some(BackupInfo {
            backup_path: backup_path.display().to_string(),
            created_at,
            mapping_count,
            version,
        }))
    }

    /// Backup files, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the backup directory cannot be read.
    pub async fn list_backups(&self) -> Result<Vec<PathBuf>> {
        let mut backups = Vec::new();
        let mut entries = match fs::read_dir(&self.backup_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(backups),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(BACKUP_PREFIX) && name.ends_with(".json") {
                backups.push(entry.path());
            }
        }
        // Timestamped names sort chronologically
        backups.sort_unstable_by(|a, b| b.cmp(a));
        Ok(backups)
    }

    /// Restore the newest backup that parses and validates, writing it back
    /// as the current state.
    ///
    /// # Errors
    ///
    /// Returns an error if backups cannot be listed or the restored state
    /// cannot be written.
    pub async fn restore_latest_backup(&self) -> Result<Option<GitHubSyncStateFile>> {
        for backup in self.list_backups().await? {
            let Some(bytes) = read_if_exists(&backup).await? else {
                continue;
            };
            match self.parse(&bytes) {
                Ok(mut state) => {
                    info!(backup = %backup.display(), "Restored sync state from backup");
                    state.updated_at = Utc::now();
                    persist_json(&self.queue, &self.path, &state, Invalidation::namespace(SYNC_NAMESPACE)).await?;
                    return Ok(Some(state));
                }
                Err(reason) => warn!(backup = %backup.display(), reason, "Skipping unusable backup"),
            }
        }
        Ok(None)
    }

    async fn prune_backups(&self) -> Result<()> {
        let backups = self.list_backups().await?;
        for stale in backups.iter().skip(self.settings.max_backups) {
            fs::remove_file(stale).await?;
            debug!(path = %stale.display(), "Pruned backup");
        }
        Ok(())
    }
}

fn corrupt_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".corrupt");
    path.with_file_name(name)
}
