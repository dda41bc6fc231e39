//! Atomic file writes.
//!
//! Every durable write in tasklink goes through the temp-file-then-rename
//! pattern so a crash never leaves a target file half written:
//!
//! 1. The payload is written to a sibling file with a `.tmp` extension
//! 2. The temporary file is flushed and synced
//! 3. The temporary file is renamed over the target path
//!
//! On POSIX systems the rename is atomic within a filesystem. If a crash
//! occurs before step 3 the original file is untouched; a stray `.tmp`
//! file may be left behind and is overwritten by the next write.
//!
//! The [`FileWriter`] trait is the seam the write queue uses to reach the
//! filesystem. [`AtomicFileWriter`] is the production implementation.

use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Destination for the bytes of a flushed write.
///
/// Implementations must be safe to call concurrently for *different* paths.
/// The write queue never issues two concurrent writes to the same path.
#[async_trait]
pub trait FileWriter: Send + Sync {
    /// Durably replace the contents of `path` with `bytes`.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error. The write queue decides whether the
    /// error is transient by inspecting its kind.
    async fn write(&self, path: &Path, bytes: &[u8]) -> io::Result<()>;
}

/// [`FileWriter`] that performs crash-safe temp-then-rename writes.
#[derive(Debug, Default, Clone, Copy)]
pub struct AtomicFileWriter;

#[async_trait]
impl FileWriter for AtomicFileWriter {
    async fn write(&self, path: &Path, bytes: &[u8]) -> io::Result<()> {
        write_atomic(path, bytes).await
    }
}

/// Atomically replaces the contents of `path` with `bytes`.
///
/// Missing parent directories are created first.
///
/// # Errors
///
/// Returns an error if the temporary file cannot be created or written,
/// or if the final rename fails (e.g., cross-filesystem move). On failure
/// the original file, if any, is left unchanged.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }

    let temp_path = make_temp_path(path);

    if let Err(e) = write_to_temp_file(&temp_path, bytes).await {
        // Best-effort cleanup of temp file
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(e);
    }

    tokio::fs::rename(&temp_path, path).await
}

/// Reads a file, returning `None` when it does not exist.
///
/// # Errors
///
/// Returns any I/O error other than `NotFound`.
pub async fn read_if_exists(path: &Path) -> io::Result<Option<Vec<u8>>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Creates the temporary path used while writing `path`.
///
/// If the original path has an extension, `.tmp` is appended to it;
/// otherwise the extension becomes `tmp`.
pub(crate) fn make_temp_path(path: &Path) -> PathBuf {
    let mut temp_path = path.to_path_buf();
    let new_extension = match path.extension() {
        Some(ext) => {
            let mut new_ext = ext.to_os_string();
            new_ext.push(".tmp");
            new_ext
        }
        None => std::ffi::OsString::from("tmp"),
    };
    temp_path.set_extension(new_extension);
    temp_path
}

async fn write_to_temp_file(temp_path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = tokio::fs::File::create(temp_path).await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_data().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn make_temp_path_with_extension() {
        let temp = make_temp_path(Path::new("/path/to/state.json"));
        assert_eq!(temp, Path::new("/path/to/state.json.tmp"));
    }

    #[test]
    fn make_temp_path_without_extension() {
        let temp = make_temp_path(Path::new("/path/to/file"));
        assert_eq!(temp, Path::new("/path/to/file.tmp"));
    }

    #[test]
    fn make_temp_path_relative() {
        let temp = make_temp_path(Path::new("tasks.json"));
        assert_eq!(temp, Path::new("tasks.json.tmp"));
    }

    #[tokio::test]
    async fn write_atomic_creates_parent_directories() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("nested/deeper/state.json");

        write_atomic(&target, b"{}").await.unwrap();

        assert_eq!(tokio::fs::read(&target).await.unwrap(), b"{}");
        assert!(!make_temp_path(&target).exists());
    }

    #[tokio::test]
    async fn write_atomic_replaces_existing_file() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("tasks.json");
        tokio::fs::write(&target, "old content").await.unwrap();

        write_atomic(&target, b"new content").await.unwrap();

        let contents = tokio::fs::read_to_string(&target).await.unwrap();
        assert_eq!(contents, "new content");
    }

    #[tokio::test]
    async fn read_if_exists_returns_none_for_missing_file() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("missing.json");

        assert!(read_if_exists(&missing).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn read_if_exists_returns_contents() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("present.json");
        tokio::fs::write(&target, "[]").await.unwrap();

        assert_eq!(read_if_exists(&target).await.unwrap().unwrap(), b"[]");
    }
}
