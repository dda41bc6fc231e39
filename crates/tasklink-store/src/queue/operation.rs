//! Queued write records and their completion handles.

use crate::error::{Error, Result};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::oneshot;

/// Raw OS error codes treated as transient (Linux `EAGAIN`, `EBUSY`, `ENFILE`, `EMFILE`).
const TRANSIENT_OS_CODES: &[i32] = &[11, 16, 23, 24];

/// Cache scopes to invalidate once a write has landed on disk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Invalidation {
    /// Namespace whose entries become stale.
    pub namespace: Option<String>,
    /// Tags whose entries become stale.
    pub tags: Vec<String>,
}

impl Invalidation {
    /// No invalidation.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Invalidate a single namespace.
    pub fn namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            tags: Vec::new(),
        }
    }

    /// Adds a tag to invalidate.
    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.namespace.is_none() && self.tags.is_empty()
    }
}

/// Outcome of a successfully settled write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteReceipt {
    /// Identifier assigned at enqueue time.
    pub operation_id: u64,
    /// Normalized target path.
    pub path: PathBuf,
    /// Retries consumed before the write landed.
    pub retry_count: u32,
    /// Size of the payload that reached disk for this file.
    pub bytes_written: usize,
    /// True when a later write to the same file carried the payload.
    pub superseded: bool,
}

/// A pending write, exclusively owned by the queue until it settles.
#[derive(Debug)]
pub struct WriteOperation {
    /// Monotonic identifier; also defines enqueue order.
    pub id: u64,
    /// Normalized target path.
    pub file_path: PathBuf,
    /// Bytes to write.
    pub payload: Arc<[u8]>,
    /// When the operation entered the queue.
    pub queued_at: SystemTime,
    /// Retries consumed so far.
    pub retry_count: u32,
    /// Scopes to invalidate after the write lands.
    pub invalidation: Invalidation,
    completion: oneshot::Sender<Result<WriteReceipt>>,
}

impl WriteOperation {
    pub(crate) fn new(
        id: u64,
        file_path: PathBuf,
        payload: Arc<[u8]>,
        invalidation: Invalidation,
    ) -> (Self, WriteHandle) {
        let (completion, receiver) = oneshot::channel();
        let handle = WriteHandle {
            id,
            path: file_path.clone(),
            receiver,
        };
        let op = Self {
            id,
            file_path,
            payload,
            queued_at: SystemTime::now(),
            retry_count: 0,
            invalidation,
            completion,
        };
        (op, handle)
    }

    /// Settles the operation. Consuming `self` guarantees a single settlement.
    pub(crate) fn settle(self, outcome: Result<WriteReceipt>) {
        // The caller may have dropped its handle; nothing to report then.
        let _ = self.completion.send(outcome);
    }
}

/// Completion handle returned by [`WriteQueue::enqueue`](super::WriteQueue::enqueue).
#[derive(Debug)]
pub struct WriteHandle {
    id: u64,
    path: PathBuf,
    receiver: oneshot::Receiver<Result<WriteReceipt>>,
}

impl WriteHandle {
    /// Identifier of the queued operation.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Normalized target path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Waits until the operation settles.
    ///
    /// # Errors
    ///
    /// Returns the terminal write error, or [`Error::CompletionLost`] if the
    /// queue dropped the operation without settling it.
    pub async fn wait(self) -> Result<WriteReceipt> {
        self.receiver.await.map_err(|_| Error::CompletionLost)?
    }
}

/// Whether an I/O error is worth retrying on the next flush cycle.
pub fn is_retriable(error: &io::Error) -> bool {
    use io::ErrorKind;

    if error
        .raw_os_error()
        .is_some_and(|code| TRANSIENT_OS_CODES.contains(&code))
    {
        return true;
    }
    matches!(
        error.kind(),
        ErrorKind::PermissionDenied
            | ErrorKind::ResourceBusy
            | ErrorKind::WouldBlock
            | ErrorKind::Interrupted
            | ErrorKind::TimedOut
            | ErrorKind::NotFound
    )
}

/// Lexically normalizes a path so different spellings group together.
///
/// `.` components are dropped and `..` pops the previous normal component.
/// The filesystem is not consulted.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let popped = matches!(normalized.components().next_back(), Some(Component::Normal(_)))
                    && normalized.pop();
                if !popped && !normalized.has_root() {
                    normalized.push("..");
                }
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("a/./b.json", "a/b.json")]
    #[case("a/x/../b.json", "a/b.json")]
    #[case("/root/.tasklink/../.tasklink/tasks.json", "/root/.tasklink/tasks.json")]
    #[case("../shared/tasks.json", "../shared/tasks.json")]
    #[case("/../tasks.json", "/tasks.json")]
    fn normalize_path_collapses_components(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(normalize_path(Path::new(input)), PathBuf::from(expected));
    }

    #[rstest]
    #[case(io::ErrorKind::PermissionDenied, true)]
    #[case(io::ErrorKind::WouldBlock, true)]
    #[case(io::ErrorKind::NotFound, true)]
    #[case(io::ErrorKind::ResourceBusy, true)]
    #[case(io::ErrorKind::InvalidInput, false)]
    #[case(io::ErrorKind::InvalidData, false)]
    fn retriable_kinds(#[case] kind: io::ErrorKind, #[case] expected: bool) {
        assert_eq!(is_retriable(&io::Error::from(kind)), expected);
    }

    #[test]
    fn transient_os_codes_are_retriable() {
        assert!(is_retriable(&io::Error::from_raw_os_error(24)));
    }

    #[tokio::test]
    async fn handle_reports_lost_completion() {
        let (op, handle) = WriteOperation::new(
            1,
            PathBuf::from("tasks.json"),
            Arc::from(&b"{}"[..]),
            Invalidation::none(),
        );
        drop(op);

        assert!(matches!(handle.wait().await, Err(Error::CompletionLost)));
    }
}
