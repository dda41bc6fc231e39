//! Integration tests for the write queue.
//!
//! These tests drive the queue through an in-memory recording writer so
//! failures can be injected per path, plus a few runs against the real
//! filesystem through the atomic writer.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tasklink_store::cache::{Cache, CacheScope};
use tasklink_store::queue::{Invalidation, WriteQueue, WriteQueueConfig};
use tasklink_store::{Error, FileWriter};
use tempfile::tempdir;

#[derive(Default)]
struct RecordingWriter {
    writes: Mutex<Vec<(PathBuf, Vec<u8>)>>,
    failures: Mutex<HashMap<PathBuf, VecDeque<io::ErrorKind>>>,
}

impl RecordingWriter {
    fn fail_next(&self, path: &str, kinds: &[io::ErrorKind]) {
        self.failures
            .lock()
            .unwrap()
            .entry(PathBuf::from(path))
            .or_default()
            .extend(kinds.iter().copied());
    }

    fn writes_to(&self, path: &str) -> Vec<Vec<u8>> {
        self.writes
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _)| p == Path::new(path))
            .map(|(_, bytes)| bytes.clone())
            .collect()
    }

    fn total_writes(&self) -> usize {
        self.writes.lock().unwrap().len()
    }
}

#[async_trait]
impl FileWriter for RecordingWriter {
    async fn write(&self, path: &Path, bytes: &[u8]) -> io::Result<()> {
        let failure = self
            .failures
            .lock()
            .unwrap()
            .get_mut(path)
            .and_then(VecDeque::pop_front);
        if let Some(kind) = failure {
            return Err(io::Error::new(kind, "injected failure"));
        }
        self.writes
            .lock()
            .unwrap()
            .push((path.to_path_buf(), bytes.to_vec()));
        Ok(())
    }
}

struct PanickingWriter;

#[async_trait]
impl FileWriter for PanickingWriter {
    async fn write(&self, _path: &Path, _bytes: &[u8]) -> io::Result<()> {
        panic!("disk driver exploded");
    }
}

fn manual_config() -> WriteQueueConfig {
    WriteQueueConfig {
        enable_auto_flush: false,
        ..WriteQueueConfig::default()
    }
}

fn recording_queue(config: WriteQueueConfig) -> (WriteQueue, Arc<RecordingWriter>) {
    let writer = Arc::new(RecordingWriter::default());
    let queue = WriteQueue::builder(config).writer(writer.clone()).build();
    (queue, writer)
}

// ========== Grouping and Ordering ==========

#[tokio::test]
async fn test_same_file_writes_coalesce_to_last_payload() {
    let (queue, writer) = recording_queue(manual_config());

    let mut handles = Vec::new();
    for i in 0..5 {
        // Two spellings of the same path must group together.
        let path = if i % 2 == 0 { "state/sync.json" } else { "state/./sync.json" };
        handles.push(
            queue
                .enqueue(path, format!("payload-{i}"), Invalidation::none())
                .await
                .unwrap(),
        );
    }

    let result = queue.flush().await;

    assert_eq!(result.success_count, 5);
    assert_eq!(result.failure_count, 0);
    assert_eq!(result.files_written, vec![PathBuf::from("state/sync.json")]);
    assert_eq!(writer.writes_to("state/sync.json"), vec![b"payload-4".to_vec()]);

    let mut receipts = Vec::new();
    for handle in handles {
        receipts.push(handle.wait().await.unwrap());
    }
    assert!(receipts[..4].iter().all(|r| r.superseded));
    assert!(!receipts[4].superseded);
}

#[tokio::test]
async fn test_distinct_files_each_written_once() {
    let (queue, writer) = recording_queue(manual_config());

    for name in ["a.json", "b.json", "c.json", "d.json"] {
        queue.enqueue(name, name, Invalidation::none()).await.unwrap();
    }
    queue.enqueue("b.json", "b-final", Invalidation::none()).await.unwrap();

    let result = queue.flush().await;

    assert_eq!(result.files_written.len(), 4);
    assert_eq!(writer.total_writes(), 4);
    assert_eq!(writer.writes_to("b.json"), vec![b"b-final".to_vec()]);
}

#[tokio::test]
async fn test_flush_with_nothing_pending_is_empty() {
    let (queue, writer) = recording_queue(manual_config());

    let result = queue.flush().await;

    assert_eq!(result, Default::default());
    assert_eq!(writer.total_writes(), 0);
}

// ========== Retry Semantics ==========

#[tokio::test]
async fn test_non_retriable_failure_is_not_retried() {
    let (queue, writer) = recording_queue(manual_config());
    writer.fail_next("tasks.json", &[io::ErrorKind::InvalidData]);

    let handle = queue
        .enqueue("tasks.json", "{}", Invalidation::none())
        .await
        .unwrap();
    let result = queue.flush().await;

    assert_eq!(result.failure_count, 1);
    assert_eq!(result.requeued_count, 0);
    assert_eq!(result.errors[0].retry_count, 0);
    assert_eq!(queue.pending_count().await, 0);

    let err = handle.wait().await.unwrap_err();
    assert!(matches!(err, Error::WriteFailed { retry_count: 0, .. }));
    assert_eq!(err.retry_count(), Some(0));
    assert_eq!(writer.total_writes(), 0);
}

#[tokio::test]
async fn test_retriable_failure_then_success_counts_once() {
    let (queue, writer) = recording_queue(manual_config());
    writer.fail_next(
        "tasks.json",
        &[io::ErrorKind::WouldBlock, io::ErrorKind::PermissionDenied],
    );

    let handle = queue
        .enqueue("tasks.json", "{}", Invalidation::none())
        .await
        .unwrap();

    let first = queue.flush().await;
    let second = queue.flush().await;
    let third = queue.flush().await;

    assert_eq!(first.requeued_count, 1);
    assert_eq!(second.requeued_count, 1);
    assert_eq!(third.success_count, 1);
    let successes = first.success_count + second.success_count + third.success_count;
    let failures = first.failure_count + second.failure_count + third.failure_count;
    assert_eq!(successes, 1);
    assert_eq!(failures, 0);

    let receipt = handle.wait().await.unwrap();
    assert_eq!(receipt.retry_count, 2);
    assert_eq!(queue.metrics().await.total_retries, 2);
}

#[tokio::test]
async fn test_retries_exhausted_rejects_with_retry_count() {
    let config = WriteQueueConfig {
        max_retries: 2,
        ..manual_config()
    };
    let (queue, writer) = recording_queue(config);
    writer.fail_next("tasks.json", &[io::ErrorKind::ResourceBusy; 5]);

    let handle = queue
        .enqueue("tasks.json", "{}", Invalidation::none())
        .await
        .unwrap();
    for _ in 0..3 {
        queue.flush().await;
    }

    let err = handle.wait().await.unwrap_err();
    assert!(matches!(err, Error::WriteFailed { retry_count: 2, .. }));
    assert_eq!(queue.metrics().await.total_failed, 1);
}

#[tokio::test]
async fn test_panicking_writer_rejects_whole_batch() {
    let queue = WriteQueue::builder(manual_config())
        .writer(Arc::new(PanickingWriter))
        .build();

    let first = queue.enqueue("tasks.json", "1", Invalidation::none()).await.unwrap();
    let second = queue.enqueue("tasks.json", "2", Invalidation::none()).await.unwrap();
    let result = queue.flush().await;

    assert_eq!(result.failure_count, 2);
    assert!(matches!(first.wait().await, Err(Error::FlushAborted { .. })));
    assert!(matches!(second.wait().await, Err(Error::FlushAborted { .. })));
}

// ========== Automatic Triggers ==========

#[tokio::test]
async fn test_size_trigger_flushes_without_waiting_for_timer() {
    let config = WriteQueueConfig {
        max_batch_size: 3,
        max_wait: Duration::from_secs(60),
        ..WriteQueueConfig::default()
    };
    let (queue, writer) = recording_queue(config);

    let mut handles = Vec::new();
    for name in ["a.json", "b.json", "c.json"] {
        handles.push(queue.enqueue(name, name, Invalidation::none()).await.unwrap());
    }

    for handle in handles {
        let receipt = tokio::time::timeout(Duration::from_secs(1), handle.wait())
            .await
            .expect("size trigger should flush immediately")
            .unwrap();
        assert_eq!(receipt.retry_count, 0);
    }
    assert_eq!(writer.total_writes(), 3);
}

#[tokio::test]
async fn test_timer_flushes_pending_write() {
    let config = WriteQueueConfig {
        max_batch_size: 100,
        max_wait: Duration::from_millis(20),
        ..WriteQueueConfig::default()
    };
    let (queue, writer) = recording_queue(config);

    let handle = queue.enqueue("a.json", "a", Invalidation::none()).await.unwrap();

    tokio::time::timeout(Duration::from_secs(2), handle.wait())
        .await
        .expect("timer should flush")
        .unwrap();
    assert_eq!(writer.writes_to("a.json").len(), 1);
    assert_eq!(queue.pending_count().await, 0);
}

#[tokio::test]
async fn test_timer_retries_transient_failure() {
    let config = WriteQueueConfig {
        max_batch_size: 100,
        max_wait: Duration::from_millis(10),
        ..WriteQueueConfig::default()
    };
    let (queue, writer) = recording_queue(config);
    writer.fail_next("a.json", &[io::ErrorKind::WouldBlock]);

    let handle = queue.enqueue("a.json", "a", Invalidation::none()).await.unwrap();

    let receipt = tokio::time::timeout(Duration::from_secs(2), handle.wait())
        .await
        .expect("retry should be flushed by a re-armed timer")
        .unwrap();
    assert_eq!(receipt.retry_count, 1);
}

// ========== Cache Invalidation ==========

#[tokio::test]
async fn test_successful_write_invalidates_namespace_and_tags() {
    let cache = Arc::new(Cache::<u32>::default());
    cache.set_scoped("tasks:all", 1, CacheScope::namespace("tasks"));
    cache.set_scoped("task:7", 2, CacheScope::default().with_tag("task-7"));
    cache.set_scoped("sync:state", 3, CacheScope::namespace("github-sync"));

    let writer = Arc::new(RecordingWriter::default());
    let queue = WriteQueue::builder(manual_config())
        .writer(writer)
        .invalidator(cache.clone())
        .build();

    queue
        .enqueue(
            "tasks.json",
            "{}",
            Invalidation::namespace("tasks").with_tag("task-7"),
        )
        .await
        .unwrap();

    // Nothing is invalidated before the write lands.
    assert!(cache.contains("tasks:all"));

    queue.flush().await;

    assert_eq!(cache.get("tasks:all"), None);
    assert_eq!(cache.get("task:7"), None);
    assert_eq!(cache.get("sync:state"), Some(3));
}

#[tokio::test]
async fn test_failed_write_keeps_cache_entries() {
    let cache = Arc::new(Cache::<u32>::default());
    cache.set_scoped("tasks:all", 1, CacheScope::namespace("tasks"));

    let writer = Arc::new(RecordingWriter::default());
    writer.fail_next("tasks.json", &[io::ErrorKind::InvalidInput]);
    let queue = WriteQueue::builder(manual_config())
        .writer(writer)
        .invalidator(cache.clone())
        .build();

    queue
        .enqueue("tasks.json", "{}", Invalidation::namespace("tasks"))
        .await
        .unwrap();
    queue.flush().await;

    assert_eq!(cache.get("tasks:all"), Some(1));
}

// ========== Shutdown ==========

#[tokio::test]
async fn test_shutdown_drains_then_rejects_new_work() {
    let (queue, writer) = recording_queue(manual_config());
    let handle = queue.enqueue("a.json", "a", Invalidation::none()).await.unwrap();
    queue.enqueue("b.json", "b", Invalidation::none()).await.unwrap();

    let result = queue.shutdown().await;

    assert_eq!(result.success_count, 2);
    assert!(handle.wait().await.is_ok());
    assert_eq!(writer.total_writes(), 2);
    assert!(queue.is_closed().await);

    let err = queue
        .enqueue("c.json", "c", Invalidation::none())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::QueueClosed));
}

#[tokio::test]
async fn test_shutdown_abandons_writes_that_keep_failing() {
    let config = WriteQueueConfig {
        max_retries: 50,
        ..manual_config()
    };
    let (queue, writer) = recording_queue(config);
    writer.fail_next("a.json", &[io::ErrorKind::WouldBlock; 50]);

    let handle = queue.enqueue("a.json", "a", Invalidation::none()).await.unwrap();
    let result = queue.shutdown().await;

    assert_eq!(result.requeued_count, tasklink_store::queue::MAX_SHUTDOWN_CYCLES);
    assert_eq!(result.failure_count, 1);
    assert!(matches!(
        handle.wait().await,
        Err(Error::Abandoned { retry_count: 5, .. })
    ));
}

// ========== Filesystem ==========

#[tokio::test]
async fn test_atomic_writer_persists_json() {
    let dir = tempdir().unwrap();
    let path = dir.path().join(".tasklink/tasks.json");
    let queue = WriteQueue::new(manual_config());

    let handle = queue
        .enqueue_json(&path, &serde_json::json!({"tasks": []}), Invalidation::none())
        .await
        .unwrap();
    queue.flush().await;
    handle.wait().await.unwrap();

    let contents: serde_json::Value =
        serde_json::from_slice(&tokio::fs::read(&path).await.unwrap()).unwrap();
    assert_eq!(contents, serde_json::json!({"tasks": []}));

    let metrics = queue.file_metrics(&path).await.unwrap();
    assert_eq!(metrics.queued, 1);
    assert_eq!(metrics.flushed, 1);
    assert!(metrics.last_flush_at.is_some());
}
