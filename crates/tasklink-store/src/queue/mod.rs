//! Batched, retried file writes with post-write cache invalidation.
//!
//! [`WriteQueue`] accepts write requests, groups them per target file and
//! executes them in flush cycles. A cycle starts when the queue reaches
//! `max_batch_size` operations or when `max_wait` has elapsed since the
//! oldest pending write, whichever comes first.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                           WriteQueue                             │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  enqueue()               │  flush cycle (one at a time)          │
//! │  ──────────              │  ────────────────────────             │
//! │  push op + handle        │  take all pending ops                 │
//! │  arm timer (first op)    │  group by normalized path             │
//! │  size reached ───────────┼→ spawn one writer task per file       │
//! │                          │  settle handles, invalidate cache     │
//! │  handle.wait()           │  re-queue transient failures          │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Ordering
//!
//! Flush cycles never overlap. Within a cycle, operations for the same file
//! coalesce in enqueue order: exactly one write lands, carrying the last
//! payload, and every operation of that file settles with its outcome.
//! Different files are written concurrently with no ordering between them.
//!
//! ## Usage
//!
//! ```no_run
//! use tasklink_store::queue::{Invalidation, WriteQueue, WriteQueueConfig};
//!
//! # async fn example() -> tasklink_store::Result<()> {
//! let queue = WriteQueue::new(WriteQueueConfig::default());
//!
//! let handle = queue
//!     .enqueue(".tasklink/tasks.json", b"{\"tasks\":[]}".to_vec(), Invalidation::namespace("tasks"))
//!     .await?;
//!
//! // Resolves once the batch containing this write has landed on disk.
//! let receipt = handle.wait().await?;
//! println!("wrote {} bytes", receipt.bytes_written);
//!
//! queue.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod metrics;
mod operation;

pub use metrics::{FileMetrics, MAX_TRACKED_FILES, QueueMetrics};
pub use operation::{
    Invalidation, WriteHandle, WriteOperation, WriteReceipt, is_retriable, normalize_path,
};

use crate::atomic::{AtomicFileWriter, FileWriter};
use crate::cache::{InvalidationScope, Invalidator};
use crate::error::{Error, Result};
use futures::future::join_all;
use metrics::MetricsRecorder;
use serde::Serialize;
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, trace, warn};

/// Maximum flush cycles `shutdown` runs to absorb re-queued retries.
pub const MAX_SHUTDOWN_CYCLES: usize = 5;

/// Write queue tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteQueueConfig {
    /// Longest time the oldest pending write waits before a flush.
    pub max_wait: Duration,
    /// Pending operation count that triggers an immediate flush.
    pub max_batch_size: usize,
    /// Retries allowed for transient I/O failures.
    pub max_retries: u32,
    /// Whether to keep aggregate and per-file counters.
    pub enable_metrics: bool,
    /// Whether the size and time triggers flush automatically.
    ///
    /// When disabled, writes only land on explicit [`WriteQueue::flush`]
    /// or [`WriteQueue::shutdown`] calls.
    pub enable_auto_flush: bool,
}

impl Default for WriteQueueConfig {
    fn default() -> Self {
        Self {
            max_wait: Duration::from_millis(150),
            max_batch_size: 10,
            max_retries: 3,
            enable_metrics: true,
            enable_auto_flush: true,
        }
    }
}

/// A terminal failure reported by a flush cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushError {
    /// Operation that failed.
    pub operation_id: u64,
    /// Target file.
    pub path: PathBuf,
    /// Retries consumed before failing.
    pub retry_count: u32,
    /// Human-readable error.
    pub message: String,
}

/// Summary of one or more flush cycles.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushResult {
    /// Operations settled successfully.
    pub success_count: usize,
    /// Operations settled with a terminal error.
    pub failure_count: usize,
    /// Operations put back for another attempt.
    pub requeued_count: usize,
    /// Files written, each listed once per cycle.
    pub files_written: Vec<PathBuf>,
    /// Terminal failures.
    pub errors: Vec<FlushError>,
}

impl FlushResult {
    /// True when nothing failed or was re-queued.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failure_count == 0 && self.requeued_count == 0
    }

    fn merge(&mut self, other: FlushResult) {
        self.success_count += other.success_count;
        self.failure_count += other.failure_count;
        self.requeued_count += other.requeued_count;
        self.files_written.extend(other.files_written);
        self.errors.extend(other.errors);
    }
}

struct QueueState {
    pending: Vec<WriteOperation>,
    closed: bool,
    /// Armed flush timer and its generation.
    timer: Option<(u64, JoinHandle<()>)>,
    timer_generation: u64,
    next_id: u64,
    metrics: MetricsRecorder,
}

/// Operations destined for one file within a flush cycle.
struct FileBatch {
    path: PathBuf,
    payload: Arc<[u8]>,
    ops: Vec<WriteOperation>,
}

struct QueueCore {
    config: WriteQueueConfig,
    writer: Arc<dyn FileWriter>,
    invalidator: Option<Arc<dyn Invalidator>>,
    state: Mutex<QueueState>,
    /// Held for the duration of a flush cycle so cycles never overlap.
    flush_lock: Mutex<()>,
}

/// Builder for a [`WriteQueue`] with a custom writer or cache.
pub struct WriteQueueBuilder {
    config: WriteQueueConfig,
    writer: Arc<dyn FileWriter>,
    invalidator: Option<Arc<dyn Invalidator>>,
}

impl WriteQueueBuilder {
    /// Replaces the filesystem writer.
    #[must_use]
    pub fn writer(mut self, writer: Arc<dyn FileWriter>) -> Self {
        self.writer = writer;
        self
    }

    /// Sets the cache to invalidate after successful writes.
    #[must_use]
    pub fn invalidator(mut self, invalidator: Arc<dyn Invalidator>) -> Self {
        self.invalidator = Some(invalidator);
        self
    }

    /// Builds the queue.
    #[must_use]
    pub fn build(self) -> WriteQueue {
        WriteQueue {
            core: Arc::new(QueueCore {
                config: self.config,
                writer: self.writer,
                invalidator: self.invalidator,
                state: Mutex::new(QueueState {
                    pending: Vec::new(),
                    closed: false,
                    timer: None,
                    timer_generation: 0,
                    next_id: 1,
                    metrics: MetricsRecorder::default(),
                }),
                flush_lock: Mutex::new(()),
            }),
        }
    }
}

/// Batching write queue. Cloning yields another handle to the same queue.
#[derive(Clone)]
pub struct WriteQueue {
    core: Arc<QueueCore>,
}

impl WriteQueue {
    /// Queue writing atomically to the filesystem with no cache attached.
    #[must_use]
    pub fn new(config: WriteQueueConfig) -> Self {
        Self::builder(config).build()
    }

    /// Starts a builder with the atomic filesystem writer.
    #[must_use]
    pub fn builder(config: WriteQueueConfig) -> WriteQueueBuilder {
        WriteQueueBuilder {
            config,
            writer: Arc::new(AtomicFileWriter),
            invalidator: None,
        }
    }

    /// The queue's configuration.
    #[must_use]
    pub fn config(&self) -> &WriteQueueConfig {
        &self.core.config
    }

    /// Queues `payload` to be written to `path`.
    ///
    /// If this write fills the batch, the flush runs before returning, so the
    /// returned handle may already be settled.
    ///
    /// # Errors
    ///
    /// Returns [`Error::QueueClosed`] after [`shutdown`](Self::shutdown).
    pub async fn enqueue(
        &self,
        path: impl AsRef<Path>,
        payload: impl Into<Vec<u8>>,
        invalidation: Invalidation,
    ) -> Result<WriteHandle> {
        let path = normalize_path(path.as_ref());
        let payload: Arc<[u8]> = Arc::from(payload.into());
        let config = &self.core.config;

        let (handle, flush_now) = {
            let mut state = self.core.state.lock().await;
            if state.closed {
                return Err(Error::QueueClosed);
            }

            let id = state.next_id;
            state.next_id += 1;
            let (op, handle) = WriteOperation::new(id, path.clone(), payload, invalidation);
            if config.enable_metrics {
                state.metrics.record_queued(&path);
            }
            state.pending.push(op);
            trace!(id, path = %path.display(), pending = state.pending.len(), "Write queued");

            let mut flush_now = false;
            if config.enable_auto_flush {
                if state.pending.len() >= config.max_batch_size.max(1) {
                    if let Some((_, timer)) = state.timer.take() {
                        timer.abort();
                    }
                    flush_now = true;
                } else if state.timer.is_none() {
                    QueueCore::arm_timer(&self.core, &mut state);
                }
            }
            (handle, flush_now)
        };

        if flush_now {
            debug!("Batch size reached, flushing");
            self.flush().await;
        }
        Ok(handle)
    }

    /// Serializes `value` as pretty JSON and queues it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] if serialization fails, or the errors of
    /// [`enqueue`](Self::enqueue).
    pub async fn enqueue_json<T: Serialize + ?Sized>(
        &self,
        path: impl AsRef<Path>,
        value: &T,
        invalidation: Invalidation,
    ) -> Result<WriteHandle> {
        let mut bytes = serde_json::to_vec_pretty(value)?;
        bytes.push(b'\n');
        self.enqueue(path, bytes, invalidation).await
    }

    /// Runs one flush cycle over everything currently pending.
    pub async fn flush(&self) -> FlushResult {
        // Run on its own task so a dropped caller cannot strand half a cycle.
        match tokio::spawn(Arc::clone(&self.core).run_flush()).await {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "Flush cycle aborted");
                FlushResult::default()
            }
        }
    }

    /// Stops accepting writes and drains the queue.
    ///
    /// Runs up to [`MAX_SHUTDOWN_CYCLES`] flush cycles to absorb retries.
    /// Anything still pending afterwards is rejected with
    /// [`Error::Abandoned`] and reported as a failure.
    pub async fn shutdown(&self) -> FlushResult {
        {
            let mut state = self.core.state.lock().await;
            state.closed = true;
            if let Some((_, timer)) = state.timer.take() {
                timer.abort();
            }
        }

        let mut total = FlushResult::default();
        for cycle in 0..MAX_SHUTDOWN_CYCLES {
            if self.pending_count().await == 0 {
                break;
            }
            trace!(cycle, "Shutdown flush cycle");
            total.merge(self.flush().await);
        }

        let leftovers = std::mem::take(&mut self.core.state.lock().await.pending);
        if !leftovers.is_empty() {
            warn!(count = leftovers.len(), "Abandoning writes still pending at shutdown");
        }
        let mut state = self.core.state.lock().await;
        for op in leftovers {
            total.failure_count += 1;
            total.errors.push(FlushError {
                operation_id: op.id,
                path: op.file_path.clone(),
                retry_count: op.retry_count,
                message: "abandoned during shutdown".to_string(),
            });
            if self.core.config.enable_metrics {
                state.metrics.record_failed(&op.file_path, 1);
            }
            let error = Error::Abandoned {
                path: op.file_path.clone(),
                retry_count: op.retry_count,
            };
            op.settle(Err(error));
        }

        info!(
            succeeded = total.success_count,
            failed = total.failure_count,
            "Write queue shut down"
        );
        total
    }

    /// Number of operations waiting for a flush.
    pub async fn pending_count(&self) -> usize {
        self.core.state.lock().await.pending.len()
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    pub async fn is_closed(&self) -> bool {
        self.core.state.lock().await.closed
    }

    /// Aggregate counters (zeroed when metrics are disabled).
    pub async fn metrics(&self) -> QueueMetrics {
        self.core.state.lock().await.metrics.snapshot()
    }

    /// Counters for a single file, if tracked.
    pub async fn file_metrics(&self, path: impl AsRef<Path>) -> Option<FileMetrics> {
        let path = normalize_path(path.as_ref());
        self.core.state.lock().await.metrics.file(&path)
    }
}

impl QueueCore {
    fn arm_timer(core: &Arc<Self>, state: &mut QueueState) {
        state.timer_generation += 1;
        let generation = state.timer_generation;
        let wait = core.config.max_wait;
        let core = Arc::clone(core);

        let timer = tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            {
                let mut state = core.state.lock().await;
                if state.timer.as_ref().is_some_and(|(g, _)| *g == generation) {
                    state.timer = None;
                }
            }
            trace!("Flush timer fired");
            // Detached from the timer so aborting a fired timer cannot cancel the cycle.
            if let Err(e) = tokio::spawn(core.run_flush()).await {
                error!(error = %e, "Timed flush cycle aborted");
            }
        });
        state.timer = Some((generation, timer));
    }

    async fn run_flush(self: Arc<Self>) -> FlushResult {
        let _cycle = self.flush_lock.lock().await;

        let mut ops = std::mem::take(&mut self.state.lock().await.pending);
        if ops.is_empty() {
            return FlushResult::default();
        }
        ops.sort_by_key(|op| op.id);

        let mut batches: BTreeMap<PathBuf, FileBatch> = BTreeMap::new();
        for op in ops {
            match batches.entry(op.file_path.clone()) {
                Entry::Occupied(mut entry) => {
                    let batch = entry.get_mut();
                    batch.payload = Arc::clone(&op.payload);
                    batch.ops.push(op);
                }
                Entry::Vacant(entry) => {
                    entry.insert(FileBatch {
                        path: op.file_path.clone(),
                        payload: Arc::clone(&op.payload),
                        ops: vec![op],
                    });
                }
            }
        }
        debug!(files = batches.len(), "Flushing write batches");

        let (batches, tasks): (Vec<FileBatch>, Vec<JoinHandle<io::Result<()>>>) = batches
            .into_values()
            .map(|batch| {
                let writer = Arc::clone(&self.writer);
                let path = batch.path.clone();
                let payload = Arc::clone(&batch.payload);
                let task = tokio::spawn(async move { writer.write(&path, &payload).await });
                (batch, task)
            })
            .unzip();
        let outcomes = join_all(tasks).await;

        let mut result = FlushResult::default();
        let mut requeue = Vec::new();
        let mut state = self.state.lock().await;
        if self.config.enable_metrics {
            state.metrics.record_cycle();
        }
        for (batch, outcome) in batches.into_iter().zip(outcomes) {
            self.settle_batch(batch, outcome, &mut state, &mut result, &mut requeue);
        }

        if !requeue.is_empty() {
            state.pending.extend(requeue);
            state.pending.sort_by_key(|op| op.id);
            if self.config.enable_auto_flush && !state.closed && state.timer.is_none() {
                Self::arm_timer(&self, &mut state);
            }
        }

        debug!(
            succeeded = result.success_count,
            failed = result.failure_count,
            requeued = result.requeued_count,
            "Flush cycle complete"
        );
        result
    }

    fn settle_batch(
        &self,
        batch: FileBatch,
        outcome: std::result::Result<io::Result<()>, JoinError>,
        state: &mut QueueState,
        result: &mut FlushResult,
        requeue: &mut Vec<WriteOperation>,
    ) {
        let FileBatch { path, payload, ops } = batch;
        let count = ops.len();

        match outcome {
            Ok(Ok(())) => {
                // Invalidate before settling so waiters never read stale entries.
                self.invalidate_for(&ops);
                result.success_count += count;
                result.files_written.push(path.clone());
                if self.config.enable_metrics {
                    state.metrics.record_flushed(&path, count as u64);
                }
                let last_id = ops.last().map(|op| op.id);
                for op in ops {
                    let receipt = WriteReceipt {
                        operation_id: op.id,
                        path: op.file_path.clone(),
                        retry_count: op.retry_count,
                        bytes_written: payload.len(),
                        superseded: Some(op.id) != last_id,
                    };
                    op.settle(Ok(receipt));
                }
            }
            Ok(Err(e)) => {
                let retriable = is_retriable(&e);
                for mut op in ops {
                    if retriable && op.retry_count < self.config.max_retries {
                        op.retry_count += 1;
                        warn!(
                            path = %path.display(),
                            retry = op.retry_count,
                            error = %e,
                            "Transient write failure, re-queueing"
                        );
                        result.requeued_count += 1;
                        if self.config.enable_metrics {
                            state.metrics.record_retries(1);
                        }
                        requeue.push(op);
                    } else {
                        error!(
                            path = %path.display(),
                            retries = op.retry_count,
                            error = %e,
                            "Write failed"
                        );
                        result.failure_count += 1;
                        result.errors.push(FlushError {
                            operation_id: op.id,
                            path: path.clone(),
                            retry_count: op.retry_count,
                            message: e.to_string(),
                        });
                        if self.config.enable_metrics {
                            state.metrics.record_failed(&path, 1);
                        }
                        let error = Error::WriteFailed {
                            path: path.clone(),
                            retry_count: op.retry_count,
                            source: io::Error::new(e.kind(), e.to_string()),
                        };
                        op.settle(Err(error));
                    }
                }
            }
            Err(join_error) => {
                let reason = if join_error.is_panic() {
                    "writer task panicked".to_string()
                } else {
                    "writer task was cancelled".to_string()
                };
                error!(path = %path.display(), %reason, "Flush aborted for batch");
                for op in ops {
                    result.failure_count += 1;
                    result.errors.push(FlushError {
                        operation_id: op.id,
                        path: path.clone(),
                        retry_count: op.retry_count,
                        message: reason.clone(),
                    });
                    if self.config.enable_metrics {
                        state.metrics.record_failed(&path, 1);
                    }
                    op.settle(Err(Error::FlushAborted {
                        path: path.clone(),
                        reason: reason.clone(),
                    }));
                }
            }
        }
    }

    fn invalidate_for(&self, ops: &[WriteOperation]) {
        let Some(invalidator) = &self.invalidator else {
            return;
        };

        let mut scopes: Vec<InvalidationScope> = Vec::new();
        for op in ops.iter().filter(|op| !op.invalidation.is_empty()) {
            if let Some(ns) = &op.invalidation.namespace {
                scopes.push(InvalidationScope::Namespace(ns.clone()));
            }
            scopes.extend(
                op.invalidation
                    .tags
                    .iter()
                    .map(|tag| InvalidationScope::Tag(tag.clone())),
            );
        }
        scopes.dedup();

        for scope in &scopes {
            let removed = invalidator.invalidate(scope);
            trace!(%scope, removed, "Invalidated after write");
        }
    }
}
