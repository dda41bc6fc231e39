//! Write queue counters with bounded per-file tracking.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Maximum number of files tracked before the oldest is evicted.
pub const MAX_TRACKED_FILES: usize = 256;

/// Counters for a single target file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileMetrics {
    /// Operations enqueued for the file.
    pub queued: u64,
    /// Operations settled successfully.
    pub flushed: u64,
    /// Operations settled with a terminal error.
    pub failed: u64,
    /// Time of the last successful write.
    pub last_flush_at: Option<SystemTime>,
}

/// Aggregate queue counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueMetrics {
    /// Operations accepted by `enqueue`.
    pub total_queued: u64,
    /// Operations settled successfully.
    pub total_flushed: u64,
    /// Operations settled with a terminal error.
    pub total_failed: u64,
    /// Re-queues after transient failures.
    pub total_retries: u64,
    /// Flush cycles that had work to do.
    pub flush_cycles: u64,
    /// Files currently tracked.
    pub tracked_files: usize,
}

#[derive(Debug, Default)]
pub(crate) struct MetricsRecorder {
    totals: QueueMetrics,
    files: HashMap<PathBuf, FileMetrics>,
    /// Insertion order for FIFO eviction.
    order: VecDeque<PathBuf>,
}

impl MetricsRecorder {
    pub(crate) fn record_queued(&mut self, path: &Path) {
        self.totals.total_queued += 1;
        self.file_mut(path).queued += 1;
    }

    pub(crate) fn record_flushed(&mut self, path: &Path, count: u64) {
        self.totals.total_flushed += count;
        let file = self.file_mut(path);
        file.flushed += count;
        file.last_flush_at = Some(SystemTime::now());
    }

    pub(crate) fn record_failed(&mut self, path: &Path, count: u64) {
        self.totals.total_failed += count;
        self.file_mut(path).failed += count;
    }

    pub(crate) fn record_retries(&mut self, count: u64) {
        self.totals.total_retries += count;
    }

    pub(crate) fn record_cycle(&mut self) {
        self.totals.flush_cycles += 1;
    }

    pub(crate) fn snapshot(&self) -> QueueMetrics {
        QueueMetrics {
            tracked_files: self.files.len(),
            ..self.totals
        }
    }

    pub(crate) fn file(&self, path: &Path) -> Option<FileMetrics> {
        self.files.get(path).copied()
    }

    fn file_mut(&mut self, path: &Path) -> &mut FileMetrics {
        if !self.files.contains_key(path) {
            while self.files.len() >= MAX_TRACKED_FILES {
                match self.order.pop_front() {
                    Some(oldest) => {
                        self.files.remove(&oldest);
                        tracing::trace!(path = %oldest.display(), "Evicted file metrics");
                    }
                    None => break,
                }
            }
            self.order.push_back(path.to_path_buf());
        }
        self.files.entry(path.to_path_buf()).or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_file_metrics_are_bounded() {
        let mut recorder = MetricsRecorder::default();
        for i in 0..=MAX_TRACKED_FILES {
            recorder.record_queued(Path::new(&format!("file-{i}.json")));
        }

        let snapshot = recorder.snapshot();
        assert_eq!(snapshot.tracked_files, MAX_TRACKED_FILES);
        assert_eq!(snapshot.total_queued, MAX_TRACKED_FILES as u64 + 1);
        assert!(recorder.file(Path::new("file-0.json")).is_none());
        assert!(recorder.file(Path::new("file-1.json")).is_some());
    }

    #[test]
    fn flushed_sets_last_flush_time() {
        let mut recorder = MetricsRecorder::default();
        let path = Path::new("tasks.json");
        recorder.record_queued(path);
        recorder.record_flushed(path, 1);

        let file = recorder.file(path).unwrap();
        assert_eq!(file.queued, 1);
        assert_eq!(file.flushed, 1);
        assert!(file.last_flush_at.is_some());
    }
}
