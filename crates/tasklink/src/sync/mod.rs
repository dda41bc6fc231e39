//! GitHub issue synchronization.
//!
//! - [`state`]: the persisted sync state aggregate
//! - [`state_store`]: loading, saving, backups and the in-progress flag
//! - [`change_detector`]: per-unit change classification
//! - [`diff`]: line and list diffs used for analysis and merging
//! - [`conflict`]: conflict lifecycle, policy table and analysis
//! - [`resolution`]: applying strategies, batch resolution and undo
//! - [`orchestrator`]: the sync pass itself

pub mod change_detector;
pub mod conflict;
pub mod diff;
pub mod orchestrator;
pub mod resolution;
pub mod state;
pub mod state_store;

pub use change_detector::{ChangeDetector, ChangeState, PendingChanges};
pub use conflict::{ConflictAnalysis, ConflictKey, RiskLevel, analyze, policy_for};
pub use orchestrator::{
    ActionKind, PlannedAction, RemoteCheck, SyncError, SyncMode, SyncOptions, SyncOrchestrator, SyncResult,
    SyncStateKind, SyncStatus,
};
pub use resolution::{
    BatchOptions, BatchResolutionResult, BatchStrategy, ConflictResolver, HistoryEntry, PreviewResult, Resolution,
    ResolutionResult,
};
pub use state::{
    ConflictType, FieldValue, GitHubSyncStateFile, MappingStatus, ResolutionStrategy, SyncConflict, SyncMapping,
};
pub use state_store::SyncStateStore;
