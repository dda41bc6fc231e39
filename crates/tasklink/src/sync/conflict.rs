//! Conflict analysis.
//!
//! Each conflict type has a fixed policy: how risky it is to resolve, which
//! strategies are offered, and which one is recommended. Deletion conflicts
//! have no recommendation and are never resolved automatically.

use super::diff::{DiffLine, ListDiff, diff_lines, diff_lists};
use super::state::{ConflictType, FieldValue, ResolutionStrategy, SyncConflict};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a conflict: `Detected → Analyzed → (Resolved | Skipped)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPhase {
    /// Found by change detection
    Detected,
    /// Policy and diffs computed
    Analyzed,
    /// A strategy was applied
    Resolved,
    /// Left for the user
    Skipped,
}

impl ConflictPhase {
    /// Phase of a stored conflict. Stored conflicts are either still open
    /// or resolved.
    pub fn of(conflict: &SyncConflict) -> Self {
        if conflict.resolved {
            ConflictPhase::Resolved
        } else {
            ConflictPhase::Detected
        }
    }

    /// Move to `next`, rejecting illegal transitions.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] for anything other than
    /// `Detected → Analyzed` or `Analyzed → Resolved | Skipped`.
    pub fn advance(self, next: ConflictPhase) -> Result<ConflictPhase> {
        match (self, next) {
            (ConflictPhase::Detected, ConflictPhase::Analyzed)
            | (ConflictPhase::Analyzed, ConflictPhase::Resolved | ConflictPhase::Skipped) => Ok(next),
            _ => Err(Error::InvalidTransition {
                from: self.to_string(),
                to: next.to_string(),
            }),
        }
    }

    /// Whether no further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, ConflictPhase::Resolved | ConflictPhase::Skipped)
    }
}

impl fmt::Display for ConflictPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConflictPhase::Detected => "detected",
            ConflictPhase::Analyzed => "analyzed",
            ConflictPhase::Resolved => "resolved",
            ConflictPhase::Skipped => "skipped",
        };
        write!(f, "{s}")
    }
}

/// How much damage a wrong resolution can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    /// Cosmetic
    Low,
    /// Content may be lost
    Medium,
    /// A whole task or issue may be lost
    High,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        };
        write!(f, "{s}")
    }
}

/// Resolution policy for a conflict type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConflictPolicy {
    /// Risk of resolving
    pub risk: RiskLevel,
    /// Strategy suggested to the user, if any
    pub recommended: Option<ResolutionStrategy>,
    /// Strategies offered
    pub strategies: &'static [ResolutionStrategy],
}

impl ConflictPolicy {
    /// Whether `strategy` is offered.
    pub fn allows(&self, strategy: ResolutionStrategy) -> bool {
        self.strategies.contains(&strategy)
    }
}

const PICK: &[ResolutionStrategy] = &[
    ResolutionStrategy::PreferLocal,
    ResolutionStrategy::PreferRemote,
    ResolutionStrategy::Manual,
];

const PICK_OR_MERGE: &[ResolutionStrategy] = &[
    ResolutionStrategy::PreferLocal,
    ResolutionStrategy::PreferRemote,
    ResolutionStrategy::Merge,
    ResolutionStrategy::Manual,
];

/// The policy table.
pub fn policy_for(conflict_type: ConflictType) -> ConflictPolicy {
    use ResolutionStrategy::{Merge, PreferLocal, PreferRemote};

    let (risk, recommended, strategies) = match conflict_type {
        ConflictType::TitleMismatch => (RiskLevel::Low, Some(PreferLocal), PICK),
        ConflictType::DescriptionMismatch => (RiskLevel::Medium, Some(Merge), PICK_OR_MERGE),
        ConflictType::StatusMismatch => (RiskLevel::Medium, Some(PreferLocal), PICK),
        ConflictType::AssigneeMismatch => (RiskLevel::Low, Some(PreferRemote), PICK),
        ConflictType::LabelMismatch => (RiskLevel::Low, Some(Merge), PICK_OR_MERGE),
        ConflictType::DeletedOnGithub | ConflictType::DeletedLocally => (RiskLevel::High, None, PICK),
    };
    ConflictPolicy {
        risk,
        recommended,
        strategies,
    }
}

/// How the two sides of a field differ.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldChange {
    /// Line diff of free text
    Text {
        /// Lines from local to remote
        lines: Vec<DiffLine>,
    },
    /// Set comparison of a list
    List(ListDiff),
    /// Scalar or enum values
    Value {
        /// Local value
        local: FieldValue,
        /// Remote value
        remote: FieldValue,
    },
    /// One side no longer exists
    Presence {
        /// Task exists
        local_exists: bool,
        /// Issue exists
        remote_exists: bool,
    },
}

/// Diff of one field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDiff {
    /// Field name
    pub field: String,
    /// The difference
    pub change: FieldChange,
}

/// Result of analyzing a conflict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictAnalysis {
    /// Task id
    pub task_id: String,
    /// Issue number
    pub issue_number: u64,
    /// Conflict type
    pub conflict_type: ConflictType,
    /// Phase after analysis
    pub phase: ConflictPhase,
    /// Offered strategies
    pub strategies: Vec<ResolutionStrategy>,
    /// Recommended strategy
    pub recommended: Option<ResolutionStrategy>,
    /// Risk
    pub risk: RiskLevel,
    /// Safe to resolve without asking
    pub auto_resolvable: bool,
    /// Field diffs
    pub diffs: Vec<FieldDiff>,
}

/// Identifies an unresolved conflict.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConflictKey {
    /// Task id
    pub task_id: String,
    /// Conflict type
    pub conflict_type: ConflictType,
}

impl ConflictKey {
    /// Key for a task and type.
    pub fn new(task_id: impl Into<String>, conflict_type: ConflictType) -> Self {
        Self {
            task_id: task_id.into(),
            conflict_type,
        }
    }

    /// Key of an existing conflict.
    pub fn of(conflict: &SyncConflict) -> Self {
        Self::new(conflict.task_id.clone(), conflict.conflict_type)
    }

    /// Whether `conflict` is the unresolved conflict this key names.
    pub fn matches(&self, conflict: &SyncConflict) -> bool {
        !conflict.resolved && conflict.task_id == self.task_id && conflict.conflict_type == self.conflict_type
    }
}

impl fmt::Display for ConflictKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.task_id, self.conflict_type)
    }
}

fn field_name(conflict_type: ConflictType) -> &'static str {
    match conflict_type {
        ConflictType::TitleMismatch => "title",
        ConflictType::DescriptionMismatch => "description",
        ConflictType::StatusMismatch => "status",
        ConflictType::AssigneeMismatch => "assignee",
        ConflictType::LabelMismatch => "labels",
        ConflictType::DeletedOnGithub | ConflictType::DeletedLocally => "existence",
    }
}

fn field_change(conflict: &SyncConflict) -> FieldChange {
    match (conflict.conflict_type, &conflict.local_value, &conflict.remote_value) {
        (ConflictType::DeletedOnGithub, ..) => FieldChange::Presence {
            local_exists: true,
            remote_exists: false,
        },
        (ConflictType::DeletedLocally, ..) => FieldChange::Presence {
            local_exists: false,
            remote_exists: true,
        },
        (ConflictType::TitleMismatch | ConflictType::DescriptionMismatch, FieldValue::Text(l), FieldValue::Text(r)) => {
            FieldChange::Text {
                lines: diff_lines(l, r),
            }
        }
        (_, FieldValue::List(l), FieldValue::List(r)) => FieldChange::List(diff_lists(l, r)),
        (_, local, remote) => FieldChange::Value {
            local: local.clone(),
            remote: remote.clone(),
        },
    }
}

/// Analyze a detected conflict.
pub fn analyze(conflict: &SyncConflict) -> ConflictAnalysis {
    let policy = policy_for(conflict.conflict_type);
    ConflictAnalysis {
        task_id: conflict.task_id.clone(),
        issue_number: conflict.issue_number,
        conflict_type: conflict.conflict_type,
        phase: ConflictPhase::Analyzed,
        strategies: policy.strategies.to_vec(),
        recommended: policy.recommended,
        risk: policy.risk,
        auto_resolvable: policy.risk != RiskLevel::High && policy.recommended.is_some(),
        diffs: vec![FieldDiff {
            field: field_name(conflict.conflict_type).to_string(),
            change: field_change(conflict),
        }],
    }
}
