//! CLI value enums and their domain conversions.

use clap::ValueEnum;

use crate::sync::{BatchStrategy, ConflictType, ResolutionStrategy};

/// Conflict type for CLI arguments
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictTypeArg {
    /// Titles differ
    #[value(name = "title_mismatch", alias = "title")]
    TitleMismatch,
    /// Descriptions differ
    #[value(name = "description_mismatch", alias = "description")]
    DescriptionMismatch,
    /// Status and issue state disagree
    #[value(name = "status_mismatch", alias = "status")]
    StatusMismatch,
    /// Assignees differ
    #[value(name = "assignee_mismatch", alias = "assignee")]
    AssigneeMismatch,
    /// Labels differ
    #[value(name = "label_mismatch", alias = "labels")]
    LabelMismatch,
    /// The issue was deleted
    #[value(name = "deleted_on_github")]
    DeletedOnGithub,
    /// The task was deleted
    #[value(name = "deleted_locally")]
    DeletedLocally,
}

impl From<ConflictTypeArg> for ConflictType {
    fn from(arg: ConflictTypeArg) -> Self {
        match arg {
            ConflictTypeArg::TitleMismatch => ConflictType::TitleMismatch,
            ConflictTypeArg::DescriptionMismatch => ConflictType::DescriptionMismatch,
            ConflictTypeArg::StatusMismatch => ConflictType::StatusMismatch,
            ConflictTypeArg::AssigneeMismatch => ConflictType::AssigneeMismatch,
            ConflictTypeArg::LabelMismatch => ConflictType::LabelMismatch,
            ConflictTypeArg::DeletedOnGithub => ConflictType::DeletedOnGithub,
            ConflictTypeArg::DeletedLocally => ConflictType::DeletedLocally,
        }
    }
}

/// Resolution strategy for CLI arguments
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyArg {
    /// Keep the local value
    #[value(name = "prefer_local", alias = "local")]
    PreferLocal,
    /// Take the remote value
    #[value(name = "prefer_remote", alias = "remote")]
    PreferRemote,
    /// Combine both sides
    Merge,
    /// Use the value given with --value
    Manual,
}

impl From<StrategyArg> for ResolutionStrategy {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::PreferLocal => ResolutionStrategy::PreferLocal,
            StrategyArg::PreferRemote => ResolutionStrategy::PreferRemote,
            StrategyArg::Merge => ResolutionStrategy::Merge,
            StrategyArg::Manual => ResolutionStrategy::Manual,
        }
    }
}

/// Batch strategy for CLI arguments
#[derive(ValueEnum, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BatchStrategyArg {
    /// Each conflict's recommended strategy, skipping high-risk ones
    #[default]
    Recommended,
    /// Keep local values everywhere
    #[value(name = "prefer_local", alias = "local")]
    PreferLocal,
    /// Take remote values everywhere
    #[value(name = "prefer_remote", alias = "remote")]
    PreferRemote,
}

impl From<BatchStrategyArg> for BatchStrategy {
    fn from(arg: BatchStrategyArg) -> Self {
        match arg {
            BatchStrategyArg::Recommended => BatchStrategy::Recommended,
            BatchStrategyArg::PreferLocal => BatchStrategy::PreferLocal,
            BatchStrategyArg::PreferRemote => BatchStrategy::PreferRemote,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::title(ConflictTypeArg::TitleMismatch, ConflictType::TitleMismatch)]
    #[case::labels(ConflictTypeArg::LabelMismatch, ConflictType::LabelMismatch)]
    #[case::deleted(ConflictTypeArg::DeletedLocally, ConflictType::DeletedLocally)]
    fn test_conflict_type_conversion(#[case] arg: ConflictTypeArg, #[case] expected: ConflictType) {
        assert_eq!(ConflictType::from(arg), expected);
    }

    #[test]
    fn test_value_names_match_stored_names() {
        for arg in ConflictTypeArg::value_variants() {
            let name = arg.to_possible_value().unwrap().get_name().to_string();
            assert_eq!(name, ConflictType::from(*arg).as_str());
        }
    }
}
