//! Field diffs and merges used by conflict analysis and resolution.
//!
//! Text is compared line by line with a longest-common-subsequence table;
//! lists are compared as sets.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// What happened to a line between the local and remote text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineOp {
    /// Present on both sides
    Context,
    /// Only on the remote side
    Add,
    /// Only on the local side
    Remove,
}

/// One line of a text diff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffLine {
    /// Operation
    pub op: LineOp,
    /// Line content without the newline
    pub content: String,
}

/// Set comparison of two lists.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListDiff {
    /// Only on the remote side
    pub added: Vec<String>,
    /// Only on the local side
    pub removed: Vec<String>,
    /// On both sides
    pub common: Vec<String>,
}

#[derive(Debug, PartialEq)]
enum EditOp {
    Equal(usize),
    Insert(usize),
    Delete(usize),
}

fn lcs_table(old: &[&str], new: &[&str]) -> Vec<Vec<usize>> {
    let mut table = vec![vec![0usize; new.len() + 1]; old.len() + 1];
    for i in 1..=old.len() {
        for j in 1..=new.len() {
            table[i][j] = if old[i - 1] == new[j - 1] {
                table[i - 1][j - 1] + 1
            } else {
                table[i - 1][j].max(table[i][j - 1])
            };
        }
    }
    table
}

/// Edit script from `old` to `new`, in forward order.
fn edit_script(old: &[&str], new: &[&str]) -> Vec<EditOp> {
    let table = lcs_table(old, new);
    let mut ops = Vec::with_capacity(old.len() + new.len());
    let (mut i, mut j) = (old.len(), new.len());

    while i > 0 || j > 0 {
        if i > 0 && j > 0 && old[i - 1] == new[j - 1] {
            ops.push(EditOp::Equal(i - 1));
            i -= 1;
            j -= 1;
        } else if j > 0 && (i == 0 || table[i][j - 1] >= table[i - 1][j]) {
            ops.push(EditOp::Insert(j - 1));
            j -= 1;
        } else {
            ops.push(EditOp::Delete(i - 1));
            i -= 1;
        }
    }

    ops.reverse();
    ops
}

fn split_lines(text: &str) -> Vec<&str> {
    if text.is_empty() {
        Vec::new()
    } else {
        text.lines().collect()
    }
}

/// Line diff from `local` to `remote`.
pub fn diff_lines(local: &str, remote: &str) -> Vec<DiffLine> {
    let old = split_lines(local);
    let new = split_lines(remote);
    edit_script(&old, &new)
        .into_iter()
        .map(|op| match op {
            EditOp::Equal(i) => DiffLine {
                op: LineOp::Context,
                content: old[i].to_string(),
            },
            EditOp::Insert(j) => DiffLine {
                op: LineOp::Add,
                content: new[j].to_string(),
            },
            EditOp::Delete(i) => DiffLine {
                op: LineOp::Remove,
                content: old[i].to_string(),
            },
        })
        .collect()
}

/// Merge two texts by taking the union of their lines.
///
/// Common lines appear once; within each changed region local-only lines
/// come before remote-only lines.
pub fn merge_lines(local: &str, remote: &str) -> String {
    let mut merged: Vec<String> = Vec::new();
    let mut added: Vec<String> = Vec::new();

    for line in diff_lines(local, remote) {
        match line.op {
            LineOp::Context => {
                merged.append(&mut added);
                merged.push(line.content);
            }
            LineOp::Remove => merged.push(line.content),
            LineOp::Add => added.push(line.content),
        }
    }
    merged.append(&mut added);
    merged.join("\n")
}

/// Compare two lists as sets. Output vectors are sorted.
pub fn diff_lists(local: &[String], remote: &[String]) -> ListDiff {
    let local: BTreeSet<&String> = local.iter().collect();
    let remote: BTreeSet<&String> = remote.iter().collect();
    ListDiff {
        added: remote.difference(&local).map(|s| (*s).clone()).collect(),
        removed: local.difference(&remote).map(|s| (*s).clone()).collect(),
        common: local.intersection(&remote).map(|s| (*s).clone()).collect(),
    }
}

/// Sorted, de-duplicated union of two lists.
pub fn merge_lists(local: &[String], remote: &[String]) -> Vec<String> {
    local
        .iter()
        .chain(remote)
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ops(diff: &[DiffLine]) -> Vec<LineOp> {
        diff.iter().map(|l| l.op).collect()
    }

    #[test]
    fn test_identical_text_is_all_context() {
        let diff = diff_lines("a\nb", "a\nb");
        assert_eq!(ops(&diff), vec![LineOp::Context, LineOp::Context]);
    }

    #[test]
    fn test_changed_line() {
        let diff = diff_lines("a\nb\nc", "a\nx\nc");
        assert_eq!(
            ops(&diff),
            vec![LineOp::Context, LineOp::Remove, LineOp::Add, LineOp::Context]
        );
        assert_eq!(diff[1].content, "b");
        assert_eq!(diff[2].content, "x");
    }

    #[test]
    fn test_empty_sides() {
        assert_eq!(ops(&diff_lines("", "a")), vec![LineOp::Add]);
        assert_eq!(ops(&diff_lines("a", "")), vec![LineOp::Remove]);
        assert!(diff_lines("", "").is_empty());
    }

    #[test]
    fn test_merge_keeps_both_sides_once() {
        let merged = merge_lines("intro\nlocal note\nend", "intro\nremote note\nend");
        assert_eq!(merged, "intro\nlocal note\nremote note\nend");
    }

    #[test]
    fn test_merge_of_equal_text_is_unchanged() {
        assert_eq!(merge_lines("same\ntext", "same\ntext"), "same\ntext");
    }

    #[test]
    fn test_list_diff_and_merge() {
        let local = vec!["bug".to_string(), "ui".to_string()];
        let remote = vec!["ui".to_string(), "urgent".to_string(), "bug".to_string()];

        let diff = diff_lists(&local, &remote);
        assert_eq!(diff.added, vec!["urgent".to_string()]);
        assert!(diff.removed.is_empty());
        assert_eq!(diff.common, vec!["bug".to_string(), "ui".to_string()]);

        assert_eq!(
            merge_lists(&local, &remote),
            vec!["bug".to_string(), "ui".to_string(), "urgent".to_string()]
        );
    }
}
