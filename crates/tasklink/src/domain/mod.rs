//! Domain types for task tracking.
//!
//! This module contains the local task model that tasklink stores in
//! `.tasklink/tasks.json` and synchronizes with GitHub issues.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Separator between a parent task id and a subtask id in a sync unit id.
pub const SUBTASK_ID_SEPARATOR: char = '.';

/// A locally tracked task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Unique identifier for the task
    pub id: String,

    /// Task title
    pub title: String,

    /// Task description
    #[serde(default)]
    pub description: String,

    /// Implementation details (optional)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,

    /// Current status
    #[serde(default)]
    pub status: TaskStatus,

    /// Priority level
    #[serde(default)]
    pub priority: Priority,

    /// Ids of tasks this task depends on
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// Labels
    #[serde(default)]
    pub labels: Vec<String>,

    /// Assignee (optional)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,

    /// Subtasks
    #[serde(default)]
    pub subtasks: Vec<Subtask>,

    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Create a pending, medium-priority task with no description.
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            details: None,
            status: TaskStatus::Pending,
            priority: Priority::Medium,
            dependencies: Vec::new(),
            labels: Vec::new(),
            assignee: None,
            subtasks: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    /// Whether the task maps onto a closed issue.
    pub fn is_closed(&self) -> bool {
        self.status.is_closed()
    }

    /// Stamp `updated_at` with the current time.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Build the standalone sync unit for one of this task's subtasks.
    ///
    /// The unit id is `{parent}.{sub}`; it inherits priority, labels and
    /// assignee from the parent and depends on the parent.
    pub fn subtask_unit(&self, subtask: &Subtask) -> Task {
        Task {
            id: subtask_unit_id(&self.id, subtask.id),
            title: subtask.title.clone(),
            description: subtask.description.clone(),
            details: None,
            status: subtask.status,
            priority: self.priority,
            dependencies: vec![self.id.clone()],
            labels: self.labels.clone(),
            assignee: self.assignee.clone(),
            subtasks: Vec::new(),
            updated_at: self.updated_at,
        }
    }
}

/// Format the sync unit id of a subtask.
pub fn subtask_unit_id(parent_id: &str, subtask_id: u32) -> String {
    format!("{parent_id}{SUBTASK_ID_SEPARATOR}{subtask_id}")
}

/// Split a sync unit id into `(parent_id, subtask_id)` if it names a subtask.
pub fn parse_subtask_unit_id(unit_id: &str) -> Option<(&str, u32)> {
    let (parent, sub) = unit_id.rsplit_once(SUBTASK_ID_SEPARATOR)?;
    if parent.is_empty() {
        return None;
    }
    sub.parse().ok().map(|sub| (parent, sub))
}

/// A checklist item inside a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subtask {
    /// Identifier, unique within the parent task
    pub id: u32,

    /// Subtask title
    pub title: String,

    /// Subtask description
    #[serde(default)]
    pub description: String,

    /// Current status
    #[serde(default)]
    pub status: TaskStatus,
}

/// Status of a task
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    /// Not started
    #[default]
    Pending,

    /// Currently being worked on
    InProgress,

    /// Waiting for review
    Review,

    /// Completed
    Done,

    /// Postponed
    Deferred,

    /// Will not be done
    Cancelled,
}

impl TaskStatus {
    /// Done and cancelled tasks correspond to closed issues.
    pub fn is_closed(self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Cancelled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in-progress",
            TaskStatus::Review => "review",
            TaskStatus::Done => "done",
            TaskStatus::Deferred => "deferred",
            TaskStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('_', "-").as_str() {
            "pending" => Ok(TaskStatus::Pending),
            "in-progress" => Ok(TaskStatus::InProgress),
            "review" => Ok(TaskStatus::Review),
            "done" => Ok(TaskStatus::Done),
            "deferred" => Ok(TaskStatus::Deferred),
            "cancelled" | "canceled" => Ok(TaskStatus::Cancelled),
            other => Err(format!("unknown task status '{other}'")),
        }
    }
}

/// Priority of a task
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Urgent
    High,

    /// Normal
    #[default]
    Medium,

    /// Whenever
    Low,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        };
        write!(f, "{s}")
    }
}

/// On-disk layout of `tasks.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskFile {
    /// Format version
    pub version: u32,

    /// All tasks
    #[serde(default)]
    pub tasks: Vec<Task>,
}

impl TaskFile {
    /// Current format version.
    pub const VERSION: u32 = 1;

    /// Look up a task by id.
    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// Look up a task by id for modification.
    pub fn get_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }
}

impl Default for TaskFile {
    fn default() -> Self {
        Self {
            version: Self::VERSION,
            tasks: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_task_json_uses_camel_case() {
        let mut task = Task::new("7", "Write docs");
        task.status = TaskStatus::InProgress;

        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["status"], "in-progress");
        assert!(json.get("updatedAt").is_some());
        assert!(json.get("details").is_none());
    }

    #[test]
    fn test_task_deserializes_with_defaults() {
        let task: Task = serde_json::from_str(
            r#"{"id":"1","title":"Setup","updatedAt":"2024-05-01T10:00:00Z"}"#,
        )
        .unwrap();

        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.priority, Priority::Medium);
        assert!(task.subtasks.is_empty());
    }

    #[rstest]
    #[case(TaskStatus::Done, true)]
    #[case(TaskStatus::Cancelled, true)]
    #[case(TaskStatus::Review, false)]
    #[case(TaskStatus::Deferred, false)]
    fn test_status_closed(#[case] status: TaskStatus, #[case] closed: bool) {
        assert_eq!(status.is_closed(), closed);
    }

    #[test]
    fn test_subtask_unit_inherits_from_parent() {
        let mut parent = Task::new("4", "Parent");
        parent.labels = vec!["backend".to_string()];
        let sub = Subtask {
            id: 2,
            title: "Child".to_string(),
            description: "do it".to_string(),
            status: TaskStatus::Done,
        };

        let unit = parent.subtask_unit(&sub);
        assert_eq!(unit.id, "4.2");
        assert_eq!(unit.dependencies, vec!["4".to_string()]);
        assert_eq!(unit.labels, parent.labels);
        assert!(unit.is_closed());
    }

    #[rstest]
    #[case("in_progress", TaskStatus::InProgress)]
    #[case("Done", TaskStatus::Done)]
    #[case("canceled", TaskStatus::Cancelled)]
    fn test_status_from_str(#[case] input: &str, #[case] expected: TaskStatus) {
        assert_eq!(input.parse::<TaskStatus>().unwrap(), expected);
    }

    #[test]
    fn test_status_from_str_rejects_unknown() {
        assert!("open".parse::<TaskStatus>().is_err());
    }

    #[rstest]
    #[case("4.2", Some(("4", 2)))]
    #[case("a.b.3", Some(("a.b", 3)))]
    #[case("4", None)]
    #[case("4.x", None)]
    #[case(".2", None)]
    fn test_parse_subtask_unit_id(#[case] input: &str, #[case] expected: Option<(&str, u32)>) {
        assert_eq!(parse_subtask_unit_id(input), expected);
    }
}
