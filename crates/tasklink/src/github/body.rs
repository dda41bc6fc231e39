//! Issue body rendering.
//!
//! The task description is the first part of the body. Everything tasklink
//! generates (details, subtask checklist, dependency links, the task id
//! marker) follows a marker comment, so the description can be recovered
//! from a body edited on GitHub.

use crate::config::SubtaskMode;
use crate::domain::Task;
use std::collections::HashMap;
use std::fmt::Write as _;

/// Line separating the user-editable description from generated sections.
pub const GENERATED_MARKER: &str = "<!-- tasklink:generated -->";

/// Render the issue body for a sync unit.
///
/// `issue_numbers` maps task ids to already-linked issue numbers so
/// dependencies render as issue references.
pub fn render_issue_body(
    task: &Task,
    subtask_mode: SubtaskMode,
    issue_numbers: &HashMap<String, u64>,
) -> String {
    let mut body = task.description.trim_end().to_string();
    body.push_str("\n\n");
    body.push_str(GENERATED_MARKER);
    body.push('\n');

    if let Some(details) = task.details.as_deref().filter(|d| !d.trim().is_empty()) {
        let _ = write!(body, "\n### Details\n\n{}\n", details.trim_end());
    }

    if subtask_mode == SubtaskMode::Checklist && !task.subtasks.is_empty() {
        body.push_str("\n### Subtasks\n\n");
        for sub in &task.subtasks {
            let mark = if sub.status.is_closed() { 'x' } else { ' ' };
            let _ = writeln!(body, "- [{mark}] {}.{} {}", task.id, sub.id, sub.title);
        }
    }

    if !task.dependencies.is_empty() {
        body.push_str("\n### Dependencies\n\n");
        for dep in &task.dependencies {
            match issue_numbers.get(dep) {
                Some(number) => {
                    let _ = writeln!(body, "- #{number} (task {dep})");
                }
                None => {
                    let _ = writeln!(body, "- task {dep} (not synced)");
                }
            }
        }
    }

    let _ = write!(
        body,
        "\n<!-- tasklink:task-id={} priority={} -->\n",
        task.id, task.priority
    );
    body
}

/// Recover the description part of an issue body.
///
/// Bodies without the marker (created outside tasklink) are returned whole.
pub fn extract_description(body: &str) -> String {
    let normalized = body.replace("\r\n", "\n");
    match normalized.find(GENERATED_MARKER) {
        Some(idx) => normalized[..idx].trim_end().to_string(),
        None => normalized.trim_end().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Subtask, TaskStatus};

    fn sample_task() -> Task {
        let mut task = Task::new("3", "Build API");
        task.description = "Expose the REST endpoints.\nWith auth.".to_string();
        task.dependencies = vec!["1".to_string(), "2".to_string()];
        task.subtasks = vec![
            Subtask {
                id: 1,
                title: "Routes".to_string(),
                description: String::new(),
                status: TaskStatus::Done,
            },
            Subtask {
                id: 2,
                title: "Auth".to_string(),
                description: String::new(),
                status: TaskStatus::Pending,
            },
        ];
        task
    }

    #[test]
    fn test_render_includes_checklist_and_dependencies() {
        let numbers = HashMap::from([("1".to_string(), 41)]);
        let body = render_issue_body(&sample_task(), SubtaskMode::Checklist, &numbers);

        assert!(body.starts_with("Expose the REST endpoints.\nWith auth."));
        assert!(body.contains("- [x] 3.1 Routes"));
        assert!(body.contains("- [ ] 3.2 Auth"));
        assert!(body.contains("- #41 (task 1)"));
        assert!(body.contains("- task 2 (not synced)"));
        assert!(body.contains("tasklink:task-id=3"));
    }

    #[test]
    fn test_separate_issue_mode_omits_checklist() {
        let body = render_issue_body(&sample_task(), SubtaskMode::SeparateIssues, &HashMap::new());
        assert!(!body.contains("### Subtasks"));
    }

    #[test]
    fn test_extract_description_round_trips() {
        let task = sample_task();
        let body = render_issue_body(&task, SubtaskMode::Checklist, &HashMap::new());
        assert_eq!(extract_description(&body), task.description);
    }

    #[test]
    fn test_extract_description_without_marker() {
        assert_eq!(extract_description("Written on GitHub\r\n"), "Written on GitHub");
    }
}
