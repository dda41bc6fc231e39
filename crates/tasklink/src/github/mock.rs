//! In-memory [`IssueTracker`] for tests.

use super::{IssueDraft, IssueState, IssueTracker, Milestone, RateLimitStatus, RemoteIssue, RepoAccess};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// A call received by [`MockTracker`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerCall {
    /// `get_issue(number)`
    GetIssue(u64),
    /// `create_issue` with the draft title
    CreateIssue(String),
    /// `update_issue(number)`
    UpdateIssue(u64),
    /// `list_labels`
    ListLabels,
    /// `list_assignees`
    ListAssignees,
    /// `list_milestones`
    ListMilestones,
    /// `rate_limit`
    RateLimit,
    /// `verify_access`
    VerifyAccess,
}

#[derive(Default)]
struct MockState {
    issues: BTreeMap<u64, RemoteIssue>,
    next_number: u64,
    calls: Vec<TrackerCall>,
    failures: HashMap<String, Error>,
    rate_remaining: u32,
}

/// Mock implementation of [`IssueTracker`] for testing.
///
/// Issues live in a map; every call is recorded so tests can assert that a
/// dry run made no remote calls, or that issues were created in dependency
/// order. Failures can be injected per task title with
/// [`fail_create`](Self::fail_create).
pub struct MockTracker {
    state: Mutex<MockState>,
}

impl Default for MockTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTracker {
    /// Empty tracker with a full rate limit.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                next_number: 1,
                rate_remaining: 5000,
                ..MockState::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert an issue as if it had been created on GitHub directly.
    pub fn seed_issue(&self, title: &str) -> RemoteIssue {
        let mut state = self.lock();
        let number = state.next_number;
        state.next_number += 1;
        let issue = RemoteIssue {
            number,
            title: title.to_string(),
            body: String::new(),
            state: IssueState::Open,
            labels: Vec::new(),
            assignees: Vec::new(),
            milestone: None,
            updated_at: Utc::now(),
            html_url: format!("https://github.com/mock/repo/issues/{number}"),
        };
        state.issues.insert(number, issue.clone());
        issue
    }

    /// Change an issue as a GitHub user would, bumping `updated_at`.
    pub fn edit_issue(&self, number: u64, edit: impl FnOnce(&mut RemoteIssue)) {
        let mut state = self.lock();
        if let Some(issue) = state.issues.get_mut(&number) {
            edit(issue);
            issue.updated_at = issue.updated_at.max(Utc::now()) + TimeDelta::seconds(1);
        }
    }

    /// Delete an issue on the remote side.
    pub fn delete_issue(&self, number: u64) {
        self.lock().issues.remove(&number);
    }

    /// Current copy of an issue.
    pub fn issue(&self, number: u64) -> Option<RemoteIssue> {
        self.lock().issues.get(&number).cloned()
    }

    /// All issues ordered by number.
    pub fn issues(&self) -> Vec<RemoteIssue> {
        self.lock().issues.values().cloned().collect()
    }

    /// Calls received so far.
    pub fn calls(&self) -> Vec<TrackerCall> {
        self.lock().calls.clone()
    }

    /// Make `create_issue` fail for drafts with this title.
    pub fn fail_create(&self, title: &str, error: Error) {
        self.lock().failures.insert(title.to_string(), error);
    }

    /// Set the remaining rate limit.
    pub fn set_rate_remaining(&self, remaining: u32) {
        self.lock().rate_remaining = remaining;
    }
}

fn apply_draft(issue: &mut RemoteIssue, draft: &IssueDraft) {
    issue.title.clone_from(&draft.title);
    issue.body.clone_from(&draft.body);
    issue.labels.clone_from(&draft.labels);
    if let Some(assignees) = &draft.assignees {
        issue.assignees.clone_from(assignees);
    }
    if let Some(state) = draft.state {
        issue.state = state;
    }
    issue.updated_at = Utc::now();
}

#[async_trait]
impl IssueTracker for MockTracker {
    async fn get_issue(&self, number: u64) -> Result<Option<RemoteIssue>> {
        let mut state = self.lock();
        state.calls.push(TrackerCall::GetIssue(number));
        Ok(state.issues.get(&number).cloned())
    }

    async fn create_issue(&self, draft: &IssueDraft) -> Result<RemoteIssue> {
        let mut state = self.lock();
        state.calls.push(TrackerCall::CreateIssue(draft.title.clone()));
        if let Some(error) = state.failures.remove(&draft.title) {
            return Err(error);
        }
        let number = state.next_number;
        state.next_number += 1;
        let mut issue = RemoteIssue {
            number,
            title: String::new(),
            body: String::new(),
            state: IssueState::Open,
            labels: Vec::new(),
            assignees: Vec::new(),
            milestone: None,
            updated_at: Utc::now(),
            html_url: format!("https://github.com/mock/repo/issues/{number}"),
        };
        apply_draft(&mut issue, draft);
        state.issues.insert(number, issue.clone());
        Ok(issue)
    }

    async fn update_issue(&self, number: u64, draft: &IssueDraft) -> Result<RemoteIssue> {
        let mut state = self.lock();
        state.calls.push(TrackerCall::UpdateIssue(number));
        let issue = state.issues.get_mut(&number).ok_or_else(|| Error::Remote {
            status: 404,
            message: format!("issue #{number} not found"),
        })?;
        apply_draft(issue, draft);
        Ok(issue.clone())
    }

    async fn list_labels(&self) -> Result<Vec<String>> {
        let mut state = self.lock();
        state.calls.push(TrackerCall::ListLabels);
        let mut labels: Vec<String> = state
            .issues
            .values()
            .flat_map(|i| i.labels.iter().cloned())
            .collect();
        labels.sort();
        labels.dedup();
        Ok(labels)
    }

    async fn list_assignees(&self) -> Result<Vec<String>> {
        self.lock().calls.push(TrackerCall::ListAssignees);
        Ok(vec!["octocat".to_string()])
    }

    async fn list_milestones(&self) -> Result<Vec<Milestone>> {
        self.lock().calls.push(TrackerCall::ListMilestones);
        Ok(Vec::new())
    }

    async fn rate_limit(&self) -> Result<RateLimitStatus> {
        let mut state = self.lock();
        state.calls.push(TrackerCall::RateLimit);
        Ok(RateLimitStatus {
            limit: 5000,
            remaining: state.rate_remaining,
            reset_at: Utc::now() + TimeDelta::hours(1),
        })
    }

    async fn verify_access(&self) -> Result<RepoAccess> {
        self.lock().calls.push(TrackerCall::VerifyAccess);
        Ok(RepoAccess {
            full_name: "mock/repo".to_string(),
            can_push: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_then_get() {
        let tracker = MockTracker::new();
        let draft = IssueDraft {
            title: "New".to_string(),
            labels: vec!["bug".to_string()],
            ..IssueDraft::default()
        };

        let created = tracker.create_issue(&draft).await.unwrap();
        let fetched = tracker.get_issue(created.number).await.unwrap().unwrap();

        assert_eq!(fetched.title, "New");
        assert_eq!(
            tracker.calls(),
            vec![
                TrackerCall::CreateIssue("New".to_string()),
                TrackerCall::GetIssue(created.number)
            ]
        );
    }

    #[tokio::test]
    async fn test_deleted_issue_is_none() {
        let tracker = MockTracker::new();
        let issue = tracker.seed_issue("Gone");
        tracker.delete_issue(issue.number);

        assert!(tracker.get_issue(issue.number).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_injected_failure_fires_once() {
        let tracker = MockTracker::new();
        tracker.fail_create("Flaky", Error::Network("reset".into()));
        let draft = IssueDraft {
            title: "Flaky".to_string(),
            ..IssueDraft::default()
        };

        assert!(tracker.create_issue(&draft).await.is_err());
        assert!(tracker.create_issue(&draft).await.is_ok());
    }
}
