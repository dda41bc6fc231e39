//! GitHub REST API client.

use super::{IssueDraft, IssueState, IssueTracker, Milestone, RateLimitStatus, RemoteIssue, RepoAccess};
use crate::config::GitHubConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, HeaderValue, USER_AGENT};
use reqwest::{RequestBuilder, Response};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, warn};

/// Attempts per request, including the first.
pub const MAX_ATTEMPTS: u32 = 3;

/// Delay before the first retry; doubles on each further retry.
pub const RETRY_BASE_DELAY: Duration = Duration::from_millis(250);

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const PAGE_SIZE: usize = 100;
const MAX_ERROR_BODY: usize = 300;

/// [`IssueTracker`] backed by the GitHub REST API.
#[derive(Clone)]
pub struct GitHubClient {
    http: reqwest::Client,
    api_base: String,
    owner: String,
    repo: String,
}

impl std::fmt::Debug for GitHubClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitHubClient")
            .field("api_base", &self.api_base)
            .field("owner", &self.owner)
            .field("repo", &self.repo)
            .finish_non_exhaustive()
    }
}

impl GitHubClient {
    /// Build a client for the configured repository.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the token cannot be used as a header value
    /// or the HTTP client cannot be created.
    pub fn new(config: &GitHubConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("tasklink/", env!("CARGO_PKG_VERSION"))),
        );
        headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.github+json"));
        headers.insert("x-github-api-version", HeaderValue::from_static("2022-11-28"));
        let auth = HeaderValue::from_str(&format!("Bearer {}", config.token.trim()))
            .map_err(|e| Error::Config(format!("invalid GitHub token: {e}")))?;
        headers.insert(AUTHORIZATION, auth);

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Config(format!("failed to create GitHub client: {e}")))?;

        Ok(Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            owner: config.owner.clone(),
            repo: config.repo.clone(),
        })
    }

    fn repo_url(&self, path: &str) -> String {
        format!("{}/repos/{}/{}{}", self.api_base, self.owner, self.repo, path)
    }

    /// Send a request, retrying transient failures with exponential backoff.
    async fn send<F>(&self, operation: &str, build: F) -> Result<Response>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let error = match build().send().await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => error_from_response(response).await,
                Err(e) => Error::Network(format!("{operation} request failed: {e}")),
            };

            if attempt < MAX_ATTEMPTS && error.is_transient() {
                let delay = retry_delay(attempt);
                warn!(operation, attempt, ?delay, error = %error, "Retrying GitHub request");
                tokio::time::sleep(delay).await;
                continue;
            }
            return Err(error);
        }
    }

    async fn request_json<T, F>(&self, operation: &str, build: F) -> Result<T>
    where
        T: DeserializeOwned,
        F: Fn() -> RequestBuilder,
    {
        let response = self.send(operation, build).await?;
        let status = response.status().as_u16();
        response.json::<T>().await.map_err(|e| Error::Remote {
            status,
            message: format!("failed to decode {operation} response: {e}"),
        })
    }

    async fn get_paginated<T>(&self, operation: &str, path: &str) -> Result<Vec<T>>
    where
        T: DeserializeOwned,
    {
        let url = self.repo_url(path);
        let mut page = 1_u32;
        let mut rows = Vec::new();
        loop {
            let page_str = page.to_string();
            let per_page = PAGE_SIZE.to_string();
            let chunk: Vec<T> = self
                .request_json(operation, || {
                    self.http
                        .get(&url)
                        .query(&[("per_page", per_page.as_str()), ("page", page_str.as_str())])
                })
                .await?;
            let len = chunk.len();
            rows.extend(chunk);
            if len < PAGE_SIZE {
                break;
            }
            page += 1;
        }
        Ok(rows)
    }
}

#[async_trait]
impl IssueTracker for GitHubClient {
    async fn get_issue(&self, number: u64) -> Result<Option<RemoteIssue>> {
        let url = self.repo_url(&format!("/issues/{number}"));
        match self
            .request_json::<WireIssue, _>("get issue", || self.http.get(&url))
            .await
        {
            Ok(issue) if issue.pull_request.is_some() => {
                warn!(number, "Mapped issue number is a pull request; treating as missing");
                Ok(None)
            }
            Ok(issue) => Ok(Some(issue.into())),
            // 410 Gone is returned for deleted issues
            Err(Error::Remote { status: 404 | 410, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create_issue(&self, draft: &IssueDraft) -> Result<RemoteIssue> {
        let url = self.repo_url("/issues");
        // The create endpoint does not accept a state.
        let create = IssueDraft {
            state: None,
            ..draft.clone()
        };
        let issue: WireIssue = self
            .request_json("create issue", || self.http.post(&url).json(&create))
            .await?;
        debug!(number = issue.number, "Created GitHub issue");

        if draft.state == Some(IssueState::Closed) {
            let close = IssueDraft {
                state: Some(IssueState::Closed),
                ..create
            };
            return self.update_issue(issue.number, &close).await;
        }
        Ok(issue.into())
    }

    async fn update_issue(&self, number: u64, draft: &IssueDraft) -> Result<RemoteIssue> {
        let url = self.repo_url(&format!("/issues/{number}"));
        let issue: WireIssue = self
            .request_json("update issue", || self.http.patch(&url).json(draft))
            .await?;
        debug!(number, "Updated GitHub issue");
        Ok(issue.into())
    }

    async fn list_labels(&self) -> Result<Vec<String>> {
        let labels: Vec<WireLabel> = self.get_paginated("list labels", "/labels").await?;
        Ok(labels.into_iter().map(|l| l.name).collect())
    }

    async fn list_assignees(&self) -> Result<Vec<String>> {
        let users: Vec<WireUser> = self.get_paginated("list assignees", "/assignees").await?;
        Ok(users.into_iter().map(|u| u.login).collect())
    }

    async fn list_milestones(&self) -> Result<Vec<Milestone>> {
        let milestones: Vec<WireMilestone> =
            self.get_paginated("list milestones", "/milestones").await?;
        Ok(milestones
            .into_iter()
            .map(|m| Milestone {
                number: m.number,
                title: m.title,
            })
            .collect())
    }

    async fn rate_limit(&self) -> Result<RateLimitStatus> {
        #[derive(Deserialize)]
        struct Body {
            resources: Resources,
        }
        #[derive(Deserialize)]
        struct Resources {
            core: Core,
        }
        #[derive(Deserialize)]
        struct Core {
            limit: u32,
            remaining: u32,
            reset: i64,
        }

        let url = format!("{}/rate_limit", self.api_base);
        let body: Body = self
            .request_json("rate limit", || self.http.get(&url))
            .await?;
        let core = body.resources.core;
        Ok(RateLimitStatus {
            limit: core.limit,
            remaining: core.remaining,
            reset_at: DateTime::from_timestamp(core.reset, 0).unwrap_or_else(Utc::now),
        })
    }

    async fn verify_access(&self) -> Result<RepoAccess> {
        #[derive(Deserialize)]
        struct Repo {
            full_name: String,
            #[serde(default)]
            permissions: Option<Permissions>,
        }
        #[derive(Deserialize)]
        struct Permissions {
            #[serde(default)]
            push: bool,
        }

        let url = self.repo_url("");
        let repo: Repo = self
            .request_json("verify access", || self.http.get(&url))
            .await?;
        Ok(RepoAccess {
            full_name: repo.full_name,
            can_push: repo.permissions.is_some_and(|p| p.push),
        })
    }
}

/// Backoff delay before retry number `attempt` (1-based).
pub fn retry_delay(attempt: u32) -> Duration {
    RETRY_BASE_DELAY.saturating_mul(1 << attempt.saturating_sub(1).min(16))
}

async fn error_from_response(response: Response) -> Error {
    let status = response.status().as_u16();
    let headers = response.headers().clone();
    let body = response.text().await.unwrap_or_default();
    classify_status(status, &headers, &body, Utc::now())
}

/// Map a non-success HTTP response onto the error taxonomy.
pub fn classify_status(status: u16, headers: &HeaderMap, body: &str, now: DateTime<Utc>) -> Error {
    let message = api_message(body);
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    let reset_header = header("x-ratelimit-reset")
        .and_then(|v| v.trim().parse::<i64>().ok())
        .and_then(|secs| DateTime::from_timestamp(secs, 0));

    match status {
        401 => Error::Authentication(message),
        403 if header("x-ratelimit-remaining").is_some_and(|v| v.trim() == "0") => {
            Error::RateLimited {
                reset_at: reset_header,
            }
        }
        429 => {
            let retry_after = header("retry-after")
                .and_then(|v| v.trim().parse::<i64>().ok())
                .map(|secs| now + TimeDelta::seconds(secs));
            Error::RateLimited {
                reset_at: retry_after.or(reset_header),
            }
        }
        403 => Error::Authorization(message),
        422 => Error::Validation(format!("GitHub rejected the request: {message}")),
        500..=599 => Error::Network(format!("GitHub returned {status}: {message}")),
        _ => Error::Remote { status, message },
    }
}

fn api_message(body: &str) -> String {
    #[derive(Deserialize)]
    struct ApiError {
        message: String,
    }

    match serde_json::from_str::<ApiError>(body) {
        Ok(err) => err.message,
        Err(_) => body.chars().take(MAX_ERROR_BODY).collect(),
    }
}

#[derive(Debug, Deserialize)]
struct WireIssue {
    number: u64,
    title: String,
    #[serde(default)]
    body: Option<String>,
    state: IssueState,
    #[serde(default)]
    labels: Vec<WireLabel>,
    #[serde(default)]
    assignees: Vec<WireUser>,
    #[serde(default)]
    milestone: Option<WireMilestone>,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    html_url: String,
    #[serde(default)]
    pull_request: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct WireLabel {
    name: String,
}

#[derive(Debug, Deserialize)]
struct WireUser {
    login: String,
}

#[derive(Debug, Deserialize)]
struct WireMilestone {
    number: u64,
    title: String,
}

impl From<WireIssue> for RemoteIssue {
    fn from(wire: WireIssue) -> Self {
        RemoteIssue {
            number: wire.number,
            title: wire.title,
            body: wire.body.unwrap_or_default(),
            state: wire.state,
            labels: wire.labels.into_iter().map(|l| l.name).collect(),
            assignees: wire.assignees.into_iter().map(|u| u.login).collect(),
            milestone: wire.milestone.map(|m| m.title),
            updated_at: wire.updated_at,
            html_url: wire.html_url,
        }
    }
}
