use std::collections::{BTreeSet, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use snafu::{ResultExt, Snafu};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::USER_AGENT;
use crate::error::FmtCompact as _;
use crate::html::html_to_text;
use crate::retry::RetryPolicy;
use crate::types::{Problem, Submission};

const LOG_TARGET: &str = "studylog::source";

pub const LEETCODE_GRAPHQL_URL: &str = "https://leetcode.com/graphql";
const LEETCODE_REFERER: &str = "https://leetcode.com";

/// Bounds on how many raw submissions are requested to find `limit` unique
/// accepted problems.
const MIN_SUBMISSION_WINDOW: usize = 20;
const MAX_SUBMISSION_WINDOW: usize = 100;

const RECENT_SUBMISSIONS_QUERY: &str = r#"
query recentSubmissionList($username: String!, $limit: Int!) {
  recentSubmissionList(username: $username, limit: $limit) {
    title
    titleSlug
    timestamp
    statusDisplay
    lang
  }
}
"#;

const QUESTION_QUERY: &str = r#"
query question($titleSlug: String!) {
  question(titleSlug: $titleSlug) {
    title
    titleSlug
    difficulty
    content
    topicTags {
      name
    }
  }
}
"#;

#[derive(Debug, Snafu)]
pub enum SourceError {
    #[snafu(display("Could not build HTTP client: {source}"))]
    Client { source: reqwest::Error },
    #[snafu(display("Request to problem source failed: {source}"))]
    Http { source: reqwest::Error },
    #[snafu(display("Problem source answered with HTTP {status}"))]
    Status { status: StatusCode },
    #[snafu(display("Problem source reported: {message}"))]
    Graphql { message: String },
    #[snafu(display("Malformed payload for `{slug}`: {reason}"))]
    Malformed { slug: String, reason: String },
}

pub type SourceResult<T> = std::result::Result<T, SourceError>;

impl SourceError {
    pub fn is_retryable(&self) -> bool {
        match self {
            SourceError::Http { source } => !source.is_decode(),
            SourceError::Status { status } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            SourceError::Client { .. }
            | SourceError::Graphql { .. }
            | SourceError::Malformed { .. } => false,
        }
    }
}

/// Read-only access to an online judge
#[async_trait]
pub trait ProblemSource: Send + Sync {
    /// Raw submission history, most recent first. An unknown user has an
    /// empty history.
    async fn recent_submissions(
        &self,
        username: &str,
        window: usize,
    ) -> SourceResult<Vec<Submission>>;

    /// Statement and metadata of a single problem
    async fn fetch_detail(&self, slug: &str) -> SourceResult<Problem>;
}

/// A selected submission after its detail fetch
#[derive(Debug)]
pub enum Fetched {
    Ready(Problem),
    Skipped {
        slug: String,
        title: String,
        error: SourceError,
    },
}

/// Accepted submissions, unique by slug, most recent first, at most `limit`
pub fn select_recent_unique(submissions: Vec<Submission>, limit: usize) -> Vec<Submission> {
    let mut seen = HashSet::new();
    submissions
        .into_iter()
        .filter(|s| s.accepted)
        .filter(|s| seen.insert(s.slug.clone()))
        .take(limit)
        .collect()
}

pub fn submission_window(limit: usize) -> usize {
    limit
        .saturating_mul(4)
        .clamp(MIN_SUBMISSION_WINDOW, MAX_SUBMISSION_WINDOW)
}

/// Fetch up to `limit` recently solved unique problems for `username`.
///
/// Only a failure to read the submission history is returned as an error.
/// A problem whose detail can't be fetched is kept as [`Fetched::Skipped`]
/// so the caller can report it.
pub async fn fetch_recent(
    source: &dyn ProblemSource,
    retry: &RetryPolicy,
    username: &str,
    limit: usize,
) -> SourceResult<Vec<Fetched>> {
    let window = submission_window(limit);
    let submissions = retry
        .run(
            "recent_submissions",
            || source.recent_submissions(username, window),
            SourceError::is_retryable,
        )
        .await?;

    let total = submissions.len();
    let selected = select_recent_unique(submissions, limit);
    info!(
        target: LOG_TARGET,
        %username,
        submissions = total,
        selected = selected.len(),
        "Selected recently solved problems"
    );

    let mut fetched = Vec::with_capacity(selected.len());
    for submission in selected {
        let slug = submission.slug.as_str();
        match retry
            .run(
                "fetch_detail",
                || source.fetch_detail(slug),
                SourceError::is_retryable,
            )
            .await
        {
            Ok(problem) => {
                debug!(target: LOG_TARGET, %slug, difficulty = %problem.difficulty, "Fetched problem detail");
                fetched.push(Fetched::Ready(problem));
            }
            Err(error) => {
                warn!(target: LOG_TARGET, %slug, err = %error.fmt_compact(), "Could not fetch problem detail, skipping");
                fetched.push(Fetched::Skipped {
                    slug: submission.slug,
                    title: submission.title,
                    error,
                });
            }
        }
    }

    Ok(fetched)
}

#[derive(Deserialize)]
struct GraphqlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphqlMessage>,
}

#[derive(Deserialize)]
struct GraphqlMessage {
    message: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecentSubmissionsData {
    recent_submission_list: Option<Vec<RawSubmission>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSubmission {
    title: String,
    title_slug: String,
    timestamp: String,
    status_display: String,
}

#[derive(Deserialize)]
struct QuestionData {
    question: Option<RawQuestion>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawQuestion {
    title: Option<String>,
    title_slug: Option<String>,
    difficulty: Option<String>,
    content: Option<String>,
    #[serde(default)]
    topic_tags: Vec<RawTag>,
}

#[derive(Deserialize)]
struct RawTag {
    name: String,
}

impl RawSubmission {
    fn into_submission(self) -> Option<Submission> {
        let secs = self.timestamp.parse::<i64>().ok()?;
        let timestamp = OffsetDateTime::from_unix_timestamp(secs).ok()?;
        Some(Submission {
            accepted: self.status_display == "Accepted",
            slug: self.title_slug,
            title: self.title,
            timestamp,
        })
    }
}

impl RawQuestion {
    fn into_problem(self, requested_slug: &str) -> SourceResult<Problem> {
        let malformed = |reason: &str| SourceError::Malformed {
            slug: requested_slug.to_string(),
            reason: reason.to_string(),
        };

        let slug = self
            .title_slug
            .unwrap_or_else(|| requested_slug.to_string());
        let title = self
            .title
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| malformed("missing title"))?;
        let difficulty = self
            .difficulty
            .filter(|d| !d.trim().is_empty())
            .ok_or_else(|| malformed("missing difficulty"))?;
        let content = self
            .content
            .ok_or_else(|| malformed("statement not available"))?;
        let statement = html_to_text(&content);
        if statement.is_empty() {
            return Err(malformed("empty statement"));
        }

        Ok(Problem {
            url: Problem::canonical_url(&slug),
            topic_tags: self
                .topic_tags
                .into_iter()
                .map(|t| t.name)
                .collect::<BTreeSet<_>>(),
            slug,
            title,
            difficulty,
            statement,
        })
    }
}

fn is_unknown_user(message: &str) -> bool {
    message.to_lowercase().contains("does not exist")
}

/// LeetCode's public GraphQL endpoint
pub struct LeetCodeClient {
    client: Client,
    endpoint: String,
}

impl LeetCodeClient {
    pub fn new() -> SourceResult<Self> {
        Self::with_endpoint(LEETCODE_GRAPHQL_URL)
    }

    pub fn with_endpoint(endpoint: impl Into<String>) -> SourceResult<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(10))
            .build()
            .context(ClientSnafu)?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    async fn graphql<T: DeserializeOwned>(
        &self,
        query: &str,
        variables: serde_json::Value,
    ) -> SourceResult<GraphqlResponse<T>> {
        let response = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::REFERER, LEETCODE_REFERER)
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await
            .context(HttpSnafu)?;

        let status = response.status();
        if !status.is_success() {
            return StatusSnafu { status }.fail();
        }

        response.json().await.context(HttpSnafu)
    }
}

#[async_trait]
impl ProblemSource for LeetCodeClient {
    async fn recent_submissions(
        &self,
        username: &str,
        window: usize,
    ) -> SourceResult<Vec<Submission>> {
        let response: GraphqlResponse<RecentSubmissionsData> = self
            .graphql(
                RECENT_SUBMISSIONS_QUERY,
                json!({ "username": username, "limit": window }),
            )
            .await?;

        if let Some(first) = response.errors.first() {
            if is_unknown_user(&first.message) {
                info!(target: LOG_TARGET, %username, "User not found, treating history as empty");
                return Ok(vec![]);
            }
            return GraphqlSnafu {
                message: first.message.clone(),
            }
            .fail();
        }

        let raw = response
            .data
            .and_then(|d| d.recent_submission_list)
            .unwrap_or_default();

        Ok(raw
            .into_iter()
            .filter_map(|raw| {
                let slug = raw.title_slug.clone();
                let submission = raw.into_submission();
                if submission.is_none() {
                    warn!(target: LOG_TARGET, %slug, "Submission with unparseable timestamp, ignoring");
                }
                submission
            })
            .collect())
    }

    async fn fetch_detail(&self, slug: &str) -> SourceResult<Problem> {
        let response: GraphqlResponse<QuestionData> = self
            .graphql(QUESTION_QUERY, json!({ "titleSlug": slug }))
            .await?;

        if let Some(first) = response.errors.first() {
            return GraphqlSnafu {
                message: first.message.clone(),
            }
            .fail();
        }

        response
            .data
            .and_then(|d| d.question)
            .ok_or_else(|| SourceError::Malformed {
                slug: slug.to_string(),
                reason: "no such question".to_string(),
            })?
            .into_problem(slug)
    }
}
