use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use tracing::debug;

use crate::USER_AGENT;
use crate::types::{Problem, Summary};

const LOG_TARGET: &str = "studylog::summarizer";

pub const OPENAI_CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4-turbo";

/// Rough size of a token, used to bound and estimate text length
const CHARS_PER_TOKEN: usize = 4;

pub const TEMPERATURE_RANGE: std::ops::RangeInclusive<f32> = 0.0..=2.0;

const SYSTEM_PROMPT: &str = "You are an assistant that summarises programming challenges. \
Given the plain text of a problem description, write a succinct summary that captures \
the problem statement, key constraints, and overall goal. Do not include implementation code.";

#[derive(Debug, Snafu)]
pub enum SummarizeError {
    #[snafu(display("Invalid summarization request: {reason}"))]
    InvalidInput { reason: String },
    #[snafu(display("Could not build HTTP client: {source}"))]
    Client { source: reqwest::Error },
    #[snafu(display("Request to language model failed: {source}"))]
    Http { source: reqwest::Error },
    #[snafu(display("Language model refused the request (HTTP {status}): {message}"))]
    Rejected { status: StatusCode, message: String },
    #[snafu(display("Language model temporarily unavailable (HTTP {status}): {message}"))]
    Unavailable { status: StatusCode, message: String },
    #[snafu(display("Language model returned an empty completion"))]
    EmptyCompletion,
}

pub type SummarizeResult<T> = std::result::Result<T, SummarizeError>;

impl SummarizeError {
    pub fn is_retryable(&self) -> bool {
        match self {
            SummarizeError::Http { source } => !source.is_decode(),
            SummarizeError::Unavailable { .. } => true,
            SummarizeError::InvalidInput { .. }
            | SummarizeError::Client { .. }
            | SummarizeError::Rejected { .. }
            | SummarizeError::EmptyCompletion => false,
        }
    }

    /// Split an unsuccessful response into fatal and retryable failures.
    /// Quota exhaustion comes back as 429 too, but waiting won't fix it.
    fn from_status(status: StatusCode, body: &str) -> Self {
        let parsed = serde_json::from_str::<ApiErrorBody>(body).ok();
        let code = parsed.as_ref().and_then(|b| b.error.code.clone());
        let message = parsed
            .map(|b| b.error.message)
            .unwrap_or_else(|| body.chars().take(200).collect());

        let fatal = matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN)
            || code.as_deref() == Some("insufficient_quota")
            || (status.is_client_error() && status != StatusCode::TOO_MANY_REQUESTS);

        if fatal {
            SummarizeError::Rejected { status, message }
        } else {
            SummarizeError::Unavailable { status, message }
        }
    }
}

/// Sampling settings for one summary
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SummaryParams {
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for SummaryParams {
    fn default() -> Self {
        Self {
            max_tokens: 400,
            temperature: 0.3,
        }
    }
}

impl SummaryParams {
    pub fn validate(&self) -> SummarizeResult<()> {
        if self.max_tokens == 0 {
            return InvalidInputSnafu {
                reason: "max_tokens must be positive",
            }
            .fail();
        }
        if !TEMPERATURE_RANGE.contains(&self.temperature) {
            return InvalidInputSnafu {
                reason: format!(
                    "temperature {} outside {}..={}",
                    self.temperature,
                    TEMPERATURE_RANGE.start(),
                    TEMPERATURE_RANGE.end()
                ),
            }
            .fail();
        }
        Ok(())
    }
}

#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, problem: &Problem, params: SummaryParams)
    -> SummarizeResult<Summary>;

    fn name(&self) -> &'static str;
}

pub fn build_user_prompt(problem: &Problem) -> String {
    format!(
        "Problem Title: {}\nDifficulty: {}\nTags: {}\n\nDescription:\n{}\n\nSummarise the problem in a few sentences.",
        problem.title,
        problem.difficulty,
        problem
            .topic_tags
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(", "),
        problem.statement
    )
}

pub fn estimate_tokens(text: &str) -> u32 {
    u32::try_from(text.chars().count().div_ceil(CHARS_PER_TOKEN)).unwrap_or(u32::MAX)
}

/// Trim the completion and cut it down if it exceeds the token budget,
/// preferring to break on whitespace.
pub fn bound_summary(text: &str, max_tokens: u32) -> String {
    let text = text.trim();
    let max_chars = (max_tokens as usize).saturating_mul(CHARS_PER_TOKEN);
    if text.chars().count() <= max_chars {
        return text.to_string();
    }

    let cut = text
        .char_indices()
        .nth(max_chars)
        .map(|(idx, _)| idx)
        .unwrap_or(text.len());
    let head = &text[..cut];
    let head = match head.rfind(char::is_whitespace) {
        Some(idx) if idx > 0 => &head[..idx],
        _ => head,
    };
    format!("{}…", head.trim_end())
}

/// OpenAI Chat Completions backend
pub struct OpenAiSummarizer {
    client: Client,
    api_key: String,
    model: String,
    endpoint: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    temperature: f32,
    max_tokens: u32,
    n: u8,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    completion_tokens: u32,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    error: ApiError,
}

#[derive(Deserialize)]
struct ApiError {
    message: String,
    code: Option<String>,
}

impl OpenAiSummarizer {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> SummarizeResult<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(60))
            .build()
            .context(ClientSnafu)?;

        Ok(Self {
            client,
            api_key: api_key.into(),
            model: model.into(),
            endpoint: OPENAI_CHAT_URL.to_string(),
        })
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    fn into_summary(
        slug: &str,
        response: ChatResponse,
        max_tokens: u32,
    ) -> SummarizeResult<Summary> {
        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();
        let text = bound_summary(&content, max_tokens);
        if text.is_empty() {
            return EmptyCompletionSnafu.fail();
        }
        let tokens_used = response
            .usage
            .map(|u| u.completion_tokens)
            .unwrap_or_else(|| estimate_tokens(&text))
            .min(max_tokens);

        Ok(Summary {
            slug: slug.to_string(),
            text,
            tokens_used,
        })
    }
}

#[async_trait]
impl Summarizer for OpenAiSummarizer {
    async fn summarize(
        &self,
        problem: &Problem,
        params: SummaryParams,
    ) -> SummarizeResult<Summary> {
        params.validate()?;
        if problem.statement.trim().is_empty() {
            return InvalidInputSnafu {
                reason: format!("`{}` has an empty statement", problem.slug),
            }
            .fail();
        }

        let user_prompt = build_user_prompt(problem);
        let request = ChatRequest {
            model: &self.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: &user_prompt,
                },
            ],
            temperature: params.temperature,
            max_tokens: params.max_tokens,
            n: 1,
        };

        debug!(target: LOG_TARGET, slug = %problem.slug, model = %self.model, "Requesting summary");
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .context(HttpSnafu)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SummarizeError::from_status(status, &body));
        }

        let response: ChatResponse = response.json().await.context(HttpSnafu)?;
        Self::into_summary(&problem.slug, response, params.max_tokens)
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}

/// Used when no language model is configured: the summary is just the
/// problem's headline facts.
pub struct TitleOnlySummarizer;

#[async_trait]
impl Summarizer for TitleOnlySummarizer {
    async fn summarize(
        &self,
        problem: &Problem,
        _params: SummaryParams,
    ) -> SummarizeResult<Summary> {
        Ok(Summary {
            slug: problem.slug.clone(),
            text: format!(
                "{} ({}), topics: {}",
                problem.title,
                problem.difficulty,
                problem.tags_display()
            ),
            tokens_used: 0,
        })
    }

    fn name(&self) -> &'static str {
        "title-only"
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    fn problem() -> Problem {
        Problem {
            slug: "two-sum".into(),
            title: "Two Sum".into(),
            difficulty: "Easy".into(),
            topic_tags: BTreeSet::from(["Array".to_string(), "Hash Table".to_string()]),
            statement: "Find two numbers adding up to target.".into(),
            url: Problem::canonical_url("two-sum"),
        }
    }

    #[test]
    fn prompt_embeds_metadata_and_statement() {
        let prompt = build_user_prompt(&problem());
        assert!(
            prompt.starts_with("Problem Title: Two Sum\nDifficulty: Easy\nTags: Array, Hash Table\n")
        );
        assert!(prompt.contains("Description:\nFind two numbers adding up to target."));
    }

    #[test]
    fn long_completion_is_cut_on_whitespace() {
        let text = "alpha beta gamma delta";
        // 3 tokens -> 12 chars -> "alpha beta g" -> cut back to "alpha beta"
        assert_eq!(bound_summary(text, 3), "alpha beta…");
        assert_eq!(bound_summary("  short  ", 10), "short");
    }

    #[test]
    fn response_usage_is_reported() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":"  A summary. "}}],
                       "usage":{"prompt_tokens":100,"completion_tokens":3,"total_tokens":103}}"#;
        let response: ChatResponse = serde_json::from_str(body).unwrap();
        let summary = OpenAiSummarizer::into_summary("two-sum", response, 400).unwrap();
        assert_eq!(summary.text, "A summary.");
        assert_eq!(summary.tokens_used, 3);
        assert_eq!(summary.slug, "two-sum");
    }

    #[test]
    fn empty_completion_is_an_error() {
        let body = r#"{"choices":[{"message":{"content":"   "}}]}"#;
        let response: ChatResponse = serde_json::from_str(body).unwrap();
        assert!(matches!(
            OpenAiSummarizer::into_summary("x", response, 400),
            Err(SummarizeError::EmptyCompletion)
        ));
    }

    #[test]
    fn quota_and_auth_errors_are_fatal() {
        let quota = r#"{"error":{"message":"You exceeded your current quota","type":"insufficient_quota","code":"insufficient_quota"}}"#;
        let err = SummarizeError::from_status(StatusCode::TOO_MANY_REQUESTS, quota);
        assert!(matches!(err, SummarizeError::Rejected { .. }));
        assert!(!err.is_retryable());

        let auth = SummarizeError::from_status(StatusCode::UNAUTHORIZED, "not json");
        assert!(!auth.is_retryable());
    }

    #[test]
    fn rate_limits_and_server_errors_are_retried() {
        let rate = r#"{"error":{"message":"Rate limit reached","code":"rate_limit_exceeded"}}"#;
        assert!(SummarizeError::from_status(StatusCode::TOO_MANY_REQUESTS, rate).is_retryable());
        assert!(SummarizeError::from_status(StatusCode::BAD_GATEWAY, "").is_retryable());
    }

    #[test]
    fn params_are_validated() {
        assert!(SummaryParams::default().validate().is_ok());
        assert!(
            SummaryParams {
                max_tokens: 0,
                temperature: 0.3
            }
            .validate()
            .is_err()
        );
        assert!(
            SummaryParams {
                max_tokens: 10,
                temperature: 2.5
            }
            .validate()
            .is_err()
        );
    }

    #[test_log::test(tokio::test)]
    async fn title_only_summary_uses_metadata() {
        let summary = TitleOnlySummarizer
            .summarize(&problem(), SummaryParams::default())
            .await
            .unwrap();
        assert_eq!(summary.text, "Two Sum (Easy), topics: Array, Hash Table");
        assert_eq!(summary.tokens_used, 0);
    }
}
