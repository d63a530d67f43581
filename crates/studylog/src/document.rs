//! Document sink: appends study-log blocks to a Google Doc.

use std::ops::Range;
use std::path::Path;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use snafu::{ResultExt, Snafu};
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::{debug, info};
use url::Url;

use crate::USER_AGENT;
use crate::error::{AuthSnafu, PublishError, PublishResult};
use crate::types::{Problem, Summary};

const LOG_TARGET: &str = "studylog::document";

pub const DOCS_API_BASE: &str = "https://docs.googleapis.com/v1/";
pub const DOCS_WRITE_SCOPE: &str = "https://www.googleapis.com/auth/documents";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const TOKEN_LIFETIME_SECS: i64 = 3600;
/// Refresh the access token this long before it expires
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// One problem ready to be written to the document
#[derive(Debug, Clone, Copy)]
pub struct DocumentEntry<'a> {
    pub problem: &'a Problem,
    pub summary: &'a Summary,
}

#[async_trait]
pub trait DocumentSink: Send + Sync {
    /// Append all `entries`, in order, at the end of document `doc_id` in a
    /// single update.
    async fn append(&self, doc_id: &str, entries: &[DocumentEntry<'_>]) -> PublishResult<()>;
}

#[derive(Debug, Snafu)]
pub enum CredentialsError {
    #[snafu(display("Can't read service account key {}: {source}", path.display()))]
    ReadKey {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("Service account key is not valid JSON: {source}"))]
    ParseKey { source: serde_json::Error },
    #[snafu(display("Service account private key is unusable: {source}"))]
    PrivateKey { source: jsonwebtoken::errors::Error },
}

pub type CredentialsResult<T> = std::result::Result<T, CredentialsError>;

#[derive(Deserialize)]
struct ServiceAccountKeyFile {
    client_email: String,
    private_key: String,
    #[serde(default)]
    token_uri: Option<String>,
}

/// Service-account credentials granting write scope on documents
pub struct ServiceAccountCredentials {
    client_email: String,
    token_uri: String,
    signing_key: EncodingKey,
}

impl std::fmt::Debug for ServiceAccountCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceAccountCredentials")
            .field("client_email", &self.client_email)
            .field("token_uri", &self.token_uri)
            .finish_non_exhaustive()
    }
}

impl ServiceAccountCredentials {
    pub fn from_json(json: &str) -> CredentialsResult<Self> {
        let file: ServiceAccountKeyFile = serde_json::from_str(json).context(ParseKeySnafu)?;
        let signing_key =
            EncodingKey::from_rsa_pem(file.private_key.as_bytes()).context(PrivateKeySnafu)?;
        Ok(Self {
            client_email: file.client_email,
            token_uri: file
                .token_uri
                .unwrap_or_else(|| DEFAULT_TOKEN_URI.to_string()),
            signing_key,
        })
    }

    pub fn load(path: &Path) -> CredentialsResult<Self> {
        let json = std::fs::read_to_string(path).context(ReadKeySnafu { path })?;
        Self::from_json(&json)
    }

    pub fn client_email(&self) -> &str {
        &self.client_email
    }

    fn signed_assertion(&self, now: OffsetDateTime) -> PublishResult<String> {
        #[derive(Serialize)]
        struct Claims<'a> {
            iss: &'a str,
            scope: &'a str,
            aud: &'a str,
            iat: i64,
            exp: i64,
        }

        let iat = now.unix_timestamp();
        let claims = Claims {
            iss: &self.client_email,
            scope: DOCS_WRITE_SCOPE,
            aud: &self.token_uri,
            iat,
            exp: iat + TOKEN_LIFETIME_SECS,
        };
        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &self.signing_key).map_err(
            |err| PublishError::Auth {
                detail: format!("can't sign token request: {err}"),
            },
        )
    }
}

/// Text of a whole batch plus the ranges that need styling. All offsets are
/// in UTF-16 code units relative to the start of `text`, which is what the
/// Docs API indexes by.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct FormattedBatch {
    pub text: String,
    pub headings: Vec<Range<usize>>,
    pub links: Vec<(Range<usize>, String)>,
    len_utf16: usize,
}

impl FormattedBatch {
    fn push(&mut self, s: &str) -> Range<usize> {
        let start = self.len_utf16;
        self.text.push_str(s);
        self.len_utf16 += s.encode_utf16().count();
        start..self.len_utf16
    }

    pub fn len_utf16(&self) -> usize {
        self.len_utf16
    }
}

/// Lay out entries as consecutive blocks:
///
/// ```text
/// {title}
/// Difficulty: {difficulty} | Tags: {tags}
/// {summary}
/// {url}
///
/// ```
///
/// The batch starts with a newline so it never merges into the document's
/// last paragraph.
pub fn format_entries(entries: &[DocumentEntry<'_>]) -> FormattedBatch {
    let mut batch = FormattedBatch::default();
    batch.push("\n");

    for entry in entries {
        let problem = entry.problem;
        let title = batch.push(&problem.title);
        batch.push("\n");
        batch.headings.push(title.start..title.end + 1);

        batch.push(&format!(
            "Difficulty: {} | Tags: {}\n",
            problem.difficulty,
            problem.tags_display()
        ));
        batch.push(entry.summary.text.trim());
        batch.push("\n");

        let link = batch.push(&problem.url);
        batch.links.push((link, problem.url.clone()));
        batch.push("\n\n");
    }

    batch
}

fn paragraph_style(range: &Range<usize>, offset: usize, style: &str) -> Value {
    json!({
        "updateParagraphStyle": {
            "range": { "startIndex": offset + range.start, "endIndex": offset + range.end },
            "paragraphStyle": { "namedStyleType": style },
            "fields": "namedStyleType",
        }
    })
}

/// `batchUpdate` requests inserting `batch` at document index `at`
pub fn batch_update_requests(batch: &FormattedBatch, at: usize) -> Value {
    let mut requests = vec![
        json!({
            "insertText": {
                "location": { "index": at },
                "text": batch.text,
            }
        }),
        // Skip the leading newline, it ends the paragraph that was already there
        paragraph_style(&(1..batch.len_utf16()), at, "NORMAL_TEXT"),
    ];
    requests.extend(
        batch
            .headings
            .iter()
            .map(|range| paragraph_style(range, at, "HEADING_3")),
    );
    requests.extend(batch.links.iter().map(|(range, url)| {
        json!({
            "updateTextStyle": {
                "range": { "startIndex": at + range.start, "endIndex": at + range.end },
                "textStyle": { "link": { "url": url } },
                "fields": "link",
            }
        })
    }));

    json!({ "requests": requests })
}

/// Map an unsuccessful Docs API response onto the sink error taxonomy
pub fn classify_status(status: StatusCode, body: &str) -> PublishError {
    let detail = format!("HTTP {status}: {}", body.chars().take(300).collect::<String>());
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => PublishError::Auth { detail },
        StatusCode::NOT_FOUND => PublishError::NotFound { detail },
        StatusCode::TOO_MANY_REQUESTS => PublishError::Transient { detail },
        s if s.is_server_error() => PublishError::Transient { detail },
        _ => PublishError::Rejected { detail },
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<u64>,
}

#[derive(Deserialize)]
struct DocumentBody {
    body: Option<DocumentContent>,
}

#[derive(Deserialize)]
struct DocumentContent {
    #[serde(default)]
    content: Vec<StructuralElement>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StructuralElement {
    end_index: Option<usize>,
}

struct CachedToken {
    value: String,
    refresh_at: Instant,
}

/// Google Docs API v1 writer authenticated with a service account
pub struct GoogleDocsPublisher {
    client: Client,
    credentials: ServiceAccountCredentials,
    api_base: Url,
    token: Mutex<Option<CachedToken>>,
}

impl GoogleDocsPublisher {
    pub fn new(credentials: ServiceAccountCredentials) -> PublishResult<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(PublishError::from_remote_transport)?;
        let api_base = Url::parse(DOCS_API_BASE).map_err(|err| PublishError::Rejected {
            detail: err.to_string(),
        })?;

        Ok(Self {
            client,
            credentials,
            api_base,
            token: Mutex::new(None),
        })
    }

    fn document_url(&self, doc_id: &str, suffix: &str) -> PublishResult<Url> {
        let mut url = self.api_base.clone();
        url.path_segments_mut()
            .map_err(|_| PublishError::Rejected {
                detail: format!("bad API base {}", self.api_base),
            })?
            .pop_if_empty()
            .push("documents")
            .push(&format!("{doc_id}{suffix}"));
        Ok(url)
    }

    async fn access_token(&self) -> PublishResult<String> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.refresh_at {
                return Ok(token.value.clone());
            }
        }

        let assertion = self
            .credentials
            .signed_assertion(OffsetDateTime::now_utc())?;
        let response = self
            .client
            .post(&self.credentials.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await
            .map_err(PublishError::from_remote_transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            // The token endpoint answers 400 for bad grants
            return match status {
                StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    AuthSnafu {
                        detail: format!("token exchange failed: {body}"),
                    }
                    .fail()
                }
                _ => Err(classify_status(status, &body)),
            };
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(PublishError::from_remote_transport)?;
        let lifetime = Duration::from_secs(token.expires_in.unwrap_or(TOKEN_LIFETIME_SECS as u64));
        debug!(
            target: LOG_TARGET,
            account = %self.credentials.client_email,
            lifetime_secs = lifetime.as_secs(),
            "Obtained access token"
        );
        *cached = Some(CachedToken {
            value: token.access_token.clone(),
            refresh_at: Instant::now() + lifetime.saturating_sub(TOKEN_EXPIRY_MARGIN),
        });
        Ok(token.access_token)
    }

    async fn end_index(&self, doc_id: &str, token: &str) -> PublishResult<usize> {
        let mut url = self.document_url(doc_id, "")?;
        url.query_pairs_mut()
            .append_pair("fields", "body(content(endIndex))");

        let response = self
            .client
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(PublishError::from_remote_transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let doc: DocumentBody = response
            .json()
            .await
            .map_err(PublishError::from_remote_transport)?;
        Ok(doc
            .body
            .into_iter()
            .flat_map(|b| b.content)
            .filter_map(|e| e.end_index)
            .max()
            .unwrap_or(1))
    }
}

#[async_trait]
impl DocumentSink for GoogleDocsPublisher {
    async fn append(&self, doc_id: &str, entries: &[DocumentEntry<'_>]) -> PublishResult<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let token = self.access_token().await?;
        let end_index = self.end_index(doc_id, &token).await?;
        // The final newline of the body can't be written past
        let insert_at = end_index.saturating_sub(1).max(1);

        let batch = format_entries(entries);
        let body = batch_update_requests(&batch, insert_at);

        let response = self
            .client
            .post(self.document_url(doc_id, ":batchUpdate")?)
            .bearer_auth(&token)
            .json(&body)
            .send()
            .await
            .map_err(PublishError::from_remote_transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        info!(
            target: LOG_TARGET,
            %doc_id,
            entries = entries.len(),
            inserted_at = insert_at,
            "Appended entries to document"
        );
        Ok(())
    }
}
