use std::path::PathBuf;

use clap::Parser;
use snafu::{ResultExt, Snafu, ensure};
use url::Url;

use crate::document::{CredentialsError, ServiceAccountCredentials};
use crate::flashcard::DEFAULT_ANKI_CONNECT_URL;
use crate::pipeline::{FlashcardTarget, RunSettings};
use crate::summarizer::{DEFAULT_OPENAI_MODEL, OPENAI_CHAT_URL, SummaryParams};

/// Summarize recently solved problems into a document and a flashcard deck
#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Opts {
    /// Online judge username whose accepted submissions are processed
    #[arg(long, env = "STUDYLOG_USERNAME")]
    pub username: String,

    /// Number of recent unique solved problems to process
    #[arg(long, default_value = "5")]
    pub limit: usize,

    /// Google Doc ID to append summaries to
    #[arg(long)]
    pub doc_id: Option<String>,

    /// Service account JSON key with write access to the document
    #[arg(long)]
    pub service_account_key: Option<PathBuf>,

    /// Anki deck to add notes to; no notes are created without it
    #[arg(long)]
    pub anki_deck: Option<String>,

    /// Anki note model
    #[arg(long, default_value = "Basic")]
    pub anki_model: String,

    /// AnkiConnect endpoint
    #[arg(long, env = "ANKI_CONNECT_URL", default_value = DEFAULT_ANKI_CONNECT_URL)]
    pub anki_connect_url: String,

    /// Tags for every created note (space separated)
    #[arg(long, num_args = 0.., value_delimiter = ' ')]
    pub tags: Vec<String>,

    /// OpenAI API key; without one, summaries fall back to the problem title
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub openai_key: Option<String>,

    /// Chat model used for summaries
    #[arg(long, env = "STUDYLOG_OPENAI_MODEL", default_value = DEFAULT_OPENAI_MODEL)]
    pub openai_model: String,

    /// Chat completions endpoint (for OpenAI-compatible services)
    #[arg(long, env = "OPENAI_API_URL", default_value = OPENAI_CHAT_URL)]
    pub openai_url: String,

    /// Maximum number of tokens per summary
    #[arg(long, default_value = "400")]
    pub max_tokens: u32,

    /// Sampling temperature for summaries
    #[arg(long, default_value = "0.3")]
    pub temperature: f32,

    /// Print the run report as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Snafu)]
pub enum ConfigError {
    #[snafu(display("Invalid option: {message}"))]
    InvalidOption { message: String },
    #[snafu(display("Could not load service account key: {source}"))]
    Credentials { source: CredentialsError },
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

pub enum SummarizerConfig {
    OpenAi {
        api_key: String,
        model: String,
        url: String,
    },
    TitleOnly,
}

pub struct DocumentConfig {
    pub doc_id: String,
    pub credentials: ServiceAccountCredentials,
}

pub struct FlashcardConfig {
    pub target: FlashcardTarget,
    pub connect_url: Url,
}

/// Everything a run needs, validated before any network call
pub struct RunConfig {
    pub settings: RunSettings,
    pub summarizer: SummarizerConfig,
    pub document: Option<DocumentConfig>,
    pub flashcards: Option<FlashcardConfig>,
    pub json: bool,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl Opts {
    pub fn into_config(self) -> ConfigResult<RunConfig> {
        let username = self.username.trim().to_string();
        ensure!(
            !username.is_empty(),
            InvalidOptionSnafu {
                message: "--username must not be empty"
            }
        );

        let params = SummaryParams {
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };
        params.validate().map_err(|err| ConfigError::InvalidOption {
            message: err.to_string(),
        })?;

        let document = match (non_empty(self.doc_id), self.service_account_key) {
            (Some(doc_id), Some(key_path)) => Some(DocumentConfig {
                doc_id,
                credentials: ServiceAccountCredentials::load(&key_path)
                    .context(CredentialsSnafu)?,
            }),
            (None, None) => None,
            _ => {
                return InvalidOptionSnafu {
                    message: "--doc-id and --service-account-key must be given together",
                }
                .fail();
            }
        };

        let flashcards = match non_empty(self.anki_deck) {
            Some(deck) => Some(FlashcardConfig {
                target: FlashcardTarget {
                    deck,
                    model: self.anki_model.trim().to_string(),
                    tags: validate_tags(self.tags)?,
                },
                connect_url: validate_connect_url(&self.anki_connect_url)?,
            }),
            None => None,
        };
        if let Some(f) = &flashcards {
            ensure!(
                !f.target.model.is_empty(),
                InvalidOptionSnafu {
                    message: "--anki-model must not be empty"
                }
            );
        }

        let summarizer = match non_empty(self.openai_key) {
            Some(api_key) => SummarizerConfig::OpenAi {
                api_key,
                model: self.openai_model,
                url: self.openai_url,
            },
            None => SummarizerConfig::TitleOnly,
        };

        Ok(RunConfig {
            settings: RunSettings {
                username,
                limit: self.limit,
                params,
            },
            summarizer,
            document,
            flashcards,
            json: self.json,
        })
    }
}

fn validate_tags(tags: Vec<String>) -> ConfigResult<Vec<String>> {
    let tags: Vec<String> = tags
        .into_iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();
    if let Some(bad) = tags.iter().find(|t| t.contains(char::is_whitespace)) {
        return InvalidOptionSnafu {
            message: format!("tag `{bad}` contains whitespace"),
        }
        .fail();
    }
    Ok(tags)
}

fn validate_connect_url(raw: &str) -> ConfigResult<Url> {
    let url = Url::parse(raw).map_err(|err| ConfigError::InvalidOption {
        message: format!("--anki-connect-url `{raw}`: {err}"),
    })?;
    ensure!(
        matches!(url.scheme(), "http" | "https"),
        InvalidOptionSnafu {
            message: format!("--anki-connect-url `{raw}` must be http(s)"),
        }
    );
    Ok(url)
}
