//! Flashcard sink: notes in Anki, via the AnkiConnect add-on.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use crate::USER_AGENT;
use crate::error::{PublishError, PublishResult};
use crate::types::{Problem, Summary};

const LOG_TARGET: &str = "studylog::flashcard";

pub const DEFAULT_ANKI_CONNECT_URL: &str = "http://localhost:8765";
const ANKI_CONNECT_VERSION: u8 = 6;

/// Content of a single note
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NoteRequest<'a> {
    pub deck: &'a str,
    pub model: &'a str,
    pub tags: &'a [String],
    pub front: String,
    pub back: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddNoteOutcome {
    Created(u64),
    /// The store already has this note
    Duplicate,
}

#[async_trait]
pub trait FlashcardSink: Send + Sync {
    /// Make sure `deck` exists, creating it if needed
    async fn ensure_deck(&self, deck: &str) -> PublishResult<()>;

    async fn add_note(&self, note: &NoteRequest<'_>) -> PublishResult<AddNoteOutcome>;
}

/// Front is the title, back the summary followed by a link to the problem.
/// Fields are HTML, so the summary is escaped and its line breaks kept.
pub fn build_note<'a>(
    problem: &Problem,
    summary: &Summary,
    deck: &'a str,
    model: &'a str,
    tags: &'a [String],
) -> NoteRequest<'a> {
    let body = html_escape::encode_text(summary.text.trim()).replace('\n', "<br>");
    let url = html_escape::encode_double_quoted_attribute(&problem.url);
    NoteRequest {
        deck,
        model,
        tags,
        front: html_escape::encode_text(&problem.title).into_owned(),
        back: format!(r#"{body}<br><br><a href="{url}">{url}</a>"#),
    }
}

#[derive(Deserialize)]
struct AnkiResponse<T> {
    result: Option<T>,
    error: Option<String>,
}

/// Turn an AnkiConnect error string into a sink error
pub fn classify_anki_error(message: &str) -> PublishError {
    let lowered = message.to_lowercase();
    if lowered.contains("not found") {
        PublishError::NotFound {
            detail: message.to_string(),
        }
    } else {
        PublishError::Rejected {
            detail: message.to_string(),
        }
    }
}

fn is_duplicate_error(message: &str) -> bool {
    message.to_lowercase().contains("duplicate")
}

/// Client for a running AnkiConnect instance
pub struct AnkiConnectClient {
    client: Client,
    url: String,
}

impl AnkiConnectClient {
    pub fn new(url: impl Into<String>) -> PublishResult<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(PublishError::from_transport)?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }

    async fn invoke<T: DeserializeOwned>(
        &self,
        action: &str,
        params: serde_json::Value,
    ) -> PublishResult<AnkiResponse<T>> {
        debug!(target: LOG_TARGET, %action, "Calling AnkiConnect");
        let response = self
            .client
            .post(&self.url)
            .json(&json!({
                "action": action,
                "version": ANKI_CONNECT_VERSION,
                "params": params,
            }))
            .send()
            .await
            .map_err(PublishError::from_transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(PublishError::Transient {
                detail: format!("AnkiConnect answered HTTP {status}"),
            });
        }

        response.json().await.map_err(PublishError::from_transport)
    }
}

#[async_trait]
impl FlashcardSink for AnkiConnectClient {
    async fn ensure_deck(&self, deck: &str) -> PublishResult<()> {
        let response: AnkiResponse<u64> = self.invoke("createDeck", json!({ "deck": deck })).await?;
        match response.error {
            Some(err) if !err.to_lowercase().contains("already exists") => {
                Err(classify_anki_error(&err))
            }
            _ => Ok(()),
        }
    }

    async fn add_note(&self, note: &NoteRequest<'_>) -> PublishResult<AddNoteOutcome> {
        let response: AnkiResponse<u64> = self
            .invoke(
                "addNote",
                json!({
                    "note": {
                        "deckName": note.deck,
                        "modelName": note.model,
                        "fields": { "Front": note.front, "Back": note.back },
                        "options": { "allowDuplicate": false },
                        "tags": note.tags,
                    }
                }),
            )
            .await?;

        note_outcome(response)
    }
}

fn note_outcome(response: AnkiResponse<u64>) -> PublishResult<AddNoteOutcome> {
    match (response.result, response.error) {
        (_, Some(err)) if is_duplicate_error(&err) => {
            info!(target: LOG_TARGET, "Note already present, keeping existing one");
            Ok(AddNoteOutcome::Duplicate)
        }
        (_, Some(err)) => Err(classify_anki_error(&err)),
        (Some(id), None) => Ok(AddNoteOutcome::Created(id)),
        (None, None) => Err(PublishError::Rejected {
            detail: "AnkiConnect returned neither a note id nor an error".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::error::PublishErrorKind;

    fn parse(body: &str) -> PublishResult<AddNoteOutcome> {
        note_outcome(serde_json::from_str(body).unwrap())
    }

    #[test]
    fn created_note_returns_id() {
        assert_eq!(
            parse(r#"{"result": 1496198395707, "error": null}"#).unwrap(),
            AddNoteOutcome::Created(1_496_198_395_707)
        );
    }

    #[test]
    fn duplicate_is_success() {
        assert_eq!(
            parse(r#"{"result": null, "error": "cannot create note because it is a duplicate"}"#)
                .unwrap(),
            AddNoteOutcome::Duplicate
        );
    }

    #[test]
    fn missing_deck_is_not_found() {
        let err = parse(r#"{"result": null, "error": "deck was not found: Leet"}"#).unwrap_err();
        assert_eq!(err.kind(), PublishErrorKind::NotFound);

        let err = parse(r#"{"result": null, "error": "cannot create note because it is empty"}"#)
            .unwrap_err();
        assert_eq!(err.kind(), PublishErrorKind::Rejected);
    }

    #[test]
    fn note_back_is_escaped_and_linked() {
        let problem = Problem {
            slug: "two-sum".into(),
            title: "Two <Sum>".into(),
            difficulty: "Easy".into(),
            topic_tags: BTreeSet::new(),
            statement: "s".into(),
            url: Problem::canonical_url("two-sum"),
        };
        let summary = Summary {
            slug: "two-sum".into(),
            text: "Use a map & scan once.\nO(n).".into(),
            tokens_used: 7,
        };
        let tags = vec!["leetcode".to_string()];
        let note = build_note(&problem, &summary, "Leet", "Basic", &tags);

        assert_eq!(note.front, "Two &lt;Sum&gt;");
        assert_eq!(
            note.back,
            "Use a map &amp; scan once.<br>O(n).<br><br>\
             <a href=\"https://leetcode.com/problems/two-sum/\">https://leetcode.com/problems/two-sum/</a>"
        );
        assert_eq!(note.tags, ["leetcode".to_string()]);
    }

    #[test_log::test(tokio::test)]
    async fn closed_port_is_unreachable() {
        // Nothing listens on port 9 (discard) in a test sandbox
        let client = AnkiConnectClient::new("http://127.0.0.1:9").unwrap();
        let err = client.ensure_deck("Leet").await.unwrap_err();
        assert_eq!(err.kind(), PublishErrorKind::Unreachable);
    }
}
