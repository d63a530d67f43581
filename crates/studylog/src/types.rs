use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub const PROBLEM_BASE_URL: &str = "https://leetcode.com/problems/";

/// One entry of a user's submission history
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub slug: String,
    pub title: String,
    pub timestamp: OffsetDateTime,
    pub accepted: bool,
}

/// A fully fetched problem, unique by `slug` within a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Problem {
    pub slug: String,
    pub title: String,
    pub difficulty: String,
    pub topic_tags: BTreeSet<String>,
    /// Plain text, markup already stripped
    pub statement: String,
    pub url: String,
}

impl Problem {
    pub fn canonical_url(slug: &str) -> String {
        format!("{PROBLEM_BASE_URL}{slug}/")
    }

    /// Tags joined for display, `"none"` when there aren't any
    pub fn tags_display(&self) -> String {
        if self.topic_tags.is_empty() {
            "none".to_string()
        } else {
            self.topic_tags
                .iter()
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join(", ")
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub slug: String,
    pub text: String,
    pub tokens_used: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    Document,
    Flashcard,
}

impl fmt::Display for SinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkKind::Document => f.write_str("document"),
            SinkKind::Flashcard => f.write_str("flashcard"),
        }
    }
}

/// Outcome of publishing one problem to one sink
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishResult {
    pub slug: String,
    pub sink: SinkKind,
    pub success: bool,
    /// External identifier on success, error detail on failure
    pub detail: Option<String>,
}
