//! The run orchestrator: fetch, summarize, publish, report.
//!
//! Everything happens on the calling task, one external call at a time.
//! Failures are recorded per problem and per sink; a run always ends with a
//! [`RunReport`].

use std::fmt;

use serde::Serialize;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::{error, info, warn};

use crate::document::{DocumentEntry, DocumentSink};
use crate::error::{ErrorKind, FmtCompact as _, PublishError, StageError};
use crate::flashcard::{AddNoteOutcome, FlashcardSink, build_note};
use crate::retry::RetryPolicy;
use crate::source::{Fetched, ProblemSource, SourceError, fetch_recent};
use crate::summarizer::{SummarizeError, Summarizer, SummaryParams};
use crate::types::{Problem, PublishResult, SinkKind, Summary};

const LOG_TARGET: &str = "studylog::pipeline";

/// What to process, independent of where the output goes
#[derive(Debug, Clone, PartialEq)]
pub struct RunSettings {
    pub username: String,
    pub limit: usize,
    pub params: SummaryParams,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashcardTarget {
    pub deck: String,
    pub model: String,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicies {
    pub source: RetryPolicy,
    pub summarizer: RetryPolicy,
    pub document: RetryPolicy,
    pub flashcard: RetryPolicy,
}

impl Default for RetryPolicies {
    fn default() -> Self {
        Self {
            source: RetryPolicy::SOURCE,
            summarizer: RetryPolicy::SUMMARIZER,
            document: RetryPolicy::DOCUMENT,
            flashcard: RetryPolicy::FLASHCARD,
        }
    }
}

impl RetryPolicies {
    /// Default attempt counts without any waiting
    pub fn immediate() -> Self {
        let d = Self::default();
        Self {
            source: RetryPolicy::immediate(d.source.attempts),
            summarizer: RetryPolicy::immediate(d.summarizer.attempts),
            document: RetryPolicy::immediate(d.document.attempts),
            flashcard: RetryPolicy::immediate(d.flashcard.attempts),
        }
    }
}

struct DocumentPublishing {
    doc_id: String,
    sink: Box<dyn DocumentSink>,
}

struct FlashcardPublishing {
    target: FlashcardTarget,
    sink: Box<dyn FlashcardSink>,
}

pub struct Pipeline {
    settings: RunSettings,
    source: Box<dyn ProblemSource>,
    summarizer: Box<dyn Summarizer>,
    document: Option<DocumentPublishing>,
    flashcards: Option<FlashcardPublishing>,
    retries: RetryPolicies,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunStatus {
    Completed,
    CompletedWithErrors,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Completed => f.write_str("Completed"),
            RunStatus::CompletedWithErrors => f.write_str("CompletedWithErrors"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StageOutcome {
    Done { detail: Option<String> },
    Failed { error: StageError },
    Skipped { reason: String },
    NotConfigured,
}

impl StageOutcome {
    fn done(detail: impl Into<String>) -> Self {
        StageOutcome::Done {
            detail: Some(detail.into()),
        }
    }

    fn skipped(reason: &str) -> Self {
        StageOutcome::Skipped {
            reason: reason.to_string(),
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, StageOutcome::Done { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, StageOutcome::Failed { .. })
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            StageOutcome::Failed { error } => Some(error.kind),
            _ => None,
        }
    }
}

impl fmt::Display for StageOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageOutcome::Done { detail: None } => f.write_str("ok"),
            StageOutcome::Done {
                detail: Some(detail),
            } => write!(f, "ok ({detail})"),
            StageOutcome::Failed { error } => write!(f, "FAILED {error}"),
            StageOutcome::Skipped { reason } => write!(f, "skipped ({reason})"),
            StageOutcome::NotConfigured => f.write_str("not configured"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProblemReport {
    pub slug: String,
    pub title: String,
    pub summary: StageOutcome,
    pub summary_text: Option<String>,
    pub document: StageOutcome,
    pub flashcard: StageOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub username: String,
    pub started_at: String,
    pub status: RunStatus,
    pub source_error: Option<StageError>,
    pub problems: Vec<ProblemReport>,
}

impl RunReport {
    fn new(username: &str, started_at: OffsetDateTime) -> Self {
        Self {
            username: username.to_string(),
            started_at: started_at
                .format(&Rfc3339)
                .unwrap_or_else(|_| started_at.unix_timestamp().to_string()),
            status: RunStatus::Completed,
            source_error: None,
            problems: vec![],
        }
    }

    fn finish(mut self) -> Self {
        let any_failed = self.source_error.is_some()
            || self.problems.iter().any(|p| {
                p.summary.is_failed() || p.document.is_failed() || p.flashcard.is_failed()
            });
        self.status = if any_failed {
            RunStatus::CompletedWithErrors
        } else {
            RunStatus::Completed
        };
        self
    }

    pub fn summarized_count(&self) -> usize {
        self.problems.iter().filter(|p| p.summary.is_done()).count()
    }

    /// One entry per problem and configured sink that was actually attempted
    pub fn publish_results(&self) -> Vec<PublishResult> {
        let mut results = vec![];
        for p in &self.problems {
            for (sink, outcome) in [
                (SinkKind::Document, &p.document),
                (SinkKind::Flashcard, &p.flashcard),
            ] {
                let (success, detail) = match outcome {
                    StageOutcome::Done { detail } => (true, detail.clone()),
                    StageOutcome::Failed { error } => (false, Some(error.to_string())),
                    StageOutcome::Skipped { .. } | StageOutcome::NotConfigured => continue,
                };
                results.push(PublishResult {
                    slug: p.slug.clone(),
                    sink,
                    success,
                    detail,
                });
            }
        }
        results
    }

    fn sinks_configured(&self) -> bool {
        self.problems.iter().any(|p| {
            !matches!(p.document, StageOutcome::NotConfigured)
                || !matches!(p.flashcard, StageOutcome::NotConfigured)
        })
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Run for {} started {}: {}",
            self.username, self.started_at, self.status
        )?;
        if let Some(err) = &self.source_error {
            writeln!(f, "  problem source: FAILED {err}")?;
        }
        if self.problems.is_empty() {
            return writeln!(f, "  no recently solved problems");
        }

        let dry_run = !self.sinks_configured();
        for p in &self.problems {
            writeln!(f, "  {} ({})", p.title, p.slug)?;
            writeln!(f, "    summary:   {}", p.summary)?;
            writeln!(f, "    document:  {}", p.document)?;
            writeln!(f, "    flashcard: {}", p.flashcard)?;
            if dry_run {
                if let Some(text) = &p.summary_text {
                    for line in text.lines() {
                        writeln!(f, "      | {line}")?;
                    }
                }
            }
        }
        Ok(())
    }
}

/// Whether a sink may still be called in this run
enum SinkState {
    Active,
    Disabled(StageError),
}

impl Pipeline {
    pub fn new(
        settings: RunSettings,
        source: Box<dyn ProblemSource>,
        summarizer: Box<dyn Summarizer>,
    ) -> Self {
        Self {
            settings,
            source,
            summarizer,
            document: None,
            flashcards: None,
            retries: RetryPolicies::default(),
        }
    }

    pub fn with_document(
        mut self,
        doc_id: impl Into<String>,
        sink: Box<dyn DocumentSink>,
    ) -> Self {
        self.document = Some(DocumentPublishing {
            doc_id: doc_id.into(),
            sink,
        });
        self
    }

    pub fn with_flashcards(
        mut self,
        target: FlashcardTarget,
        sink: Box<dyn FlashcardSink>,
    ) -> Self {
        self.flashcards = Some(FlashcardPublishing { target, sink });
        self
    }

    pub fn with_retries(mut self, retries: RetryPolicies) -> Self {
        self.retries = retries;
        self
    }

    fn not_summarized(&self, reason: &str) -> (StageOutcome, StageOutcome) {
        let outcome = |configured: bool| {
            if configured {
                StageOutcome::skipped(reason)
            } else {
                StageOutcome::NotConfigured
            }
        };
        (
            outcome(self.document.is_some()),
            outcome(self.flashcards.is_some()),
        )
    }

    pub async fn run(&self) -> RunReport {
        let settings = &self.settings;
        let mut report = RunReport::new(&settings.username, OffsetDateTime::now_utc());

        info!(
            target: LOG_TARGET,
            username = %settings.username,
            limit = settings.limit,
            summarizer = self.summarizer.name(),
            document = self.document.is_some(),
            flashcards = self.flashcards.is_some(),
            "Starting run"
        );

        if settings.limit == 0 {
            info!(target: LOG_TARGET, "Limit is zero, nothing to do");
            return report.finish();
        }

        let fetched = match fetch_recent(
            self.source.as_ref(),
            &self.retries.source,
            &settings.username,
            settings.limit,
        )
        .await
        {
            Ok(fetched) => fetched,
            Err(err) => {
                error!(target: LOG_TARGET, err = %err.fmt_compact(), "Could not read submission history");
                report.source_error = Some(StageError::new(ErrorKind::SourceUnavailable, &err));
                return report.finish();
            }
        };

        // The deck is set up right before the first note, so runs that
        // publish nothing never touch the flashcard store
        let mut flashcard_state: Option<SinkState> = None;
        // (report index, problem, summary) waiting for the document batch
        let mut for_document: Vec<(usize, Problem, Summary)> = vec![];

        for item in fetched {
            let problem = match item {
                Fetched::Ready(problem) => problem,
                Fetched::Skipped { slug, title, error } => {
                    report.problems.push(self.skipped_problem(slug, title, &error));
                    continue;
                }
            };

            let summary = match self.summarize(&problem).await {
                Ok(summary) => summary,
                Err(err) => {
                    warn!(target: LOG_TARGET, slug = %problem.slug, err = %err.fmt_compact(), "Summarization failed, moving on");
                    let (document, flashcard) = self.not_summarized("summarization failed");
                    report.problems.push(ProblemReport {
                        slug: problem.slug,
                        title: problem.title,
                        summary: StageOutcome::Failed {
                            error: StageError::new(ErrorKind::SummarizationFailed, &err),
                        },
                        summary_text: None,
                        document,
                        flashcard,
                    });
                    continue;
                }
            };

            let flashcard = self
                .publish_flashcard(&problem, &summary, &mut flashcard_state)
                .await;
            let document = if self.document.is_some() {
                StageOutcome::skipped("pending")
            } else {
                StageOutcome::NotConfigured
            };

            report.problems.push(ProblemReport {
                slug: problem.slug.clone(),
                title: problem.title.clone(),
                summary: StageOutcome::done(format!("{} tokens", summary.tokens_used)),
                summary_text: Some(summary.text.clone()),
                document,
                flashcard,
            });
            if self.document.is_some() {
                for_document.push((report.problems.len() - 1, problem, summary));
            }
        }

        if let Some(document) = &self.document {
            if !for_document.is_empty() {
                let outcome = self.publish_document(document, &for_document).await;
                for (idx, _, _) in &for_document {
                    report.problems[*idx].document = outcome.clone();
                }
            }
        }

        let report = report.finish();
        info!(
            target: LOG_TARGET,
            status = %report.status,
            problems = report.problems.len(),
            summarized = report.summarized_count(),
            published = report.publish_results().iter().filter(|r| r.success).count(),
            "Run finished"
        );
        report
    }

    fn skipped_problem(&self, slug: String, title: String, error: &SourceError) -> ProblemReport {
        let (document, flashcard) = self.not_summarized("problem detail unavailable");
        ProblemReport {
            slug,
            title,
            summary: StageOutcome::Failed {
                error: StageError::new(ErrorKind::SourceUnavailable, error),
            },
            summary_text: None,
            document,
            flashcard,
        }
    }

    async fn summarize(&self, problem: &Problem) -> Result<Summary, SummarizeError> {
        let params = self.settings.params;
        self.retries
            .summarizer
            .run(
                "summarize",
                || self.summarizer.summarize(problem, params),
                SummarizeError::is_retryable,
            )
            .await
    }

    async fn prepare_flashcards(&self) -> SinkState {
        let Some(flashcards) = &self.flashcards else {
            return SinkState::Active;
        };
        let deck = flashcards.target.deck.as_str();

        match self
            .retries
            .flashcard
            .run(
                "ensure_deck",
                || flashcards.sink.ensure_deck(deck),
                PublishError::is_retryable,
            )
            .await
        {
            Ok(()) => SinkState::Active,
            Err(err) if err.disables_sink() => {
                error!(target: LOG_TARGET, %deck, err = %err.fmt_compact(), "Flashcard sink unusable, skipping it for this run");
                SinkState::Disabled(StageError::publish(&err))
            }
            Err(err) => {
                warn!(target: LOG_TARGET, %deck, err = %err.fmt_compact(), "Could not ensure deck exists");
                SinkState::Active
            }
        }
    }

    async fn publish_flashcard(
        &self,
        problem: &Problem,
        summary: &Summary,
        state: &mut Option<SinkState>,
    ) -> StageOutcome {
        let Some(flashcards) = &self.flashcards else {
            return StageOutcome::NotConfigured;
        };
        if state.is_none() {
            *state = Some(self.prepare_flashcards().await);
        }
        if let Some(SinkState::Disabled(error)) = state {
            return StageOutcome::Failed {
                error: error.clone(),
            };
        }

        let target = &flashcards.target;
        let note = build_note(problem, summary, &target.deck, &target.model, &target.tags);
        match self
            .retries
            .flashcard
            .run(
                "add_note",
                || flashcards.sink.add_note(&note),
                PublishError::is_retryable,
            )
            .await
        {
            Ok(AddNoteOutcome::Created(id)) => {
                info!(target: LOG_TARGET, slug = %problem.slug, note_id = id, "Added flashcard");
                StageOutcome::done(format!("note {id}"))
            }
            Ok(AddNoteOutcome::Duplicate) => StageOutcome::done("already present"),
            Err(err) => {
                warn!(target: LOG_TARGET, slug = %problem.slug, err = %err.fmt_compact(), "Flashcard publishing failed");
                let error = StageError::publish(&err);
                if err.disables_sink() {
                    *state = Some(SinkState::Disabled(error.clone()));
                }
                StageOutcome::Failed { error }
            }
        }
    }

    async fn publish_document(
        &self,
        document: &DocumentPublishing,
        ready: &[(usize, Problem, Summary)],
    ) -> StageOutcome {
        let entries: Vec<DocumentEntry<'_>> = ready
            .iter()
            .map(|(_, problem, summary)| DocumentEntry { problem, summary })
            .collect();
        let doc_id = document.doc_id.as_str();

        match self
            .retries
            .document
            .run(
                "append",
                || document.sink.append(doc_id, &entries),
                PublishError::is_retryable,
            )
            .await
        {
            Ok(()) => StageOutcome::done(format!("appended to {doc_id}")),
            Err(err) => {
                error!(target: LOG_TARGET, %doc_id, err = %err.fmt_compact(), "Document publishing failed");
                StageOutcome::Failed {
                    error: StageError::publish(&err),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests;
