use std::{error, fmt, result};

use serde::Serialize;
use snafu::Snafu;

/// Report-level classification of everything that can go wrong in a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "reason")]
pub enum ErrorKind {
    SourceUnavailable,
    SummarizationFailed,
    PublishError(PublishErrorKind),
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::SourceUnavailable => f.write_str("SourceUnavailable"),
            ErrorKind::SummarizationFailed => f.write_str("SummarizationFailed"),
            ErrorKind::PublishError(kind) => write!(f, "PublishError({kind})"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishErrorKind {
    Auth,
    NotFound,
    Unreachable,
    Transient,
    Rejected,
}

impl fmt::Display for PublishErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PublishErrorKind::Auth => "auth",
            PublishErrorKind::NotFound => "not_found",
            PublishErrorKind::Unreachable => "unreachable",
            PublishErrorKind::Transient => "transient",
            PublishErrorKind::Rejected => "rejected",
        })
    }
}

/// Errors shared by both sinks
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum PublishError {
    #[snafu(display("Sink rejected credentials: {detail}"))]
    Auth { detail: String },
    #[snafu(display("Sink target not found: {detail}"))]
    NotFound { detail: String },
    #[snafu(display("Sink unreachable: {source}"))]
    Unreachable { source: reqwest::Error },
    #[snafu(display("Transient sink failure: {detail}"))]
    Transient { detail: String },
    #[snafu(display("Sink refused the request: {detail}"))]
    Rejected { detail: String },
}

pub type PublishResult<T> = result::Result<T, PublishError>;

impl PublishError {
    pub fn kind(&self) -> PublishErrorKind {
        match self {
            PublishError::Auth { .. } => PublishErrorKind::Auth,
            PublishError::NotFound { .. } => PublishErrorKind::NotFound,
            PublishError::Unreachable { .. } => PublishErrorKind::Unreachable,
            PublishError::Transient { .. } => PublishErrorKind::Transient,
            PublishError::Rejected { .. } => PublishErrorKind::Rejected,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, PublishError::Transient { .. })
    }

    /// Errors after which the sink is not worth calling again in this run
    pub fn disables_sink(&self) -> bool {
        matches!(
            self.kind(),
            PublishErrorKind::Auth | PublishErrorKind::NotFound | PublishErrorKind::Unreachable
        )
    }

    /// Classify a transport error from a local connector: anything that never
    /// got a response back is treated as the sink being unreachable.
    pub fn from_transport(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            PublishError::Unreachable { source: err }
        } else {
            PublishError::Transient {
                detail: FmtCompactError(&err).to_string(),
            }
        }
    }

    /// Classify a transport error from a hosted API, where connection
    /// failures and timeouts are retryable.
    pub fn from_remote_transport(err: reqwest::Error) -> Self {
        PublishError::Transient {
            detail: FmtCompactError(&err).to_string(),
        }
    }
}

/// An error as recorded in the run report
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageError {
    pub kind: ErrorKind,
    pub detail: String,
}

impl StageError {
    pub fn new(kind: ErrorKind, err: &impl error::Error) -> Self {
        Self {
            kind,
            detail: err.fmt_compact().to_string(),
        }
    }

    pub fn publish(err: &PublishError) -> Self {
        Self::new(ErrorKind::PublishError(err.kind()), err)
    }
}

impl fmt::Display for StageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.detail)
    }
}

/// Renders an error and its whole `source()` chain on one line
pub struct FmtCompactError<'e, E>(pub &'e E);

impl<E> fmt::Display for FmtCompactError<'_, E>
where
    E: error::Error,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut current = Some(self.0 as &dyn error::Error);
        let mut last_rendered = String::new();

        while let Some(err) = current {
            let rendered = err.to_string();
            // snafu display strings usually embed `{source}` already
            if !last_rendered.contains(&rendered) {
                if !last_rendered.is_empty() {
                    f.write_str(": ")?;
                }
                f.write_str(&rendered)?;
            }
            last_rendered = rendered;
            current = err.source();
        }

        Ok(())
    }
}

pub trait FmtCompact {
    type Report: fmt::Display;
    fn fmt_compact(self) -> Self::Report;
}

impl<'e, E> FmtCompact for &'e E
where
    E: error::Error,
{
    type Report = FmtCompactError<'e, E>;

    fn fmt_compact(self) -> Self::Report {
        FmtCompactError(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Snafu)]
    enum Inner {
        #[snafu(display("disk on fire"))]
        Fire,
    }

    #[derive(Debug, Snafu)]
    enum Outer {
        #[snafu(display("could not save"))]
        Save { source: Inner },
        #[snafu(display("could not load: {source}"))]
        Load { source: Inner },
    }

    #[test]
    fn compact_chain_joins_sources() {
        let err = Outer::Save { source: Inner::Fire };
        assert_eq!(err.fmt_compact().to_string(), "could not save: disk on fire");
    }

    #[test]
    fn compact_chain_does_not_repeat_embedded_source() {
        let err = Outer::Load { source: Inner::Fire };
        assert_eq!(
            err.fmt_compact().to_string(),
            "could not load: disk on fire"
        );
    }

    #[test_log::test(tokio::test)]
    async fn connection_failures_depend_on_sink_location() {
        // Nothing listens on the discard port in a test sandbox
        let err = reqwest::Client::new()
            .get("http://127.0.0.1:9/")
            .send()
            .await
            .unwrap_err();
        let local = PublishError::from_transport(err);
        assert_eq!(local.kind(), PublishErrorKind::Unreachable);
        assert!(local.disables_sink());

        let err = reqwest::Client::new()
            .get("http://127.0.0.1:9/")
            .send()
            .await
            .unwrap_err();
        let remote = PublishError::from_remote_transport(err);
        assert_eq!(remote.kind(), PublishErrorKind::Transient);
        assert!(remote.is_retryable());
        assert!(!remote.disables_sink());
    }

    #[test]
    fn fatal_kinds_disable_sink() {
        assert!(
            PublishError::Auth {
                detail: "401".into()
            }
            .disables_sink()
        );
        assert!(
            !PublishError::Transient {
                detail: "503".into()
            }
            .disables_sink()
        );
        assert_eq!(
            ErrorKind::PublishError(PublishErrorKind::NotFound).to_string(),
            "PublishError(not_found)"
        );
    }
}
