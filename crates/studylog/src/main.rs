use std::io;

use clap::Parser;
use snafu::{ResultExt, Snafu};
use studylog::cli::{ConfigError, Opts, RunConfig, SummarizerConfig};
use studylog::document::GoogleDocsPublisher;
use studylog::error::PublishError;
use studylog::flashcard::AnkiConnectClient;
use studylog::pipeline::{Pipeline, RunReport};
use studylog::source::{LeetCodeClient, SourceError};
use studylog::summarizer::{OpenAiSummarizer, SummarizeError, Summarizer, TitleOnlySummarizer};
use tokio::signal;
use tracing::level_filters::LevelFilter;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

pub const LOG_TARGET: &str = "studylog::main";

#[derive(Debug, Snafu)]
pub enum CliError {
    #[snafu(display("Invalid configuration: {source}"))]
    Config { source: ConfigError },
    #[snafu(display("Logging initialization failed"))]
    Logging,
    #[snafu(display("Problem source client: {source}"))]
    Source { source: SourceError },
    #[snafu(display("Summarizer client: {source}"))]
    SummarizerInit { source: SummarizeError },
    #[snafu(display("Publisher client: {source}"))]
    PublisherInit { source: PublishError },
    #[snafu(display("Could not listen for Ctrl+C: {source}"))]
    Signal { source: io::Error },
    #[snafu(display("Interrupted; entries published so far were kept"))]
    Interrupted,
}

pub type CliResult<T> = std::result::Result<T, CliError>;

#[snafu::report]
#[tokio::main(flavor = "current_thread")]
async fn main() -> CliResult<()> {
    init_logging()?;

    let config = Opts::parse().into_config().context(ConfigSnafu)?;
    let json = config.json;
    let pipeline = build_pipeline(config)?;

    let report = tokio::select! {
        report = pipeline.run() => report,
        res = signal::ctrl_c() => {
            res.context(SignalSnafu)?;
            warn!(target: LOG_TARGET, "Interrupted, stopping before the next call");
            return Err(CliError::Interrupted);
        }
    };

    print_report(&report, json);
    Ok(())
}

fn build_pipeline(config: RunConfig) -> CliResult<Pipeline> {
    let summarizer: Box<dyn Summarizer> = match config.summarizer {
        SummarizerConfig::OpenAi {
            api_key,
            model,
            url,
        } => {
            info!(target: LOG_TARGET, %model, "Summarizing with OpenAI");
            Box::new(
                OpenAiSummarizer::new(api_key, model)
                    .context(SummarizerInitSnafu)?
                    .with_endpoint(url),
            )
        }
        SummarizerConfig::TitleOnly => {
            warn!(
                target: LOG_TARGET,
                "No OpenAI API key configured, summaries will only contain the problem title"
            );
            Box::new(TitleOnlySummarizer)
        }
    };

    let source = LeetCodeClient::new().context(SourceSnafu)?;
    let mut pipeline = Pipeline::new(config.settings, Box::new(source), summarizer);

    if let Some(document) = config.document {
        info!(
            target: LOG_TARGET,
            doc_id = %document.doc_id,
            account = %document.credentials.client_email(),
            "Publishing to Google Docs"
        );
        let publisher = GoogleDocsPublisher::new(document.credentials).context(PublisherInitSnafu)?;
        pipeline = pipeline.with_document(document.doc_id, Box::new(publisher));
    }

    if let Some(flashcards) = config.flashcards {
        info!(
            target: LOG_TARGET,
            deck = %flashcards.target.deck,
            url = %flashcards.connect_url,
            "Publishing to Anki"
        );
        let client =
            AnkiConnectClient::new(flashcards.connect_url.as_str()).context(PublisherInitSnafu)?;
        pipeline = pipeline.with_flashcards(flashcards.target, Box::new(client));
    }

    Ok(pipeline)
}

fn print_report(report: &RunReport, json: bool) {
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(report).expect("Can't fail")
        );
    } else {
        print!("{report}");
    }
}

pub fn init_logging() -> CliResult<()> {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .try_init()
        .map_err(|_| CliError::Logging)?;

    Ok(())
}
