use time::macros::datetime;

use super::*;
use crate::error::PublishErrorKind;

fn report() -> RunReport {
    RunReport::new("alice", datetime!(2024-05-01 12:00 UTC))
}

fn problem(
    slug: &str,
    summary: StageOutcome,
    document: StageOutcome,
    flashcard: StageOutcome,
) -> ProblemReport {
    ProblemReport {
        slug: slug.to_string(),
        title: slug.to_uppercase(),
        summary,
        summary_text: Some(format!("summary of {slug}")),
        document,
        flashcard,
    }
}

fn unreachable() -> StageOutcome {
    StageOutcome::Failed {
        error: StageError {
            kind: ErrorKind::PublishError(PublishErrorKind::Unreachable),
            detail: "connection refused".to_string(),
        },
    }
}

#[test]
fn started_at_is_rfc3339() {
    assert_eq!(report().started_at, "2024-05-01T12:00:00Z");
}

#[test]
fn empty_run_is_completed() {
    let report = report().finish();
    assert_eq!(report.status, RunStatus::Completed);
    assert!(report.publish_results().is_empty());
    assert_eq!(report.to_string().lines().last(), Some("  no recently solved problems"));
}

#[test]
fn any_failed_stage_marks_run() {
    let mut r = report();
    r.problems.push(problem(
        "a",
        StageOutcome::done("12 tokens"),
        StageOutcome::done("appended to doc"),
        unreachable(),
    ));
    let r = r.finish();
    assert_eq!(r.status, RunStatus::CompletedWithErrors);

    let mut r = report();
    r.source_error = Some(StageError {
        kind: ErrorKind::SourceUnavailable,
        detail: "timeout".to_string(),
    });
    assert_eq!(r.finish().status, RunStatus::CompletedWithErrors);
}

#[test]
fn skipped_stages_do_not_fail_run() {
    let mut r = report();
    r.problems.push(problem(
        "a",
        StageOutcome::done("0 tokens"),
        StageOutcome::NotConfigured,
        StageOutcome::skipped("summarization failed"),
    ));
    assert_eq!(r.finish().status, RunStatus::Completed);
}

#[test]
fn publish_results_cover_attempted_sinks_only() {
    let mut r = report();
    r.problems.push(problem(
        "a",
        StageOutcome::done("12 tokens"),
        StageOutcome::done("appended to doc"),
        unreachable(),
    ));
    r.problems.push(problem(
        "b",
        StageOutcome::done("9 tokens"),
        StageOutcome::skipped("pending"),
        StageOutcome::NotConfigured,
    ));

    let results = r.publish_results();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].sink, SinkKind::Document);
    assert!(results[0].success);
    assert_eq!(results[0].detail.as_deref(), Some("appended to doc"));
    assert_eq!(results[1].sink, SinkKind::Flashcard);
    assert!(!results[1].success);
    assert_eq!(
        results[1].detail.as_deref(),
        Some("PublishError(unreachable): connection refused")
    );
}

#[test]
fn dry_run_report_prints_summaries() {
    let mut r = report();
    r.problems.push(problem(
        "two-sum",
        StageOutcome::done("5 tokens"),
        StageOutcome::NotConfigured,
        StageOutcome::NotConfigured,
    ));
    let text = r.finish().to_string();

    assert!(text.starts_with("Run for alice started 2024-05-01T12:00:00Z: Completed\n"));
    assert!(text.contains("  TWO-SUM (two-sum)\n"));
    assert!(text.contains("    document:  not configured\n"));
    assert!(text.contains("      | summary of two-sum\n"));
}

#[test]
fn report_serializes_outcomes_with_status_tag() {
    let mut r = report();
    r.problems.push(problem(
        "a",
        StageOutcome::done("1 tokens"),
        StageOutcome::NotConfigured,
        unreachable(),
    ));
    let value = serde_json::to_value(r.finish()).unwrap();

    assert_eq!(value["status"], "CompletedWithErrors");
    assert_eq!(value["problems"][0]["document"]["status"], "not_configured");
    assert_eq!(value["problems"][0]["flashcard"]["status"], "failed");
    assert_eq!(
        value["problems"][0]["flashcard"]["error"]["kind"]["kind"],
        "publish_error"
    );
    assert_eq!(
        value["problems"][0]["flashcard"]["error"]["kind"]["reason"],
        "unreachable"
    );
}
