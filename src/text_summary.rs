//! Text summary builder for CLI output.
//!
//! Formats a finished run as human-readable lines for text mode.

use crate::model::{ReportKind, RunOutcome, RunPhase};
use crate::summary::AuditSummary;

/// Pre-formatted lines for text output.
pub(crate) struct TextSummary {
    pub lines: Vec<String>,
}

/// Build a text summary from a finished run.
pub(crate) fn build_text_summary(outcome: &RunOutcome) -> TextSummary {
    let summary = AuditSummary::from_results(&outcome.results);
    let mut lines = Vec::new();

    lines.push(format!("Resource: {}", outcome.resource_name));
    match outcome.phase {
        RunPhase::Cancelled => lines.push("Status: stopped by user (partial results)".into()),
        phase => lines.push(format!("Status: {phase:?}")),
    }

    for r in &outcome.results {
        let mark = if r.passed { "PASS" } else { "FAIL" };
        lines.push(format!("[{mark}] {} - {}", r.control_id, r.description));
        let details = r.details.trim();
        if !details.is_empty() {
            lines.push(format!("       {}", first_line(details)));
        }
    }

    lines.push(format!(
        "Controls: {} total, {} passed, {} failed (pass rate {})",
        summary.total,
        summary.passed,
        summary.failed,
        summary.pass_rate_label()
    ));
    match (outcome.report_kind(), outcome.report_path.as_deref()) {
        (Some(ReportKind::Partial), Some(path)) => {
            lines.push(format!("Partial report: {}", path.display()))
        }
        (_, Some(path)) => lines.push(format!("Report: {}", path.display())),
        _ => lines.push("Report: none (no results recorded)".into()),
    }

    TextSummary { lines }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or(text)
}
