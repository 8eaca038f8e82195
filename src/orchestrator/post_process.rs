//! Post-run processing utilities.
//!
//! Handles the JSON export and summary messages after a run reaches a terminal state.

use crate::model::{AuditConfig, RunOutcome};
use crate::storage;
use crate::summary::AuditSummary;
use std::path::PathBuf;

/// Result of post-run processing, ready for presentation layers.
pub(crate) struct ProcessedRun {
    pub summary: AuditSummary,
    pub export_path: Option<PathBuf>,
    pub messages: Vec<String>,
}

/// Summarize a finished run and write `results.json` next to its report.
///
/// Export failures are reported as messages; the run outcome stands either way.
pub(crate) fn process_run_completion(cfg: &AuditConfig, outcome: &RunOutcome) -> ProcessedRun {
    let summary = AuditSummary::from_results(&outcome.results);
    let mut messages = vec![format!(
        "Audit {:?}: {} controls, {} passed, {} failed, pass rate {}",
        outcome.phase,
        summary.total,
        summary.passed,
        summary.failed,
        summary.pass_rate_label()
    )];

    let path = storage::results_path(&outcome.output_dir);
    let export_path = match storage::export_json(&path, cfg, outcome) {
        Ok(()) => {
            messages.push(format!("Exported JSON: {}", path.display()));
            Some(path)
        }
        Err(e) => {
            messages.push(format!("Export JSON failed: {e:#}"));
            None
        }
    };

    ProcessedRun {
        summary,
        export_path,
        messages,
    }
}
