mod auditor;
mod prompt;
#[cfg(test)]
pub(crate) mod testing;
mod verdict;

pub use auditor::ControlAuditor;
pub use verdict::VerdictExtractor;

use crate::agent::{BrowserAgent, EvidenceCapture, LanguageModel};
use crate::error::RunError;
use crate::model::{AuditConfig, Control, ControlResult, ReportKind, RunOutcome, RunPhase};
use crate::report::ReportSink;
use crate::status::StatusBoard;
use crate::storage;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Everything outside the process the engine talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub agent: Arc<dyn BrowserAgent>,
    pub model: Arc<dyn LanguageModel>,
    pub capture: Arc<dyn EvidenceCapture>,
    pub report: Arc<dyn ReportSink>,
}

/// One accepted start request.
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub run_id: String,
    pub controls: Vec<Control>,
    pub resource_name: String,
}

/// Sequential audit of one control list against one resource.
///
/// The caller has already claimed the status board (`try_begin`); the engine owns every
/// write to it from then on and always leaves it inactive.
pub struct AuditEngine {
    cfg: AuditConfig,
    collaborators: Collaborators,
    status: Arc<StatusBoard>,
}

impl AuditEngine {
    pub fn new(cfg: AuditConfig, collaborators: Collaborators, status: Arc<StatusBoard>) -> Self {
        Self {
            cfg,
            collaborators,
            status,
        }
    }

    pub async fn run(self, plan: RunPlan, cancel: CancellationToken) -> Result<RunOutcome, RunError> {
        let RunPlan {
            run_id,
            controls,
            resource_name,
        } = plan;

        let started_at = storage::now_local();
        let output_dir = match storage::create_run_dir(&self.cfg.output_root, started_at) {
            Ok(dir) => dir,
            Err(e) => {
                error!(
                    run_id = %run_id,
                    error = %format!("{e:#}"),
                    "could not prepare output directory"
                );
                self.status.fail(&run_id, format!("{e:#}"));
                return Err(RunError::internal(e));
            }
        };
        info!(
            run_id = %run_id,
            controls = controls.len(),
            resource = %resource_name,
            output_dir = %output_dir.display(),
            "starting analysis"
        );

        let auditor = ControlAuditor::new(
            self.collaborators.agent.clone(),
            self.collaborators.capture.clone(),
            VerdictExtractor::new(self.collaborators.model.clone()),
            self.cfg.console_url.clone(),
            self.cfg.step_budget,
            output_dir.clone(),
        );

        let total = controls.len();
        let mut results: Vec<ControlResult> = Vec::with_capacity(total);
        let mut cancelled = false;

        for (index, control) in controls.iter().enumerate() {
            // Cancellation only takes effect between controls.
            if cancel.is_cancelled() {
                info!(run_id = %run_id, "analysis stopped by user");
                cancelled = true;
                break;
            }

            debug!(control_id = %control.id, "analyzing control {}/{}", index + 1, total);
            self.status.set_current(&control.id);

            let (result, panicked) = match AssertUnwindSafe(auditor.audit(control, &resource_name))
                .catch_unwind()
                .await
            {
                Ok(result) => (result, false),
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    error!(control_id = %control.id, panic = %message, "control auditor panicked");
                    let result =
                        ControlResult::failed(control, format!("Error during analysis: {message}"));
                    (result, true)
                }
            };

            debug!(control_id = %control.id, passed = result.passed, "control analysis completed");
            results.push(result.clone());
            self.status.record(result);

            if panicked && cancel.is_cancelled() && index + 1 < total {
                info!(run_id = %run_id, "analysis stopped by user after auditor failure");
                cancelled = true;
                break;
            }
        }

        if cancelled {
            self.status.deactivate(RunPhase::Cancelled);
            let report_path = if results.is_empty() {
                info!(run_id = %run_id, "no results recorded; skipping partial report");
                None
            } else {
                Some(
                    self.compile_report(
                        &run_id,
                        &results,
                        &output_dir,
                        ReportKind::Partial,
                        RunPhase::Cancelled,
                    )
                    .await?,
                )
            };
            return Ok(RunOutcome {
                run_id,
                phase: RunPhase::Cancelled,
                resource_name,
                output_dir,
                results,
                report_path,
            });
        }

        self.status.clear_current();
        let report = self
            .compile_report(
                &run_id,
                &results,
                &output_dir,
                ReportKind::Full,
                RunPhase::Completed,
            )
            .await;
        self.status.deactivate(RunPhase::Completed);
        let report_path = report?;
        info!(run_id = %run_id, "analysis completed successfully");

        Ok(RunOutcome {
            run_id,
            phase: RunPhase::Completed,
            resource_name,
            output_dir,
            results,
            report_path: Some(report_path),
        })
    }

    async fn compile_report(
        &self,
        run_id: &str,
        results: &[ControlResult],
        output_dir: &Path,
        kind: ReportKind,
        phase: RunPhase,
    ) -> Result<PathBuf, RunError> {
        let destination = output_dir.join(kind.file_name());
        debug!(run_id = %run_id, ?kind, path = %destination.display(), "generating report");
        let sink = self.collaborators.report.clone();
        let (rows, target) = (results.to_vec(), destination.clone());
        let compiled = tokio::task::spawn_blocking(move || sink.compile(&rows, &target))
            .await
            .map_err(|e| anyhow::anyhow!("report task failed: {e}"))
            .and_then(|r| r);
        match compiled {
            Ok(path) => {
                info!(run_id = %run_id, ?kind, path = %path.display(), "report generated");
                self.status.set_report(run_id, path.clone());
                Ok(path)
            }
            Err(e) => {
                let err = RunError::Report {
                    path: destination,
                    phase,
                    error: e,
                };
                self.status.set_error(run_id, err.to_string());
                Err(err)
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "control auditor panicked".to_string()
    }
}
