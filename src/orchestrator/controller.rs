//! Run lifecycle controller.
//!
//! Owns start/stop orchestration and hands run handles and status snapshots to
//! presentation layers (CLI, HTTP).

use super::post_process::process_run_completion;
use crate::agent::BrowserSession;
use crate::engine::{AuditEngine, Collaborators, RunPlan};
use crate::error::{RunError, StartError};
use crate::model::{AuditConfig, Control, RunOutcome, RunStatus};
use crate::status::StatusBoard;
use crate::storage;
use anyhow::anyhow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

static RUN_SEQ: AtomicU64 = AtomicU64::new(1);

/// Entry point for starting, observing, and stopping audit runs. Cheap to clone.
#[derive(Clone)]
pub struct AuditController {
    inner: Arc<Inner>,
}

struct Inner {
    cfg: AuditConfig,
    collaborators: Collaborators,
    session: Arc<dyn BrowserSession>,
    status: Arc<StatusBoard>,
    active: Mutex<Option<ActiveRun>>,
    /// Supervisor tasks of accepted runs; drained on shutdown.
    runs: TaskTracker,
}

/// Cancellation token of the run currently in flight. A fresh token is minted per run, so
/// a stop that arrives between runs can never leak into the next one.
struct ActiveRun {
    run_id: String,
    cancel: CancellationToken,
}

impl Inner {
    fn active(&self) -> MutexGuard<'_, Option<ActiveRun>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn clear_active(&self, run_id: &str) {
        let mut active = self.active();
        if active.as_ref().is_some_and(|a| a.run_id == run_id) {
            *active = None;
        }
    }
}

/// Handle to one accepted run.
pub struct RunHandle {
    run_id: String,
    cancel: CancellationToken,
    status_rx: watch::Receiver<RunStatus>,
    handle: JoinHandle<Result<RunOutcome, RunError>>,
}

impl RunHandle {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Request cooperative cancellation; the control in flight still finishes.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn status(&self) -> RunStatus {
        self.status_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RunStatus> {
        self.status_rx.clone()
    }

    /// Wait for the run to reach a terminal state.
    pub async fn wait(self) -> Result<RunOutcome, RunError> {
        match self.handle.await {
            Ok(res) => res,
            Err(e) => Err(RunError::internal(anyhow!("run supervisor failed: {e}"))),
        }
    }
}

impl AuditController {
    pub fn new(
        cfg: AuditConfig,
        collaborators: Collaborators,
        session: Arc<dyn BrowserSession>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                cfg,
                collaborators,
                session,
                status: Arc::new(StatusBoard::new()),
                active: Mutex::new(None),
                runs: TaskTracker::new(),
            }),
        }
    }

    pub fn config(&self) -> &AuditConfig {
        &self.inner.cfg
    }

    pub fn session(&self) -> &Arc<dyn BrowserSession> {
        &self.inner.session
    }

    /// Best-effort current state. Never fails.
    pub fn status(&self) -> RunStatus {
        self.inner.status.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<RunStatus> {
        self.inner.status.subscribe()
    }

    /// Signal the active run to stop. Always acknowledged; returns whether a run was
    /// actually signalled.
    pub fn stop(&self) -> bool {
        match self.inner.active().as_ref() {
            Some(run) => {
                info!(run_id = %run.run_id, "stop analysis requested");
                run.cancel.cancel();
                true
            }
            None => {
                debug!("stop requested with no active run");
                false
            }
        }
    }

    /// Stop the active run, if any, and wait until it has reached a terminal state and
    /// written its report and export. Runs started afterwards are still tracked.
    pub async fn shutdown(&self) {
        self.stop();
        self.inner.runs.close();
        self.inner.runs.wait().await;
        self.inner.runs.reopen();
    }

    /// Validate and launch a run in the background. Returns as soon as the run is accepted.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self, controls: Vec<Control>, resource_name: &str) -> Result<RunHandle, StartError> {
        if controls.is_empty() {
            return Err(StartError::NoControls);
        }
        let resource_name = resource_name.trim();
        if resource_name.is_empty() {
            return Err(StartError::BlankResource);
        }
        if !self.inner.session.is_established() {
            error!("browser not launched when attempting to start analysis");
            return Err(StartError::NoSession);
        }

        let run_id = next_run_id();
        let cancel = CancellationToken::new();
        {
            // Held across the claim so `stop` never sees a claimed board without a token.
            let mut active = self.inner.active();
            if !self.inner.status.try_begin(&run_id, controls.len()) {
                warn!("analysis already in progress when attempting to start new analysis");
                return Err(StartError::AlreadyRunning);
            }
            *active = Some(ActiveRun {
                run_id: run_id.clone(),
                cancel: cancel.clone(),
            });
        }
        info!(
            run_id = %run_id,
            controls = controls.len(),
            resource = resource_name,
            "analysis accepted"
        );

        let engine = AuditEngine::new(
            self.inner.cfg.clone(),
            self.inner.collaborators.clone(),
            self.inner.status.clone(),
        );
        let plan = RunPlan {
            run_id: run_id.clone(),
            controls,
            resource_name: resource_name.to_string(),
        };
        let run_task = tokio::spawn(engine.run(plan, cancel.clone()));
        let inner = self.inner.clone();
        let supervised_id = run_id.clone();
        let handle = self
            .inner
            .runs
            .spawn(async move { supervise(inner, supervised_id, run_task).await });

        Ok(RunHandle {
            run_id,
            cancel,
            status_rx: self.inner.status.subscribe(),
            handle,
        })
    }
}

/// Background-task host for a run: observes how it ended, logs it, and releases the run slot.
async fn supervise(
    inner: Arc<Inner>,
    run_id: String,
    task: JoinHandle<Result<RunOutcome, RunError>>,
) -> Result<RunOutcome, RunError> {
    let result = match task.await {
        Ok(res) => res,
        Err(e) => {
            let err = RunError::internal(anyhow!("run task failed: {e}"));
            inner.status.fail(&run_id, err.to_string());
            Err(err)
        }
    };

    match &result {
        Ok(outcome) => {
            let processed = process_run_completion(&inner.cfg, outcome);
            info!(
                run_id = %run_id,
                phase = ?outcome.phase,
                passed = processed.summary.passed,
                failed = processed.summary.failed,
                export = ?processed.export_path,
                "run finished"
            );
            for message in &processed.messages {
                debug!(run_id = %run_id, "{message}");
            }
        }
        Err(e) if e.is_report_failure() => {
            error!(run_id = %run_id, error = %e, "audit finished but report generation failed");
        }
        Err(e) => {
            error!(run_id = %run_id, error = %e, "error during analysis");
        }
    }

    inner.clear_active(&run_id);
    result
}

fn next_run_id() -> String {
    let seq = RUN_SEQ.fetch_add(1, Ordering::Relaxed);
    format!(
        "run-{}-{seq}",
        storage::timestamp_slug(storage::now_local())
    )
}
