//! Run status board.
//!
//! The orchestrator is the only writer. Observers hold a `watch::Receiver` or ask for a
//! snapshot; either way they get an owned copy and never block the writer.

use crate::model::{ControlResult, RunPhase, RunStatus};
use std::path::PathBuf;
use tokio::sync::watch;

pub struct StatusBoard {
    tx: watch::Sender<RunStatus>,
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusBoard {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(RunStatus::default());
        Self { tx }
    }

    pub fn snapshot(&self) -> RunStatus {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RunStatus> {
        self.tx.subscribe()
    }

    /// Reset the board for a new run. Returns false, leaving the board untouched, if a run
    /// is already active. Check and reset happen under the channel's write lock.
    pub fn try_begin(&self, run_id: &str, total_controls: usize) -> bool {
        self.tx.send_if_modified(|s| {
            if s.active {
                return false;
            }
            *s = RunStatus {
                run_id: Some(run_id.to_string()),
                phase: RunPhase::Running,
                active: true,
                total_controls,
                ..Default::default()
            };
            true
        })
    }

    pub fn set_current(&self, control_id: &str) {
        self.tx.send_modify(|s| s.current_control = Some(control_id.to_string()));
    }

    /// No control in flight; the run stays active (report compile).
    pub fn clear_current(&self) {
        self.tx.send_if_modified(|s| s.current_control.take().is_some());
    }

    /// Append a result and recompute progress from the number of results held.
    pub fn record(&self, result: ControlResult) {
        self.tx.send_modify(|s| {
            s.results.push(result);
            s.progress_percent = progress_percent(s.results.len(), s.total_controls);
        });
    }

    /// Leave the running state. Results are frozen from here on.
    pub fn deactivate(&self, phase: RunPhase) {
        self.tx.send_modify(|s| {
            s.active = false;
            s.current_control = None;
            s.phase = phase;
        });
    }

    /// Late annotations are keyed by run: once a run is inactive a new one may already own
    /// the board, and its status must not pick up the previous run's report or error.
    pub fn set_report(&self, run_id: &str, path: PathBuf) {
        self.tx.send_if_modified(|s| {
            if s.run_id.as_deref() != Some(run_id) {
                return false;
            }
            s.report_path = Some(path);
            true
        });
    }

    pub fn set_error(&self, run_id: &str, message: String) {
        self.tx.send_if_modified(|s| {
            if s.run_id.as_deref() != Some(run_id) {
                return false;
            }
            s.error = Some(message);
            true
        });
    }

    /// Abort path: mark inactive and failed, keeping whatever results were gathered.
    pub fn fail(&self, run_id: &str, message: String) {
        self.tx.send_if_modified(|s| {
            if s.run_id.as_deref() != Some(run_id) {
                return false;
            }
            s.active = false;
            s.current_control = None;
            s.phase = RunPhase::Failed;
            s.error = Some(message);
            true
        });
    }
}

pub fn progress_percent(done: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    done as f64 / total as f64 * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Control, ControlResult};

    fn result(id: &str) -> ControlResult {
        ControlResult::failed(&Control::new(id, "d"), "x")
    }

    #[test]
    fn begin_is_rejected_while_active() {
        let board = StatusBoard::new();
        assert!(board.try_begin("run-1", 2));
        board.record(result("A"));
        assert!(!board.try_begin("run-2", 5));

        let s = board.snapshot();
        assert_eq!(s.run_id.as_deref(), Some("run-1"));
        assert_eq!(s.results.len(), 1);
        assert_eq!(s.progress_percent, 50.0);
        assert_eq!(s.total_controls, 2);
    }

    #[test]
    fn begin_after_terminal_state_resets() {
        let board = StatusBoard::new();
        assert!(board.try_begin("run-1", 1));
        board.set_current("A");
        board.record(result("A"));
        board.deactivate(RunPhase::Completed);
        assert_eq!(board.snapshot().current_control, None);

        assert!(board.try_begin("run-2", 3));
        let s = board.snapshot();
        assert!(s.results.is_empty());
        assert_eq!(s.progress_percent, 0.0);
        assert_eq!(s.phase, RunPhase::Running);
    }

    #[test]
    fn subscribers_see_updates() {
        let board = StatusBoard::new();
        let rx = board.subscribe();
        board.try_begin("run-1", 4);
        board.set_current("A");
        assert_eq!(rx.borrow().current_control.as_deref(), Some("A"));
    }

    #[test]
    fn stale_annotations_are_ignored() {
        let board = StatusBoard::new();
        board.try_begin("run-1", 1);
        board.deactivate(RunPhase::Cancelled);
        board.try_begin("run-2", 1);
        board.set_report("run-1", PathBuf::from("old.html"));
        board.fail("run-1", "late".into());

        let s = board.snapshot();
        assert_eq!(s.report_path, None);
        assert_eq!(s.error, None);
        assert!(s.active);

        board.set_report("run-2", PathBuf::from("new.html"));
        assert_eq!(board.snapshot().report_path, Some(PathBuf::from("new.html")));
    }

    #[test]
    fn progress_handles_zero_total() {
        assert_eq!(progress_percent(0, 0), 0.0);
        assert!((progress_percent(1, 3) - 33.333_333).abs() < 1e-4);
        assert_eq!(progress_percent(3, 3), 100.0);
    }
}
