//! Typed failures at the orchestration boundary.
//!
//! Everything below this boundary uses `anyhow` with context; these enums exist so the
//! transport and CLI layers can tell an input rejection from a broken run, and a broken run
//! from a run whose audit finished but whose report could not be written.

use crate::model::RunPhase;
use std::path::PathBuf;
use thiserror::Error;

/// Reasons a `start` request is turned away. None of them mutate run state.
#[derive(Debug, Error)]
pub enum StartError {
    #[error("Analysis already in progress")]
    AlreadyRunning,
    #[error("Browser not launched. Please launch browser first.")]
    NoSession,
    #[error("Either benchmark file or controls must be provided")]
    MissingControls,
    #[error("No controls supplied")]
    NoControls,
    #[error("Resource name must not be empty")]
    BlankResource,
    #[error("Invalid controls format: {0}")]
    InvalidControls(String),
}

impl StartError {
    /// Conflicts are distinct from malformed input for callers that map to status codes.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StartError::AlreadyRunning)
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    /// Something outside per-control handling broke; the run was aborted.
    #[error("audit run failed: {error:#}")]
    Internal { error: anyhow::Error },
    /// The audit itself finished (or was cancelled) but the report could not be produced.
    #[error("report generation failed for {path}: {error:#}")]
    Report {
        path: PathBuf,
        phase: RunPhase,
        error: anyhow::Error,
    },
}

impl RunError {
    pub fn internal(error: impl Into<anyhow::Error>) -> Self {
        RunError::Internal {
            error: error.into(),
        }
    }

    pub fn is_report_failure(&self) -> bool {
        matches!(self, RunError::Report { .. })
    }
}
