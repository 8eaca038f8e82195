use crate::error::StartError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Console the agent is confined to while auditing.
    pub console_url: String,
    /// Maximum number of browser actions the agent may take per control.
    pub step_budget: u32,
    /// Directory under which each run gets its own `audit_results_*` folder.
    pub output_root: PathBuf,
    /// Base URL of the browser agent service.
    pub agent_url: String,
    #[serde(with = "humantime_serde")]
    pub agent_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub model_timeout: Duration,
    pub user_agent: String,
}

/// One checkable compliance requirement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Control {
    #[serde(default = "default_control_id")]
    pub id: String,
    #[serde(default = "default_control_description")]
    pub description: String,
}

fn default_control_id() -> String {
    "Unknown".to_string()
}

fn default_control_description() -> String {
    "No description provided".to_string()
}

impl Control {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
        }
    }
}

/// Benchmark file envelope. Anything besides the control list is ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Benchmark {
    #[serde(default)]
    pub controls: Vec<Control>,
}

impl Benchmark {
    /// Parse a benchmark file (`{"controls": [...]}`).
    pub fn from_json(content: &str) -> Result<Self, StartError> {
        serde_json::from_str(content)
            .map_err(|e| StartError::InvalidControls(format!("invalid benchmark file: {e}")))
    }
}

/// Parse a manually entered control list (a bare JSON array).
pub fn parse_manual_controls(content: &str) -> Result<Vec<Control>, StartError> {
    serde_json::from_str(content).map_err(|e| StartError::InvalidControls(e.to_string()))
}

/// Pick the control list for a run from a benchmark document or a manual list. The
/// benchmark wins when both are supplied.
pub fn resolve_controls(
    benchmark: Option<&str>,
    manual: Option<&str>,
) -> Result<Vec<Control>, StartError> {
    match (benchmark, manual) {
        (Some(doc), _) => Benchmark::from_json(doc).map(|b| b.controls),
        (None, Some(list)) => parse_manual_controls(list),
        (None, None) => Err(StartError::MissingControls),
    }
}

/// Pass/fail outcome for one control plus the explanation behind it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub passed: bool,
    pub details: String,
}

impl Verdict {
    pub fn failed(details: impl Into<String>) -> Self {
        Self {
            passed: false,
            details: details.into(),
        }
    }
}

/// Outcome record for one processed control. Failures are values, never errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlResult {
    pub control_id: String,
    pub description: String,
    pub passed: bool,
    #[serde(default)]
    pub evidence_path: Option<PathBuf>,
    pub details: String,
}

impl ControlResult {
    pub fn from_verdict(control: &Control, verdict: Verdict, evidence_path: Option<PathBuf>) -> Self {
        Self {
            control_id: control.id.clone(),
            description: control.description.clone(),
            passed: verdict.passed,
            evidence_path,
            details: verdict.details,
        }
    }

    pub fn failed(control: &Control, details: impl Into<String>) -> Self {
        Self::from_verdict(control, Verdict::failed(details), None)
    }

    pub fn evidence(&self) -> Option<&Path> {
        self.evidence_path.as_deref()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    #[default]
    Idle,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl RunPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunPhase::Completed | RunPhase::Cancelled | RunPhase::Failed
        )
    }
}

/// Observable state of the current (or most recent) run.
///
/// Wire names (`is_analyzing`, `progress`) are the ones the dashboard polls for.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStatus {
    pub run_id: Option<String>,
    pub phase: RunPhase,
    #[serde(rename = "is_analyzing")]
    pub active: bool,
    pub current_control: Option<String>,
    #[serde(rename = "progress")]
    pub progress_percent: f64,
    pub total_controls: usize,
    pub results: Vec<ControlResult>,
    #[serde(default)]
    pub report_path: Option<PathBuf>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Which flavour of report a run produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportKind {
    Full,
    Partial,
}

impl ReportKind {
    pub fn file_name(self) -> &'static str {
        match self {
            ReportKind::Full => "audit_report.html",
            ReportKind::Partial => "audit_report_partial.html",
        }
    }
}

/// What a finished run hands back to whoever awaited it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    pub run_id: String,
    pub phase: RunPhase,
    pub resource_name: String,
    pub output_dir: PathBuf,
    pub results: Vec<ControlResult>,
    pub report_path: Option<PathBuf>,
}

impl RunOutcome {
    pub fn report_kind(&self) -> Option<ReportKind> {
        self.report_path.as_ref().map(|_| match self.phase {
            RunPhase::Cancelled => ReportKind::Partial,
            _ => ReportKind::Full,
        })
    }
}
