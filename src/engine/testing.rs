//! In-process collaborators for engine and controller tests.

use crate::agent::{BrowserAgent, BrowserSession, EvidenceCapture, LanguageModel};
use crate::model::ControlResult;
use crate::report::ReportSink;
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

#[derive(Clone)]
pub(crate) enum AgentStep {
    /// Agent reports the control as met.
    Pass(&'static str),
    /// Agent reports the control as not met.
    Deny(&'static str),
    /// Agent call errors out.
    Fail(&'static str),
    Panic,
    /// Signal `started`, wait for `release`, then pass.
    Gate {
        started: Arc<Notify>,
        release: Arc<Notify>,
    },
}

pub(crate) struct FakeAgent {
    steps: HashMap<String, AgentStep>,
    calls: Mutex<Vec<(String, u32)>>,
}

impl FakeAgent {
    pub fn new() -> Self {
        Self {
            steps: HashMap::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with(mut self, control_id: &str, step: AgentStep) -> Self {
        self.steps.insert(control_id.to_string(), step);
        self
    }

    pub fn calls(&self) -> Vec<(String, u32)> {
        self.calls.lock().unwrap().clone()
    }

    /// Control ids in the order the agent was asked about them.
    pub fn audited_ids(&self) -> Vec<String> {
        self.calls()
            .iter()
            .filter_map(|(task, _)| control_id_of(task))
            .collect()
    }
}

fn control_id_of(task: &str) -> Option<String> {
    task.lines()
        .find_map(|l| l.trim().strip_prefix("Current control: "))
        .and_then(|rest| rest.split(" - ").next())
        .map(str::to_owned)
}

#[async_trait]
impl BrowserAgent for FakeAgent {
    async fn run(&self, task: &str, step_budget: u32) -> Result<String> {
        self.calls
            .lock()
            .unwrap()
            .push((task.to_string(), step_budget));
        let id = control_id_of(task).unwrap_or_default();
        match self.steps.get(&id).cloned().unwrap_or(AgentStep::Pass("ok")) {
            AgentStep::Pass(text) => Ok(format!("VERDICT:PASS {text}")),
            AgentStep::Deny(text) => Ok(format!("VERDICT:FAIL {text}")),
            AgentStep::Fail(msg) => Err(anyhow!(msg)),
            AgentStep::Panic => panic!("agent exploded on {id}"),
            AgentStep::Gate { started, release } => {
                started.notify_one();
                release.notified().await;
                Ok("VERDICT:PASS gated control".to_string())
            }
        }
    }
}

/// Turns `VERDICT:PASS <text>` agent output into a well-formed JSON reply.
pub(crate) struct FakeModel;

#[async_trait]
impl LanguageModel for FakeModel {
    async fn invoke(&self, prompt: &str) -> Result<String> {
        let text = prompt
            .split("Text:\n")
            .nth(1)
            .and_then(|rest| rest.lines().next())
            .unwrap_or_default();
        let passed = text.starts_with("VERDICT:PASS");
        Ok(serde_json::json!({ "passed": passed, "details": text }).to_string())
    }
}

pub(crate) enum FakeCapture {
    Image(Vec<u8>),
    Empty,
    Fail,
}

#[async_trait]
impl EvidenceCapture for FakeCapture {
    async fn capture_full_page(&self) -> Result<Option<Vec<u8>>> {
        match self {
            FakeCapture::Image(bytes) => Ok(Some(bytes.clone())),
            FakeCapture::Empty => Ok(None),
            FakeCapture::Fail => bail!("page crashed"),
        }
    }
}

pub(crate) struct FakeSession(pub AtomicBool);

impl FakeSession {
    pub fn established() -> Self {
        Self(AtomicBool::new(true))
    }

    pub fn absent() -> Self {
        Self(AtomicBool::new(false))
    }
}

#[async_trait]
impl BrowserSession for FakeSession {
    fn is_established(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    async fn launch(&self) -> Result<bool> {
        Ok(!self.0.swap(true, Ordering::SeqCst))
    }
}

/// Report sink that records what it was asked to render and optionally fails.
#[derive(Default)]
pub(crate) struct RecordingReport {
    pub fail: bool,
    pub compiled: Mutex<Vec<(PathBuf, Vec<String>)>>,
}

impl RecordingReport {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn compiled(&self) -> Vec<(PathBuf, Vec<String>)> {
        self.compiled.lock().unwrap().clone()
    }
}

impl ReportSink for RecordingReport {
    fn compile(&self, results: &[ControlResult], destination: &Path) -> Result<PathBuf> {
        if self.fail {
            bail!("disk full");
        }
        let ids = results.iter().map(|r| r.control_id.clone()).collect();
        self.compiled
            .lock()
            .unwrap()
            .push((destination.to_path_buf(), ids));
        Ok(destination.to_path_buf())
    }
}
