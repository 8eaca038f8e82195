use super::prompt;
use super::verdict::VerdictExtractor;
use crate::agent::{BrowserAgent, EvidenceCapture};
use crate::model::{Control, ControlResult};
use crate::storage;
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Runs one control end to end: task, agent, verdict, evidence.
pub struct ControlAuditor {
    agent: Arc<dyn BrowserAgent>,
    capture: Arc<dyn EvidenceCapture>,
    extractor: VerdictExtractor,
    console_url: String,
    step_budget: u32,
    evidence_dir: PathBuf,
}

impl ControlAuditor {
    pub fn new(
        agent: Arc<dyn BrowserAgent>,
        capture: Arc<dyn EvidenceCapture>,
        extractor: VerdictExtractor,
        console_url: String,
        step_budget: u32,
        evidence_dir: PathBuf,
    ) -> Self {
        Self {
            agent,
            capture,
            extractor,
            console_url,
            step_budget,
            evidence_dir,
        }
    }

    /// Always yields a result. Agent or model failures become a failed verdict that records
    /// the error.
    pub async fn audit(&self, control: &Control, resource_name: &str) -> ControlResult {
        info!(control_id = %control.id, resource = resource_name, "analyzing control");
        match self.inspect(control, resource_name).await {
            Ok(result) => result,
            Err(e) => {
                error!(control_id = %control.id, error = %format!("{e:#}"), "error analyzing control");
                ControlResult::failed(control, format!("Error during analysis: {e:#}"))
            }
        }
    }

    async fn inspect(&self, control: &Control, resource_name: &str) -> Result<ControlResult> {
        let task = prompt::build_task_prompt(control, resource_name, &self.console_url);
        let raw = self
            .agent
            .run(&task, self.step_budget)
            .await
            .context("browser agent run failed")?;
        debug!(control_id = %control.id, output_len = raw.len(), "agent finished");

        let verdict = self.extractor.extract(&raw).await?;
        let evidence = self.capture_evidence(&control.id).await;
        Ok(ControlResult::from_verdict(control, verdict, evidence))
    }

    /// Capture problems never fail the control; they only drop the evidence reference.
    async fn capture_evidence(&self, control_id: &str) -> Option<PathBuf> {
        let bytes = match self.capture.capture_full_page().await {
            Ok(Some(bytes)) if !bytes.is_empty() => bytes,
            Ok(_) => {
                warn!(control_id, "no screenshot data received");
                return None;
            }
            Err(e) => {
                error!(control_id, error = %format!("{e:#}"), "failed to take screenshot");
                return None;
            }
        };
        let path = storage::evidence_path(&self.evidence_dir, control_id, storage::now_local());
        let saved = tokio::task::spawn_blocking(move || storage::save_evidence(&path, &bytes))
            .await
            .context("evidence writer task failed")
            .and_then(|r| r);
        match saved {
            Ok(path) => {
                debug!(control_id, path = %path.display(), "screenshot saved");
                Some(path)
            }
            Err(e) => {
                error!(control_id, error = %format!("{e:#}"), "failed to save screenshot");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::{AgentStep, FakeAgent, FakeCapture, FakeModel};

    fn auditor(agent: FakeAgent, capture: FakeCapture, dir: PathBuf) -> ControlAuditor {
        ControlAuditor::new(
            Arc::new(agent),
            Arc::new(capture),
            VerdictExtractor::new(Arc::new(FakeModel)),
            "https://portal.azure.com/".into(),
            50,
            dir,
        )
    }

    #[tokio::test]
    async fn passing_control_with_evidence() {
        let tmp = tempfile::tempdir().unwrap();
        let agent = FakeAgent::new().with("NS-1", AgentStep::Pass("NSG rules restrict ingress"));
        let a = auditor(agent, FakeCapture::Image(b"png".to_vec()), tmp.path().into());

        let r = a.audit(&Control::new("NS-1", "Network segmentation"), "vm-01").await;
        assert!(r.passed);
        assert_eq!(r.control_id, "NS-1");
        assert_eq!(r.description, "Network segmentation");
        assert!(r.details.contains("NSG rules restrict ingress"));
        let evidence = r.evidence_path.expect("evidence saved");
        assert!(evidence
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("screenshot_NS-1_"));
        assert_eq!(std::fs::read(evidence).unwrap(), b"png");
    }

    #[tokio::test]
    async fn agent_error_becomes_failed_result() {
        let tmp = tempfile::tempdir().unwrap();
        let agent = FakeAgent::new().with("IM-1", AgentStep::Fail("browser context closed"));
        let a = auditor(agent, FakeCapture::Image(b"png".to_vec()), tmp.path().into());

        let r = a.audit(&Control::new("IM-1", "Identity"), "vm-01").await;
        assert!(!r.passed);
        assert!(r.details.starts_with("Error during analysis"));
        assert!(r.details.contains("browser context closed"));
        assert_eq!(r.evidence_path, None);
    }

    #[tokio::test]
    async fn capture_failure_keeps_verdict() {
        let tmp = tempfile::tempdir().unwrap();
        let agent = FakeAgent::new().with("DP-3", AgentStep::Pass("TLS 1.2 enforced"));
        let a = auditor(agent, FakeCapture::Fail, tmp.path().into());

        let r = a.audit(&Control::new("DP-3", "Encrypt in transit"), "vm-01").await;
        assert!(r.passed);
        assert_eq!(r.evidence_path, None);
    }

    #[tokio::test]
    async fn empty_capture_or_unwritable_dir_drops_evidence() {
        let tmp = tempfile::tempdir().unwrap();
        let agent = FakeAgent::new().with("LT-1", AgentStep::Pass("logging on"));
        let a = auditor(agent, FakeCapture::Empty, tmp.path().into());
        let r = a.audit(&Control::new("LT-1", "Logging"), "vm").await;
        assert_eq!(r.evidence_path, None);

        let agent = FakeAgent::new().with("LT-1", AgentStep::Pass("logging on"));
        let a = auditor(
            agent,
            FakeCapture::Image(b"png".to_vec()),
            tmp.path().join("does-not-exist"),
        );
        let r = a.audit(&Control::new("LT-1", "Logging"), "vm").await;
        assert!(r.passed);
        assert_eq!(r.evidence_path, None);
    }

    #[tokio::test]
    async fn task_carries_step_budget_and_resource() {
        let tmp = tempfile::tempdir().unwrap();
        let agent = Arc::new(FakeAgent::new().with("PA-1", AgentStep::Fail("stop")));
        let a = ControlAuditor::new(
            agent.clone(),
            Arc::new(FakeCapture::Empty),
            VerdictExtractor::new(Arc::new(FakeModel)),
            "https://portal.azure.com/".into(),
            7,
            tmp.path().into(),
        );
        a.audit(&Control::new("PA-1", "Privileged access"), "kv-prod").await;
        let calls = agent.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, 7);
        assert!(calls[0].0.contains("Resource to audit: kv-prod"));
    }

    #[tokio::test]
    async fn ids_that_sanitize_alike_keep_separate_evidence() {
        let tmp = tempfile::tempdir().unwrap();
        let agent = FakeAgent::new()
            .with("NS/1", AgentStep::Pass("ok"))
            .with("NS_1", AgentStep::Pass("ok"));
        let a = auditor(agent, FakeCapture::Image(b"png".to_vec()), tmp.path().into());

        let first = a.audit(&Control::new("NS/1", "slash"), "vm").await;
        let second = a.audit(&Control::new("NS_1", "underscore"), "vm").await;
        let first = first.evidence_path.expect("first evidence");
        let second = second.evidence_path.expect("second evidence");
        assert_ne!(first, second);
        assert!(first.exists() && second.exists());
    }
}
