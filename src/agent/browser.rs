use super::{BrowserAgent, BrowserSession, EvidenceCapture};
use crate::model::AuditConfig;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::Engine;
use reqwest::Url;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

/// Longest slice of an error body worth carrying into an error message.
const MAX_ERROR_BODY_CHARS: usize = 500;

/// Client for the browser agent service that owns the single shared browser context.
///
/// The service exposes three operations: launch the session on the console, run an agent
/// task in it, and screenshot whatever page it is on.
pub struct BrowserServiceClient {
    http: reqwest::Client,
    base_url: Url,
    console_url: String,
    established: AtomicBool,
}

#[derive(Debug, Serialize)]
struct LaunchRequest<'a> {
    start_url: &'a str,
}

#[derive(Debug, Deserialize)]
struct LaunchResponse {
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Serialize)]
struct AgentRunRequest<'a> {
    task: &'a str,
    max_steps: u32,
}

#[derive(Debug, Deserialize)]
struct AgentRunResponse {
    result: String,
}

#[derive(Debug, Deserialize)]
struct ScreenshotResponse {
    #[serde(default)]
    data: Option<String>,
}

impl BrowserServiceClient {
    pub fn new(cfg: &AuditConfig) -> Result<Self> {
        let base_url = normalize_base(&cfg.agent_url)?;
        let http = reqwest::Client::builder()
            .user_agent(cfg.user_agent.clone())
            .timeout(cfg.agent_timeout)
            .build()
            .context("build agent HTTP client")?;
        Ok(Self {
            http,
            base_url,
            console_url: cfg.console_url.clone(),
            established: AtomicBool::new(false),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .with_context(|| format!("build agent service URL for {path}"))
    }
}

#[async_trait]
impl BrowserSession for BrowserServiceClient {
    fn is_established(&self) -> bool {
        self.established.load(Ordering::Acquire)
    }

    async fn launch(&self) -> Result<bool> {
        if self.is_established() {
            return Ok(false);
        }
        let url = self.endpoint("session/launch")?;
        let resp = self
            .http
            .post(url)
            .json(&LaunchRequest {
                start_url: &self.console_url,
            })
            .send()
            .await
            .context("launch browser session")?;
        let body: LaunchResponse = read_json(resp, "browser launch").await?;
        info!(
            console = %self.console_url,
            message = body.message.as_deref().unwrap_or("launched"),
            "browser session established"
        );
        self.established.store(true, Ordering::Release);
        Ok(true)
    }
}

#[async_trait]
impl BrowserAgent for BrowserServiceClient {
    async fn run(&self, task: &str, step_budget: u32) -> Result<String> {
        let url = self.endpoint("agent/run")?;
        debug!(max_steps = step_budget, "dispatching agent task");
        let resp = self
            .http
            .post(url)
            .json(&AgentRunRequest {
                task,
                max_steps: step_budget,
            })
            .send()
            .await
            .context("send agent task")?;
        let body: AgentRunResponse = read_json(resp, "agent run").await?;
        Ok(body.result)
    }
}

#[async_trait]
impl EvidenceCapture for BrowserServiceClient {
    async fn capture_full_page(&self) -> Result<Option<Vec<u8>>> {
        let mut url = self.endpoint("session/screenshot")?;
        url.query_pairs_mut().append_pair("full_page", "true");
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .context("request screenshot")?;
        let body: ScreenshotResponse = read_json(resp, "screenshot").await?;
        body.data.as_deref().map(decode_screenshot).transpose()
    }
}

async fn read_json<T: DeserializeOwned>(resp: reqwest::Response, what: &str) -> Result<T> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        let body: String = body.chars().take(MAX_ERROR_BODY_CHARS).collect();
        bail!("{what} returned {status}: {body}");
    }
    resp.json::<T>()
        .await
        .with_context(|| format!("decode {what} response"))
}

/// Ensure the base URL ends with a slash so relative joins append instead of replacing.
fn normalize_base(raw: &str) -> Result<Url> {
    let mut url = Url::parse(raw).with_context(|| format!("invalid agent URL: {raw}"))?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

fn decode_screenshot(data: &str) -> Result<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(data.trim())
        .context("decode base64 screenshot")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_joins_append_paths() {
        let base = normalize_base("http://127.0.0.1:9333/browser").unwrap();
        assert_eq!(
            base.join("agent/run").unwrap().as_str(),
            "http://127.0.0.1:9333/browser/agent/run"
        );
        let base = normalize_base("http://localhost:9333").unwrap();
        assert_eq!(
            base.join("session/launch").unwrap().as_str(),
            "http://localhost:9333/session/launch"
        );
    }

    #[test]
    fn invalid_base_url_is_rejected() {
        assert!(normalize_base("not a url").is_err());
    }

    #[test]
    fn screenshot_payload_is_base64() {
        let encoded = base64::engine::general_purpose::STANDARD.encode(b"\x89PNG");
        assert_eq!(decode_screenshot(&encoded).unwrap(), b"\x89PNG".to_vec());
        assert!(decode_screenshot("***").is_err());
    }
}
