//! External collaborators the audit engine drives.
//!
//! The engine only sees these traits. The HTTP clients in this module are the production
//! implementations; tests swap in in-process fakes.

mod browser;
mod llm;

pub use browser::BrowserServiceClient;
pub use llm::{ChatModel, ModelCredentials, ModelProvider};

use anyhow::Result;
use async_trait::async_trait;

/// A browser-driving agent that carries out a natural-language task.
#[async_trait]
pub trait BrowserAgent: Send + Sync {
    /// Run `task` against the live browser session, taking at most `step_budget` actions,
    /// and return the agent's final free-text answer.
    async fn run(&self, task: &str, step_budget: u32) -> Result<String>;
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn invoke(&self, prompt: &str) -> Result<String>;
}

#[async_trait]
pub trait EvidenceCapture: Send + Sync {
    /// Full-page capture of the current browser state. `None` means nothing was captured.
    async fn capture_full_page(&self) -> Result<Option<Vec<u8>>>;
}

/// The process-wide browser session shared by every run.
#[async_trait]
pub trait BrowserSession: Send + Sync {
    fn is_established(&self) -> bool;

    /// Establish the session. Returns `false` when it was already running.
    async fn launch(&self) -> Result<bool>;
}
