use super::prompt;
use crate::agent::LanguageModel;
use crate::model::Verdict;
use anyhow::{Context, Result};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

const NO_DETAILS: &str = "No details provided";

/// Reduces an agent's free-text answer to a structured verdict via a second model pass.
pub struct VerdictExtractor {
    model: Arc<dyn LanguageModel>,
}

impl VerdictExtractor {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }

    /// Errors only when the model call itself fails. A reply that can't be parsed is a
    /// failed verdict, not an error.
    pub async fn extract(&self, agent_output: &str) -> Result<Verdict> {
        let extraction_prompt = prompt::build_extraction_prompt(agent_output);
        debug!(prompt = %extraction_prompt, "requesting verdict extraction");
        let reply = self
            .model
            .invoke(&extraction_prompt)
            .await
            .context("verdict extraction model call failed")?;
        Ok(parse_verdict(&reply))
    }
}

/// Best-effort parse of the model's reply.
///
/// Anything that isn't a JSON object falls back to a failed verdict carrying the raw reply.
/// Missing or mistyped fields default individually.
pub fn parse_verdict(reply: &str) -> Verdict {
    match serde_json::from_str::<Value>(reply) {
        Ok(Value::Object(map)) => {
            let passed = map.get("passed").and_then(Value::as_bool).unwrap_or(false);
            let details = map
                .get("details")
                .and_then(Value::as_str)
                .unwrap_or(NO_DETAILS)
                .to_string();
            debug!(passed, "extracted verdict");
            Verdict { passed, details }
        }
        Ok(other) => {
            let kind = json_kind(&other);
            warn!(kind, reply, "extraction reply is not a JSON object");
            Verdict::failed(format!(
                "Could not parse LLM extraction: expected a JSON object, got {kind} | {reply}"
            ))
        }
        Err(e) => {
            warn!(error = %e, reply, "error parsing extraction reply as JSON");
            Verdict::failed(format!("Could not parse LLM extraction: {e} | {reply}"))
        }
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
