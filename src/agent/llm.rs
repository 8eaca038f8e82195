use super::LanguageModel;
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const OPENAI_CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";

/// Which chat-completions backend to talk to. Keys stay out of `Debug` output.
#[derive(Clone)]
pub enum ModelProvider {
    OpenAi {
        api_key: String,
        model: String,
    },
    Azure {
        api_key: String,
        endpoint: String,
        deployment: String,
        api_version: String,
    },
}

impl std::fmt::Debug for ModelProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelProvider::OpenAi { model, .. } => {
                f.debug_struct("OpenAi").field("model", model).finish()
            }
            ModelProvider::Azure {
                endpoint,
                deployment,
                api_version,
                ..
            } => f
                .debug_struct("Azure")
                .field("endpoint", endpoint)
                .field("deployment", deployment)
                .field("api_version", api_version)
                .finish(),
        }
    }
}

/// Credentials as gathered from flags / environment.
#[derive(Clone, Default)]
pub struct ModelCredentials {
    pub openai_api_key: Option<String>,
    pub openai_model: String,
    pub azure_api_key: Option<String>,
    pub azure_endpoint: Option<String>,
    pub azure_deployment: String,
    pub azure_api_version: String,
}

impl ModelProvider {
    /// OpenAI wins when its key is present; Azure needs both key and endpoint.
    pub fn select(creds: &ModelCredentials) -> Result<Self> {
        let non_empty = |v: &Option<String>| {
            v.as_deref()
                .filter(|s| !s.trim().is_empty())
                .map(str::to_owned)
        };
        if let Some(api_key) = non_empty(&creds.openai_api_key) {
            return Ok(ModelProvider::OpenAi {
                api_key,
                model: creds.openai_model.clone(),
            });
        }
        match (non_empty(&creds.azure_api_key), non_empty(&creds.azure_endpoint)) {
            (Some(api_key), Some(endpoint)) => Ok(ModelProvider::Azure {
                api_key,
                endpoint,
                deployment: creds.azure_deployment.clone(),
                api_version: creds.azure_api_version.clone(),
            }),
            _ => bail!("No LLM API keys found"),
        }
    }

    fn chat_url(&self) -> Result<Url> {
        match self {
            ModelProvider::OpenAi { .. } => Url::parse(OPENAI_CHAT_URL).context("parse OpenAI URL"),
            ModelProvider::Azure {
                endpoint,
                deployment,
                api_version,
                ..
            } => {
                let raw = format!(
                    "{}/openai/deployments/{}/chat/completions",
                    endpoint.trim_end_matches('/'),
                    deployment
                );
                let mut url =
                    Url::parse(&raw).with_context(|| format!("invalid Azure endpoint: {endpoint}"))?;
                url.query_pairs_mut().append_pair("api-version", api_version);
                Ok(url)
            }
        }
    }

    fn model_name(&self) -> Option<&str> {
        match self {
            ModelProvider::OpenAi { model, .. } => Some(model),
            // Azure routes by deployment; the body carries no model.
            ModelProvider::Azure { .. } => None,
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    temperature: f32,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

/// Single-turn chat-completions client at temperature 0.
pub struct ChatModel {
    http: reqwest::Client,
    provider: ModelProvider,
    url: Url,
}

impl ChatModel {
    pub fn new(provider: ModelProvider, timeout: Duration, user_agent: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(user_agent.to_string())
            .timeout(timeout)
            .build()
            .context("build model HTTP client")?;
        let url = provider.chat_url()?;
        Ok(Self {
            http,
            provider,
            url,
        })
    }

    pub fn provider(&self) -> &ModelProvider {
        &self.provider
    }
}

#[async_trait]
impl LanguageModel for ChatModel {
    async fn invoke(&self, prompt: &str) -> Result<String> {
        let body = ChatRequest {
            model: self.provider.model_name(),
            temperature: 0.0,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
        };
        let req = self.http.post(self.url.clone()).json(&body);
        let req = match &self.provider {
            ModelProvider::OpenAi { api_key, .. } => req.bearer_auth(api_key),
            ModelProvider::Azure { api_key, .. } => req.header("api-key", api_key),
        };
        let resp = req.send().await.context("send chat completion request")?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            bail!("chat completion returned {status}: {text}");
        }
        let parsed: ChatResponse = resp
            .json()
            .await
            .context("decode chat completion response")?;
        first_content(parsed)
    }
}

fn first_content(resp: ChatResponse) -> Result<String> {
    resp.choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| anyhow!("chat completion returned no content"))
}
