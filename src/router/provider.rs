//! Completion providers.
//!
//! A provider turns one prompt into one completion. Two wire protocols are
//! supported:
//! - Ollama's native `/api/chat`
//! - OpenAI-compatible `/chat/completions` (OpenAI, Anthropic's compatibility
//!   endpoint, vLLM, LM Studio, ...)

use crate::config::{ApiStyle, ProviderConfig, Tier};
use crate::error::ProviderError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Upper bound on how much of an error body ends up in logs and errors.
const MAX_ERROR_BODY: usize = 500;

/// A single prompt for a completion provider.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system: String,
    pub prompt: String,
}

/// Anything that can answer a [`CompletionRequest`].
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    fn name(&self) -> &str;

    fn tier(&self) -> Tier;

    /// Hard limit for one call, enforced by the caller.
    fn timeout(&self) -> Duration;

    async fn complete(&self, request: &CompletionRequest) -> Result<String, ProviderError>;
}

/// Message in a chat request.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

impl ChatMessage {
    fn new(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: content.to_string(),
        }
    }
}

/// Ollama chat API request.
#[derive(Debug, Serialize)]
struct OllamaChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
    num_predict: u32,
}

/// Ollama chat API response.
#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    message: ChatMessage,
}

/// OpenAI-compatible chat request.
#[derive(Debug, Serialize)]
struct OpenAiChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct OpenAiChatResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: ChatMessage,
}

/// A provider reached over HTTP.
pub struct HttpProvider {
    config: ProviderConfig,
    http_client: reqwest::Client,
}

impl HttpProvider {
    /// Create a provider. The client is shared by every provider.
    pub fn new(config: ProviderConfig, http_client: reqwest::Client) -> Self {
        debug!(
            "Configured provider {} ({} tier, model {})",
            config.name, config.tier, config.model
        );
        Self {
            config,
            http_client,
        }
    }

    fn endpoint(&self) -> String {
        let base = self.config.base_url.trim_end_matches('/');
        match self.config.api_style {
            ApiStyle::Ollama => format!("{}/api/chat", base),
            ApiStyle::OpenAi => format!("{}/chat/completions", base),
        }
    }

    fn api_key(&self) -> Result<Option<String>, ProviderError> {
        match self.config.api_key_env {
            Some(ref var) => std::env::var(var)
                .map(Some)
                .map_err(|_| ProviderError::MissingApiKey {
                    provider: self.config.name.clone(),
                    variable: var.clone(),
                }),
            None => Ok(None),
        }
    }

    fn messages(request: &CompletionRequest) -> Vec<ChatMessage> {
        vec![
            ChatMessage::new("system", &request.system),
            ChatMessage::new("user", &request.prompt),
        ]
    }

    fn transport_error(&self, e: reqwest::Error) -> ProviderError {
        if e.is_timeout() {
            ProviderError::Timeout {
                provider: self.config.name.clone(),
                timeout: self.config.timeout(),
            }
        } else if e.is_connect() {
            ProviderError::Transport {
                provider: self.config.name.clone(),
                message: format!("cannot connect to {}", self.config.base_url),
            }
        } else {
            ProviderError::Transport {
                provider: self.config.name.clone(),
                message: e.to_string(),
            }
        }
    }

    async fn post<B: Serialize>(&self, body: &B) -> Result<reqwest::Response, ProviderError> {
        let mut request = self
            .http_client
            .post(self.endpoint())
            .timeout(self.config.timeout())
            .json(body);

        if let Some(key) = self.api_key()? {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| self.transport_error(e))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let mut body = response.text().await.unwrap_or_default();
            body.truncate(floor_char_boundary(&body, MAX_ERROR_BODY));
            return Err(ProviderError::Status {
                provider: self.config.name.clone(),
                status,
                body,
            });
        }

        Ok(response)
    }
}

#[async_trait]
impl CompletionProvider for HttpProvider {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn tier(&self) -> Tier {
        self.config.tier
    }

    fn timeout(&self) -> Duration {
        self.config.timeout()
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String, ProviderError> {
        debug!(provider = %self.config.name, "Sending completion request");

        match self.config.api_style {
            ApiStyle::Ollama => {
                let body = OllamaChatRequest {
                    model: self.config.model.clone(),
                    messages: Self::messages(request),
                    stream: false,
                    options: OllamaOptions {
                        temperature: self.config.temperature,
                        num_predict: self.config.max_tokens,
                    },
                };
                let response: OllamaChatResponse = self
                    .post(&body)
                    .await?
                    .json()
                    .await
                    .map_err(|e| ProviderError::malformed(&self.config.name, e.to_string()))?;
                Ok(response.message.content)
            }
            ApiStyle::OpenAi => {
                let body = OpenAiChatRequest {
                    model: self.config.model.clone(),
                    messages: Self::messages(request),
                    temperature: self.config.temperature,
                    max_tokens: self.config.max_tokens,
                };
                let response: OpenAiChatResponse = self
                    .post(&body)
                    .await?
                    .json()
                    .await
                    .map_err(|e| ProviderError::malformed(&self.config.name, e.to_string()))?;
                response
                    .choices
                    .into_iter()
                    .next()
                    .map(|c| c.message.content)
                    .ok_or_else(|| ProviderError::malformed(&self.config.name, "no choices in response"))
            }
        }
    }
}

fn floor_char_boundary(s: &str, max: usize) -> usize {
    if s.len() <= max {
        return s.len();
    }
    (0..=max).rev().find(|&i| s.is_char_boundary(i)).unwrap_or(0)
}

/// Read-only set of configured providers.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn CompletionProvider>>,
}

impl ProviderRegistry {
    pub fn new(providers: Vec<Arc<dyn CompletionProvider>>) -> Self {
        Self { providers }
    }

    /// Build HTTP providers for every configured entry.
    pub fn from_config(configs: &[ProviderConfig], http_client: &reqwest::Client) -> Self {
        let providers = configs
            .iter()
            .map(|c| Arc::new(HttpProvider::new(c.clone(), http_client.clone())) as Arc<dyn CompletionProvider>)
            .collect();
        Self { providers }
    }

    /// First provider of the given tier.
    pub fn by_tier(&self, tier: Tier) -> Option<Arc<dyn CompletionProvider>> {
        self.providers.iter().find(|p| p.tier() == tier).cloned()
    }

    pub fn by_name(&self, name: &str) -> Option<Arc<dyn CompletionProvider>> {
        self.providers.iter().find(|p| p.name() == name).cloned()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}
