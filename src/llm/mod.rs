//! Chat model clients
//!
//! The cycle only needs "messages in, reply text out", so every backend sits
//! behind [`ChatModel`]. Models are named `provider:model`; a name without a
//! known provider prefix is an Ollama model (Ollama tags contain colons too,
//! e.g. `qwen3:8b`).

pub mod ollama;
pub mod openai;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::Settings;

pub use ollama::OllamaChat;
pub use openai::OpenAiChat;

/// A message in a chat conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String, // "system", "user", "assistant"
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Error type for model calls
#[derive(Debug)]
pub enum ModelError {
    /// Transport failure (connect, timeout, body read)
    Request(reqwest::Error),
    /// Non-success HTTP status
    Status { status: u16, body: String },
    /// Response body did not have the expected shape
    Parse(serde_json::Error),
    /// The model answered with no content
    EmptyResponse,
    /// Bad model name or missing credentials
    Config(String),
}

impl ModelError {
    /// Transport errors, 429, 5xx and empty replies are worth another attempt
    pub fn is_retryable(&self) -> bool {
        match self {
            ModelError::Request(_) | ModelError::EmptyResponse => true,
            ModelError::Status { status, .. } => *status == 429 || *status >= 500,
            ModelError::Parse(_) | ModelError::Config(_) => false,
        }
    }
}

impl fmt::Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelError::Request(e) => write!(f, "Request error: {}", e),
            ModelError::Status { status, body } => {
                write!(f, "Model endpoint returned HTTP {}: {}", status, body)
            }
            ModelError::Parse(e) => write!(f, "Parse error: {}", e),
            ModelError::EmptyResponse => write!(f, "Empty response from model"),
            ModelError::Config(msg) => write!(f, "Model configuration error: {}", msg),
        }
    }
}

impl std::error::Error for ModelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ModelError::Request(e) => Some(e),
            ModelError::Parse(e) => Some(e),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ModelError {
    fn from(e: reqwest::Error) -> Self {
        ModelError::Request(e)
    }
}

impl From<serde_json::Error> for ModelError {
    fn from(e: serde_json::Error) -> Self {
        ModelError::Parse(e)
    }
}

/// A chat backend
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// `provider:model`, used in logs and metrics
    fn name(&self) -> &str;

    /// Send the whole conversation and return the reply text
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, ModelError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Ollama,
    OpenAi,
}

impl Provider {
    fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix.to_ascii_lowercase().as_str() {
            "ollama" => Some(Provider::Ollama),
            "openai" => Some(Provider::OpenAi),
            _ => None,
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provider::Ollama => f.write_str("ollama"),
            Provider::OpenAi => f.write_str("openai"),
        }
    }
}

/// Parsed `provider:model` name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub provider: Provider,
    pub model: String,
}

impl ModelSpec {
    pub fn parse(name: &str) -> Result<Self, ModelError> {
        let name = name.trim();
        let (provider, model) = match name.split_once(':') {
            Some((prefix, rest)) => match Provider::from_prefix(prefix) {
                Some(provider) => (provider, rest.trim()),
                None => (Provider::Ollama, name),
            },
            None => (Provider::Ollama, name),
        };
        if model.is_empty() {
            return Err(ModelError::Config(format!("no model name in {:?}", name)));
        }
        Ok(Self {
            provider,
            model: model.to_string(),
        })
    }
}

impl fmt::Display for ModelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.provider, self.model)
    }
}

/// Build the client for `spec` from the endpoint settings
pub fn build_model(spec: &ModelSpec, settings: &Settings) -> Result<Arc<dyn ChatModel>, ModelError> {
    let client = reqwest::Client::builder()
        .timeout(settings.request_timeout)
        .build()?;

    match spec.provider {
        Provider::Ollama => Ok(Arc::new(OllamaChat::with_client(
            client,
            settings.ollama_url.clone(),
            spec.model.clone(),
        ))),
        Provider::OpenAi => {
            let api_key = settings.openai_api_key.clone().ok_or_else(|| {
                ModelError::Config("OPENAI_API_KEY is required for openai models".to_string())
            })?;
            Ok(Arc::new(OpenAiChat::with_client(
                client,
                settings.openai_base_url.clone(),
                api_key,
                spec.model.clone(),
            )))
        }
    }
}
