//! Ollama `/api/chat` client (non-streaming)

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::{ChatMessage, ChatModel, ModelError};

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: ResponseMessage,
    #[serde(default)]
    eval_count: u32,
    #[serde(default)]
    eval_duration: u64,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: String,
}

#[derive(Clone)]
pub struct OllamaChat {
    base_url: String,
    model: String,
    name: String,
    client: reqwest::Client,
}

impl OllamaChat {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url, model)
    }

    pub fn with_client(
        client: reqwest::Client,
        base_url: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        let model = model.into();
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            name: format!("ollama:{}", model),
            model,
            client,
        }
    }
}

#[async_trait]
impl ChatModel for OllamaChat {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, ModelError> {
        let endpoint = format!("{}/api/chat", self.base_url);
        let body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "stream": false,
            "options": {
                "temperature": 0.0
            }
        });

        let response = self.client.post(&endpoint).json(&body).send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(ModelError::Status {
                status: status.as_u16(),
                body: text,
            });
        }
        if text.is_empty() {
            return Err(ModelError::EmptyResponse);
        }

        let reply = parse_reply(&text)?;
        Ok(reply)
    }
}

fn parse_reply(text: &str) -> Result<String, ModelError> {
    let parsed: ChatResponse = serde_json::from_str(text)?;
    debug!(
        eval_count = parsed.eval_count,
        eval_duration_ns = parsed.eval_duration,
        "Ollama reply"
    );
    if parsed.message.content.trim().is_empty() {
        return Err(ModelError::EmptyResponse);
    }
    Ok(parsed.message.content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reply() {
        let text = r#"{"model":"qwen3","message":{"role":"assistant","content":"```python\nprint(1)\n```"},"done":true,"eval_count":12}"#;
        assert_eq!(parse_reply(text).unwrap(), "```python\nprint(1)\n```");
    }

    #[test]
    fn test_blank_reply_is_empty_response() {
        let text = r#"{"message":{"role":"assistant","content":"  "},"done":true}"#;
        assert!(matches!(parse_reply(text), Err(ModelError::EmptyResponse)));
        assert!(matches!(parse_reply("{}"), Err(ModelError::Parse(_))));
    }

    #[test]
    fn test_base_url_trailing_slash() {
        let chat = OllamaChat::new("http://localhost:11434/", "qwen3");
        assert_eq!(chat.base_url, "http://localhost:11434");
        assert_eq!(chat.name(), "ollama:qwen3");
    }
}
