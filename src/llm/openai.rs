//! OpenAI-compatible `/chat/completions` client

use async_trait::async_trait;
use serde::Deserialize;

use super::{ChatMessage, ChatModel, ModelError};

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Clone)]
pub struct OpenAiChat {
    base_url: String,
    api_key: String,
    model: String,
    name: String,
    client: reqwest::Client,
}

impl OpenAiChat {
    pub fn with_client(
        client: reqwest::Client,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        let model = model.into();
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            name: format!("openai:{}", model),
            model,
            client,
        }
    }
}

#[async_trait]
impl ChatModel for OpenAiChat {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, ModelError> {
        let endpoint = format!("{}/chat/completions", self.base_url);
        let body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "temperature": 0.0,
        });

        let response = self
            .client
            .post(&endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(ModelError::Status {
                status: status.as_u16(),
                body: text,
            });
        }
        parse_completion(&text)
    }
}

fn parse_completion(text: &str) -> Result<String, ModelError> {
    let parsed: CompletionResponse = serde_json::from_str(text)?;
    parsed
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .filter(|content| !content.trim().is_empty())
        .ok_or(ModelError::EmptyResponse)
}
