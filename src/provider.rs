use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromptMessage {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Completion {
    pub text: String,
    pub total_tokens: Option<u64>,
}

/// key: model-provider -> opaque text generation call
#[async_trait]
pub trait ModelProvider: Send + Sync {
    async fn complete(&self, messages: &[PromptMessage]) -> Result<Completion>;
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    total_tokens: u64,
}

/// Non-streaming client for `/v1/chat/completions`.
#[derive(Clone)]
pub struct OpenAiCompatibleProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    system_prompt: String,
}

impl OpenAiCompatibleProvider {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
        system_prompt: impl Into<String>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .context("failed to build model provider client")?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            api_key,
            model: model.into(),
            system_prompt: system_prompt.into(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    fn auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(key) = &self.api_key {
            request.bearer_auth(key)
        } else {
            request
        }
    }
}

#[async_trait]
impl ModelProvider for OpenAiCompatibleProvider {
    async fn complete(&self, messages: &[PromptMessage]) -> Result<Completion> {
        let mut prompt = Vec::with_capacity(messages.len() + 1);
        prompt.push(json!({ "role": Role::System, "content": self.system_prompt }));
        prompt.extend(
            messages
                .iter()
                .map(|message| json!({ "role": message.role, "content": message.content })),
        );

        let response = self
            .auth(self.client.post(self.endpoint("v1/chat/completions")))
            .json(&json!({ "model": self.model, "messages": prompt }))
            .send()
            .await
            .context("model provider request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("model provider answered {status}: {body}"));
        }

        let body: ChatCompletionResponse = response
            .json()
            .await
            .context("model provider returned an unreadable body")?;
        let text = body
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| anyhow!("model provider returned no choices"))?;

        Ok(Completion {
            text,
            total_tokens: body.usage.map(|usage| usage.total_tokens),
        })
    }
}
