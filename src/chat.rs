use std::sync::Arc;

use axum::{extract::Extension, Json};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::billing::{Admission, UsagePolicyEngine};
use crate::error::{AppError, AppResult};
use crate::extractor::AuthUser;
use crate::provider::{ModelProvider, PromptMessage, Role};

#[derive(Debug, Deserialize)]
pub struct ChatMessagePart {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub text: Option<String>,
}

/// A message as sent by the chat UI: plain `content` or a list of parts.
#[derive(Debug, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub parts: Vec<ChatMessagePart>,
}

impl ChatMessage {
    pub fn text(&self) -> String {
        match &self.content {
            Some(content) if !content.is_empty() => content.clone(),
            _ => self
                .parts
                .iter()
                .filter(|part| part.kind == "text")
                .filter_map(|part| part.text.as_deref())
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub message: String,
    pub tokens_used: Option<u64>,
    /// Quota or credits left after this message, when the plan has a limit.
    pub remaining: Option<i64>,
}

/// key: chat-request-path -> admit, call model, release on failure
pub async fn send_message(
    Extension(usage): Extension<UsagePolicyEngine>,
    Extension(provider): Extension<Arc<dyn ModelProvider>>,
    AuthUser { account_id, .. }: AuthUser,
    Json(payload): Json<ChatRequest>,
) -> AppResult<Json<ChatResponse>> {
    if payload.messages.is_empty() {
        return Err(AppError::BadRequest("messages must not be empty".into()));
    }

    let summary = usage.ledger().plan_summary(account_id).await?;
    let ticket = match usage.admit_account(account_id, &summary.plan).await? {
        Admission::Granted(ticket) => ticket,
        Admission::Denied(reason) => return Err(AppError::TooManyRequests(reason.to_string())),
    };

    let prompt: Vec<PromptMessage> = payload
        .messages
        .iter()
        .map(|message| PromptMessage {
            role: message.role,
            content: message.text(),
        })
        .collect();

    match provider.complete(&prompt).await {
        Ok(completion) => Ok(Json(ChatResponse {
            message: completion.text,
            tokens_used: completion.total_tokens,
            remaining: ticket.remaining,
        })),
        Err(err) => {
            warn!(?err, %account_id, "model call failed; releasing usage");
            if let Err(release_err) = usage.release(ticket).await {
                error!(?release_err, %account_id, "failed to release reserved usage");
            }
            Err(AppError::BadGateway("model provider unavailable".into()))
        }
    }
}
