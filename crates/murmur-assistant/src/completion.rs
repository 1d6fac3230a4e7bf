use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::context::{ContextTurn, Role};

pub const SYSTEM_PROMPT: &str = "You are a helpful and friendly AI assistant in a chat application. \
                                 Keep your responses concise and conversational.";

pub const NOT_CONFIGURED_REPLY: &str = "I'm sorry, I'm not configured correctly (missing API key).";

pub const DEFAULT_COMPLETION_URL: &str = "https://api.mistral.ai/v1/chat/completions";
pub const DEFAULT_MODEL: &str = "mistral-tiny";

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("no API key configured")]
    NotConfigured,
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("completion service returned {0}")]
    Status(u16),
    #[error("generation timed out")]
    Timeout,
    #[error("completion response had no choices")]
    EmptyChoices,
}

/// Request/response text generation.
#[async_trait]
pub trait TextGenerator: Send + Sync + 'static {
    async fn complete(
        &self,
        system_prompt: &str,
        context: &[ContextTurn],
        message: &str,
    ) -> Result<String, GenerationError>;
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<Turn<'a>>,
}

#[derive(Serialize)]
struct Turn<'a> {
    role: Role,
    content: &'a str,
}

#[derive(Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Client for an OpenAI-style chat-completions endpoint (Mistral by default).
pub struct MistralClient {
    http: reqwest::Client,
    url: String,
    model: String,
    api_key: String,
}

impl MistralClient {
    pub fn new(
        url: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, GenerationError> {
        let api_key = api_key
            .filter(|key| !key.trim().is_empty())
            .ok_or(GenerationError::NotConfigured)?;
        let http = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            http,
            url: url.into(),
            model: model.into(),
            api_key,
        })
    }
}

#[async_trait]
impl TextGenerator for MistralClient {
    async fn complete(
        &self,
        system_prompt: &str,
        context: &[ContextTurn],
        message: &str,
    ) -> Result<String, GenerationError> {
        let mut messages = Vec::with_capacity(context.len() + 2);
        messages.push(Turn { role: Role::System, content: system_prompt });
        messages.extend(context.iter().map(|turn| Turn {
            role: turn.role,
            content: &turn.content,
        }));
        messages.push(Turn { role: Role::User, content: message });

        let response = self
            .http
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&CompletionRequest { model: &self.model, messages })
            .send()
            .await
            .map_err(timeout_or_http)?;

        let status = response.status();
        if !status.is_success() {
            return Err(GenerationError::Status(status.as_u16()));
        }

        let body: CompletionResponse = response.json().await.map_err(timeout_or_http)?;
        let choice = body.choices.into_iter().next().ok_or(GenerationError::EmptyChoices)?;
        let text = choice.message.content.unwrap_or_default();
        debug!("Completion returned {} chars", text.len());
        Ok(text)
    }
}

fn timeout_or_http(e: reqwest::Error) -> GenerationError {
    if e.is_timeout() {
        GenerationError::Timeout
    } else {
        GenerationError::Http(e)
    }
}

/// Used when no API key is set; always answers with the same notice.
pub struct CannedReply;

#[async_trait]
impl TextGenerator for CannedReply {
    async fn complete(
        &self,
        _system_prompt: &str,
        _context: &[ContextTurn],
        _message: &str,
    ) -> Result<String, GenerationError> {
        Ok(NOT_CONFIGURED_REPLY.to_string())
    }
}
