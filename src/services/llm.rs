//! Generation provider integration
//!
//! Defines the provider boundary used by the generation invoker and an
//! OpenAI-compatible chat-completions backend. Provider failures are
//! classified as transient (worth retrying) or permanent.

use crate::config::GenerationConfig;
use crate::types::EntityId;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Role of a context message in the provider payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextRole {
    User,
    Assistant,
}

/// One ordered conversation turn handed to the provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextMessage {
    pub role: ContextRole,
    pub content: String,
}

impl ContextMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ContextRole::User,
            content: content.into(),
        }
    }
}

/// Everything the provider needs for one attempt
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub entity_id: EntityId,
    pub system_prompt: String,
    pub context: Vec<ContextMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// Successful provider response
#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub text: String,
    pub usage: TokenUsage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientKind {
    Timeout,
    RateLimited,
    /// Upstream 5xx
    Upstream,
    Network,
}

impl fmt::Display for TransientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransientKind::Timeout => "timeout",
            TransientKind::RateLimited => "rate limited",
            TransientKind::Upstream => "upstream error",
            TransientKind::Network => "network error",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermanentKind {
    Authentication,
    MalformedRequest,
    InvalidResponse,
    /// Nothing usable left after post-processing
    EmptyResponse,
}

impl fmt::Display for PermanentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PermanentKind::Authentication => "authentication",
            PermanentKind::MalformedRequest => "malformed request",
            PermanentKind::InvalidResponse => "invalid response",
            PermanentKind::EmptyResponse => "empty response",
        };
        f.write_str(name)
    }
}

/// Classified provider failure
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GenerationError {
    #[error("transient {kind}: {message}")]
    Transient { kind: TransientKind, message: String },

    #[error("permanent {kind}: {message}")]
    Permanent { kind: PermanentKind, message: String },
}

impl GenerationError {
    pub fn transient(kind: TransientKind, message: impl Into<String>) -> Self {
        GenerationError::Transient {
            kind,
            message: message.into(),
        }
    }

    pub fn permanent(kind: PermanentKind, message: impl Into<String>) -> Self {
        GenerationError::Permanent {
            kind,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, GenerationError::Transient { .. })
    }

    /// Map an HTTP status to a failure class
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let message = format!("status {}: {}", status, body);
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Self::permanent(PermanentKind::Authentication, message)
            }
            StatusCode::TOO_MANY_REQUESTS => Self::transient(TransientKind::RateLimited, message),
            StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
                Self::transient(TransientKind::Timeout, message)
            }
            s if s.is_server_error() => Self::transient(TransientKind::Upstream, message),
            _ => Self::permanent(PermanentKind::MalformedRequest, message),
        }
    }
}

/// External language-generation provider
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<Generation, GenerationError>;
}

/// OpenAI-compatible chat-completions backend
pub struct OpenAiCompatibleProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
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

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

impl OpenAiCompatibleProvider {
    pub fn new(
        api_key: String,
        model: String,
        base_url: String,
        request_timeout: Duration,
    ) -> crate::error::Result<Self> {
        if api_key.is_empty() {
            return Err(crate::error::ChorusError::InvalidConfig(
                "generation API key not set (CHORUS__GENERATION__API_KEY or OPENAI_API_KEY)"
                    .to_string(),
            ));
        }

        let client = reqwest::Client::builder().timeout(request_timeout).build()?;

        Ok(Self {
            client,
            api_key,
            model,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn from_config(config: &GenerationConfig) -> crate::error::Result<Self> {
        Self::new(
            config.api_key.clone().unwrap_or_default(),
            config.model.clone(),
            config.api_base.clone(),
            // The invoker enforces the per-attempt timeout; this only bounds
            // a connection that never returns
            config.attempt_timeout * 2,
        )
    }

    fn build_body<'a>(&'a self, request: &'a GenerationRequest) -> ChatRequest<'a> {
        let mut messages = Vec::with_capacity(request.context.len() + 1);
        messages.push(ChatMessage {
            role: "system",
            content: &request.system_prompt,
        });
        for turn in &request.context {
            messages.push(ChatMessage {
                role: match turn.role {
                    ContextRole::User => "user",
                    ContextRole::Assistant => "assistant",
                },
                content: &turn.content,
            });
        }

        ChatRequest {
            model: &self.model,
            messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        }
    }
}

#[async_trait]
impl GenerationProvider for OpenAiCompatibleProvider {
    async fn generate(&self, request: &GenerationRequest) -> Result<Generation, GenerationError> {
        debug!(
            entity_id = %request.entity_id,
            context_len = request.context.len(),
            "Calling chat completions API"
        );

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&self.build_body(request))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GenerationError::transient(TransientKind::Timeout, e.to_string())
                } else {
                    GenerationError::transient(TransientKind::Network, e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(GenerationError::from_status(status, &error_text));
        }

        let body: ChatResponse = response.json().await.map_err(|e| {
            GenerationError::permanent(
                PermanentKind::InvalidResponse,
                format!("Failed to parse response: {}", e),
            )
        })?;

        let text = body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| {
                GenerationError::permanent(PermanentKind::EmptyResponse, "Empty response from API")
            })?;

        let usage = body
            .usage
            .map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
            })
            .unwrap_or_default();

        Ok(Generation { text, usage })
    }
}
