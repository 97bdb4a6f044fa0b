/// Generation client trait and shared types for streamed model completions.
///
/// A call to [`GenerationClient::generate`] yields a lazy, finite,
/// non-restartable [`TokenStream`]. The stream ends with exactly one
/// [`GenerationEvent::Completed`] carrying the assembled text; a stream that
/// ends without it is [`GenerationError::Incomplete`].
pub mod openai;
pub mod prompts;
pub mod scripted;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

pub use openai::OpenAiClient;
pub use scripted::ScriptedGenerator;

/// Errors surfaced by a generation client.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GenerationError {
    #[error("upstream error{}: {message}", .status.map(|s| format!(" ({s})")).unwrap_or_default())]
    Upstream { status: Option<u16>, message: String },

    #[error("rate limited by upstream")]
    RateLimited,

    #[error("upstream timed out")]
    Timeout,

    #[error("generation cancelled")]
    Cancelled,

    #[error("stream ended before completion")]
    Incomplete,
}

impl GenerationError {
    /// Whether opening the stream again has a reasonable chance to succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            GenerationError::RateLimited | GenerationError::Timeout => true,
            GenerationError::Upstream { status, .. } => status.is_some_and(|s| s >= 500),
            GenerationError::Cancelled | GenerationError::Incomplete => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// One item of a token stream.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationEvent {
    Token(String),
    /// Final assembled text. Nothing follows it.
    Completed(String),
}

pub type TokenStream = BoxStream<'static, Result<GenerationEvent, GenerationError>>;

/// Trait for streamed completion backends.
///
/// Implementations must be `Send + Sync` to be shared behind `Arc` by every
/// session.
#[async_trait]
pub trait GenerationClient: Send + Sync {
    /// Open a completion stream for `prompt` given the prior `history`
    /// (system message first, if any).
    async fn generate(
        &self,
        history: &[ChatMessage],
        prompt: &str,
    ) -> Result<TokenStream, GenerationError>;
}

/// Open a stream, retrying exactly once when the first attempt fails with a
/// transient error. Failures after the stream is open are never retried here.
pub async fn open_with_retry(
    client: &dyn GenerationClient,
    history: &[ChatMessage],
    prompt: &str,
) -> Result<TokenStream, GenerationError> {
    match client.generate(history, prompt).await {
        Ok(stream) => Ok(stream),
        Err(e) if e.is_transient() => {
            warn!("generation open failed ({e}), retrying once");
            client.generate(history, prompt).await
        }
        Err(e) => Err(e),
    }
}

/// Drain a stream and return the completed text.
pub async fn collect_text(mut stream: TokenStream) -> Result<String, GenerationError> {
    while let Some(event) = stream.next().await {
        if let GenerationEvent::Completed(text) = event? {
            return Ok(text);
        }
    }
    Err(GenerationError::Incomplete)
}
