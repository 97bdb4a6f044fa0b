/// OpenAI-compatible `chat/completions` client with SSE streaming.
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{ChatMessage, GenerationClient, GenerationError, GenerationEvent, TokenStream};
use crate::config::GenerationConfig;

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<&'a ChatMessage>,
    temperature: f32,
    stream: bool,
}

#[derive(Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Delta,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct Delta {
    content: Option<String>,
}

pub struct OpenAiClient {
    http: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    temperature: f32,
    timeout: Duration,
}

impl OpenAiClient {
    /// Build a client from config. The API key is read from the environment
    /// variable named in `api_key_env`; a missing variable means no auth header.
    pub fn from_config(config: &GenerationConfig) -> Result<Self, GenerationError> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let http = Client::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(|e| GenerationError::Upstream {
                status: None,
                message: e.to_string(),
            })?;
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.is_empty());

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key,
            temperature: config.temperature,
            timeout,
        })
    }
}

fn map_request_error(e: reqwest::Error) -> GenerationError {
    if e.is_timeout() {
        GenerationError::Timeout
    } else {
        GenerationError::Upstream {
            status: e.status().map(|s| s.as_u16()),
            message: e.to_string(),
        }
    }
}

#[async_trait]
impl GenerationClient for OpenAiClient {
    async fn generate(
        &self,
        history: &[ChatMessage],
        prompt: &str,
    ) -> Result<TokenStream, GenerationError> {
        let user = ChatMessage::user(prompt);
        let mut messages: Vec<&ChatMessage> = history.iter().collect();
        messages.push(&user);

        let body = CompletionRequest {
            model: &self.model,
            messages,
            temperature: self.temperature,
            stream: true,
        };

        let mut req = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        debug!("opening completion stream (model={})", self.model);
        let resp = tokio::time::timeout(self.timeout, req.send())
            .await
            .map_err(|_| GenerationError::Timeout)?
            .map_err(map_request_error)?;

        let status = resp.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(GenerationError::RateLimited);
        }
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(GenerationError::Upstream {
                status: Some(status.as_u16()),
                message,
            });
        }

        let bytes = resp
            .bytes_stream()
            .map(|r| r.map(|b| b.to_vec()).map_err(map_request_error))
            .boxed();
        Ok(decode_sse(bytes, self.timeout))
    }
}

type ByteStream = BoxStream<'static, Result<Vec<u8>, GenerationError>>;

struct SseState {
    bytes: ByteStream,
    buffer: Vec<u8>,
    assembled: String,
    idle_timeout: Duration,
    /// A finishing chunk carried text; `Completed` follows its token.
    pending_done: bool,
    done: bool,
}

enum Line {
    Token(String),
    /// Text that arrived in the same chunk as `finish_reason`.
    LastToken(String),
    Done,
    Skip,
}

fn parse_line(line: &[u8]) -> Line {
    let line = String::from_utf8_lossy(line);
    let Some(data) = line.trim().strip_prefix("data:") else {
        return Line::Skip;
    };
    let data = data.trim_start();
    if data == "[DONE]" {
        return Line::Done;
    }
    let Ok(parsed) = serde_json::from_str::<StreamResponse>(data) else {
        return Line::Skip;
    };
    match parsed.choices.into_iter().next() {
        Some(choice) => match (choice.delta.content, choice.finish_reason) {
            (Some(content), Some(_)) if !content.is_empty() => Line::LastToken(content),
            (_, Some(_)) => Line::Done,
            (Some(content), None) if !content.is_empty() => Line::Token(content),
            _ => Line::Skip,
        },
        None => Line::Skip,
    }
}

/// Turn a raw SSE byte stream into generation events. Each chunk read is
/// bounded by `idle_timeout`.
fn decode_sse(bytes: ByteStream, idle_timeout: Duration) -> TokenStream {
    let state = SseState {
        bytes,
        buffer: Vec::new(),
        assembled: String::new(),
        idle_timeout,
        pending_done: false,
        done: false,
    };

    stream::unfold(state, |mut state| async move {
        if state.done {
            return None;
        }
        if state.pending_done {
            state.done = true;
            let text = std::mem::take(&mut state.assembled);
            return Some((Ok(GenerationEvent::Completed(text)), state));
        }
        loop {
            while let Some(pos) = state.buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = state.buffer.drain(..=pos).collect();
                match parse_line(&line) {
                    Line::Token(token) => {
                        state.assembled.push_str(&token);
                        return Some((Ok(GenerationEvent::Token(token)), state));
                    }
                    Line::LastToken(token) => {
                        state.assembled.push_str(&token);
                        state.pending_done = true;
                        return Some((Ok(GenerationEvent::Token(token)), state));
                    }
                    Line::Done => {
                        state.done = true;
                        let text = std::mem::take(&mut state.assembled);
                        return Some((Ok(GenerationEvent::Completed(text)), state));
                    }
                    Line::Skip => {}
                }
            }

            match tokio::time::timeout(state.idle_timeout, state.bytes.next()).await {
                Err(_) => {
                    state.done = true;
                    return Some((Err(GenerationError::Timeout), state));
                }
                Ok(Some(Ok(chunk))) => state.buffer.extend_from_slice(&chunk),
                Ok(Some(Err(e))) => {
                    state.done = true;
                    return Some((Err(e), state));
                }
                Ok(None) => {
                    state.done = true;
                    return Some((Err(GenerationError::Incomplete), state));
                }
            }
        }
    })
    .boxed()
}
