//! Wire format of the streaming connection: typed `{type, data}` envelopes.
//!
//! Every request gets `<type>.completed` or `<type>.error`, echoing the
//! client's `request_id`. Chat turns additionally emit `chat.token` events
//! before their terminal event.
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::db::models::ConversationKind;
use crate::error::{AppError, Result};

pub const AUTHENTICATE: &str = "session.authenticate";
pub const DEMO: &str = "session.demo";
pub const CONVERSATION_LIST: &str = "conversation.list";
pub const MESSAGES_GET: &str = "conversation.messages.get";
pub const CHUNK_CREATE: &str = "conversation.chunk.create";
pub const CHUNK_MERGE: &str = "conversation.chunk.merge";
pub const METADATA: &str = "document.metadata";
pub const CHUNK_LIST: &str = "document.chunk.list";
pub const CHUNK_NAVIGATE: &str = "document.chunk.navigate";
pub const MESSAGE_SEND: &str = "conversation.message.send";
pub const MESSAGE_CANCEL: &str = "conversation.message.cancel";
pub const QUESTIONS_GENERATE: &str = "conversation.questions.generate";
pub const CHAT_TOKEN: &str = "chat.token";

const DEFAULT_QUESTION_COUNT: usize = 3;
const MAX_QUESTION_COUNT: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl Envelope {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
            request_id: None,
        }
    }

    #[must_use]
    pub fn with_request_id(mut self, request_id: Option<String>) -> Self {
        self.request_id = request_id;
        self
    }

    /// `<request>.completed` carrying `data`.
    pub fn completed(request: &str, request_id: Option<String>, data: Value) -> Self {
        Self::new(format!("{request}.completed"), data).with_request_id(request_id)
    }

    /// `<request>.error`, or plain `error` when the request type is unknown.
    pub fn failure(
        request: &str,
        request_id: Option<String>,
        err: &AppError,
        conversation_id: Option<&str>,
    ) -> Self {
        let kind = if request.is_empty() {
            "error".to_string()
        } else {
            format!("{request}.error")
        };
        let mut data = json!({ "code": err.code(), "detail": err.to_string() });
        if let Some(id) = conversation_id {
            data["conversation_id"] = json!(id);
        }
        Self::new(kind, data).with_request_id(request_id)
    }

    pub fn token(conversation_id: &str, token: &str) -> Self {
        Self::new(
            CHAT_TOKEN,
            json!({ "conversation_id": conversation_id, "token": token }),
        )
    }
}

// ── Request payloads ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SendMessage {
    pub conversation_id: String,
    pub content: String,
    #[serde(default)]
    pub conversation_type: Option<ConversationKind>,
    #[serde(default)]
    pub chunk_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AuthenticateData {
    token: String,
}

#[derive(Debug, Default, Deserialize)]
struct ListData {
    #[serde(default)]
    document_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessagesData {
    conversation_id: String,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    offset: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct ChunkCreateData {
    chunk_id: String,
    range: (i64, i64),
    #[serde(default)]
    highlighted_text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MergeData {
    main_conversation_id: String,
    highlight_conversation_id: String,
}

#[derive(Debug, Deserialize)]
struct NavigateData {
    chunk_id: String,
}

#[derive(Debug, Deserialize)]
struct ConversationData {
    conversation_id: String,
}

#[derive(Debug, Deserialize)]
struct QuestionsData {
    conversation_id: String,
    #[serde(default)]
    count: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Authenticate {
        token: String,
    },
    Demo,
    ListConversations {
        document_id: Option<String>,
    },
    GetMessages {
        conversation_id: String,
        limit: Option<usize>,
        offset: usize,
    },
    CreateChunkConversation {
        chunk_id: String,
        start: i64,
        end: i64,
        highlighted_text: Option<String>,
    },
    Merge {
        main_conversation_id: String,
        highlight_conversation_id: String,
    },
    Metadata,
    ListChunks,
    Navigate {
        chunk_id: String,
    },
    SendMessage(SendMessage),
    CancelMessage {
        conversation_id: String,
    },
    GenerateQuestions {
        conversation_id: String,
        count: usize,
    },
}

fn decode<T: DeserializeOwned>(kind: &str, data: &Value) -> Result<T> {
    serde_json::from_value(data.clone())
        .map_err(|e| AppError::validation(format!("invalid data for {kind}: {e}")))
}

impl Request {
    /// Parses an envelope into a typed request. Unknown types and malformed
    /// data are validation errors.
    pub fn parse(envelope: &Envelope) -> Result<Self> {
        let kind = envelope.kind.as_str();
        let data = &envelope.data;
        let request = match kind {
            AUTHENTICATE => {
                let d: AuthenticateData = decode(kind, data)?;
                Request::Authenticate { token: d.token }
            }
            DEMO => Request::Demo,
            CONVERSATION_LIST => {
                let d: ListData = if data.is_null() {
                    ListData::default()
                } else {
                    decode(kind, data)?
                };
                Request::ListConversations {
                    document_id: d.document_id,
                }
            }
            MESSAGES_GET => {
                let d: MessagesData = decode(kind, data)?;
                Request::GetMessages {
                    conversation_id: d.conversation_id,
                    limit: d.limit,
                    offset: d.offset.unwrap_or(0),
                }
            }
            CHUNK_CREATE => {
                let d: ChunkCreateData = decode(kind, data)?;
                Request::CreateChunkConversation {
                    chunk_id: d.chunk_id,
                    start: d.range.0,
                    end: d.range.1,
                    highlighted_text: d.highlighted_text,
                }
            }
            CHUNK_MERGE => {
                let d: MergeData = decode(kind, data)?;
                Request::Merge {
                    main_conversation_id: d.main_conversation_id,
                    highlight_conversation_id: d.highlight_conversation_id,
                }
            }
            METADATA => Request::Metadata,
            CHUNK_LIST => Request::ListChunks,
            CHUNK_NAVIGATE => {
                let d: NavigateData = decode(kind, data)?;
                Request::Navigate {
                    chunk_id: d.chunk_id,
                }
            }
            MESSAGE_SEND => Request::SendMessage(decode(kind, data)?),
            MESSAGE_CANCEL => {
                let d: ConversationData = decode(kind, data)?;
                Request::CancelMessage {
                    conversation_id: d.conversation_id,
                }
            }
            QUESTIONS_GENERATE => {
                let d: QuestionsData = decode(kind, data)?;
                let count = d.count.unwrap_or(DEFAULT_QUESTION_COUNT);
                if count == 0 || count > MAX_QUESTION_COUNT {
                    return Err(AppError::validation(format!(
                        "count must be between 1 and {MAX_QUESTION_COUNT}"
                    )));
                }
                Request::GenerateQuestions {
                    conversation_id: d.conversation_id,
                    count,
                }
            }
            other => {
                return Err(AppError::validation(format!(
                    "unknown request type: {other}"
                )));
            }
        };
        Ok(request)
    }

    /// The conversation a failure of this request is reported against.
    #[must_use]
    pub fn conversation_id(&self) -> Option<&str> {
        match self {
            Request::GetMessages {
                conversation_id, ..
            }
            | Request::CancelMessage { conversation_id }
            | Request::GenerateQuestions {
                conversation_id, ..
            } => Some(conversation_id),
            Request::SendMessage(send) => Some(&send.conversation_id),
            Request::Merge {
                highlight_conversation_id,
                ..
            } => Some(highlight_conversation_id),
            _ => None,
        }
    }
}
