//! Connection-scoped event router.
//!
//! Requests are handled one at a time in arrival order. Store reads and
//! writes reply inline; chat turns, question generation and summarizing
//! merges run as tasks that reply through the same outbound channel, so
//! reads stay responsive while a reply streams.
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::protocol::{self, Envelope, Request, SendMessage};
use super::turn;
use crate::context::AppContext;
use crate::error::{AppError, Result};
use crate::identity::Principal;

/// Outbound events buffered per connection before the router waits.
pub const OUTBOUND_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    Connected,
    Authenticated(Principal),
    Active(Principal),
    Closed,
}

/// What the transport should do after a frame was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

pub struct Session {
    ctx: AppContext,
    document_id: String,
    state: SessionState,
    outbound: mpsc::Sender<Envelope>,
    shutdown: CancellationToken,
    /// In-flight turns of this connection, by conversation id.
    turns: Arc<DashMap<String, CancellationToken>>,
}

impl Session {
    /// A session bound to `document_id` once authenticated, and the receiver
    /// the transport drains.
    pub fn new(ctx: AppContext, document_id: impl Into<String>) -> (Self, mpsc::Receiver<Envelope>) {
        let (outbound, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let session = Self {
            ctx,
            document_id: document_id.into(),
            state: SessionState::Connected,
            outbound,
            shutdown: CancellationToken::new(),
            turns: Arc::new(DashMap::new()),
        };
        (session, rx)
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    /// Parses one text frame and handles it.
    pub async fn handle_text(&mut self, text: &str) -> Flow {
        match serde_json::from_str::<Envelope>(text) {
            Ok(envelope) => self.handle(envelope).await,
            Err(e) => {
                let err = AppError::validation(format!("malformed envelope: {e}"));
                self.send(Envelope::failure("", None, &err, None)).await;
                self.flow()
            }
        }
    }

    /// Binary frames carry the same JSON as text frames.
    pub async fn handle_binary(&mut self, bytes: &[u8]) -> Flow {
        match std::str::from_utf8(bytes) {
            Ok(text) => self.handle_text(text).await,
            Err(e) => {
                let err = AppError::validation(format!("frame is not UTF-8: {e}"));
                self.send(Envelope::failure("", None, &err, None)).await;
                self.flow()
            }
        }
    }

    pub async fn handle(&mut self, envelope: Envelope) -> Flow {
        if self.state == SessionState::Closed {
            return Flow::Close;
        }

        let kind = envelope.kind.clone();
        let request_id = envelope.request_id.clone();
        let request = match Request::parse(&envelope) {
            Ok(request) => request,
            Err(e) => {
                self.send(Envelope::failure(&kind, request_id, &e, None)).await;
                return self.flow();
            }
        };
        debug!("session {}: {kind}", self.document_id);

        let active = matches!(self.state, SessionState::Active(_));
        match (active, &request) {
            (false, Request::Authenticate { .. } | Request::Demo) => {
                return self.authenticate(&kind, request_id, &request).await;
            }
            (false, _) => {
                self.send(Envelope::failure(&kind, request_id, &AppError::Unauthenticated, None))
                    .await;
                return self.flow();
            }
            (true, Request::Authenticate { .. } | Request::Demo) => {
                let err = AppError::validation("session is already authenticated");
                self.send(Envelope::failure(&kind, request_id, &err, None)).await;
                return self.flow();
            }
            _ => {}
        }

        let conversation_id = request.conversation_id().map(str::to_string);
        match self.dispatch(request, request_id.clone()).await {
            Ok(Some(data)) => self.send(Envelope::completed(&kind, request_id, data)).await,
            Ok(None) => {}
            Err(e) => {
                self.send(Envelope::failure(&kind, request_id, &e, conversation_id.as_deref()))
                    .await;
            }
        }
        self.flow()
    }

    /// Closes the session and cancels every in-flight turn it started.
    pub fn close(&mut self) {
        if self.state != SessionState::Closed {
            info!("session for document {} closed", self.document_id);
        }
        self.state = SessionState::Closed;
        self.shutdown.cancel();
    }

    fn flow(&self) -> Flow {
        match self.state {
            SessionState::Closed => Flow::Close,
            _ => Flow::Continue,
        }
    }

    async fn send(&self, envelope: Envelope) {
        if self.outbound.send(envelope).await.is_err() {
            debug!("outbound channel closed for document {}", self.document_id);
        }
    }

    // ── Authentication ───────────────────────────────────────────────

    async fn authenticate(&mut self, kind: &str, request_id: Option<String>, request: &Request) -> Flow {
        let principal = match request {
            Request::Authenticate { token } => self.ctx.identity.authenticate(token),
            _ if self.ctx.config.allow_demo => Ok(Principal::Demo),
            _ => Err(AppError::Unauthenticated),
        };
        let principal = match principal {
            Ok(p) => p,
            Err(e) => {
                warn!("session for document {}: authentication failed", self.document_id);
                self.send(Envelope::failure(kind, request_id, &e, None)).await;
                return self.flow();
            }
        };
        self.state = SessionState::Authenticated(principal.clone());

        // Bind to the document; a session for a missing document ends here.
        if let Err(e) = self.ctx.documents().get(&self.document_id).await {
            self.send(Envelope::failure(kind, request_id, &e, None)).await;
            self.close();
            return Flow::Close;
        }

        info!(
            "session for document {} active ({})",
            self.document_id,
            principal.mode()
        );
        let data = json!({
            "document_id": self.document_id,
            "mode": principal.mode(),
            "principal": principal,
        });
        self.state = SessionState::Active(principal);
        self.send(Envelope::completed(kind, request_id, data)).await;
        Flow::Continue
    }

    // ── Active requests ──────────────────────────────────────────────

    /// `Ok(None)` means a spawned task sends the reply.
    async fn dispatch(&mut self, request: Request, request_id: Option<String>) -> Result<Option<Value>> {
        let doc = self.document_id.clone();
        match request {
            Request::ListConversations { document_id } => {
                if document_id.is_some_and(|d| d != doc) {
                    return Err(AppError::validation(
                        "document_id does not match the session's document",
                    ));
                }
                let listing = self.ctx.graph().list_for_document(&doc).await?;
                Ok(Some(json!({
                    "main_conversation_id": listing.main.id,
                    "conversations": listing.by_id(),
                    "count": listing.count(),
                })))
            }
            Request::GetMessages {
                conversation_id,
                limit,
                offset,
            } => {
                turn::conversation_in_document(&self.ctx, &doc, &conversation_id).await?;
                let page = self.ctx.messages().page(&conversation_id, limit, offset).await?;
                Ok(Some(serde_json::to_value(page).map_err(internal)?))
            }
            Request::CreateChunkConversation {
                chunk_id,
                start,
                end,
                highlighted_text,
            } => {
                let conversation = self
                    .ctx
                    .graph()
                    .create_chunk_conversation(&doc, &chunk_id, start, end, highlighted_text.as_deref())
                    .await?;
                Ok(Some(json!({ "conversation": conversation })))
            }
            Request::Merge {
                main_conversation_id,
                highlight_conversation_id,
            } => {
                turn::conversation_in_document(&self.ctx, &doc, &main_conversation_id).await?;
                self.merge(main_conversation_id, highlight_conversation_id, request_id)
                    .await
            }
            Request::Metadata => {
                let metadata = self.ctx.documents().metadata(&doc).await?;
                Ok(Some(serde_json::to_value(metadata).map_err(internal)?))
            }
            Request::ListChunks => {
                let chunks = self.ctx.documents().chunks(&doc).await?;
                Ok(Some(json!({ "chunks": chunks })))
            }
            Request::Navigate { chunk_id } => {
                let nav = self.ctx.navigation().navigate(&doc, &chunk_id).await?;
                Ok(Some(serde_json::to_value(nav).map_err(internal)?))
            }
            Request::SendMessage(send) => self.send_message(send, request_id).await,
            Request::CancelMessage { conversation_id } => {
                let cancelled = match self.turns.get(&conversation_id) {
                    Some(token) => {
                        token.cancel();
                        true
                    }
                    None => false,
                };
                Ok(Some(json!({
                    "conversation_id": conversation_id,
                    "cancelled": cancelled,
                })))
            }
            Request::GenerateQuestions {
                conversation_id,
                count,
            } => {
                self.generate_questions(conversation_id, count, request_id);
                Ok(None)
            }
            Request::Authenticate { .. } | Request::Demo => {
                Err(AppError::validation("session is already authenticated"))
            }
        }
    }

    /// Starts a turn. The busy flag is taken before anything else and held by
    /// the turn task until it finishes.
    async fn send_message(
        &mut self,
        send: SendMessage,
        request_id: Option<String>,
    ) -> Result<Option<Value>> {
        let guard = self.ctx.busy.try_acquire(&send.conversation_id)?;
        let prepared = turn::prepare(&self.ctx, &self.document_id, &send).await?;

        let conversation_id = prepared.conversation_id.clone();
        let cancel = self.shutdown.child_token();
        self.turns.insert(conversation_id.clone(), cancel.clone());

        let ctx = self.ctx.clone();
        let outbound = self.outbound.clone();
        let turns = self.turns.clone();
        tokio::spawn(async move {
            let terminal = turn::run(ctx, prepared, outbound.clone(), cancel, request_id).await;
            turns.remove(&conversation_id);
            drop(guard);
            let _ = outbound.send(terminal).await;
        });
        Ok(None)
    }

    async fn merge(
        &self,
        main_id: String,
        highlight_id: String,
        request_id: Option<String>,
    ) -> Result<Option<Value>> {
        if !self.ctx.config.merge.summarize {
            let outcome = self.ctx.merge(&main_id, &highlight_id).await?;
            return Ok(Some(serde_json::to_value(outcome).map_err(internal)?));
        }

        // Summarizing calls the generator, so reply from a task.
        let ctx = self.ctx.clone();
        let outbound = self.outbound.clone();
        tokio::spawn(async move {
            let result = ctx.merge(&main_id, &highlight_id).await;
            let envelope = task_reply(
                protocol::CHUNK_MERGE,
                request_id,
                result,
                Some(highlight_id.as_str()),
            );
            let _ = outbound.send(envelope).await;
        });
        Ok(None)
    }

    fn generate_questions(&self, conversation_id: String, count: usize, request_id: Option<String>) {
        let ctx = self.ctx.clone();
        let doc = self.document_id.clone();
        let outbound = self.outbound.clone();
        let cancel = self.shutdown.child_token();
        tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                r = turn::generate_questions(&ctx, &doc, &conversation_id, count) => r,
            };
            let result = result.map(|questions| {
                json!({ "conversation_id": conversation_id, "questions": questions })
            });
            let envelope = task_reply(
                protocol::QUESTIONS_GENERATE,
                request_id,
                result,
                Some(conversation_id.as_str()),
            );
            let _ = outbound.send(envelope).await;
        });
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn internal(e: serde_json::Error) -> AppError {
    AppError::validation(format!("failed to encode reply: {e}"))
}

/// Terminal event of a spawned request. A reply that cannot be encoded is
/// reported as `<request>.error`.
fn task_reply<T: Serialize>(
    request: &str,
    request_id: Option<String>,
    result: Result<T>,
    conversation_id: Option<&str>,
) -> Envelope {
    match result.and_then(|data| serde_json::to_value(data).map_err(internal)) {
        Ok(data) => Envelope::completed(request, request_id, data),
        Err(e) => Envelope::failure(request, request_id, &e, conversation_id),
    }
}
