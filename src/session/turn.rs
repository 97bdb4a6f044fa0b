//! One chat turn: prompt assembly, token streaming, commit on completion.
use futures::StreamExt;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, trace, warn};

use super::protocol::{Envelope, MESSAGE_SEND, SendMessage};
use crate::context::AppContext;
use crate::db::models::{Conversation, ConversationKind};
use crate::error::{AppError, Entity, Result};
use crate::generation::{
    ChatMessage, GenerationError, GenerationEvent, collect_text, open_with_retry, prompts,
};
use crate::message_log::{PendingTurn, TurnRecord};

/// A validated turn whose prompt is ready to be sent.
#[derive(Debug)]
pub struct PreparedTurn {
    pub conversation_id: String,
    history: Vec<ChatMessage>,
    prompt: String,
    pending: PendingTurn,
}

/// The conversation, provided it belongs to `document_id`.
pub async fn conversation_in_document(
    ctx: &AppContext,
    document_id: &str,
    conversation_id: &str,
) -> Result<Conversation> {
    let conversation = ctx.graph().get(conversation_id).await?;
    if conversation.document_id != document_id {
        return Err(AppError::not_found(Entity::Conversation, conversation_id));
    }
    Ok(conversation)
}

/// System prompt plus prior messages for `conversation`.
///
/// `focus_chunk_id` narrows a main conversation's context to one chunk.
pub async fn conversation_history(
    ctx: &AppContext,
    document_id: &str,
    conversation: &Conversation,
    focus_chunk_id: Option<&str>,
) -> Result<Vec<ChatMessage>> {
    let documents = ctx.documents();
    let system = match conversation.kind {
        ConversationKind::Main => {
            let document = documents.get(document_id).await?;
            let chunks = documents.chunks(document_id).await?;
            let focus = match focus_chunk_id {
                Some(id) => Some(documents.chunk(document_id, id).await?),
                None => None,
            };
            prompts::main_system_prompt(&document, &chunks, focus.as_ref())
        }
        ConversationKind::Chunk => {
            let chunk_id = conversation
                .chunk_id
                .as_deref()
                .ok_or_else(|| AppError::not_found(Entity::Chunk, &conversation.id))?;
            let chunk = documents.chunk(document_id, chunk_id).await?;
            prompts::highlight_system_prompt(
                &chunk,
                conversation.highlighted_text.as_deref().unwrap_or_default(),
            )
        }
    };
    let messages = ctx.messages().list(&conversation.id).await?;
    Ok(prompts::history(system, &messages))
}

/// Validates a `message.send` request and assembles its prompt.
pub async fn prepare(ctx: &AppContext, document_id: &str, send: &SendMessage) -> Result<PreparedTurn> {
    if send.content.trim().is_empty() {
        return Err(AppError::validation("message content must not be empty"));
    }
    let conversation = conversation_in_document(ctx, document_id, &send.conversation_id).await?;

    if let Some(kind) = send.conversation_type {
        if kind != conversation.kind {
            return Err(AppError::validation(format!(
                "conversation {} is a {} conversation, not {kind}",
                conversation.id, conversation.kind
            )));
        }
    }

    let focus = match (conversation.kind, send.chunk_id.as_deref()) {
        (ConversationKind::Main, focus) => focus,
        (ConversationKind::Chunk, Some(chunk_id))
            if conversation.chunk_id.as_deref() != Some(chunk_id) =>
        {
            return Err(AppError::validation(format!(
                "conversation {} is not scoped to chunk {chunk_id}",
                conversation.id
            )));
        }
        (ConversationKind::Chunk, _) => None,
    };

    let history = conversation_history(ctx, document_id, &conversation, focus).await?;
    Ok(PreparedTurn {
        conversation_id: conversation.id.clone(),
        history,
        prompt: send.content.clone(),
        pending: PendingTurn::new(conversation.id, send.content.clone()),
    })
}

/// Streams the turn to `outbound` and commits it on completion.
///
/// Returns the terminal event without sending it, so the caller can release
/// the conversation before the client sees the turn end. Cancellation and
/// a closed outbound channel both discard the turn.
pub async fn run(
    ctx: AppContext,
    turn: PreparedTurn,
    outbound: mpsc::Sender<Envelope>,
    cancel: CancellationToken,
    request_id: Option<String>,
) -> Envelope {
    let conversation_id = turn.conversation_id.clone();
    info!("Generating reply in conversation {conversation_id}");

    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(AppError::from(GenerationError::Cancelled)),
        r = stream_and_commit(&ctx, turn, &outbound) => r,
    };

    match result {
        Ok(record) => {
            info!(
                "Turn committed in {conversation_id} ({} chars)",
                record.assistant.content.chars().count()
            );
            Envelope::completed(
                MESSAGE_SEND,
                request_id,
                json!({
                    "conversation_id": conversation_id,
                    "message": record.assistant,
                    "user_message": record.user,
                }),
            )
        }
        Err(e) => {
            warn!("Turn in {conversation_id} failed: {e}");
            Envelope::failure(MESSAGE_SEND, request_id, &e, Some(conversation_id.as_str()))
        }
    }
}

async fn stream_and_commit(
    ctx: &AppContext,
    turn: PreparedTurn,
    outbound: &mpsc::Sender<Envelope>,
) -> Result<TurnRecord> {
    let PreparedTurn {
        conversation_id,
        history,
        prompt,
        mut pending,
    } = turn;

    let mut stream = open_with_retry(ctx.generator.as_ref(), &history, &prompt).await?;
    while let Some(event) = stream.next().await {
        match event? {
            GenerationEvent::Token(token) => {
                pending.push_token(&token);
                trace!("token for {conversation_id}: {token:?}");
                outbound
                    .send(Envelope::token(&conversation_id, &token))
                    .await
                    .map_err(|_| GenerationError::Cancelled)?;
            }
            GenerationEvent::Completed(text) => {
                return ctx.messages().commit_turn(pending.complete(&text)).await;
            }
        }
    }
    Err(GenerationError::Incomplete.into())
}

/// Suggested follow-up questions for a conversation. Nothing is persisted.
pub async fn generate_questions(
    ctx: &AppContext,
    document_id: &str,
    conversation_id: &str,
    count: usize,
) -> Result<Vec<String>> {
    let conversation = conversation_in_document(ctx, document_id, conversation_id).await?;
    let history = conversation_history(ctx, document_id, &conversation, None).await?;
    let stream = open_with_retry(
        ctx.generator.as_ref(),
        &history,
        &prompts::questions_request(count),
    )
    .await?;
    let text = collect_text(stream).await?;
    Ok(prompts::parse_questions(&text, count))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::config::Config;
    use crate::db::Db;
    use crate::db::models::StoredDocument;
    use crate::generation::ScriptedGenerator;

    async fn setup(generator: ScriptedGenerator) -> (AppContext, StoredDocument) {
        let ctx = AppContext::new(
            Db::open_in_memory().unwrap().shared(),
            Config::default(),
            Arc::new(generator),
        );
        let stored = ctx
            .db
            .lock()
            .await
            .insert_document("Doc", &["Alpha text.".to_string(), "Beta text.".to_string()])
            .unwrap();
        (ctx, stored)
    }

    fn send(conversation_id: &str, content: &str) -> SendMessage {
        SendMessage {
            conversation_id: conversation_id.into(),
            content: content.into(),
            conversation_type: None,
            chunk_id: None,
        }
    }

    #[tokio::test]
    async fn test_run_streams_then_commits() {
        let (ctx, stored) = setup(ScriptedGenerator::with_reply("one two three")).await;
        let doc = &stored.document.id;
        let main = &stored.main_conversation.id;

        let turn = prepare(&ctx, doc, &send(main, "count")).await.unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        let terminal = run(ctx.clone(), turn, tx, CancellationToken::new(), None).await;

        let mut streamed = String::new();
        while let Ok(env) = rx.try_recv() {
            assert_eq!(env.kind, "chat.token");
            streamed.push_str(env.data["token"].as_str().unwrap());
        }
        assert_eq!(terminal.kind, "conversation.message.send.completed");
        assert_eq!(terminal.data["message"]["content"], streamed.as_str());
        assert_eq!(terminal.data["user_message"]["content"], "count");
        assert_eq!(ctx.messages().list(main).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_mid_stream_failure_persists_nothing() {
        let generator =
            ScriptedGenerator::with_reply("a b c").fail_mid_stream(1, GenerationError::Timeout);
        let (ctx, stored) = setup(generator).await;
        let main = &stored.main_conversation.id;

        let turn = prepare(&ctx, &stored.document.id, &send(main, "q")).await.unwrap();
        let (tx, _rx) = mpsc::channel(16);
        let terminal = run(ctx.clone(), turn, tx, CancellationToken::new(), None).await;

        assert_eq!(terminal.kind, "conversation.message.send.error");
        assert_eq!(terminal.data["code"], "upstream_generation_error");
        assert!(ctx.messages().list(main).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_closed_channel_discards_turn() {
        let (ctx, stored) = setup(ScriptedGenerator::with_reply("x y")).await;
        let main = &stored.main_conversation.id;
        let turn = prepare(&ctx, &stored.document.id, &send(main, "q")).await.unwrap();
        let (tx, rx) = mpsc::channel(16);
        drop(rx);

        let terminal = run(ctx.clone(), turn, tx, CancellationToken::new(), None).await;
        assert_eq!(terminal.data["code"], "cancelled");
        assert!(ctx.messages().list(main).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_prepare_validation() {
        let (ctx, stored) = setup(ScriptedGenerator::default()).await;
        let doc = &stored.document.id;
        let main = &stored.main_conversation.id;

        let err = prepare(&ctx, doc, &send(main, "   ")).await.unwrap_err();
        assert_eq!(err.code(), "validation_error");

        let mut wrong_kind = send(main, "q");
        wrong_kind.conversation_type = Some(ConversationKind::Chunk);
        let err = prepare(&ctx, doc, &wrong_kind).await.unwrap_err();
        assert_eq!(err.code(), "validation_error");

        let mut foreign_focus = send(main, "q");
        foreign_focus.chunk_id = Some("elsewhere".into());
        let err = prepare(&ctx, doc, &foreign_focus).await.unwrap_err();
        assert_eq!(err.missing_entity(), Some(Entity::Chunk));

        let err = prepare(&ctx, "other-doc", &send(main, "q")).await.unwrap_err();
        assert_eq!(err.missing_entity(), Some(Entity::Conversation));
    }

    #[tokio::test]
    async fn test_focus_chunk_in_system_prompt() {
        let (ctx, stored) = setup(ScriptedGenerator::default()).await;
        let mut request = send(&stored.main_conversation.id, "q");
        request.chunk_id = Some(stored.chunks[1].id.clone());
        let turn = prepare(&ctx, &stored.document.id, &request).await.unwrap();
        assert!(turn.history[0].content.contains("Beta text."));
        assert!(!turn.history[0].content.contains("Alpha text."));
    }

    #[tokio::test]
    async fn test_generate_questions() {
        let (ctx, stored) =
            setup(ScriptedGenerator::with_reply("1. Why alpha?\n2. Why beta?\n3. Why not?")).await;
        let questions = generate_questions(&ctx, &stored.document.id, &stored.main_conversation.id, 2)
            .await
            .unwrap();
        assert_eq!(questions, vec!["Why alpha?", "Why beta?"]);
        assert!(ctx
            .messages()
            .list(&stored.main_conversation.id)
            .await
            .unwrap()
            .is_empty());
    }
}
