//! Non-streaming JSON routes.
use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::json;
use tracing::error;

use crate::context::AppContext;
use crate::error::{AppError, Result};
use crate::identity::Principal;
use crate::ingest::IngestError;

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::NotFound { .. } => StatusCode::NOT_FOUND,
            AppError::AlreadyMerged(_) | AppError::ConversationBusy(_) => StatusCode::CONFLICT,
            AppError::Validation(_)
            | AppError::InvalidRange { .. }
            | AppError::DocumentHasNoChunks(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::Unauthenticated => StatusCode::UNAUTHORIZED,
            AppError::Ingestion(IngestError::TooLarge { .. }) => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::Ingestion(IngestError::UnsupportedFormat(_)) => {
                StatusCode::UNSUPPORTED_MEDIA_TYPE
            }
            AppError::Ingestion(IngestError::Extraction(_)) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::UpstreamGeneration(_) => StatusCode::BAD_GATEWAY,
            AppError::Storage(e) => {
                error!("storage error: {e}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "detail": self.to_string() }))).into_response()
    }
}

/// Resolves the bearer token. Without one, requests pass only in demo mode.
pub(crate) fn authorize(ctx: &AppContext, headers: &HeaderMap) -> Result<Principal> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    match token {
        Some(token) => ctx.identity.authenticate(token),
        None if ctx.config.allow_demo => Ok(Principal::Demo),
        None => Err(AppError::Unauthenticated),
    }
}

pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

#[derive(Debug, Deserialize)]
pub struct IngestParams {
    #[serde(default)]
    filename: Option<String>,
}

pub async fn ingest_document(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    Query(params): Query<IngestParams>,
    body: Bytes,
) -> Result<Response> {
    authorize(&ctx, &headers)?;
    let filename = params.filename.unwrap_or_default();
    let stored = ctx.ingest(body.to_vec(), filename).await?;
    let body = json!({
        "document": stored.document,
        "chunk_count": stored.chunks.len(),
        "main_conversation": stored.main_conversation,
    });
    Ok((StatusCode::CREATED, Json(body)).into_response())
}

pub async fn get_document(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    Path(document_id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    authorize(&ctx, &headers)?;
    let documents = ctx.documents();
    let document = documents.get(&document_id).await?;
    let chunks = documents.chunks(&document_id).await?;
    Ok(Json(json!({ "document": document, "chunks": chunks })))
}

pub async fn list_documents(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    Query(params): Query<PageParams>,
) -> Result<Response> {
    authorize(&ctx, &headers)?;
    let page = ctx
        .documents()
        .list(params.limit, params.offset.unwrap_or(0))
        .await?;
    Ok(Json(page).into_response())
}

pub async fn list_chunks(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    Path(document_id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    authorize(&ctx, &headers)?;
    let chunks = ctx.documents().chunks(&document_id).await?;
    Ok(Json(json!({ "document_id": document_id, "chunks": chunks })))
}

pub async fn list_conversations(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    Path(document_id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    authorize(&ctx, &headers)?;
    let listing = ctx.graph().list_for_document(&document_id).await?;
    Ok(Json(json!({
        "main_conversation_id": listing.main.id,
        "conversations": listing.by_id(),
        "by_chunk": listing.chunks,
        "count": listing.count(),
    })))
}

#[derive(Debug, Deserialize)]
pub struct CreateChunkConversation {
    chunk_id: String,
    range: (i64, i64),
    #[serde(default)]
    highlighted_text: Option<String>,
}

pub async fn create_chunk_conversation(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    Path(document_id): Path<String>,
    Json(req): Json<CreateChunkConversation>,
) -> Result<Response> {
    authorize(&ctx, &headers)?;
    let conversation = ctx
        .graph()
        .create_chunk_conversation(
            &document_id,
            &req.chunk_id,
            req.range.0,
            req.range.1,
            req.highlighted_text.as_deref(),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(json!({ "conversation": conversation }))).into_response())
}

pub async fn merge(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    Path((main_id, highlight_id)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>> {
    authorize(&ctx, &headers)?;
    let outcome = ctx.merge(&main_id, &highlight_id).await?;
    Ok(Json(json!({
        "conversation": outcome.conversation,
        "message": outcome.message,
    })))
}

pub async fn navigate(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    Path((document_id, chunk_id)): Path<(String, String)>,
) -> Result<Response> {
    authorize(&ctx, &headers)?;
    let nav = ctx.navigation().navigate(&document_id, &chunk_id).await?;
    Ok(Json(nav).into_response())
}

#[derive(Debug, Deserialize)]
pub struct PageParams {
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    offset: Option<usize>,
}

pub async fn list_messages(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
    Query(params): Query<PageParams>,
) -> Result<Response> {
    authorize(&ctx, &headers)?;
    let page = ctx
        .messages()
        .page(&conversation_id, params.limit, params.offset.unwrap_or(0))
        .await?;
    Ok(Json(page).into_response())
}
