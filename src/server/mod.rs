//! HTTP surface: JSON routes plus the per-document WebSocket stream.
pub mod http;
pub mod ws;

use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use tracing::info;

use crate::context::AppContext;

pub fn router(ctx: AppContext) -> Router {
    // Size limits are enforced by ingestion.
    let body_limit = ctx.config.max_document_bytes.saturating_add(1);
    Router::new()
        .route("/health", get(http::health))
        .route(
            "/api/documents",
            get(http::list_documents).post(http::ingest_document),
        )
        .route("/api/documents/:document_id", get(http::get_document))
        .route("/api/documents/:document_id/chunks", get(http::list_chunks))
        .route(
            "/api/documents/:document_id/conversations",
            get(http::list_conversations),
        )
        .route(
            "/api/documents/:document_id/conversations/chunk",
            post(http::create_chunk_conversation),
        )
        .route(
            "/api/documents/:document_id/chunks/:chunk_id/navigation",
            get(http::navigate),
        )
        .route("/api/documents/:document_id/stream", get(ws::stream))
        .route(
            "/api/conversations/:main_id/merge/:highlight_id",
            post(http::merge),
        )
        .route(
            "/api/conversations/:conversation_id/messages",
            get(http::list_messages),
        )
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(ctx)
}

/// Serves until Ctrl-C.
pub async fn serve(ctx: AppContext, addr: SocketAddr) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("docthread listening on http://{addr}");

    axum::serve(listener, router(ctx))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await
        .context("server error")?;
    Ok(())
}
