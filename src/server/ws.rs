//! WebSocket transport for [`Session`].
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use crate::context::AppContext;
use crate::session::{Flow, Session};

pub async fn stream(
    ws: WebSocketUpgrade,
    State(ctx): State<AppContext>,
    Path(document_id): Path<String>,
) -> Response {
    ws.on_upgrade(move |socket| run_socket(socket, ctx, document_id))
}

async fn run_socket(socket: WebSocket, ctx: AppContext, document_id: String) {
    info!("stream opened for document {document_id}");
    let (mut sink, mut source) = socket.split();
    let (mut session, mut outbound) = Session::new(ctx, document_id.clone());

    let writer = tokio::spawn(async move {
        while let Some(envelope) = outbound.recv().await {
            let text = match serde_json::to_string(&envelope) {
                Ok(text) => text,
                Err(e) => {
                    warn!("dropping unencodable event {}: {e}", envelope.kind);
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(frame) = source.next().await {
        let flow = match frame {
            Ok(Message::Text(text)) => session.handle_text(&text).await,
            Ok(Message::Binary(bytes)) => session.handle_binary(&bytes).await,
            Ok(Message::Close(_)) => Flow::Close,
            Ok(_) => Flow::Continue,
            Err(e) => {
                debug!("stream for document {document_id} errored: {e}");
                Flow::Close
            }
        };
        if flow == Flow::Close {
            break;
        }
    }

    // Dropping the session releases the last sender once turn tasks finish,
    // which ends the writer.
    session.close();
    drop(session);
    let _ = writer.await;
    info!("stream closed for document {document_id}");
}
