use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::auth::RequireAuth;
use crate::error::{ApiError, ApiResult};
use crate::handlers::ApiState;
use crate::progress::ProgressHub;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Transfer id whose progress events this socket receives.
    pub id: String,
}

/// GET /ws?id=... — subscribe to progress events for one transfer id.
///
/// Registering a transfer id that already has a listener supersedes the
/// previous socket; the old one's stream ends and its loop exits.
pub async fn ws_handler(
    State(state): State<ApiState>,
    RequireAuth(_auth): RequireAuth,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> ApiResult<Response> {
    if query.id.is_empty() {
        return Err(ApiError::InvalidInput(
            "transfer id must not be empty".to_string(),
        ));
    }
    let hub = Arc::clone(&state.hub);
    Ok(ws.on_upgrade(move |socket| progress_socket(socket, hub, query.id)))
}

async fn progress_socket(socket: WebSocket, hub: Arc<ProgressHub>, transfer_id: String) {
    let mut listener = hub.register(&transfer_id);
    let (mut ws_tx, mut ws_rx) = socket.split();

    debug!("progress socket connected: transfer={}", transfer_id);

    loop {
        tokio::select! {
            event = listener.recv() => {
                let Some(event) = event else {
                    // A newer socket claimed this transfer id.
                    debug!("progress listener superseded: transfer={}", transfer_id);
                    break;
                };
                let payload = match serde_json::to_string(&event) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("failed to serialize progress event: {}", e);
                        continue;
                    }
                };
                if let Err(e) = ws_tx.send(Message::Text(payload.into())).await {
                    debug!("progress socket send failed: {}", e);
                    break;
                }
            }
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if ws_tx.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                        debug!("progress socket closed by client: transfer={}", transfer_id);
                        break;
                    }
                    // This socket is push-only; inbound payloads are dropped.
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    debug!("progress socket disconnected: transfer={}", transfer_id);
    // Dropping the listener detaches it from the hub unless it was superseded.
}
