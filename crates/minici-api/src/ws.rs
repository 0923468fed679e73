//! WebSocket relay for live build output.
//!
//! A client connecting to `/ws/builds/{id}/logs` receives every chunk the
//! build writes from that moment on as a text frame. The socket is closed
//! when the build finishes. Earlier output is only available from the log
//! file endpoint.

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code};
use axum::extract::{Path, State};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use minici_core::ResourceId;
use minici_executor::LogSubscription;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::AppState;
use crate::error::ApiError;

/// WebSocket upgrade handler. Builds that are not in flight get a 404.
pub async fn build_logs_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let build_id = ResourceId::from_uuid(id);
    let subscription = state.orchestrator.subscribe(build_id).await?;
    Ok(ws.on_upgrade(move |socket| relay(socket, build_id, subscription)))
}

async fn relay(socket: WebSocket, build_id: ResourceId, mut subscription: LogSubscription) {
    info!(build_id = %build_id, subscriber = subscription.id(), "Log stream opened");
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            chunk = subscription.recv() => {
                let Some(chunk) = chunk else {
                    let close = CloseFrame {
                        code: close_code::NORMAL,
                        reason: "build finished".into(),
                    };
                    let _ = sender.send(Message::Close(Some(close))).await;
                    break;
                };
                let text = String::from_utf8_lossy(&chunk).into_owned();
                if let Err(e) = sender.send(Message::Text(text.into())).await {
                    debug!(build_id = %build_id, error = %e, "Log stream client went away");
                    break;
                }
            }
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(build_id = %build_id, error = %e, "WebSocket error");
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    // Dropping the subscription detaches it from the sink on the next write.
    info!(build_id = %build_id, "Log stream closed");
}
