//! WebSocket transport for the real-time notifier.
//!
//! Frames are JSON `{"event": ..., "data": ...}` in both directions.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, warn};

use super::state::AppState;
use crate::notifier::{ClientCommand, Notifier, ServerEvent, Subscription};

#[derive(Deserialize)]
pub struct WsParams {
    token: Option<String>,
}

/// The credential is checked before the upgrade; a rejected handshake
/// never joins a channel.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
    headers: HeaderMap,
) -> Response {
    let token = params.token.or_else(|| {
        headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    });

    let subscription = match state.notifier.connect(token.as_deref()).await {
        Ok(sub) => sub,
        Err(e) => {
            warn!("Subscriber rejected: {}", e);
            return (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response();
        }
    };

    let key = subscription.key.clone();
    let on_failure = Arc::clone(&state.notifier);
    let notifier = Arc::clone(&state.notifier);
    ws.on_failed_upgrade(move |e| {
        warn!(user = %key.user_id, "WebSocket upgrade failed: {}", e);
        tokio::spawn(async move { on_failure.disconnect(&key).await });
    })
    .on_upgrade(move |socket| session(socket, notifier, subscription))
}

async fn session(socket: WebSocket, notifier: Arc<Notifier>, mut sub: Subscription) {
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            event = sub.events.recv() => {
                let Some(event) = event else { break };
                match serde_json::to_string(&event) {
                    Ok(text) => {
                        if sink.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Event not serializable: {}", e),
                }
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ClientCommand>(text.as_str()) {
                        Ok(command) => {
                            notifier.handle_command(&sub.key, command).await;
                        }
                        Err(e) => {
                            debug!(user = %sub.key.user_id, "Bad client frame: {}", e);
                            let reply = ServerEvent::Error { message: format!("unrecognized frame: {}", e) };
                            notifier.emit_to_connection(&sub.key, reply).await;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            }
        }
    }

    notifier.disconnect(&sub.key).await;
}
