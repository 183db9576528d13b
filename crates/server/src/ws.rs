use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    http::HeaderMap,
    response::IntoResponse,
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use shared::{domain::UserId, protocol::ClientFrame, protocol::ErrorFrame};
use storage::GroupRow;
use tracing::{debug, warn};

use crate::{
    auth::{bearer_token, verify_token},
    AppState,
};

/// Live-socket entry point: `GET /ws/chat/{group_slug}`.
///
/// The bearer credential is verified before the upgrade, but a failed check
/// still completes the handshake so the client receives one structured error
/// frame instead of an indistinguishable transport drop.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(group_slug): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let identity = match bearer_token(&headers) {
        None => Err("provide an auth token"),
        Some(token) => verify_token(&state.auth, token).ok_or("invalid token"),
    };
    ws.on_upgrade(move |socket| ws_connection(state, socket, group_slug, identity))
}

async fn ws_connection(
    state: Arc<AppState>,
    socket: WebSocket,
    group_slug: String,
    identity: Result<UserId, &'static str>,
) {
    let (mut sender, mut receiver) = socket.split();

    // Rejected connections get exactly one error frame, then the close; they
    // never enter the channel registry.
    let user_id = match identity {
        Ok(user_id) => user_id,
        Err(reason) => {
            warn!(%group_slug, %reason, "rejecting socket");
            reject(&mut sender, reason).await;
            return;
        }
    };

    let group = match server_api::resolve_group(&state.api, &group_slug).await {
        Ok(group) => group,
        Err(err) => {
            warn!(%group_slug, error = %err.message, "rejecting socket");
            reject(&mut sender, &err.message).await;
            return;
        }
    };

    let (connection_id, own_tx, mut outbound) = state.registry.subscribe(&group.slug);

    let send_task = tokio::spawn(async move {
        while let Some(payload) = outbound.recv().await {
            if sender.send(Message::Text(payload)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(frame)) = receiver.next().await {
        let Message::Text(text) = frame else {
            continue;
        };
        if handle_frame(&state, &group, user_id, &text, &own_tx).await.is_break() {
            break;
        }
    }

    // Unconditional and idempotent: the error path above may already have
    // torn the connection down.
    state.registry.unsubscribe(&group.slug, connection_id);
    send_task.abort();
    debug!(slug = %group.slug, connection_id, "socket closed");
}

async fn handle_frame(
    state: &AppState,
    group: &GroupRow,
    user_id: UserId,
    text: &str,
    own_tx: &tokio::sync::mpsc::UnboundedSender<String>,
) -> std::ops::ControlFlow<()> {
    use std::ops::ControlFlow;

    // Unparseable frames and empty bodies are dropped without persisting.
    let Ok(frame) = serde_json::from_str::<ClientFrame>(text) else {
        debug!(slug = %group.slug, "dropping unparseable frame");
        return ControlFlow::Continue(());
    };
    if frame.body.trim().is_empty() {
        return ControlFlow::Continue(());
    }

    // Re-derive identity per frame rather than trusting connection-local
    // state: the user row may have vanished since subscribe time.
    let author = match state.api.storage.user_by_id(user_id).await {
        Ok(Some(author)) => author,
        Ok(None) => {
            warn!(slug = %group.slug, user_id = user_id.0, "sender no longer exists, closing");
            return ControlFlow::Break(());
        }
        Err(err) => {
            warn!(slug = %group.slug, %err, "identity lookup failed");
            return ControlFlow::Continue(());
        }
    };

    let stored =
        match server_api::append_message(&state.api, group, author.user_id, Some(&frame.body), None)
            .await
        {
            Ok(stored) => stored,
            Err(err) => {
                // Store-level rejections (e.g. Forbidden) surface as an error
                // frame to this connection only; the socket stays open.
                send_error(own_tx, &err.message);
                return ControlFlow::Continue(());
            }
        };

    match server_api::chat_frame(&state.api, group, &stored).await {
        Ok(payload) => match serde_json::to_string(&payload) {
            Ok(serialized) => {
                let delivered = state.registry.publish(&group.slug, &serialized);
                debug!(slug = %group.slug, delivered, "message fanned out");
            }
            Err(err) => warn!(slug = %group.slug, %err, "payload serialization failed"),
        },
        Err(err) => warn!(slug = %group.slug, error = %err.message, "fan-out enrichment failed"),
    }
    ControlFlow::Continue(())
}

fn send_error(own_tx: &tokio::sync::mpsc::UnboundedSender<String>, message: &str) {
    let frame = ErrorFrame {
        error: message.to_string(),
    };
    if let Ok(serialized) = serde_json::to_string(&frame) {
        let _ = own_tx.send(serialized);
    }
}

async fn reject(sender: &mut SplitSink<WebSocket, Message>, reason: &str) {
    let frame = ErrorFrame {
        error: reason.to_string(),
    };
    if let Ok(serialized) = serde_json::to_string(&frame) {
        let _ = sender.send(Message::Text(serialized)).await;
    }
    let _ = sender.close().await;
}

#[cfg(test)]
#[path = "tests/ws_tests.rs"]
mod tests;
