use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;

use relay_core::events::Event;
use relay_core::ids::{SessionId, UserId};
use relay_core::model::Role;
use relay_hub::EventHub;

use crate::server::AppState;

/// Connection-upgrade query. Token validation happens upstream; the
/// identity arrives here pre-validated.
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    #[serde(rename = "userId")]
    pub user_id: String,
}

/// WebSocket upgrade handler. Establishes a session, announces its id,
/// pushes the initial snapshot, then pumps frames until disconnect.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let user_id = UserId::from_raw(query.user_id);
    ws.on_upgrade(move |socket| handle_socket(socket, user_id, state))
}

async fn handle_socket(socket: WebSocket, user_id: UserId, state: AppState) {
    let hub = state.hub;
    // Least-privileged snapshot until the sync below refreshes it.
    let (session_id, rx) = hub.add_session(user_id, Role::User);
    tracing::info!(session_id = %session_id, "websocket client connected");

    hub.push_to_session(
        &session_id,
        &Event::Connection {
            session_id: session_id.clone(),
        },
    );
    hub.sync_session(&session_id).await;

    run_connection(socket, session_id, rx, hub).await;
}

/// Pump frames between the hub and the socket: the writer drains the
/// session's send queue, the reader watches for close. Either half ending
/// tears the session down.
async fn run_connection(
    socket: WebSocket,
    session_id: SessionId,
    mut rx: mpsc::Receiver<String>,
    hub: Arc<EventHub>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if ws_tx.send(WsMessage::Text(frame.into())).await.is_err() {
                break;
            }
        }
    });

    let reader_sid = session_id.clone();
    let reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                WsMessage::Close(_) => break,
                WsMessage::Text(_) => {
                    // Subscriptions go over HTTP; inbound frames carry nothing.
                    tracing::trace!(session_id = %reader_sid, "ignoring inbound frame");
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = writer => {},
        _ = reader => {},
    }

    tracing::info!(session_id = %session_id, "websocket client disconnected");
    hub.remove_session(&session_id);
}
