//! State stream: pushes every observed app-state transition as a text
//! frame with the state's wire name.

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::warn;

use sandpiper_broker::Lease;

use crate::state::ServerState;
use crate::ws::keepalive::{KeepAliveSocket, KEEPALIVE_INTERVAL};

pub async fn app_state_ws(
    State(state): State<ServerState>,
    Path(app_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    // Resolve and lease before upgrading so failures surface as HTTP
    // status codes instead of a dropped socket.
    let app = match state.store.app(&app_id).await {
        Ok(Some(app)) => app,
        Ok(None) => return StatusCode::NOT_FOUND.into_response(),
        Err(err) => {
            warn!(app = %app_id, error = %err, "App lookup failed");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let lease = match state.broker.lease(&app.id, "", &app.worktree_id).await {
        Ok(lease) => lease,
        Err(err) => {
            warn!(app = %app_id, error = %err, "Cannot lease context for state stream");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    ws.on_upgrade(move |socket| stream_state(lease, socket))
}

async fn stream_state(lease: Lease, socket: WebSocket) {
    let (sub_id, mut states) = lease.subscribe_state();
    let (socket, mut inbound) = KeepAliveSocket::new(socket, KEEPALIVE_INTERVAL, KEEPALIVE_INTERVAL);
    let mut interrupted = socket.interrupted();

    loop {
        tokio::select! {
            update = states.recv() => match update {
                Some(update) => {
                    if socket.send_text(update.as_str_name()).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            msg = inbound.recv() => {
                if msg.is_none() {
                    break;
                }
            }
            _ = interrupted.changed() => break,
        }
    }

    lease.unsubscribe_state(sub_id);
}
