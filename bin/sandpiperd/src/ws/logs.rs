//! Log stream: tail-with-backlog plus live lines, aggregated into one
//! text frame per flush interval.

use std::time::Duration;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use tracing::warn;

use crate::state::ServerState;
use crate::ws::keepalive::{KeepAliveSocket, KEEPALIVE_INTERVAL};

const TAIL_LINES: usize = 500;
const FLUSH_INTERVAL: Duration = Duration::from_millis(100);

pub async fn app_log_ws(
    State(state): State<ServerState>,
    Path(app_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| stream_logs(state, app_id, socket))
}

async fn stream_logs(state: ServerState, app_id: String, socket: WebSocket) {
    let (sub_id, mut lines) = match state.logs.tail(&app_id, TAIL_LINES).await {
        Ok(subscription) => subscription,
        Err(err) => {
            warn!(app = %app_id, error = %err, "Cannot tail app log");
            return;
        }
    };

    let (socket, mut inbound) = KeepAliveSocket::new(socket, KEEPALIVE_INTERVAL, KEEPALIVE_INTERVAL);
    let mut interrupted = socket.interrupted();
    let mut flush = tokio::time::interval(FLUSH_INTERVAL);
    let mut buffer = String::new();

    loop {
        tokio::select! {
            _ = flush.tick() => {
                if !buffer.is_empty() {
                    let chunk = std::mem::take(&mut buffer);
                    if socket.send_text(chunk).await.is_err() {
                        break;
                    }
                }
            }
            line = lines.recv() => match line {
                Some(line) => {
                    buffer.push_str(&line);
                    buffer.push('\n');
                }
                None => break,
            },
            // Draining keeps ping/pong alive; the frames themselves are
            // not interesting here.
            msg = inbound.recv() => {
                if msg.is_none() {
                    break;
                }
            }
            _ = interrupted.changed() => break,
        }
    }

    state.logs.close_tail(&app_id, sub_id);
}
