//! Language-server bridge: starts the sandbox's language server, then
//! relays WebSocket frames to its TCP socket and back, translating the
//! `Content-Length` framing of the LSP wire protocol.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::warn;

use sandpiper_broker::{ops, Lease, ProcessState, LSP_PORT};
use sandpiper_rpc::process::GetProcessStateReq;

use crate::state::ServerState;
use crate::ws::keepalive::{KeepAliveSocket, KEEPALIVE_INTERVAL};

const LANG_SERVER_PROCESS: &str = "lang-server";
const LANG_SERVER_RUN_PATH: &str = "/langserver";
const START_TIMEOUT: Duration = Duration::from_secs(10);
const START_POLL_INTERVAL: Duration = Duration::from_millis(100);

fn lang_server_cmd() -> Vec<String> {
    vec![
        "/usr/local/bin/typescript-language-server".to_string(),
        format!("--socket={LSP_PORT}"),
    ]
}

pub async fn app_langserver_ws(
    State(state): State<ServerState>,
    Path(app_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
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
            warn!(app = %app_id, error = %err, "Cannot lease context for language server");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    // The language server only makes sense once type stubs are in place.
    if let Err(err) = ops::run_task(&lease, "sync_types", &[], true).await {
        warn!(app = %app_id, error = %err, "Cannot sync types");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    if let Err(err) = ops::configure_process(
        &lease,
        LANG_SERVER_PROCESS,
        &lang_server_cmd(),
        LANG_SERVER_RUN_PATH,
        LSP_PORT,
        &[],
    )
    .await
    {
        warn!(app = %app_id, error = %err, "Cannot enable language server");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    // Wait for the language server to come up.
    let started = std::time::Instant::now();
    loop {
        if started.elapsed() > START_TIMEOUT {
            warn!(app = %app_id, "Timed out waiting for the language server");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
        let req = GetProcessStateReq {
            process_name: LANG_SERVER_PROCESS.to_string(),
        };
        match lease.process_client().get_process_state(req).await {
            Ok(resp) => {
                if resp.into_inner().process_state() == ProcessState::Running {
                    break;
                }
            }
            Err(status) => {
                warn!(app = %app_id, error = %status, "Cannot poll language server state");
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
        }
        tokio::time::sleep(START_POLL_INTERVAL).await;
    }

    let lsp = match TcpStream::connect(lease.lsp_endpoint()).await {
        Ok(stream) => stream,
        Err(err) => {
            warn!(app = %app_id, error = %err, "Cannot connect to the language server");
            return StatusCode::BAD_GATEWAY.into_response();
        }
    };

    ws.on_upgrade(move |socket| bridge(lease, lsp, socket))
}

async fn bridge(lease: Lease, lsp: TcpStream, socket: WebSocket) {
    let (socket, mut inbound) = KeepAliveSocket::new(socket, KEEPALIVE_INTERVAL, KEEPALIVE_INTERVAL);
    let mut interrupted = socket.interrupted();
    let (lsp_read, mut lsp_write) = lsp.into_split();

    let (done_tx, mut done_rx) = mpsc::channel::<()>(4);

    // WebSocket → LSP: frame each message with a Content-Length header.
    let ws_to_lsp_done = done_tx.clone();
    let ws_to_lsp = tokio::spawn(async move {
        while let Some(msg) = inbound.recv().await {
            let payload: Vec<u8> = match msg {
                Message::Text(text) => text.as_bytes().to_vec(),
                Message::Binary(data) => data.to_vec(),
                _ => continue,
            };
            let header = format!("Content-Length: {}\r\n\r\n", payload.len());
            let written = async {
                lsp_write.write_all(header.as_bytes()).await?;
                lsp_write.write_all(&payload).await
            }
            .await;
            if written.is_err() {
                break;
            }
        }
        let _ = ws_to_lsp_done.try_send(());
    });

    // LSP → WebSocket: strip the framing and emit text frames.
    let lsp_to_ws_done = done_tx.clone();
    let lsp_to_ws = tokio::spawn(async move {
        let mut reader = BufReader::new(lsp_read);
        loop {
            match read_lsp_message(&mut reader).await {
                Ok(Some(payload)) => match String::from_utf8(payload) {
                    Ok(text) => {
                        if socket.send_text(text).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => {
                        warn!("Language server sent a non-UTF-8 message");
                        break;
                    }
                },
                Ok(None) => break,
                Err(err) => {
                    warn!(error = %err, "Bad message from the language server");
                    break;
                }
            }
        }
        let _ = lsp_to_ws_done.try_send(());
    });

    tokio::select! {
        _ = done_rx.recv() => {}
        _ = interrupted.changed() => {}
    }

    ws_to_lsp.abort();
    lsp_to_ws.abort();
    drop(lease);
}

/// Read one `Content-Length`-framed LSP message. `Ok(None)` means the
/// stream ended cleanly between messages.
async fn read_lsp_message<R>(reader: &mut R) -> std::io::Result<Option<Vec<u8>>>
where
    R: AsyncBufReadExt + Unpin,
{
    let mut content_length: Option<usize> = None;
    loop {
        let mut header = String::new();
        if reader.read_line(&mut header).await? == 0 {
            return Ok(None);
        }
        let header = header.trim_end_matches(['\r', '\n']);
        if header.is_empty() {
            // Blank line ends the headers.
            break;
        }
        if let Some(value) = header.strip_prefix("Content-Length:") {
            content_length = value.trim().parse().ok();
        }
        // Every other header is ignored.
    }

    let Some(length) = content_length else {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "missing Content-Length header",
        ));
    };

    let mut payload = vec![0u8; length];
    tokio::io::AsyncReadExt::read_exact(reader, &mut payload).await?;
    Ok(Some(payload))
}
