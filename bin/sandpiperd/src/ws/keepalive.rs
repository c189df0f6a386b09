//! Keep-alive wrapper for long-lived WebSockets.
//!
//! Sends a ping every interval and raises an interruption signal when the
//! pong is late. Browser clients that cannot send control frames get the
//! same effect with a literal `_ping` text frame, answered with `_pong`.
//! All writes are serialized behind one mutex.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

/// Ping cadence and pong deadline for every stream endpoint.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// Write half plus the keep-alive machinery. [`KeepAliveSocket::new`]
/// hands the application frames back as a separate receiver so consumers
/// can select over them freely.
pub struct KeepAliveSocket {
    outbound: Arc<Mutex<SplitSink<WebSocket, Message>>>,
    interrupted: watch::Receiver<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl KeepAliveSocket {
    pub fn new(
        socket: WebSocket,
        ping_interval: Duration,
        pong_timeout: Duration,
    ) -> (Self, mpsc::Receiver<Message>) {
        let (sink, mut stream) = socket.split();
        let outbound = Arc::new(Mutex::new(sink));
        let (incoming_tx, incoming_rx) = mpsc::channel(32);
        let (interrupted_tx, interrupted_rx) = watch::channel(false);
        let (pong_tx, mut pong_rx) = mpsc::channel::<()>(1);

        // Reader: answers `_ping`, feeds pongs to the pinger, forwards
        // application frames. Dropping `incoming_tx` on exit closes the
        // consumer's receiver.
        let reader_outbound = outbound.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                let msg = match frame {
                    Ok(msg) => msg,
                    Err(_) => break,
                };
                match msg {
                    Message::Pong(_) => {
                        let _ = pong_tx.try_send(());
                    }
                    Message::Text(text) if text.as_str() == "_ping" => {
                        let mut out = reader_outbound.lock().await;
                        if out.send(Message::Text("_pong".into())).await.is_err() {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    msg => {
                        if incoming_tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        // Pinger: one outstanding ping at a time; a missed pong or a
        // failed write interrupts the connection.
        let ping_outbound = outbound.clone();
        let pinger = tokio::spawn(async move {
            loop {
                tokio::time::sleep(ping_interval).await;
                {
                    let mut out = ping_outbound.lock().await;
                    if out.send(Message::Ping(Bytes::new())).await.is_err() {
                        let _ = interrupted_tx.send(true);
                        return;
                    }
                }
                tokio::select! {
                    pong = pong_rx.recv() => {
                        if pong.is_none() {
                            return;
                        }
                    }
                    _ = tokio::time::sleep(pong_timeout) => {
                        let _ = interrupted_tx.send(true);
                        return;
                    }
                }
            }
        });

        (
            Self {
                outbound,
                interrupted: interrupted_rx,
                tasks: vec![reader, pinger],
            },
            incoming_rx,
        )
    }

    /// Serialized write to the socket.
    pub async fn send(&self, msg: Message) -> Result<(), axum::Error> {
        self.outbound.lock().await.send(msg).await
    }

    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), axum::Error> {
        self.send(Message::Text(text.into().into())).await
    }

    /// Watch that flips to true when the keep-alive declares the
    /// connection dead.
    pub fn interrupted(&self) -> watch::Receiver<bool> {
        self.interrupted.clone()
    }
}

impl Drop for KeepAliveSocket {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
