//! Accept loop for the app proxy with watch-based graceful shutdown.

use std::net::SocketAddr;
use std::sync::Arc;

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{ProxyError, Result};
use crate::service::AppProxy;

/// The proxy server
pub struct ProxyServer {
    proxy: Arc<AppProxy>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(proxy: AppProxy) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            proxy: Arc::new(proxy),
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Signal the accept loop to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Bind `addr` and serve until shutdown is signalled.
    pub async fn run(&self, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|err| ProxyError::BindFailed {
                addr,
                reason: err.to_string(),
            })?;
        self.serve(listener).await
    }

    /// Serve on an already-bound listener. In-flight connections run to
    /// completion after shutdown; only the accept loop stops.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        if let Ok(addr) = listener.local_addr() {
            info!(addr = %addr, "App proxy listening");
        }

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    info!("App proxy shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, remote) = match accepted {
                        Ok(conn) => conn,
                        Err(err) => {
                            warn!(error = %err, "Accept failed");
                            continue;
                        }
                    };

                    let proxy = self.proxy.clone();
                    tokio::spawn(async move {
                        let io = TokioIo::new(stream);
                        let service = service_fn(move |req| {
                            let proxy = proxy.clone();
                            async move {
                                Ok::<_, std::convert::Infallible>(proxy.handle(req, remote).await)
                            }
                        });
                        let conn = http1::Builder::new()
                            .serve_connection(io, service)
                            .with_upgrades();
                        if let Err(err) = conn.await {
                            debug!(remote = %remote, error = %err, "Connection error");
                        }
                    });
                }
            }
        }
    }
}
