//! WebSocket upgrade forwarding: proxy the handshake to the app endpoint,
//! then splice the two upgraded connections together.

use http::{header, Request, Response, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tracing::debug;

use sandpiper_broker::Lease;

use crate::error::{ProxyError, Result};
use crate::service::{empty_body, full_body, BoxBody};

/// True when the request asks for a WebSocket upgrade.
pub fn is_websocket_upgrade<B>(req: &Request<B>) -> bool {
    let connection_upgrade = req
        .headers()
        .get(header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').any(|p| p.trim().eq_ignore_ascii_case("upgrade")))
        .unwrap_or(false);
    let upgrade_websocket = req
        .headers()
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    connection_upgrade && upgrade_websocket
}

/// Forward an upgrade handshake to `target` and, on a 101, tunnel bytes
/// between the two upgraded connections until either side closes.
///
/// The lease is moved into the tunnel task so the context stays borrowed
/// for as long as frames can still flow.
pub(crate) async fn proxy_upgrade(
    mut req: Request<Incoming>,
    target: String,
    lease: Lease,
) -> Result<Response<BoxBody>> {
    let stream = TcpStream::connect(&target)
        .await
        .map_err(|err| ProxyError::Backend(format!("connect {target}: {err}")))?;
    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|err| ProxyError::Backend(err.to_string()))?;
    tokio::spawn(async move {
        if let Err(err) = conn.with_upgrades().await {
            debug!(error = %err, "Backend upgrade connection closed with error");
        }
    });

    // Mirror the client's handshake, headers included.
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let mut builder = Request::builder().method(req.method().clone()).uri(path_and_query);
    for (name, value) in req.headers() {
        builder = builder.header(name, value);
    }
    let backend_req = builder
        .body(empty_body())
        .map_err(|err| ProxyError::InvalidRequest(err.to_string()))?;

    let mut backend_resp = sender
        .send_request(backend_req)
        .await
        .map_err(|err| ProxyError::Backend(err.to_string()))?;

    if backend_resp.status() != StatusCode::SWITCHING_PROTOCOLS {
        // The app refused the upgrade; relay its answer as-is.
        let (parts, body) = backend_resp.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|err| ProxyError::Backend(err.to_string()))?
            .to_bytes();
        return Ok(Response::from_parts(parts, full_body(body)));
    }

    let client_upgrade = hyper::upgrade::on(&mut req);
    let backend_upgrade = hyper::upgrade::on(&mut backend_resp);
    tokio::spawn(async move {
        let (client_io, backend_io) = match tokio::join!(client_upgrade, backend_upgrade) {
            (Ok(client_io), Ok(backend_io)) => (client_io, backend_io),
            (Err(err), _) | (_, Err(err)) => {
                debug!(error = %err, "WebSocket upgrade failed");
                return;
            }
        };
        let mut client_io = TokioIo::new(client_io);
        let mut backend_io = TokioIo::new(backend_io);
        if let Err(err) = tokio::io::copy_bidirectional(&mut client_io, &mut backend_io).await {
            debug!(error = %err, "WebSocket tunnel closed with error");
        }
        drop(lease);
    });

    // Relay the backend's 101 with its handshake headers.
    let mut response = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
    for (name, value) in backend_resp.headers() {
        response = response.header(name, value);
    }
    response
        .body(empty_body())
        .map_err(|err| ProxyError::Internal(err.to_string()))
}
