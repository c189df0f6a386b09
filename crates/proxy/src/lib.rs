//! Sandpiper app proxy.
//!
//! Maps `<app>.<domain>` hostnames onto app sandboxes: resolves the app,
//! leases its context from the broker, makes sure the app process is
//! running, then forwards the request — WebSocket upgrades through a
//! spliced tunnel, everything else through an HTTP client.

pub mod directory;
pub mod error;
pub mod server;
pub mod service;
pub mod upgrade;

pub use directory::{AppDirectory, AppRecord};
pub use error::{ProxyError, Result};
pub use server::ProxyServer;
pub use service::{
    app_name_from_host, empty_body, enable_app_process, error_response, full_body,
    restart_app_process, AppProxy, BoxBody, ProxyConfig,
};
pub use upgrade::is_websocket_upgrade;
