//! Proxy error types

use std::net::SocketAddr;
use thiserror::Error;

use sandpiper_broker::BrokerError;

/// Errors that can occur while proxying a request into an app
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The request host does not follow the `<app>.<domain>` shape
    #[error("Host '{host}' is not an app host")]
    NotAnAppHost { host: String },

    /// No app is registered under the requested name
    #[error("No app named '{name}'")]
    AppNotFound { name: String },

    /// The app process finished instead of reaching the running state
    #[error("App '{app}' finished instead of starting")]
    AppFinished { app: String },

    /// The app never reached the running state within the readiness window
    #[error("Timed out waiting for app '{app}' to start")]
    ReadyTimeout { app: String },

    /// The app directory lookup itself failed
    #[error("App directory lookup failed: {0}")]
    Directory(anyhow::Error),

    /// Leasing or talking to the sandbox failed
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// Forwarding to the app endpoint failed
    #[error("Backend request failed: {0}")]
    Backend(String),

    /// The incoming request could not be rewritten
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Failed to bind the listener
    #[error("Failed to bind to {addr}: {reason}")]
    BindFailed { addr: SocketAddr, reason: String },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for proxy operations
pub type Result<T, E = ProxyError> = std::result::Result<T, E>;

impl ProxyError {
    /// HTTP status this error maps to. Readiness failures are 404 like an
    /// unknown host: from the visitor's point of view the app is not there.
    pub fn status_code(&self) -> http::StatusCode {
        match self {
            ProxyError::NotAnAppHost { .. }
            | ProxyError::AppNotFound { .. }
            | ProxyError::AppFinished { .. }
            | ProxyError::ReadyTimeout { .. } => http::StatusCode::NOT_FOUND,
            ProxyError::InvalidRequest(_) => http::StatusCode::BAD_REQUEST,
            ProxyError::Backend(_) => http::StatusCode::BAD_GATEWAY,
            ProxyError::Directory(_)
            | ProxyError::Broker(_)
            | ProxyError::BindFailed { .. }
            | ProxyError::Internal(_) => http::StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes() {
        let err = ProxyError::NotAnAppHost {
            host: "example.com".to_string(),
        };
        assert_eq!(err.status_code(), http::StatusCode::NOT_FOUND);

        let err = ProxyError::ReadyTimeout {
            app: "app1".to_string(),
        };
        assert_eq!(err.status_code(), http::StatusCode::NOT_FOUND);

        let err = ProxyError::Backend("connection refused".to_string());
        assert_eq!(err.status_code(), http::StatusCode::BAD_GATEWAY);
    }
}
