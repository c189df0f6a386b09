//! Broker error types

use thiserror::Error;

/// Errors surfaced by the broker and context operations
#[derive(Debug, Error)]
pub enum BrokerError {
    /// No agents were configured
    #[error("No agents configured")]
    NoAgents,

    /// An agent endpoint could not be turned into a channel
    #[error("Invalid endpoint '{endpoint}': {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    /// An agent did not answer the startup reclaim call
    #[error("Agent '{endpoint}' unreachable: {source}")]
    AgentUnreachable {
        endpoint: String,
        source: tonic::Status,
    },

    /// Opening a sandbox on the chosen agent failed
    #[error("Failed to open sandbox for app '{app}' on '{agent}': {source}")]
    OpenFailed {
        app: String,
        agent: String,
        source: tonic::Status,
    },

    /// The same app was leased with a different worktree id. This is a bug
    /// in the caller and is never retried.
    #[error("Inconsistent worktree ids for app '{app}': context has '{have}', caller asked for '{requested}'")]
    InconsistentWorktree {
        app: String,
        have: String,
        requested: String,
    },

    /// The context was fenced after a failed teardown; no further leases
    /// will ever succeed for it.
    #[error("Context for app '{app}' is fenced after a failed teardown")]
    PoisonedContext { app: String },

    /// A sandbox RPC failed; transient, the caller decides whether to retry
    #[error("Sandbox RPC failed: {0}")]
    Rpc(#[from] tonic::Status),
}

/// Result type alias for broker operations
pub type Result<T, E = BrokerError> = std::result::Result<T, E>;
