//! Sandbox context broker.
//!
//! Multiplexes many logical clients onto a small set of remote sandboxes:
//! a [`Broker`] hands out reference-counted [`Lease`]s on per-app
//! [`SandboxContext`]s, opens new sandboxes on the least-loaded agent, and
//! tears idle ones down once the last lease is gone and the expiry timer
//! fires.

pub mod broker;
pub mod context;
pub mod error;
pub mod ops;
mod pool;
pub mod testing;
mod tracker;

pub use broker::{Broker, BrokerConfig, Lease, APP_PORT, LSP_PORT};
pub use context::SandboxContext;
pub use error::{BrokerError, Result};

// The tracked app state is the wire-level process state; re-exported so
// consumers don't need to depend on the rpc crate for it.
pub use sandpiper_rpc::process::ProcessState;
