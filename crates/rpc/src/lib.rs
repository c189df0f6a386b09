//! Protobuf contracts for the two Sandpiper RPC surfaces.
//!
//! `agent` is the control surface of a compute agent (open/close sandbox
//! contexts); `exec`, `process` and `worktree` are the per-sandbox services
//! reached over the channel an `OpenContext` response points at.

pub mod agent {
    tonic::include_proto!("agent");
}

pub mod exec {
    tonic::include_proto!("exec");
}

pub mod process {
    tonic::include_proto!("process");
}

pub mod worktree {
    tonic::include_proto!("worktree");
}

impl exec::KeyValuePair {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

impl process::KeyValuePair {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}
