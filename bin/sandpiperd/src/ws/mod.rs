//! Long-lived WebSocket surfaces: log stream, state stream, and the
//! language-server bridge, all wrapped in the keep-alive layer.

pub mod keepalive;
pub mod langserver;
pub mod logs;
pub mod state;
