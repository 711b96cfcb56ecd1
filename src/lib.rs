//! Reusable MQTT session management: connection lifecycle, reconnection,
//! subscription-state tracking, message dispatch, and a durable session
//! event log. The binary in `main.rs` wraps this in a small console; any
//! other presentation layer can drive the same API.

pub mod config;
pub mod logsink;
pub mod notify;
pub mod persistence;
pub mod session;
pub mod transport;
