//! # Transport - Narrow Contract Over the MQTT Client Library
//!
//! The session manager does not talk to any MQTT library directly. It
//! consumes this module's two traits: a [`Connector`] that opens one
//! physical connection, and the [`Transport`] handle it yields, paired
//! with a channel of [`TransportEvent`]s. Everything the manager needs
//! from the outside world fits in that contract, which keeps the core
//! testable against a scripted mock and the library swappable.
//!
//! The production implementation lives in [`ws`] and is backed by
//! `rumqttc` over websockets.

pub mod ws;

pub use ws::WsConnector;

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Events delivered by a transport, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The broker accepted the session.
    Connected,
    /// The connection failed or broke with the given reason.
    Error(String),
    /// The connection closed.
    Closed,
    /// An inbound publish arrived.
    Message { topic: String, payload: Vec<u8> },
}

/// Failures at the transport boundary.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to open transport: {0}")]
    Open(String),
    #[error("transport request failed: {0}")]
    Request(String),
}

/// Receiving half of a transport's event stream.
pub type TransportEvents = mpsc::Receiver<TransportEvent>;

/// Handle to one physical connection.
///
/// Requests are fire-and-forget: they enqueue toward the broker without
/// waiting for an acknowledgment. `end` is best-effort and never fails.
pub trait Transport: Send + Sync {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), TransportError>;
    fn subscribe(&self, topic: &str) -> Result<(), TransportError>;
    fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;
    fn end(&self);
}

/// Opens physical connections.
pub trait Connector: Send + Sync {
    /// Opens a connection to `url` with the given client id and optional
    /// `(username, password)` credentials. Session establishment is
    /// reported asynchronously through the returned event stream.
    fn open(
        &self,
        url: &str,
        client_id: &str,
        credentials: Option<(String, String)>,
    ) -> Result<(Arc<dyn Transport>, TransportEvents), TransportError>;
}
