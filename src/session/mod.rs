//! # Session Module - MQTT Connection Lifecycle
//!
//! Owns the single logical broker connection and everything that hangs off
//! it: state transitions, subscription tracking, inbound message fan-out,
//! and the event log trail.
//!
//! ## Why This Module Exists
//!
//! Connection handling is the one piece of this system that has to be
//! right regardless of what sits on top of it. The session manager gives
//! the presentation layer a small, race-free command surface (connect,
//! disconnect, publish, subscribe, unsubscribe) and hides the messy parts:
//! half-open connections, connect timeouts, broker rejections, unsolicited
//! drops, and resubscription after a reconnect.
//!
//! ## Module Architecture
//!
//! ```text
//! session/
//! ├── error.rs     - Per-operation error taxonomy and reject classification
//! ├── registry.rs  - Subscription registry (what should be subscribed now)
//! └── manager.rs   - SessionManager, state machine and event pump
//! ```
//!
//! ## Design Philosophy
//!
//! - **One owner per connection**: the manager holds the transport handle
//!   exclusively; nothing else touches it.
//! - **Serialized transitions**: all state mutations go through one lock,
//!   never held across an await. A second connect attempt is rejected
//!   synchronously, not queued.
//! - **Collaborator failures stay contained**: log appends and
//!   notification dispatch can never fail a session operation.

pub mod error;
pub mod manager;
pub mod registry;

pub use error::{
    classify_rejection, ConnectError, PublishError, RejectReason, SubscribeError, UnsubscribeError,
};
pub use manager::{SessionEvents, SessionManager, CONNECT_TIMEOUT};
pub use registry::{Subscription, SubscriptionRegistry};

use std::fmt;

/// Lifecycle state of the managed connection.
///
/// `Failed` is transient bookkeeping between a failed attempt and the
/// settled `Disconnected`; the failure itself is returned from `connect`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Failed {
        reason: String,
    },
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnecting => write!(f, "disconnecting"),
            ConnectionState::Failed { reason } => write!(f, "failed: {reason}"),
        }
    }
}

/// An inbound publish as handed to the observer. Transient; only delivery
/// is guaranteed, retention is the observer's concern.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub received_at: chrono::DateTime<chrono::Local>,
}

impl InboundMessage {
    /// Payload as text, with invalid UTF-8 replaced.
    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}
