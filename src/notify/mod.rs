//! Fire-and-forget notification delivery for inbound messages.
//!
//! The session manager calls [`NotificationSink::notify`] for every
//! inbound message while notifications are enabled. Delivery is
//! best-effort: implementations must not block and must swallow their own
//! failures, because a broken notification channel is never allowed to
//! affect the connection.

use tracing::info;

/// Receives one callback per inbound message when notifications are
/// enabled.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, title: &str, body: &str);
}

/// Surfaces notifications as `tracing` events. Used by the headless
/// console, which has no platform notification service to hand them to.
pub struct TracingNotifier;

impl NotificationSink for TracingNotifier {
    fn notify(&self, title: &str, body: &str) {
        info!("{}: {}", title, body);
    }
}
