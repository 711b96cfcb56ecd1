use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::BrokerConfig;
use crate::logsink::{LogSink, Severity};
use crate::notify::NotificationSink;
use crate::transport::{Connector, Transport, TransportEvent, TransportEvents};

use super::error::{
    classify_rejection, ConnectError, PublishError, SubscribeError, UnsubscribeError,
};
use super::registry::{Subscription, SubscriptionRegistry};
use super::{ConnectionState, InboundMessage};

/// Bound on how long a connection attempt may stay half-open before the
/// transport is force-closed and the attempt reported as timed out.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

const MESSAGE_QUEUE: usize = 100;
const NOTIFICATION_TITLE: &str = "New MQTT Message";

/// Observation side of a [`SessionManager`], handed out once at
/// construction: current connection state and inbound messages.
pub struct SessionEvents {
    pub state: watch::Receiver<ConnectionState>,
    pub messages: mpsc::Receiver<InboundMessage>,
}

/// Owns one logical broker connection and provides the command surface
/// the presentation layer drives.
///
/// All collaborators are injected; the manager holds no global state and
/// can be instantiated freely (one connection per instance). Cloning is
/// cheap and clones share the same connection.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use mqttdeck::config::BrokerConfig;
/// use mqttdeck::logsink::FileLogSink;
/// use mqttdeck::notify::TracingNotifier;
/// use mqttdeck::session::SessionManager;
/// use mqttdeck::transport::WsConnector;
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let logs = Arc::new(FileLogSink::open("logs.json".into()).await);
/// let (manager, mut events) =
///     SessionManager::new(Arc::new(WsConnector), logs, Arc::new(TracingNotifier));
///
/// manager
///     .connect(BrokerConfig {
///         host: "broker.local".into(),
///         port: 1883,
///         ..BrokerConfig::default()
///     })
///     .await?;
/// manager.subscribe("sensors/temp")?;
/// while let Some(message) = events.messages.recv().await {
///     println!("{}: {}", message.topic, message.payload_text());
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct SessionManager {
    shared: Arc<Shared>,
}

struct Shared {
    connector: Arc<dyn Connector>,
    logs: Arc<dyn LogSink>,
    notifier: Arc<dyn NotificationSink>,
    notifications: AtomicBool,
    conn: Mutex<Conn>,
    state_tx: watch::Sender<ConnectionState>,
    message_tx: mpsc::Sender<InboundMessage>,
}

/// Connection-scoped state. Guarded by one mutex, never held across an
/// await point.
struct Conn {
    state: ConnectionState,
    transport: Option<Arc<dyn Transport>>,
    cancel: Option<CancellationToken>,
    registry: SubscriptionRegistry,
}

/// Outcome of waiting for the first session-level transport event.
enum SessionStart {
    Established,
    Rejected(String),
}

impl SessionManager {
    /// Creates a manager in the `Disconnected` state together with its
    /// observation channels.
    pub fn new(
        connector: Arc<dyn Connector>,
        logs: Arc<dyn LogSink>,
        notifier: Arc<dyn NotificationSink>,
    ) -> (Self, SessionEvents) {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (message_tx, message_rx) = mpsc::channel(MESSAGE_QUEUE);
        let shared = Arc::new(Shared {
            connector,
            logs,
            notifier,
            notifications: AtomicBool::new(true),
            conn: Mutex::new(Conn {
                state: ConnectionState::Disconnected,
                transport: None,
                cancel: None,
                registry: SubscriptionRegistry::new(),
            }),
            state_tx,
            message_tx,
        });
        (
            Self { shared },
            SessionEvents {
                state: state_rx,
                messages: message_rx,
            },
        )
    }

    /// Opens a connection to the broker described by `config`.
    ///
    /// Rejected synchronously with [`ConnectError::AlreadyConnected`] while
    /// a connection is open or being opened; the caller must disconnect
    /// first. Validates the config before any I/O. The attempt is bounded
    /// by [`CONNECT_TIMEOUT`]; on expiry the half-open transport is closed.
    ///
    /// On success the subscription registry is replayed in insertion order
    /// and the event pump for this connection is started.
    pub async fn connect(&self, config: BrokerConfig) -> Result<(), ConnectError> {
        config.validate()?;

        // Claim the Connecting slot synchronously, before any I/O. A
        // transport left behind by an unsolicited close is swept here.
        let stale = {
            let mut conn = self.shared.conn();
            match conn.state {
                ConnectionState::Connecting | ConnectionState::Connected => {
                    return Err(ConnectError::AlreadyConnected)
                }
                _ => {}
            }
            conn.state = ConnectionState::Connecting;
            (conn.transport.take(), conn.cancel.take())
        };
        self.shared.publish_state(ConnectionState::Connecting);
        if let Some(cancel) = stale.1 {
            cancel.cancel();
        }
        if let Some(transport) = stale.0 {
            debug!("Closing transport left over from a lost connection");
            transport.end();
        }

        let url = config.url();
        let client_id = generate_client_id();
        info!("Connecting to {} as {}", url, client_id);

        let opened = self
            .shared
            .connector
            .open(&url, &client_id, config.credentials());
        let (transport, mut events) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                let reason = e.to_string();
                self.shared.fail_connect(&reason);
                return Err(ConnectError::BrokerRejected(classify_rejection(&reason)));
            }
        };

        match timeout(CONNECT_TIMEOUT, wait_for_session(&mut events)).await {
            Err(_) => {
                transport.end();
                self.shared
                    .fail_connect("Connection timed out after 15 seconds");
                Err(ConnectError::Timeout)
            }
            Ok(SessionStart::Rejected(reason)) => {
                transport.end();
                self.shared.fail_connect(&reason);
                Err(ConnectError::BrokerRejected(classify_rejection(&reason)))
            }
            Ok(SessionStart::Established) => {
                let cancel = CancellationToken::new();
                {
                    let mut conn = self.shared.conn();
                    conn.state = ConnectionState::Connected;
                    conn.transport = Some(transport.clone());
                    conn.cancel = Some(cancel.clone());
                }
                self.shared.publish_state(ConnectionState::Connected);
                self.shared
                    .logs
                    .append("Successfully connected to MQTT broker", Severity::Success);
                self.shared.replay_subscriptions(&transport);
                tokio::spawn(run_pump(self.shared.clone(), transport, events, cancel));
                Ok(())
            }
        }
    }

    /// Closes the current connection. Idempotent and infallible: closing
    /// is best-effort, and a caller that wants to be disconnected already
    /// is. Clears the subscription registry, so the next connect starts
    /// with no subscriptions.
    pub fn disconnect(&self) {
        let (transport, cancel) = {
            let mut conn = self.shared.conn();
            match conn.state {
                ConnectionState::Disconnected | ConnectionState::Failed { .. } => {
                    // Nothing user-visible to do; still sweep a transport
                    // left behind by an unsolicited close.
                    let stale = (conn.transport.take(), conn.cancel.take());
                    drop(conn);
                    if let Some(cancel) = stale.1 {
                        cancel.cancel();
                    }
                    if let Some(transport) = stale.0 {
                        transport.end();
                    }
                    return;
                }
                ConnectionState::Connecting => {
                    // The in-flight connect owns this transition until it
                    // resolves; there is no transport to close yet.
                    debug!("Ignoring disconnect while a connection attempt is in flight");
                    return;
                }
                _ => {}
            }
            conn.state = ConnectionState::Disconnecting;
            conn.registry.clear();
            (conn.transport.take(), conn.cancel.take())
        };
        self.shared.publish_state(ConnectionState::Disconnecting);

        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        if let Some(transport) = transport {
            transport.end();
        }

        {
            let mut conn = self.shared.conn();
            // Settle only if no new connect claimed the slot meanwhile.
            if conn.state != ConnectionState::Disconnecting {
                return;
            }
            conn.state = ConnectionState::Disconnected;
        }
        self.shared.publish_state(ConnectionState::Disconnected);
        self.shared
            .logs
            .append("Disconnected from MQTT broker", Severity::Warning);
    }

    /// Publishes `payload` to `topic`. Fire-and-forget: the request is
    /// handed to the transport without waiting for broker acknowledgment.
    pub fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), PublishError> {
        let transport = self
            .connected_transport()
            .ok_or(PublishError::NotConnected)?;
        if topic.trim().is_empty() {
            return Err(PublishError::EmptyTopic);
        }
        transport.publish(topic, payload)?;
        Ok(())
    }

    /// Subscribes to `topic` and records it in the registry. Duplicate
    /// subscriptions are rejected rather than silently deduplicated.
    pub fn subscribe(&self, topic: &str) -> Result<(), SubscribeError> {
        let transport = {
            let mut conn = self.shared.conn();
            if conn.state != ConnectionState::Connected {
                return Err(SubscribeError::NotConnected);
            }
            if !conn.registry.add(topic) {
                return Err(SubscribeError::AlreadySubscribed);
            }
            conn.transport.clone()
        };
        let transport = transport.ok_or(SubscribeError::NotConnected)?;
        if let Err(e) = transport.subscribe(topic) {
            // Roll the entry back out so registry and broker agree.
            self.shared.conn().registry.remove(topic);
            return Err(e.into());
        }
        Ok(())
    }

    /// Unsubscribes from `topic` and drops it from the registry.
    pub fn unsubscribe(&self, topic: &str) -> Result<(), UnsubscribeError> {
        let transport = {
            let conn = self.shared.conn();
            if conn.state != ConnectionState::Connected {
                return Err(UnsubscribeError::NotConnected);
            }
            if !conn.registry.contains(topic) {
                return Err(UnsubscribeError::NotSubscribed);
            }
            conn.transport.clone()
        };
        let transport = transport.ok_or(UnsubscribeError::NotConnected)?;
        transport.unsubscribe(topic)?;
        self.shared.conn().registry.remove(topic);
        Ok(())
    }

    /// Whether inbound messages are forwarded to the notification sink.
    /// Durable storage of this flag is the caller's concern.
    pub fn set_notifications_enabled(&self, enabled: bool) {
        self.shared.notifications.store(enabled, Ordering::Relaxed);
    }

    pub fn notifications_enabled(&self) -> bool {
        self.shared.notifications.load(Ordering::Relaxed)
    }

    /// Snapshot of the current connection state.
    pub fn state(&self) -> ConnectionState {
        self.shared.conn().state.clone()
    }

    /// A fresh state receiver, for observers beyond the one handed out at
    /// construction.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Snapshot of the subscription registry, in insertion order.
    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.shared.conn().registry.list()
    }

    fn connected_transport(&self) -> Option<Arc<dyn Transport>> {
        let conn = self.shared.conn();
        if conn.state == ConnectionState::Connected {
            conn.transport.clone()
        } else {
            None
        }
    }
}

impl Shared {
    fn conn(&self) -> MutexGuard<'_, Conn> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }

    /// Failed-connect bookkeeping: log the reason, pass through the
    /// transient `Failed` state, settle on `Disconnected`.
    fn fail_connect(&self, reason: &str) {
        self.logs.append(reason, Severity::Error);
        self.publish_state(ConnectionState::Failed {
            reason: reason.to_string(),
        });
        self.conn().state = ConnectionState::Disconnected;
        self.publish_state(ConnectionState::Disconnected);
    }

    /// Replays every registry entry through the transport in insertion
    /// order. A failed topic is logged, marked inactive, and retried on
    /// the next reconnect; the connection stands either way.
    fn replay_subscriptions(&self, transport: &Arc<dyn Transport>) {
        let topics = self.conn().registry.topics();
        for topic in &topics {
            match transport.subscribe(topic) {
                Ok(()) => self.conn().registry.mark_active(topic, true),
                Err(e) => {
                    self.logs.append(
                        &format!("Failed to resubscribe to {topic}: {e}"),
                        Severity::Warning,
                    );
                    self.conn().registry.mark_active(topic, false);
                }
            }
        }
    }

    /// Inbound publish: fan out to the observer, log, and notify. None of
    /// these may affect connection state.
    fn on_message(&self, topic: String, payload: Vec<u8>) {
        let message = InboundMessage {
            topic,
            payload,
            received_at: chrono::Local::now(),
        };
        let text = message.payload_text();
        self.logs.append(
            &format!("Received message on {}: {}", message.topic, text),
            Severity::Info,
        );
        if self.notifications.load(Ordering::Relaxed) {
            self.notifier.notify(NOTIFICATION_TITLE, &text);
        }
        if let Err(e) = self.message_tx.try_send(message) {
            debug!("Dropping inbound message: {}", e);
        }
    }

    /// Unsolicited drop (broker closed or transport error). Distinguished
    /// in the log from a user-initiated disconnect; the registry is
    /// preserved so a reconnect can restore the subscriptions.
    fn on_connection_drop(&self, text: &str) {
        let was_connected = {
            let mut conn = self.conn();
            if conn.state == ConnectionState::Connected {
                conn.state = ConnectionState::Disconnected;
                true
            } else {
                false
            }
        };
        if was_connected {
            self.publish_state(ConnectionState::Disconnected);
            self.logs.append(text, Severity::Error);
        }
    }

    /// The transport re-established the session on its own. Restore the
    /// Connected state and replay the preserved registry.
    fn on_reconnected(&self, transport: &Arc<dyn Transport>) {
        {
            let mut conn = self.conn();
            let same_transport =
                matches!(&conn.transport, Some(current) if Arc::ptr_eq(current, transport));
            if !same_transport || conn.state != ConnectionState::Disconnected {
                return;
            }
            conn.state = ConnectionState::Connected;
        }
        self.publish_state(ConnectionState::Connected);
        self.logs
            .append("Reconnected to MQTT broker", Severity::Success);
        self.replay_subscriptions(transport);
    }
}

/// Waits for the first session-level event of a fresh transport. Messages
/// cannot arrive before the session exists, but are skipped defensively
/// rather than misread as an outcome.
async fn wait_for_session(events: &mut TransportEvents) -> SessionStart {
    loop {
        match events.recv().await {
            Some(TransportEvent::Connected) => return SessionStart::Established,
            Some(TransportEvent::Error(reason)) => return SessionStart::Rejected(reason),
            Some(TransportEvent::Closed) => {
                return SessionStart::Rejected(
                    "Connection closed before the session was established".to_string(),
                )
            }
            Some(TransportEvent::Message { topic, .. }) => {
                warn!("Ignoring message on {} before session establishment", topic);
            }
            None => return SessionStart::Rejected("Transport closed unexpectedly".to_string()),
        }
    }
}

/// Per-connection event pump. Runs until the transport's event stream
/// ends or the connection is cancelled by a user disconnect.
async fn run_pump(
    shared: Arc<Shared>,
    transport: Arc<dyn Transport>,
    mut events: TransportEvents,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        match event {
            TransportEvent::Message { topic, payload } => shared.on_message(topic, payload),
            TransportEvent::Connected => shared.on_reconnected(&transport),
            TransportEvent::Closed => shared.on_connection_drop("MQTT connection lost"),
            TransportEvent::Error(reason) => {
                shared.on_connection_drop(&format!("Connection error: {reason}"))
            }
        }
    }
    debug!("Session event pump stopped");
}

fn generate_client_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("mqttdeck-{}", &id[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_ids_are_unique_and_prefixed() {
        let a = generate_client_id();
        let b = generate_client_id();
        assert!(a.starts_with("mqttdeck-"));
        assert_eq!(a.len(), "mqttdeck-".len() + 8);
        assert_ne!(a, b);
    }
}
