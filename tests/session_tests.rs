//! End-to-end tests for the session manager against a scripted transport.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use mqttdeck::config::BrokerConfig;
use mqttdeck::logsink::{LogRecord, LogSink, Severity};
use mqttdeck::notify::NotificationSink;
use mqttdeck::session::{
    ConnectError, ConnectionState, PublishError, RejectReason, SessionEvents, SessionManager,
    SubscribeError, UnsubscribeError,
};
use mqttdeck::transport::{Connector, Transport, TransportError, TransportEvent, TransportEvents};

// --- collaborators -------------------------------------------------------

#[derive(Default)]
struct MemoryLog {
    records: Mutex<Vec<LogRecord>>,
}

impl LogSink for MemoryLog {
    fn append(&self, text: &str, severity: Severity) {
        if text.trim().is_empty() {
            return;
        }
        self.records
            .lock()
            .unwrap()
            .push(LogRecord::now(text, severity));
    }

    fn list(&self) -> Vec<LogRecord> {
        self.records.lock().unwrap().clone()
    }

    fn clear(&self) {
        self.records.lock().unwrap().clear();
    }
}

#[derive(Default)]
struct RecordingNotifier {
    seen: Mutex<Vec<(String, String)>>,
}

impl NotificationSink for RecordingNotifier {
    fn notify(&self, title: &str, body: &str) {
        self.seen
            .lock()
            .unwrap()
            .push((title.to_string(), body.to_string()));
    }
}

// --- scripted transport --------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    Publish(String, Vec<u8>),
    Subscribe(String),
    Unsubscribe(String),
    End,
}

#[derive(Default)]
struct TransportLog {
    calls: Mutex<Vec<Call>>,
    failing_topics: Mutex<HashSet<String>>,
}

impl TransportLog {
    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn subscribes(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Subscribe(topic) => Some(topic),
                _ => None,
            })
            .collect()
    }

    fn fail_subscribes_to(&self, topic: &str) {
        self.failing_topics.lock().unwrap().insert(topic.to_string());
    }
}

struct MockTransport {
    log: Arc<TransportLog>,
}

impl Transport for MockTransport {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), TransportError> {
        self.log
            .calls
            .lock()
            .unwrap()
            .push(Call::Publish(topic.to_string(), payload.to_vec()));
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.log
            .calls
            .lock()
            .unwrap()
            .push(Call::Subscribe(topic.to_string()));
        if self.log.failing_topics.lock().unwrap().contains(topic) {
            return Err(TransportError::Request("subscribe refused".to_string()));
        }
        Ok(())
    }

    fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.log
            .calls
            .lock()
            .unwrap()
            .push(Call::Unsubscribe(topic.to_string()));
        Ok(())
    }

    fn end(&self) {
        self.log.calls.lock().unwrap().push(Call::End);
    }
}

/// What the next `open` call should do.
#[derive(Debug, Clone, Copy)]
enum OpenPlan {
    /// Deliver `Connected` immediately.
    Accept,
    /// Deliver an error event with this reason.
    Reject(&'static str),
    /// Never deliver a session event.
    Silent,
}

/// One opened transport, as seen by a test: the URL and client id it was
/// opened with, the event injection handle, and the recorded calls.
struct Opened {
    url: String,
    client_id: String,
    events: mpsc::Sender<TransportEvent>,
    log: Arc<TransportLog>,
}

#[derive(Default)]
struct MockConnector {
    plans: Mutex<VecDeque<OpenPlan>>,
    opened: Mutex<Vec<Arc<Opened>>>,
}

impl MockConnector {
    fn plan(&self, plan: OpenPlan) {
        self.plans.lock().unwrap().push_back(plan);
    }

    fn open_count(&self) -> usize {
        self.opened.lock().unwrap().len()
    }

    fn opened(&self, index: usize) -> Arc<Opened> {
        self.opened.lock().unwrap()[index].clone()
    }
}

impl Connector for MockConnector {
    fn open(
        &self,
        url: &str,
        client_id: &str,
        _credentials: Option<(String, String)>,
    ) -> Result<(Arc<dyn Transport>, TransportEvents), TransportError> {
        let plan = self
            .plans
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(OpenPlan::Accept);
        let (tx, rx) = mpsc::channel(16);
        match plan {
            OpenPlan::Accept => tx.try_send(TransportEvent::Connected).unwrap(),
            OpenPlan::Reject(reason) => tx
                .try_send(TransportEvent::Error(reason.to_string()))
                .unwrap(),
            OpenPlan::Silent => {}
        }
        let log = Arc::new(TransportLog::default());
        self.opened.lock().unwrap().push(Arc::new(Opened {
            url: url.to_string(),
            client_id: client_id.to_string(),
            events: tx,
            log: log.clone(),
        }));
        Ok((Arc::new(MockTransport { log }), rx))
    }
}

// --- harness -------------------------------------------------------------

struct Harness {
    manager: SessionManager,
    events: SessionEvents,
    connector: Arc<MockConnector>,
    logs: Arc<MemoryLog>,
    notifier: Arc<RecordingNotifier>,
}

fn harness() -> Harness {
    let connector = Arc::new(MockConnector::default());
    let logs = Arc::new(MemoryLog::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let (manager, events) = SessionManager::new(connector.clone(), logs.clone(), notifier.clone());
    Harness {
        manager,
        events,
        connector,
        logs,
        notifier,
    }
}

fn broker() -> BrokerConfig {
    BrokerConfig {
        host: "broker.local".to_string(),
        port: 1883,
        ..BrokerConfig::default()
    }
}

fn log_texts(logs: &MemoryLog, severity: Severity) -> Vec<String> {
    logs.list()
        .into_iter()
        .filter(|r| r.severity == severity)
        .map(|r| r.text)
        .collect()
}

async fn wait_for_state(rx: &mut watch::Receiver<ConnectionState>, want: ConnectionState) {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if *rx.borrow_and_update() == want {
                return;
            }
            rx.changed().await.expect("state channel closed");
        }
    })
    .await
    .expect("timed out waiting for connection state");
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

// --- connect -------------------------------------------------------------

#[tokio::test]
async fn connect_opens_ws_url_and_logs_success() {
    let mut h = harness();

    h.manager.connect(broker()).await.unwrap();

    assert_eq!(h.manager.state(), ConnectionState::Connected);
    wait_for_state(&mut h.events.state, ConnectionState::Connected).await;

    let opened = h.connector.opened(0);
    assert_eq!(opened.url, "ws://broker.local:1883/mqtt");
    assert!(opened.client_id.starts_with("mqttdeck-"));
    assert_eq!(
        log_texts(&h.logs, Severity::Success),
        vec!["Successfully connected to MQTT broker"]
    );
}

#[tokio::test]
async fn connect_uses_wss_with_tls() {
    let h = harness();
    let config = BrokerConfig {
        use_tls: true,
        port: 8884,
        ..broker()
    };

    h.manager.connect(config).await.unwrap();

    assert_eq!(h.connector.opened(0).url, "wss://broker.local:8884/mqtt");
}

#[tokio::test]
async fn invalid_config_fails_before_any_io() {
    let h = harness();
    let config = BrokerConfig {
        host: "  ".to_string(),
        ..broker()
    };

    let result = h.manager.connect(config).await;

    assert!(matches!(result, Err(ConnectError::InvalidConfig(_))));
    assert_eq!(h.connector.open_count(), 0);
    assert_eq!(h.manager.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn second_connect_while_connected_is_rejected() {
    let h = harness();
    h.manager.connect(broker()).await.unwrap();

    let second = h.manager.connect(broker()).await;

    assert!(matches!(second, Err(ConnectError::AlreadyConnected)));
    assert_eq!(h.connector.open_count(), 1);
}

#[tokio::test]
async fn connect_while_connecting_is_rejected_without_queueing() {
    let h = harness();
    h.connector.plan(OpenPlan::Silent);

    let manager = h.manager.clone();
    let first = tokio::spawn(async move { manager.connect(broker()).await });

    for _ in 0..1000 {
        if h.manager.state() == ConnectionState::Connecting && h.connector.open_count() == 1 {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(h.manager.state(), ConnectionState::Connecting);

    let second = h.manager.connect(broker()).await;
    assert!(matches!(second, Err(ConnectError::AlreadyConnected)));
    assert_eq!(h.connector.open_count(), 1);

    // Let the first attempt resolve so it does not outlive the test.
    h.connector
        .opened(0)
        .events
        .try_send(TransportEvent::Connected)
        .unwrap();
    assert!(first.await.unwrap().is_ok());
}

#[tokio::test]
async fn bad_credentials_are_classified() {
    let h = harness();
    h.connector.plan(OpenPlan::Reject("Bad username or password"));

    let result = h.manager.connect(broker()).await;

    assert!(matches!(
        result,
        Err(ConnectError::BrokerRejected(RejectReason::BadCredentials))
    ));
    assert_eq!(h.manager.state(), ConnectionState::Disconnected);
    assert_eq!(
        log_texts(&h.logs, Severity::Error),
        vec!["Bad username or password"]
    );
    assert!(h.connector.opened(0).log.calls().contains(&Call::End));
}

#[tokio::test]
async fn other_rejections_are_unreachable() {
    let h = harness();
    h.connector
        .plan(OpenPlan::Reject("Connection refused: ServiceUnavailable"));

    let result = h.manager.connect(broker()).await;

    assert!(matches!(
        result,
        Err(ConnectError::BrokerRejected(RejectReason::Unreachable))
    ));
    assert_eq!(h.manager.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn connect_times_out_and_closes_the_transport() {
    let h = harness();
    h.connector.plan(OpenPlan::Silent);

    let result = h.manager.connect(broker()).await;

    assert!(matches!(result, Err(ConnectError::Timeout)));
    assert_eq!(h.manager.state(), ConnectionState::Disconnected);
    assert!(h.connector.opened(0).log.calls().contains(&Call::End));
    assert_eq!(
        log_texts(&h.logs, Severity::Error),
        vec!["Connection timed out after 15 seconds"]
    );
}

// --- disconnect ----------------------------------------------------------

#[tokio::test]
async fn disconnect_is_idempotent() {
    let h = harness();
    h.manager.connect(broker()).await.unwrap();

    h.manager.disconnect();
    assert_eq!(h.manager.state(), ConnectionState::Disconnected);
    assert!(h.connector.opened(0).log.calls().contains(&Call::End));

    h.manager.disconnect();
    assert_eq!(h.manager.state(), ConnectionState::Disconnected);
    assert_eq!(
        log_texts(&h.logs, Severity::Warning),
        vec!["Disconnected from MQTT broker"]
    );
}

#[tokio::test]
async fn explicit_disconnect_clears_the_registry() {
    let h = harness();
    h.manager.connect(broker()).await.unwrap();
    h.manager.subscribe("sensors/temp").unwrap();

    h.manager.disconnect();
    assert!(h.manager.subscriptions().is_empty());

    h.manager.connect(broker()).await.unwrap();
    assert!(h.manager.subscriptions().is_empty());
    assert!(h.connector.opened(1).log.subscribes().is_empty());
}

// --- publish -------------------------------------------------------------

#[tokio::test]
async fn publish_while_disconnected_never_touches_the_transport() {
    let h = harness();

    let result = h.manager.publish("sensors/temp", b"21.5");

    assert!(matches!(result, Err(PublishError::NotConnected)));
    assert_eq!(h.connector.open_count(), 0);
}

#[tokio::test]
async fn publish_rejects_an_empty_topic() {
    let h = harness();
    h.manager.connect(broker()).await.unwrap();

    assert!(matches!(
        h.manager.publish("", b"x"),
        Err(PublishError::EmptyTopic)
    ));
    assert!(matches!(
        h.manager.publish("   ", b"x"),
        Err(PublishError::EmptyTopic)
    ));
    assert!(h.connector.opened(0).log.calls().is_empty());
}

#[tokio::test]
async fn publish_forwards_to_the_transport() {
    let h = harness();
    h.manager.connect(broker()).await.unwrap();

    h.manager.publish("actuators/led", b"on").unwrap();

    assert_eq!(
        h.connector.opened(0).log.calls(),
        vec![Call::Publish("actuators/led".to_string(), b"on".to_vec())]
    );
}

// --- subscribe / unsubscribe --------------------------------------------

#[tokio::test]
async fn duplicate_subscribe_is_rejected() {
    let h = harness();
    h.manager.connect(broker()).await.unwrap();

    h.manager.subscribe("sensors/temp").unwrap();
    let second = h.manager.subscribe("sensors/temp");

    assert!(matches!(second, Err(SubscribeError::AlreadySubscribed)));
    assert_eq!(h.manager.subscriptions().len(), 1);
    assert_eq!(
        h.connector.opened(0).log.subscribes(),
        vec!["sensors/temp"]
    );
}

#[tokio::test]
async fn subscribe_requires_a_connection() {
    let h = harness();
    assert!(matches!(
        h.manager.subscribe("sensors/temp"),
        Err(SubscribeError::NotConnected)
    ));
}

#[tokio::test]
async fn unsubscribe_is_symmetric() {
    let h = harness();
    assert!(matches!(
        h.manager.unsubscribe("sensors/temp"),
        Err(UnsubscribeError::NotConnected)
    ));

    h.manager.connect(broker()).await.unwrap();
    assert!(matches!(
        h.manager.unsubscribe("sensors/temp"),
        Err(UnsubscribeError::NotSubscribed)
    ));

    h.manager.subscribe("sensors/temp").unwrap();
    h.manager.unsubscribe("sensors/temp").unwrap();
    assert!(h.manager.subscriptions().is_empty());
    assert!(h
        .connector
        .opened(0)
        .log
        .calls()
        .contains(&Call::Unsubscribe("sensors/temp".to_string())));
}

// --- reconnection --------------------------------------------------------

#[tokio::test]
async fn internal_reconnect_replays_the_registry_in_order() {
    let mut h = harness();
    h.manager.connect(broker()).await.unwrap();
    h.manager.subscribe("c").unwrap();
    h.manager.subscribe("a").unwrap();
    h.manager.subscribe("b").unwrap();

    let opened = h.connector.opened(0);
    opened.events.send(TransportEvent::Closed).await.unwrap();
    wait_for_state(&mut h.events.state, ConnectionState::Disconnected).await;
    assert!(log_texts(&h.logs, Severity::Error).contains(&"MQTT connection lost".to_string()));

    opened.events.send(TransportEvent::Connected).await.unwrap();
    wait_for_state(&mut h.events.state, ConnectionState::Connected).await;

    let log = opened.log.clone();
    wait_until(move || log.subscribes().len() == 6).await;
    assert_eq!(
        opened.log.subscribes(),
        vec!["c", "a", "b", "c", "a", "b"],
        "replay must follow insertion order"
    );
}

#[tokio::test]
async fn unsolicited_close_preserves_the_registry_for_a_fresh_connect() {
    let mut h = harness();
    h.manager.connect(broker()).await.unwrap();
    h.manager.subscribe("sensors/temp").unwrap();

    let first = h.connector.opened(0);
    first.events.send(TransportEvent::Closed).await.unwrap();
    wait_for_state(&mut h.events.state, ConnectionState::Disconnected).await;

    h.manager.connect(broker()).await.unwrap();

    // The lingering transport is swept, and the preserved registry is
    // replayed on the new connection.
    assert!(first.log.calls().contains(&Call::End));
    assert_eq!(
        h.connector.opened(1).log.subscribes(),
        vec!["sensors/temp"]
    );
}

#[tokio::test]
async fn failed_resubscribe_keeps_the_connection_and_marks_inactive() {
    let mut h = harness();
    h.manager.connect(broker()).await.unwrap();
    h.manager.subscribe("a").unwrap();
    h.manager.subscribe("b").unwrap();

    let opened = h.connector.opened(0);
    opened.log.fail_subscribes_to("a");
    opened.events.send(TransportEvent::Closed).await.unwrap();
    wait_for_state(&mut h.events.state, ConnectionState::Disconnected).await;
    opened.events.send(TransportEvent::Connected).await.unwrap();
    wait_for_state(&mut h.events.state, ConnectionState::Connected).await;

    let manager = h.manager.clone();
    wait_until(move || {
        let subs = manager.subscriptions();
        subs.len() == 2 && !subs[0].active && subs[1].active
    })
    .await;

    assert_eq!(h.manager.state(), ConnectionState::Connected);
    assert!(log_texts(&h.logs, Severity::Warning)
        .iter()
        .any(|t| t.starts_with("Failed to resubscribe to a")));
}

// --- inbound messages ----------------------------------------------------

#[tokio::test]
async fn inbound_message_is_forwarded_logged_and_notified() {
    let mut h = harness();
    h.manager.connect(broker()).await.unwrap();
    h.manager.subscribe("sensors/temp").unwrap();

    h.connector
        .opened(0)
        .events
        .send(TransportEvent::Message {
            topic: "sensors/temp".to_string(),
            payload: b"21.5".to_vec(),
        })
        .await
        .unwrap();

    let message = tokio::time::timeout(Duration::from_secs(2), h.events.messages.recv())
        .await
        .expect("no message delivered")
        .expect("message channel closed");
    assert_eq!(message.topic, "sensors/temp");
    assert_eq!(message.payload_text(), "21.5");

    assert!(log_texts(&h.logs, Severity::Info)
        .contains(&"Received message on sensors/temp: 21.5".to_string()));
    assert_eq!(
        h.notifier.seen.lock().unwrap().clone(),
        vec![("New MQTT Message".to_string(), "21.5".to_string())]
    );
}

#[tokio::test]
async fn disabled_notifications_suppress_the_sink_but_not_the_log() {
    let mut h = harness();
    h.manager.set_notifications_enabled(false);
    h.manager.connect(broker()).await.unwrap();

    h.connector
        .opened(0)
        .events
        .send(TransportEvent::Message {
            topic: "sensors/temp".to_string(),
            payload: b"21.5".to_vec(),
        })
        .await
        .unwrap();

    let message = tokio::time::timeout(Duration::from_secs(2), h.events.messages.recv())
        .await
        .expect("no message delivered")
        .expect("message channel closed");
    assert_eq!(message.payload_text(), "21.5");

    assert!(h.notifier.seen.lock().unwrap().is_empty());
    assert_eq!(log_texts(&h.logs, Severity::Info).len(), 1);
}
