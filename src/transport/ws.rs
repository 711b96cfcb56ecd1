use std::sync::Arc;
use std::time::Duration;

use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Packet, QoS,
    Transport as MqttTransport,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::{Connector, Transport, TransportError, TransportEvent, TransportEvents};

const EVENT_QUEUE: usize = 100;
const KEEP_ALIVE: Duration = Duration::from_secs(5);
/// Pause after an event-loop error so rumqttc's automatic reconnect does
/// not spin against an unreachable broker.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// Websocket [`Connector`] backed by rumqttc.
pub struct WsConnector;

impl Connector for WsConnector {
    fn open(
        &self,
        url: &str,
        client_id: &str,
        credentials: Option<(String, String)>,
    ) -> Result<(Arc<dyn Transport>, TransportEvents), TransportError> {
        // For websocket transports rumqttc carries host and port inside the
        // URL; the port argument is unused.
        let mut options = MqttOptions::new(client_id, url, 8000);
        if url.starts_with("wss://") {
            options.set_transport(MqttTransport::wss_with_default_config());
        } else if url.starts_with("ws://") {
            options.set_transport(MqttTransport::Ws);
        } else {
            return Err(TransportError::Open(format!(
                "unsupported transport scheme in {url}"
            )));
        }
        options.set_keep_alive(KEEP_ALIVE);
        if let Some((username, password)) = credentials {
            options.set_credentials(username, password);
        }

        let (client, eventloop) = AsyncClient::new(options, EVENT_QUEUE);
        let cancel = CancellationToken::new();
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE);
        tokio::spawn(run_event_loop(eventloop, event_tx, cancel.clone()));

        Ok((Arc::new(WsTransport { client, cancel }), event_rx))
    }
}

struct WsTransport {
    client: AsyncClient,
    cancel: CancellationToken,
}

impl Transport for WsTransport {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), TransportError> {
        self.client
            .try_publish(topic, QoS::AtMostOnce, false, payload.to_vec())
            .map_err(|e| TransportError::Request(e.to_string()))
    }

    fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.client
            .try_subscribe(topic, QoS::AtMostOnce)
            .map_err(|e| TransportError::Request(e.to_string()))
    }

    fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.client
            .try_unsubscribe(topic)
            .map_err(|e| TransportError::Request(e.to_string()))
    }

    fn end(&self) {
        let _ = self.client.try_disconnect();
        self.cancel.cancel();
    }
}

/// Polls the rumqttc event loop and translates its events into
/// [`TransportEvent`]s until the transport ends or the receiver is gone.
async fn run_event_loop(
    mut eventloop: EventLoop,
    events: mpsc::Sender<TransportEvent>,
    cancel: CancellationToken,
) {
    loop {
        let polled = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            polled = eventloop.poll() => polled,
        };

        let (mapped, failed) = match polled {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => match ack.code {
                ConnectReturnCode::Success => (Some(TransportEvent::Connected), false),
                code => (Some(TransportEvent::Error(describe_refusal(code))), true),
            },
            Ok(Event::Incoming(Packet::Publish(publish))) => (
                Some(TransportEvent::Message {
                    topic: publish.topic.clone(),
                    payload: publish.payload.to_vec(),
                }),
                false,
            ),
            Ok(Event::Incoming(Packet::Disconnect)) => (Some(TransportEvent::Closed), false),
            Ok(event) => {
                trace!("Ignoring MQTT event: {:?}", event);
                (None, false)
            }
            Err(e) => (Some(map_connection_error(&e)), true),
        };

        if let Some(event) = mapped {
            if events.send(event).await.is_err() {
                debug!("Transport event receiver dropped, stopping event loop");
                break;
            }
        }
        if failed {
            // The next poll re-dials the broker.
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(RECONNECT_BACKOFF) => {}
            }
        }
    }
}

fn map_connection_error(e: &ConnectionError) -> TransportEvent {
    match e {
        ConnectionError::ConnectionRefused(code) => TransportEvent::Error(describe_refusal(*code)),
        other => TransportEvent::Error(other.to_string()),
    }
}

/// Human-readable reason for a refused CONNECT. The credential case uses
/// the wording brokers and client libraries conventionally report, which
/// is also what the session manager's classifier matches on.
fn describe_refusal(code: ConnectReturnCode) -> String {
    match code {
        ConnectReturnCode::BadUserNamePassword => "Bad username or password".to_string(),
        ConnectReturnCode::NotAuthorized => "Not authorized".to_string(),
        ConnectReturnCode::ServiceUnavailable => "Service unavailable".to_string(),
        other => format!("Connection refused: {other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_credentials_use_the_conventional_wording() {
        assert_eq!(
            describe_refusal(ConnectReturnCode::BadUserNamePassword),
            "Bad username or password"
        );
    }

    #[tokio::test]
    async fn non_websocket_schemes_are_rejected() {
        let result = WsConnector.open("tcp://broker.local:1883", "client", None);
        assert!(matches!(result, Err(TransportError::Open(_))));
    }
}
