//! rumqttc-backed [`Transport`]
//!
//! `connect` builds the rumqttc client and hands the event loop to its own
//! pump task, which drains the request channel and forwards routed events
//! to `next_event`. Requests therefore never wait on the worker polling the
//! loop. Any event-loop error ends the pump for good, so rumqttc never
//! reconnects behind the session's back.

use super::connection::{
    configure_v4_options, configure_v5_options, connect_timeout_secs, to_v4_qos, to_v5_qos,
};
use super::event_router::{EventRoute, EventRouter};
use crate::config::MqttSection;
use crate::profile::{ConnectionProfile, ProtocolVersion, QoS};
use crate::transport::{Transport, TransportError, TransportEvent, TransportFactory};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn, Instrument};

/// How long a graceful disconnect may take before the link is dropped
const DISCONNECT_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

enum EventLoop {
    V4(rumqttc::EventLoop),
    V5(rumqttc::v5::EventLoop),
}

/// One result of polling the event loop
enum Polled {
    Route(EventRoute),
    OutgoingDisconnect,
    Failed(String),
}

impl EventLoop {
    async fn poll(&mut self) -> Polled {
        match self {
            EventLoop::V4(event_loop) => match event_loop.poll().await {
                Ok(rumqttc::Event::Outgoing(rumqttc::Outgoing::Disconnect)) => {
                    Polled::OutgoingDisconnect
                }
                Ok(event) => Polled::Route(EventRouter::route_v4_event(&event)),
                Err(e) => Polled::Failed(e.to_string()),
            },
            EventLoop::V5(event_loop) => match event_loop.poll().await {
                Ok(rumqttc::v5::Event::Outgoing(rumqttc::Outgoing::Disconnect)) => {
                    Polled::OutgoingDisconnect
                }
                Ok(event) => Polled::Route(EventRouter::route_v5_event(&event)),
                Err(e) => Polled::Failed(e.to_string()),
            },
        }
    }
}

/// Request side of a link
#[derive(Clone)]
enum ClientHandle {
    V4(rumqttc::AsyncClient),
    V5(rumqttc::v5::AsyncClient),
}

impl ClientHandle {
    async fn disconnect(&self) -> Result<(), TransportError> {
        match self {
            ClientHandle::V4(client) => client.disconnect().await.map_err(client_error),
            ClientHandle::V5(client) => client.disconnect().await.map_err(client_error),
        }
    }
}

fn client_error<E: std::error::Error + Send + Sync + 'static>(e: E) -> TransportError {
    TransportError::Client(Box::new(e))
}

/// Map a route to what the worker should see, or `None` to keep polling.
/// The flag is the CONNACK-seen marker shared with the transport.
fn transport_event(route: EventRoute, acknowledged: &AtomicBool) -> Option<TransportEvent> {
    match route {
        EventRoute::ConnectionAcknowledged { success: true, .. } => {
            acknowledged.store(true, Ordering::SeqCst);
            Some(TransportEvent::Connected)
        }
        EventRoute::ConnectionAcknowledged {
            success: false,
            code,
        } => Some(TransportEvent::Disconnected {
            reason: format!("Connection refused with code {code:#04x}"),
        }),
        EventRoute::MessageReceived {
            topic,
            payload,
            qos,
            retain,
        } => Some(TransportEvent::Message {
            topic,
            payload,
            qos,
            retain,
        }),
        EventRoute::Disconnected => Some(TransportEvent::Disconnected {
            reason: "Broker closed the connection".to_string(),
        }),
        EventRoute::SubscriptionConfirmed { return_codes } => {
            let success = EventRouter::validate_subscription_success(&return_codes).is_ok();
            Some(TransportEvent::SubscribeAck { success })
        }
        EventRoute::InfrastructureEvent(description) => {
            trace!(event = %description, "MQTT infrastructure event");
            None
        }
        EventRoute::OutgoingEvent => None,
    }
}

/// Drive the event loop until the link ends
///
/// Returns after forwarding a terminal `Disconnected`, after our own
/// DISCONNECT went out, or once nobody reads the events any more.
async fn pump(
    mut event_loop: EventLoop,
    events: mpsc::UnboundedSender<TransportEvent>,
    acknowledged: Arc<AtomicBool>,
) {
    loop {
        let event = match event_loop.poll().await {
            Polled::OutgoingDisconnect => {
                debug!("Outgoing disconnect flushed");
                return;
            }
            Polled::Failed(reason) => {
                warn!(%reason, "MQTT event loop failed");
                TransportEvent::Disconnected { reason }
            }
            Polled::Route(route) => match transport_event(route, &acknowledged) {
                Some(event) => event,
                None => continue,
            },
        };

        let terminal = matches!(event, TransportEvent::Disconnected { .. });
        if events.send(event).is_err() || terminal {
            return;
        }
    }
}

/// A live rumqttc link: the request handle plus the pump feeding `events`
struct Link {
    client: ClientHandle,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    acknowledged: Arc<AtomicBool>,
    pump: JoinHandle<()>,
}

impl Drop for Link {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

/// MQTT transport for one profile, speaking 3.1.1 or 5.0
pub struct MqttTransport {
    defaults: MqttSection,
    link: Option<Link>,
}

impl MqttTransport {
    pub fn new(defaults: MqttSection) -> Self {
        Self {
            defaults,
            link: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.link.is_some()
    }

    fn client(&self) -> Result<ClientHandle, TransportError> {
        self.link
            .as_ref()
            .map(|link| link.client.clone())
            .ok_or(TransportError::NotConnected)
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn connect(&mut self, profile: &ConnectionProfile) -> Result<(), TransportError> {
        self.link = None;
        let capacity = self.defaults.request_capacity.max(1);

        let (client, event_loop) = match profile.protocol {
            ProtocolVersion::V311 => {
                let options = configure_v4_options(profile, &self.defaults)?;
                let (client, mut event_loop) = rumqttc::AsyncClient::new(options, capacity);
                event_loop
                    .network_options
                    .set_connection_timeout(connect_timeout_secs(profile, &self.defaults));
                (ClientHandle::V4(client), EventLoop::V4(event_loop))
            }
            ProtocolVersion::V5 => {
                let options = configure_v5_options(profile, &self.defaults)?;
                let (client, event_loop) = rumqttc::v5::AsyncClient::new(options, capacity);
                (ClientHandle::V5(client), EventLoop::V5(event_loop))
            }
        };

        info!(
            host = %profile.host,
            port = profile.port,
            protocol = %profile.protocol,
            tls = profile.use_tls,
            "MQTT connect attempt started"
        );

        let (events_tx, events) = mpsc::unbounded_channel();
        let acknowledged = Arc::new(AtomicBool::new(false));
        let pump = tokio::spawn(
            pump(event_loop, events_tx, acknowledged.clone()).instrument(tracing::Span::current()),
        );
        self.link = Some(Link {
            client,
            events,
            acknowledged,
            pump,
        });
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        let Some(mut link) = self.link.take() else {
            return Ok(());
        };

        // Without a CONNACK there is no session to close on the broker
        if !link.acknowledged.load(Ordering::SeqCst) {
            debug!("Dropping unacknowledged MQTT link");
            return Ok(());
        }

        if let Err(e) = link.client.disconnect().await {
            debug!(error = %e, "MQTT link already gone");
            return Ok(());
        }
        if tokio::time::timeout(DISCONNECT_FLUSH_TIMEOUT, &mut link.pump)
            .await
            .is_err()
        {
            warn!("MQTT disconnect did not flush in time, dropping link");
        }
        info!("MQTT link closed");
        Ok(())
    }

    async fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), TransportError> {
        match self.client()? {
            ClientHandle::V4(client) => client
                .subscribe(topic, to_v4_qos(qos))
                .await
                .map_err(client_error),
            ClientHandle::V5(client) => client
                .subscribe(topic, to_v5_qos(qos))
                .await
                .map_err(client_error),
        }
    }

    async fn unsubscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        match self.client()? {
            ClientHandle::V4(client) => client.unsubscribe(topic).await.map_err(client_error),
            ClientHandle::V5(client) => client.unsubscribe(topic).await.map_err(client_error),
        }
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), TransportError> {
        match self.client()? {
            ClientHandle::V4(client) => client
                .publish_bytes(topic, to_v4_qos(qos), retain, payload)
                .await
                .map_err(client_error),
            ClientHandle::V5(client) => client
                .publish_bytes(topic, to_v5_qos(qos), retain, payload)
                .await
                .map_err(client_error),
        }
    }

    async fn next_event(&mut self) -> TransportEvent {
        let received = match self.link.as_mut() {
            Some(link) => link.events.recv().await,
            None => return std::future::pending().await,
        };

        match received {
            Some(TransportEvent::Disconnected { reason }) => {
                self.link = None;
                TransportEvent::Disconnected { reason }
            }
            Some(event) => event,
            None => {
                self.link = None;
                TransportEvent::Disconnected {
                    reason: "MQTT event loop stopped".to_string(),
                }
            }
        }
    }
}

/// Builds an [`MqttTransport`] per session, sharing application defaults
#[derive(Debug, Clone, Default)]
pub struct MqttTransportFactory {
    defaults: MqttSection,
}

impl MqttTransportFactory {
    pub fn new(defaults: MqttSection) -> Self {
        Self { defaults }
    }
}

impl TransportFactory for MqttTransportFactory {
    type Transport = MqttTransport;

    fn create(&self, _profile: &ConnectionProfile) -> MqttTransport {
        MqttTransport::new(self.defaults.clone())
    }
}
