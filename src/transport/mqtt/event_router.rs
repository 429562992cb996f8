//! Pure routing of rumqttc events
//!
//! Both protocol revisions are collapsed into one [`EventRoute`] so the
//! client only has a single decision table to act on.

use super::connection::{from_v4_qos, from_v5_qos};
use crate::profile::QoS;
use bytes::Bytes;

/// Routing decision for one event-loop event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventRoute {
    /// CONNACK; `code` is the raw reason code
    ConnectionAcknowledged { success: bool, code: u8 },
    /// Inbound PUBLISH
    MessageReceived {
        topic: String,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    },
    /// Broker sent DISCONNECT
    Disconnected,
    /// SUBACK with one code per filter; 0x80 and above mean failure
    SubscriptionConfirmed { return_codes: Vec<u8> },
    /// Keep-alive and acknowledgement traffic
    InfrastructureEvent(String),
    /// Anything we sent
    OutgoingEvent,
}

impl EventRoute {
    /// Whether the client should surface this route to the worker
    pub fn is_meaningful(&self) -> bool {
        !matches!(
            self,
            EventRoute::InfrastructureEvent(_) | EventRoute::OutgoingEvent
        )
    }
}

pub struct EventRouter;

impl EventRouter {
    pub fn route_v4_event(event: &rumqttc::Event) -> EventRoute {
        use rumqttc::{ConnectReturnCode, Event, Packet, SubscribeReasonCode};

        match event {
            Event::Incoming(Packet::ConnAck(connack)) => EventRoute::ConnectionAcknowledged {
                success: connack.code == ConnectReturnCode::Success,
                code: connack.code as u8,
            },
            Event::Incoming(Packet::Publish(publish)) => EventRoute::MessageReceived {
                topic: publish.topic.clone(),
                payload: publish.payload.clone(),
                qos: from_v4_qos(publish.qos),
                retain: publish.retain,
            },
            Event::Incoming(Packet::Disconnect) => EventRoute::Disconnected,
            Event::Incoming(Packet::SubAck(suback)) => EventRoute::SubscriptionConfirmed {
                return_codes: suback
                    .return_codes
                    .iter()
                    .map(|code| match code {
                        SubscribeReasonCode::Success(qos) => u8::from(from_v4_qos(*qos)),
                        SubscribeReasonCode::Failure => 0x80,
                    })
                    .collect(),
            },
            Event::Incoming(other) => EventRoute::InfrastructureEvent(format!("{other:?}")),
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    pub fn route_v5_event(event: &rumqttc::v5::Event) -> EventRoute {
        use rumqttc::v5::mqttbytes::v5::{ConnectReturnCode, Packet, SubscribeReasonCode};
        use rumqttc::v5::Event;

        match event {
            Event::Incoming(Packet::ConnAck(connack)) => EventRoute::ConnectionAcknowledged {
                success: connack.code == ConnectReturnCode::Success,
                code: connack.code as u8,
            },
            Event::Incoming(Packet::Publish(publish)) => EventRoute::MessageReceived {
                topic: String::from_utf8_lossy(&publish.topic).to_string(),
                payload: publish.payload.clone(),
                qos: from_v5_qos(publish.qos),
                retain: publish.retain,
            },
            Event::Incoming(Packet::Disconnect(_)) => EventRoute::Disconnected,
            Event::Incoming(Packet::SubAck(suback)) => EventRoute::SubscriptionConfirmed {
                return_codes: suback
                    .return_codes
                    .iter()
                    .map(|code| match code {
                        SubscribeReasonCode::Success(qos) => u8::from(from_v5_qos(*qos)),
                        _ => 0x80,
                    })
                    .collect(),
            },
            Event::Incoming(other) => EventRoute::InfrastructureEvent(format!("{other:?}")),
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// Validate subscription success from SUBACK return codes
    pub fn validate_subscription_success(return_codes: &[u8]) -> Result<(), String> {
        if return_codes.iter().any(|&code| code >= 0x80) {
            Err(format!(
                "Subscription failed with return codes: {return_codes:?}"
            ))
        } else {
            Ok(())
        }
    }
}
