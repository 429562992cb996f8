//! Transport layer consumed by session workers
//!
//! A [`Transport`] is one protocol client bound to one profile. The session
//! worker owns it exclusively, drives it with commands and pulls
//! [`TransportEvent`]s from it. Wire encoding lives entirely behind this
//! trait; the MQTT implementation is in [`mqtt`].

use crate::profile::{ConnectionProfile, QoS};
use bytes::Bytes;
use thiserror::Error;

pub mod mqtt;

/// Events produced by a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Broker acknowledged the connection
    Connected,
    /// Connect attempt failed or an established link dropped
    Disconnected { reason: String },
    /// Broker answered a subscribe request
    SubscribeAck { success: bool },
    /// Inbound publish
    Message {
        topic: String,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    },
}

/// Transport-level failures. These never escape a session; the worker turns
/// them into state transitions or log lines.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Invalid connection options: {0}")]
    InvalidOptions(String),
    #[error("Transport is not connected")]
    NotConnected,
    #[error("Client request failed")]
    Client(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Connection failed: {0}")]
    Connection(String),
}

/// Protocol client driven by a session worker
///
/// `connect` only starts an attempt; the outcome arrives later from
/// `next_event` as `Connected` or `Disconnected`. `next_event` must be
/// cancel safe because the worker races it against its command queue.
#[async_trait::async_trait]
pub trait Transport: Send + 'static {
    async fn connect(&mut self, profile: &ConnectionProfile) -> Result<(), TransportError>;

    /// Tear the link down completely; no further events are produced until
    /// the next `connect`
    async fn disconnect(&mut self) -> Result<(), TransportError>;

    async fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), TransportError>;

    async fn unsubscribe(&mut self, topic: &str) -> Result<(), TransportError>;

    async fn publish(
        &mut self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), TransportError>;

    /// Wait for the next event from the link
    async fn next_event(&mut self) -> TransportEvent;
}

/// Creates one transport per session
pub trait TransportFactory: Send + Sync + 'static {
    type Transport: Transport;

    fn create(&self, profile: &ConnectionProfile) -> Self::Transport;
}

/// Type aliases for the MQTT transport
pub type MqttTransport = mqtt::MqttTransport;
pub type MqttTransportFactory = mqtt::MqttTransportFactory;
