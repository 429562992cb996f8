//! Mock transport for testing
//!
//! [`MockTransport`] records every call and replays events injected through
//! its [`MockTransportHandle`], so sessions, workers and the registry can be
//! exercised without a broker.

use crate::profile::{ConnectionProfile, QoS};
use crate::transport::{Transport, TransportError, TransportEvent, TransportFactory};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// One recorded transport call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    Connect {
        client_id: String,
    },
    Disconnect,
    Subscribe {
        topic: String,
        qos: QoS,
    },
    Unsubscribe {
        topic: String,
    },
    Publish {
        topic: String,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    },
}

impl TransportCall {
    pub fn kind(&self) -> &'static str {
        match self {
            TransportCall::Connect { .. } => "connect",
            TransportCall::Disconnect => "disconnect",
            TransportCall::Subscribe { .. } => "subscribe",
            TransportCall::Unsubscribe { .. } => "unsubscribe",
            TransportCall::Publish { .. } => "publish",
        }
    }
}

/// Test-side handle: inspect calls and inject events
#[derive(Debug, Clone)]
pub struct MockTransportHandle {
    calls: Arc<Mutex<Vec<TransportCall>>>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl MockTransportHandle {
    pub async fn calls(&self) -> Vec<TransportCall> {
        self.calls.lock().await.clone()
    }

    pub async fn calls_of(&self, kind: &str) -> Vec<TransportCall> {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|call| call.kind() == kind)
            .cloned()
            .collect()
    }

    pub async fn clear_history(&self) {
        self.calls.lock().await.clear();
    }

    pub fn inject(&self, event: TransportEvent) -> bool {
        self.events.send(event).is_ok()
    }

    pub fn connack(&self) -> bool {
        self.inject(TransportEvent::Connected)
    }

    pub fn lose_connection(&self, reason: &str) -> bool {
        self.inject(TransportEvent::Disconnected {
            reason: reason.to_string(),
        })
    }

    pub fn inject_message(&self, topic: &str, payload: &str) -> bool {
        self.inject(TransportEvent::Message {
            topic: topic.to_string(),
            payload: Bytes::copy_from_slice(payload.as_bytes()),
            qos: QoS::AtMostOnce,
            retain: false,
        })
    }
}

/// Mock transport for testing
#[derive(Debug)]
pub struct MockTransport {
    calls: Arc<Mutex<Vec<TransportCall>>>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: mpsc::UnboundedReceiver<TransportEvent>,
    auto_connack: bool,
    auto_suback: bool,
    fail_connect: bool,
}

impl Default for MockTransport {
    fn default() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            events_tx,
            events_rx,
            auto_connack: true,
            auto_suback: true,
            fail_connect: false,
        }
    }
}

impl MockTransport {
    /// Acknowledges connects and subscribes automatically
    pub fn new() -> Self {
        Self::default()
    }

    /// Leave the connect attempt pending until the test calls `connack`
    pub fn without_auto_connack(mut self) -> Self {
        self.auto_connack = false;
        self
    }

    pub fn without_auto_suback(mut self) -> Self {
        self.auto_suback = false;
        self
    }

    /// Refuse to start connect attempts
    pub fn with_connect_failure(mut self) -> Self {
        self.fail_connect = true;
        self
    }

    pub fn handle(&self) -> MockTransportHandle {
        MockTransportHandle {
            calls: self.calls.clone(),
            events: self.events_tx.clone(),
        }
    }

    async fn record(&self, call: TransportCall) {
        self.calls.lock().await.push(call);
    }

    fn drain_stale_events(&mut self) {
        while self.events_rx.try_recv().is_ok() {}
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&mut self, profile: &ConnectionProfile) -> Result<(), TransportError> {
        self.record(TransportCall::Connect {
            client_id: profile.client_id.clone(),
        })
        .await;

        if self.fail_connect {
            return Err(TransportError::Connection(
                "Mock connection failure".to_string(),
            ));
        }

        self.drain_stale_events();
        if self.auto_connack {
            let _ = self.events_tx.send(TransportEvent::Connected);
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.record(TransportCall::Disconnect).await;
        self.drain_stale_events();
        Ok(())
    }

    async fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), TransportError> {
        self.record(TransportCall::Subscribe {
            topic: topic.to_string(),
            qos,
        })
        .await;
        if self.auto_suback {
            let _ = self
                .events_tx
                .send(TransportEvent::SubscribeAck { success: true });
        }
        Ok(())
    }

    async fn unsubscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        self.record(TransportCall::Unsubscribe {
            topic: topic.to_string(),
        })
        .await;
        Ok(())
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), TransportError> {
        self.record(TransportCall::Publish {
            topic: topic.to_string(),
            payload,
            qos,
            retain,
        })
        .await;
        Ok(())
    }

    async fn next_event(&mut self) -> TransportEvent {
        match self.events_rx.recv().await {
            Some(event) => event,
            // Unreachable while self holds a sender; stay pending like an idle link
            None => std::future::pending().await,
        }
    }
}

/// Builds [`MockTransport`]s and keeps a handle to each, keyed by profile id
#[derive(Debug, Clone, Default)]
pub struct MockTransportFactory {
    handles: Arc<std::sync::Mutex<HashMap<String, MockTransportHandle>>>,
    created: Arc<std::sync::atomic::AtomicUsize>,
    without_auto_connack: bool,
    fail_connect: bool,
}

impl MockTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn without_auto_connack(mut self) -> Self {
        self.without_auto_connack = true;
        self
    }

    pub fn with_connect_failure(mut self) -> Self {
        self.fail_connect = true;
        self
    }

    /// Handle of the most recent transport created for `profile_id`
    pub fn handle(&self, profile_id: &str) -> Option<MockTransportHandle> {
        self.handles
            .lock()
            .ok()
            .and_then(|handles| handles.get(profile_id).cloned())
    }

    /// Number of transports created so far
    pub fn created(&self) -> usize {
        self.created.load(std::sync::atomic::Ordering::SeqCst)
    }
}

impl TransportFactory for MockTransportFactory {
    type Transport = MockTransport;

    fn create(&self, profile: &ConnectionProfile) -> MockTransport {
        let mut transport = MockTransport::new();
        if self.without_auto_connack {
            transport = transport.without_auto_connack();
        }
        if self.fail_connect {
            transport = transport.with_connect_failure();
        }

        if let Ok(mut handles) = self.handles.lock() {
            handles.insert(profile.id.clone(), transport.handle());
        }
        self.created
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        transport
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_records_calls_and_auto_acks() {
        let mut transport = MockTransport::new();
        let handle = transport.handle();
        let profile = ConnectionProfile::new("p", "localhost", 1883);

        transport.connect(&profile).await.unwrap();
        assert_eq!(transport.next_event().await, TransportEvent::Connected);

        transport.subscribe("a/#", QoS::AtLeastOnce).await.unwrap();
        assert_eq!(
            transport.next_event().await,
            TransportEvent::SubscribeAck { success: true }
        );

        let calls = handle.calls().await;
        assert_eq!(
            calls,
            vec![
                TransportCall::Connect {
                    client_id: profile.client_id.clone()
                },
                TransportCall::Subscribe {
                    topic: "a/#".to_string(),
                    qos: QoS::AtLeastOnce
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_disconnect_discards_pending_events() {
        let mut transport = MockTransport::new().without_auto_connack();
        let handle = transport.handle();

        handle.connack();
        handle.inject_message("t", "x");
        transport.disconnect().await.unwrap();
        handle.lose_connection("later");

        assert_eq!(
            transport.next_event().await,
            TransportEvent::Disconnected {
                reason: "later".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_factory_tracks_handles_by_profile() {
        let factory = MockTransportFactory::new().with_connect_failure();
        let profile = ConnectionProfile::new("p", "localhost", 1883);

        let mut transport = factory.create(&profile);
        assert_eq!(factory.created(), 1);
        assert!(transport.connect(&profile).await.is_err());

        let handle = factory.handle(&profile.id).unwrap();
        assert_eq!(handle.calls_of("connect").await.len(), 1);
        assert!(factory.handle("unknown").is_none());
    }
}
