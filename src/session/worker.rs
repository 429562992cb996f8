//! Session worker: the isolated task that owns a session's transport
//!
//! Commands arrive over an unbounded FIFO and are processed strictly in
//! order. Transport events are only polled while a link exists. Results go
//! back to the session as [`WorkerEvent`]s; inbound messages go through the
//! [`MessageBatcher`] instead.

use super::batcher::MessageBatcher;
use super::message::Message;
use crate::profile::{ConnectionProfile, QoS};
use crate::transport::{Transport, TransportEvent};
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Requests from the session to its worker
#[derive(Debug, Clone)]
pub(crate) enum WorkerCommand {
    Connect(ConnectionProfile),
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
    /// Stop the worker, tearing down any live link first
    Shutdown,
}

/// Outcomes reported by the worker (and the batch ticker) to the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum WorkerEvent {
    Connected,
    ConnectFailed(String),
    ConnectionLost(String),
    DisconnectComplete,
    SubscribeAck { success: bool },
    Messages(Vec<Message>),
}

/// Worker-side view of the link, independent of the session's state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LinkState {
    Idle,
    Connecting,
    Up,
}

pub(crate) struct SessionWorker<T: Transport> {
    transport: T,
    commands: mpsc::UnboundedReceiver<WorkerCommand>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    batcher: MessageBatcher,
    link: LinkState,
}

impl<T: Transport> SessionWorker<T> {
    pub(crate) fn new(
        transport: T,
        commands: mpsc::UnboundedReceiver<WorkerCommand>,
        events: mpsc::UnboundedSender<WorkerEvent>,
        batcher: MessageBatcher,
    ) -> Self {
        Self {
            transport,
            commands,
            events,
            batcher,
            link: LinkState::Idle,
        }
    }

    /// Run until `Shutdown` arrives or the session drops its command sender
    pub(crate) async fn run(mut self) {
        debug!("Session worker started");
        loop {
            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(WorkerCommand::Shutdown) | None => {
                        self.teardown().await;
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                },

                event = self.transport.next_event(), if self.link != LinkState::Idle => {
                    self.handle_transport_event(event);
                }
            }
        }
        debug!("Session worker stopped");
    }

    async fn handle_command(&mut self, command: WorkerCommand) {
        match command {
            WorkerCommand::Connect(profile) => {
                if self.link != LinkState::Idle {
                    warn!(link = ?self.link, "Connect requested while link is active, ignoring");
                    return;
                }
                info!(host = %profile.host, port = profile.port, "Connecting");
                match self.transport.connect(&profile).await {
                    Ok(()) => self.link = LinkState::Connecting,
                    Err(e) => {
                        warn!(error = %e, "Connect attempt could not start");
                        self.emit(WorkerEvent::ConnectFailed(e.to_string()));
                    }
                }
            }
            WorkerCommand::Disconnect => {
                self.teardown().await;
                self.emit(WorkerEvent::DisconnectComplete);
            }
            WorkerCommand::Subscribe { topic, qos } => {
                if !self.link_is_up("subscribe", &topic) {
                    return;
                }
                if let Err(e) = self.transport.subscribe(&topic, qos).await {
                    warn!(topic = %topic, error = %e, "Subscribe failed");
                }
            }
            WorkerCommand::Unsubscribe { topic } => {
                if !self.link_is_up("unsubscribe", &topic) {
                    return;
                }
                if let Err(e) = self.transport.unsubscribe(&topic).await {
                    warn!(topic = %topic, error = %e, "Unsubscribe failed");
                }
            }
            WorkerCommand::Publish {
                topic,
                payload,
                qos,
                retain,
            } => {
                if !self.link_is_up("publish", &topic) {
                    return;
                }
                if let Err(e) = self.transport.publish(&topic, payload, qos, retain).await {
                    warn!(topic = %topic, error = %e, "Publish failed");
                }
            }
            WorkerCommand::Shutdown => {}
        }
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {
                if self.link == LinkState::Connecting {
                    self.link = LinkState::Up;
                    self.emit(WorkerEvent::Connected);
                } else {
                    debug!(link = ?self.link, "Discarding late connection acknowledgment");
                }
            }
            TransportEvent::Disconnected { reason } => {
                let previous = std::mem::replace(&mut self.link, LinkState::Idle);
                match previous {
                    LinkState::Connecting => self.emit(WorkerEvent::ConnectFailed(reason)),
                    LinkState::Up => self.emit(WorkerEvent::ConnectionLost(reason)),
                    LinkState::Idle => {}
                }
            }
            TransportEvent::SubscribeAck { success } => {
                self.emit(WorkerEvent::SubscribeAck { success });
            }
            TransportEvent::Message {
                topic,
                payload,
                qos,
                retain,
            } => {
                self.batcher
                    .enqueue(Message::received(topic, payload, qos, retain));
            }
        }
    }

    async fn teardown(&mut self) {
        if self.link == LinkState::Idle {
            return;
        }
        if let Err(e) = self.transport.disconnect().await {
            warn!(error = %e, "Transport disconnect reported an error");
        }
        self.link = LinkState::Idle;
        info!("Link torn down");
    }

    fn link_is_up(&self, operation: &str, topic: &str) -> bool {
        if self.link == LinkState::Up {
            return true;
        }
        warn!(operation, topic, link = ?self.link, "Dropping command, link is not up");
        false
    }

    fn emit(&self, event: WorkerEvent) {
        if self.events.send(event).is_err() {
            debug!("Session dispatcher gone, dropping worker event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockTransport, TransportCall};
    use std::time::Duration;
    use tokio::time::timeout;

    struct Harness {
        commands: mpsc::UnboundedSender<WorkerCommand>,
        events: mpsc::UnboundedReceiver<WorkerEvent>,
        batcher: MessageBatcher,
        handle: crate::testing::MockTransportHandle,
        task: tokio::task::JoinHandle<()>,
    }

    fn spawn_worker(transport: MockTransport) -> Harness {
        let handle = transport.handle();
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (event_tx, events) = mpsc::unbounded_channel();
        let batcher = MessageBatcher::new();
        let worker = SessionWorker::new(transport, command_rx, event_tx, batcher.clone());
        Harness {
            commands,
            events,
            batcher,
            handle,
            task: tokio::spawn(worker.run()),
        }
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<WorkerEvent>) -> WorkerEvent {
        timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("worker event expected")
            .expect("worker event channel closed")
    }

    fn profile() -> ConnectionProfile {
        ConnectionProfile::new("test", "localhost", 1883)
    }

    #[tokio::test]
    async fn test_connect_then_ack_reports_connected() {
        let mut h = spawn_worker(MockTransport::new());

        h.commands.send(WorkerCommand::Connect(profile())).unwrap();
        assert_eq!(next_event(&mut h.events).await, WorkerEvent::Connected);

        h.commands.send(WorkerCommand::Shutdown).unwrap();
        timeout(Duration::from_secs(1), h.task).await.unwrap().unwrap();
        let calls = h.handle.calls().await;
        assert!(matches!(calls.first(), Some(TransportCall::Connect { .. })));
        assert_eq!(calls.last(), Some(&TransportCall::Disconnect));
    }

    #[tokio::test]
    async fn test_failed_connect_start_reports_failure() {
        let mut h = spawn_worker(MockTransport::new().with_connect_failure());

        h.commands.send(WorkerCommand::Connect(profile())).unwrap();
        assert!(matches!(
            next_event(&mut h.events).await,
            WorkerEvent::ConnectFailed(_)
        ));
    }

    #[tokio::test]
    async fn test_commands_are_processed_in_order() {
        let mut h = spawn_worker(MockTransport::new());
        h.commands.send(WorkerCommand::Connect(profile())).unwrap();
        assert_eq!(next_event(&mut h.events).await, WorkerEvent::Connected);

        h.commands
            .send(WorkerCommand::Subscribe {
                topic: "a".to_string(),
                qos: QoS::AtLeastOnce,
            })
            .unwrap();
        h.commands
            .send(WorkerCommand::Publish {
                topic: "b".to_string(),
                payload: Bytes::from_static(b"1"),
                qos: QoS::AtMostOnce,
                retain: false,
            })
            .unwrap();
        h.commands
            .send(WorkerCommand::Unsubscribe {
                topic: "a".to_string(),
            })
            .unwrap();
        h.commands.send(WorkerCommand::Disconnect).unwrap();

        // Queued commands win over transport events, so the link is gone
        // before the mock's SUBACK could be polled
        assert_eq!(
            next_event(&mut h.events).await,
            WorkerEvent::DisconnectComplete
        );

        let calls = h.handle.calls().await;
        let kinds: Vec<&str> = calls.iter().map(TransportCall::kind).collect();
        assert_eq!(
            kinds,
            vec!["connect", "subscribe", "publish", "unsubscribe", "disconnect"]
        );
    }

    #[tokio::test]
    async fn test_late_ack_after_disconnect_is_discarded() {
        let mut h = spawn_worker(MockTransport::new().without_auto_connack());

        h.commands.send(WorkerCommand::Connect(profile())).unwrap();
        h.commands.send(WorkerCommand::Disconnect).unwrap();
        assert_eq!(
            next_event(&mut h.events).await,
            WorkerEvent::DisconnectComplete
        );

        h.handle.connack();
        let late = timeout(Duration::from_millis(100), h.events.recv()).await;
        assert!(late.is_err(), "no event expected after teardown, got {late:?}");
    }

    #[tokio::test]
    async fn test_link_loss_is_reported() {
        let mut h = spawn_worker(MockTransport::new());
        h.commands.send(WorkerCommand::Connect(profile())).unwrap();
        assert_eq!(next_event(&mut h.events).await, WorkerEvent::Connected);

        h.handle.lose_connection("broker went away");
        assert_eq!(
            next_event(&mut h.events).await,
            WorkerEvent::ConnectionLost("broker went away".to_string())
        );
    }

    #[tokio::test]
    async fn test_inbound_messages_go_to_batcher() {
        let mut h = spawn_worker(MockTransport::new());
        h.commands.send(WorkerCommand::Connect(profile())).unwrap();
        assert_eq!(next_event(&mut h.events).await, WorkerEvent::Connected);

        h.handle.inject_message("sensors/temp", "21.5");
        h.handle.inject_message("sensors/temp", "21.6");

        timeout(Duration::from_secs(1), async {
            while h.batcher.pending() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("messages should reach the batcher");

        let batch = h.batcher.take_batch().unwrap();
        assert_eq!(batch[0].payload_text(), "21.5");
        assert_eq!(batch[1].payload_text(), "21.6");
    }

    #[tokio::test]
    async fn test_commands_without_link_never_reach_transport() {
        let h = spawn_worker(MockTransport::new());
        h.commands
            .send(WorkerCommand::Publish {
                topic: "b".to_string(),
                payload: Bytes::new(),
                qos: QoS::AtMostOnce,
                retain: false,
            })
            .unwrap();
        h.commands.send(WorkerCommand::Shutdown).unwrap();
        timeout(Duration::from_secs(1), h.task).await.unwrap().unwrap();

        assert!(h.handle.calls().await.is_empty());
    }
}
