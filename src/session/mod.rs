//! Worker-isolated client sessions
//!
//! A [`Session`] is the caller-facing handle for one profile's connection.
//! Three tasks run behind it:
//!
//! - the worker, which owns the transport and processes commands in order
//! - the batch ticker, which drains inbound messages at a fixed interval
//! - the dispatcher, which applies worker results to the state machine and
//!   re-publishes them to observers
//!
//! Commands are one-way: they validate preconditions synchronously, queue the
//! work and return. Outcomes surface as [`SessionEvent`]s and state changes.

pub mod batcher;
pub mod message;
pub mod state;
pub mod subscriptions;
pub(crate) mod worker;

pub use batcher::MessageBatcher;
pub use message::{Direction, Message, SessionStats};
pub use state::{determine_next_state, ConnectionState, StateEvent};
pub use subscriptions::{Subscription, SubscriptionRegistry};

use crate::config::SessionSection;
use crate::error::{SessionError, SessionResult};
use crate::profile::{ConnectionProfile, QoS};
use crate::topic::{validate_topic_filter, validate_topic_name};
use crate::transport::Transport;
use crate::{session_span, worker_span};
use bytes::Bytes;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};
use worker::{SessionWorker, WorkerCommand, WorkerEvent};

/// Notifications published by a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    StateChanged(ConnectionState),
    /// One flushed batch, in arrival order
    MessagesReceived(Vec<Message>),
    MessagePublished(Message),
    /// Broker answer to a subscribe request. A failure is reported only; the
    /// local subscription is kept.
    SubscriptionAcknowledged { success: bool },
}

#[derive(Debug, Default)]
struct Counters {
    received: u64,
    published: u64,
    connected_at: Option<Instant>,
}

/// State shared between the handle and its dispatcher task
struct Shared {
    profile_id: String,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<SessionEvent>,
    subscriptions: Mutex<SubscriptionRegistry>,
    history: Mutex<Vec<Message>>,
    counters: StdMutex<Counters>,
}

impl Shared {
    fn counters(&self) -> std::sync::MutexGuard<'_, Counters> {
        self.counters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Apply a state machine event atomically
    ///
    /// Returns the new state, or the unchanged current state as the error
    /// when the event is not legal right now. Observers are notified inside
    /// the update so notification order matches transition order.
    fn apply(&self, event: StateEvent) -> Result<ConnectionState, ConnectionState> {
        let mut outcome = Err(ConnectionState::Disconnected);
        self.state.send_if_modified(|state| {
            let current = *state;
            match determine_next_state(current, event) {
                Some(next) => {
                    *state = next;
                    outcome = Ok(next);
                    info!(profile_id = %self.profile_id, from = %current, to = %next, "Session state changed");
                    self.on_transition(next);
                    let _ = self.events.send(SessionEvent::StateChanged(next));
                    true
                }
                None => {
                    outcome = Err(current);
                    false
                }
            }
        });
        outcome
    }

    /// Force the state to `Disconnected` after a teardown that did not converge
    fn force_disconnected(&self) {
        self.state.send_if_modified(|state| {
            if *state == ConnectionState::Disconnected {
                return false;
            }
            warn!(profile_id = %self.profile_id, from = %state, "Forcing session to disconnected");
            *state = ConnectionState::Disconnected;
            self.on_transition(ConnectionState::Disconnected);
            let _ = self.events.send(SessionEvent::StateChanged(ConnectionState::Disconnected));
            true
        });
    }

    fn on_transition(&self, next: ConnectionState) {
        let mut counters = self.counters();
        match next {
            ConnectionState::Connected => counters.connected_at = Some(Instant::now()),
            ConnectionState::Disconnected | ConnectionState::Disconnecting => {
                counters.connected_at = None
            }
            ConnectionState::Connecting => {}
        }
    }

    fn current(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn publish_event(&self, event: SessionEvent) {
        // No receivers is fine; observers are optional
        let _ = self.events.send(event);
    }
}

/// Background tasks owned by a session
struct SessionTasks {
    worker: JoinHandle<()>,
    ticker: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl SessionTasks {
    fn abort(&self) {
        let _ = self.shutdown_tx.send(true);
        self.worker.abort();
        self.ticker.abort();
        self.dispatcher.abort();
    }
}

/// Runtime client bound to one profile
pub struct Session {
    profile: ConnectionProfile,
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<WorkerCommand>,
    tasks: StdMutex<Option<SessionTasks>>,
    disconnect_timeout: Duration,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("profile_id", &self.profile.id)
            .field("state", &self.state())
            .finish()
    }
}

impl Session {
    /// Create a session and start its worker, ticker and dispatcher
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<T: Transport>(
        profile: ConnectionProfile,
        transport: T,
        settings: &SessionSection,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (events_tx, _) = broadcast::channel(settings.event_capacity.max(1));
        let shared = Arc::new(Shared {
            profile_id: profile.id.clone(),
            state: state_tx,
            events: events_tx,
            subscriptions: Mutex::new(SubscriptionRegistry::new()),
            history: Mutex::new(Vec::new()),
            counters: StdMutex::new(Counters::default()),
        });

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (worker_event_tx, worker_event_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let batcher = MessageBatcher::new();

        let ticker_events = worker_event_tx.clone();
        let ticker = batcher.spawn_ticker(settings.batch_interval(), shutdown_rx, move |batch| {
            ticker_events.send(WorkerEvent::Messages(batch)).is_ok()
        });

        let worker = SessionWorker::new(transport, command_rx, worker_event_tx, batcher);
        let worker = tokio::spawn(
            worker
                .run()
                .instrument(worker_span!(profile_id = %profile.id)),
        );

        let dispatcher = tokio::spawn(
            dispatch(shared.clone(), worker_event_rx, command_tx.downgrade())
                .instrument(session_span!(profile_id = %profile.id)),
        );

        debug!(profile_id = %profile.id, "Session spawned");

        Arc::new(Self {
            profile,
            shared,
            commands: command_tx,
            tasks: StdMutex::new(Some(SessionTasks {
                worker,
                ticker,
                dispatcher,
                shutdown_tx,
            })),
            disconnect_timeout: settings.disconnect_timeout(),
        })
    }

    pub fn id(&self) -> &str {
        &self.profile.id
    }

    /// Snapshot of the profile this session was created from
    pub fn profile(&self) -> &ConnectionProfile {
        &self.profile
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.current()
    }

    /// Watch the connection state
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Subscribe to every session notification
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    /// Wait until the session reaches `target`
    pub async fn wait_for_state(
        &self,
        target: ConnectionState,
        timeout: Duration,
    ) -> SessionResult<()> {
        let mut states = self.state_changes();
        let reached = tokio::time::timeout(timeout, async {
            states.wait_for(|state| *state == target).await.map(|_| ())
        })
        .await;
        match reached {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(SessionError::WorkerUnavailable),
            Err(_) => Err(SessionError::Timeout {
                expected: target,
                state: self.state(),
                timeout,
            }),
        }
    }

    /// Start connecting. Only valid while disconnected.
    pub async fn request_connect(&self) -> SessionResult<()> {
        if let Err(state) = self.shared.apply(StateEvent::ConnectRequested) {
            return Err(self.reject("connect", state));
        }
        if self
            .commands
            .send(WorkerCommand::Connect(self.profile.clone()))
            .is_err()
        {
            let _ = self.shared.apply(StateEvent::ConnectFailed);
            return Err(SessionError::WorkerUnavailable);
        }
        Ok(())
    }

    /// Start disconnecting. Valid while connected, and while a connect
    /// attempt is in flight, which cancels it.
    pub async fn request_disconnect(&self) -> SessionResult<()> {
        let applied = {
            let _subscriptions = self.shared.subscriptions.lock().await;
            self.shared.apply(StateEvent::DisconnectRequested)
        };
        if let Err(state) = applied {
            return Err(self.reject("disconnect", state));
        }
        if self.commands.send(WorkerCommand::Disconnect).is_err() {
            self.shared.force_disconnected();
            return Err(SessionError::WorkerUnavailable);
        }
        Ok(())
    }

    /// Subscribe to a topic filter
    ///
    /// Recorded locally right away; the broker's answer arrives later as
    /// [`SessionEvent::SubscriptionAcknowledged`].
    pub async fn subscribe(&self, topic: &str, qos: QoS, color: &str) -> SessionResult<()> {
        if let Err(e) = validate_topic_filter(topic) {
            warn!(profile_id = %self.profile.id, topic, error = %e, "Rejected subscribe");
            return Err(SessionError::invalid_topic(topic, e));
        }
        let mut subscriptions = self.shared.subscriptions.lock().await;
        self.require_connected("subscribe")?;
        if !subscriptions.add(topic, qos, color) {
            warn!(profile_id = %self.profile.id, topic, "Rejected duplicate subscription");
            return Err(SessionError::DuplicateSubscription {
                topic: topic.to_string(),
            });
        }

        if let Err(e) = self.send(WorkerCommand::Subscribe {
            topic: topic.to_string(),
            qos,
        }) {
            subscriptions.remove(topic);
            return Err(e);
        }
        drop(subscriptions);
        debug!(profile_id = %self.profile.id, topic, %qos, "Subscribe queued");
        Ok(())
    }

    /// Remove a subscription and unsubscribe on the broker
    pub async fn unsubscribe(&self, topic: &str) -> SessionResult<()> {
        if let Err(e) = validate_topic_filter(topic) {
            warn!(profile_id = %self.profile.id, topic, error = %e, "Rejected unsubscribe");
            return Err(SessionError::invalid_topic(topic, e));
        }
        let mut subscriptions = self.shared.subscriptions.lock().await;
        self.require_connected("unsubscribe")?;
        if !subscriptions.remove(topic) {
            warn!(profile_id = %self.profile.id, topic, "Rejected unsubscribe of unknown topic");
            return Err(SessionError::UnknownSubscription {
                topic: topic.to_string(),
            });
        }

        self.send(WorkerCommand::Unsubscribe {
            topic: topic.to_string(),
        })?;
        drop(subscriptions);
        debug!(profile_id = %self.profile.id, topic, "Unsubscribe queued");
        Ok(())
    }

    /// Publish a message. It is recorded in the history immediately.
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> SessionResult<()> {
        if let Err(e) = validate_topic_name(topic) {
            warn!(profile_id = %self.profile.id, topic, error = %e, "Rejected publish");
            return Err(SessionError::invalid_topic(topic, e));
        }
        self.require_connected("publish")?;

        let payload = payload.into();
        self.send(WorkerCommand::Publish {
            topic: topic.to_string(),
            payload: payload.clone(),
            qos,
            retain,
        })?;

        let message = Message::published(topic, payload, qos, retain);
        self.shared.history.lock().await.push(message.clone());
        self.shared.counters().published += 1;
        self.shared.publish_event(SessionEvent::MessagePublished(message));
        Ok(())
    }

    /// Subscriptions in insertion order
    pub async fn subscriptions(&self) -> Vec<Subscription> {
        self.shared.subscriptions.lock().await.list().to_vec()
    }

    pub async fn is_subscribed(&self, topic: &str) -> bool {
        self.shared.subscriptions.lock().await.contains(topic)
    }

    /// Toggle a subscription's display flag. No network traffic.
    pub async fn set_subscription_enabled(&self, topic: &str, enabled: bool) -> SessionResult<()> {
        if self
            .shared
            .subscriptions
            .lock()
            .await
            .set_enabled(topic, enabled)
        {
            Ok(())
        } else {
            Err(SessionError::UnknownSubscription {
                topic: topic.to_string(),
            })
        }
    }

    /// Display color for a message topic
    pub async fn color_for(&self, topic: &str) -> Option<String> {
        self.shared
            .subscriptions
            .lock()
            .await
            .color_for(topic)
            .map(str::to_string)
    }

    /// Message history, oldest first
    pub async fn messages(&self) -> Vec<Message> {
        self.shared.history.lock().await.clone()
    }

    pub async fn clear_messages(&self) {
        self.shared.history.lock().await.clear();
    }

    pub fn stats(&self) -> SessionStats {
        let counters = self.shared.counters();
        SessionStats {
            received: counters.received,
            published: counters.published,
            connected_for: counters.connected_at.map(|at| at.elapsed()),
        }
    }

    /// Tear the session down
    ///
    /// Requests a disconnect when a link is live or pending, waits for the
    /// worker to report `Disconnected` (bounded by the configured timeout),
    /// then stops the worker, ticker and dispatcher. Idempotent.
    pub async fn close(&self) {
        let tasks = match self.tasks.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(tasks) = tasks else {
            return;
        };

        info!(profile_id = %self.profile.id, state = %self.state(), "Closing session");

        if matches!(
            self.state(),
            ConnectionState::Connected | ConnectionState::Connecting
        ) {
            let _ = self.request_disconnect().await;
        }
        if self.state() != ConnectionState::Disconnected {
            if let Err(e) = self
                .wait_for_state(ConnectionState::Disconnected, self.disconnect_timeout)
                .await
            {
                warn!(profile_id = %self.profile.id, error = %e, "Session did not disconnect in time");
            }
        }

        let _ = self.commands.send(WorkerCommand::Shutdown);
        let _ = tasks.shutdown_tx.send(true);

        let deadline = self.disconnect_timeout;
        join_or_abort("worker", tasks.worker, deadline).await;
        join_or_abort("ticker", tasks.ticker, deadline).await;
        join_or_abort("dispatcher", tasks.dispatcher, deadline).await;

        let _subscriptions = self.shared.subscriptions.lock().await;
        self.shared.force_disconnected();
        debug!(profile_id = %self.profile.id, "Session closed");
    }

    fn require_connected(&self, operation: &'static str) -> SessionResult<()> {
        let state = self.state();
        if state.accepts_commands() {
            Ok(())
        } else {
            Err(self.reject(operation, state))
        }
    }

    fn reject(&self, operation: &'static str, state: ConnectionState) -> SessionError {
        warn!(profile_id = %self.profile.id, operation, %state, "Rejected command in current state");
        SessionError::invalid_state(operation, state)
    }

    fn send(&self, command: WorkerCommand) -> SessionResult<()> {
        self.commands
            .send(command)
            .map_err(|_| SessionError::WorkerUnavailable)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Async teardown is not possible here; close() is the graceful path
        let tasks = match self.tasks.get_mut() {
            Ok(tasks) => tasks.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(tasks) = tasks {
            tasks.abort();
        }
    }
}

async fn join_or_abort(name: &str, handle: JoinHandle<()>, deadline: Duration) {
    let abort = handle.abort_handle();
    match tokio::time::timeout(deadline, handle).await {
        Ok(Ok(())) => debug!(task = name, "Session task stopped"),
        Ok(Err(e)) if !e.is_cancelled() => warn!(task = name, error = %e, "Session task ended with error"),
        Ok(Err(_)) => {}
        Err(_) => {
            warn!(task = name, "Session task did not stop in time, aborting");
            abort.abort();
        }
    }
}

/// Apply worker results to the session until every worker-side sender is gone
///
/// Transitions into or out of `Connected` happen under the subscription lock,
/// so subscribe and unsubscribe see a state consistent with the registry.
async fn dispatch(
    shared: Arc<Shared>,
    mut events: mpsc::UnboundedReceiver<WorkerEvent>,
    commands: mpsc::WeakUnboundedSender<WorkerCommand>,
) {
    while let Some(event) = events.recv().await {
        match event {
            WorkerEvent::Connected => {
                let subscriptions = shared.subscriptions.lock().await;
                match shared.apply(StateEvent::ConnectSucceeded) {
                    Ok(_) => resubscribe(&subscriptions, &commands),
                    Err(state) => debug!(%state, "Ignoring connection success"),
                }
            }
            WorkerEvent::ConnectFailed(reason) => {
                warn!(%reason, "Connect attempt failed");
                if let Err(state) = shared.apply(StateEvent::ConnectFailed) {
                    debug!(%state, "Ignoring connect failure");
                }
            }
            WorkerEvent::ConnectionLost(reason) => {
                warn!(%reason, "Connection lost");
                let _subscriptions = shared.subscriptions.lock().await;
                if let Err(state) = shared.apply(StateEvent::ConnectionLost) {
                    debug!(%state, "Ignoring connection loss");
                }
            }
            WorkerEvent::DisconnectComplete => {
                if let Err(state) = shared.apply(StateEvent::TeardownComplete) {
                    debug!(%state, "Ignoring teardown completion");
                }
            }
            WorkerEvent::SubscribeAck { success } => {
                if !success {
                    warn!("Broker rejected a subscription; local subscription kept");
                }
                shared.publish_event(SessionEvent::SubscriptionAcknowledged { success });
            }
            WorkerEvent::Messages(batch) => {
                shared.history.lock().await.extend(batch.iter().cloned());
                shared.counters().received += batch.len() as u64;
                shared.publish_event(SessionEvent::MessagesReceived(batch));
            }
        }
    }
    debug!("Session dispatcher stopped");
}

/// Re-issue kept subscriptions on a fresh link
fn resubscribe(
    subscriptions: &SubscriptionRegistry,
    commands: &mpsc::WeakUnboundedSender<WorkerCommand>,
) {
    if subscriptions.is_empty() {
        return;
    }
    let Some(commands) = commands.upgrade() else {
        return;
    };
    for subscription in subscriptions.list() {
        let command = WorkerCommand::Subscribe {
            topic: subscription.topic.clone(),
            qos: subscription.qos,
        };
        if commands.send(command).is_err() {
            return;
        }
    }
    info!(count = subscriptions.len(), "Re-issued subscriptions after connect");
}
