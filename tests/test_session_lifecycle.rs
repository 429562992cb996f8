//! Session lifecycle tests
//!
//! Drives real sessions (worker, batch ticker, dispatcher) over the mock
//! transport:
//! - connect / disconnect transitions and the disconnect-during-connect race
//! - subscription bookkeeping and rejection rules
//! - publish history and statistics
//! - batched inbound delivery


use bytes::Bytes;
use mqttdesk::session::Direction;
use mqttdesk::testing::{MockTransport, MockTransportHandle, TransportCall};
use mqttdesk::{
    ConnectionState, ErrorKind, QoS, Session, SessionError, SessionEvent, TransportEvent,
};
use std::sync::Arc;
use std::time::Duration;
use test_helpers::{connect, fast_settings, local_profile, STEP_TIMEOUT};
use tokio::sync::broadcast;
use tokio::time::timeout;

fn spawn_session(transport: MockTransport) -> (Arc<Session>, MockTransportHandle) {
    let handle = transport.handle();
    let session = Session::spawn(local_profile("lifecycle"), transport, &fast_settings());
    (session, handle)
}

/// Wait until the mock has recorded `count` calls of `kind`
async fn wait_for_calls(handle: &MockTransportHandle, kind: &str, count: usize) {
    timeout(STEP_TIMEOUT, async {
        while handle.calls_of(kind).await.len() < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("expected {count} {kind} call(s)"));
}

async fn next_event(events: &mut broadcast::Receiver<SessionEvent>) -> SessionEvent {
    timeout(STEP_TIMEOUT, events.recv())
        .await
        .expect("session event expected")
        .expect("session event channel open")
}

#[tokio::test]
async fn test_connect_and_disconnect_round_trip() {
    // Arrange
    let (session, handle) = spawn_session(MockTransport::new());
    let mut events = session.events();

    // Act
    connect(&session).await;
    session.request_disconnect().await.unwrap();
    session
        .wait_for_state(ConnectionState::Disconnected, STEP_TIMEOUT)
        .await
        .unwrap();

    // Assert
    let mut states = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let SessionEvent::StateChanged(state) = event {
            states.push(state);
        }
    }
    assert_eq!(
        states,
        vec![
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Disconnecting,
            ConnectionState::Disconnected,
        ]
    );
    let kinds: Vec<&str> = handle.calls().await.iter().map(TransportCall::kind).collect();
    assert_eq!(kinds, vec!["connect", "disconnect"]);

    session.close().await;
}

#[tokio::test]
async fn test_disconnect_during_connect_never_reopens() {
    // Arrange: the broker answers only after the user gave up
    let (session, handle) = spawn_session(MockTransport::new().without_auto_connack());
    let mut states = session.state_changes();

    // Act
    session.request_connect().await.unwrap();
    session.request_disconnect().await.unwrap();
    handle.connack();

    session
        .wait_for_state(ConnectionState::Disconnected, STEP_TIMEOUT)
        .await
        .unwrap();

    // Assert: give a late acknowledgment time to surface, then check it did not
    let _ = states.borrow_and_update();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(session.state(), ConnectionState::Disconnected);
    assert!(!states.has_changed().unwrap(), "state moved after teardown");

    session.close().await;
}

#[tokio::test]
async fn test_disconnect_during_connect_state_sequence() {
    // Arrange
    let (session, handle) = spawn_session(MockTransport::new().without_auto_connack());
    let mut events = session.events();

    // Act
    session.request_connect().await.unwrap();
    session.request_disconnect().await.unwrap();
    handle.connack();
    session
        .wait_for_state(ConnectionState::Disconnected, STEP_TIMEOUT)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Assert
    let mut states = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let SessionEvent::StateChanged(state) = event {
            states.push(state);
        }
    }
    assert!(!states.contains(&ConnectionState::Connected), "{states:?}");
    assert_eq!(states.last(), Some(&ConnectionState::Disconnected));

    session.close().await;
}

#[tokio::test]
async fn test_failed_connect_returns_to_disconnected() {
    let (session, _handle) = spawn_session(MockTransport::new().with_connect_failure());

    session.request_connect().await.unwrap();
    session
        .wait_for_state(ConnectionState::Disconnected, STEP_TIMEOUT)
        .await
        .unwrap();

    // Connecting again is allowed after a failure
    assert!(session.request_connect().await.is_ok());
    session.close().await;
}

#[tokio::test]
async fn test_lost_connection_rejects_further_commands() {
    // Arrange
    let (session, handle) = spawn_session(MockTransport::new());
    connect(&session).await;

    // Act
    handle.lose_connection("broker restarted");
    session
        .wait_for_state(ConnectionState::Disconnected, STEP_TIMEOUT)
        .await
        .unwrap();

    // Assert
    let err = session
        .subscribe("a/b", QoS::AtMostOnce, "#ffffff")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SessionError::InvalidState {
            operation: "subscribe",
            state: ConnectionState::Disconnected
        }
    ));
    assert_eq!(session.stats().connected_for, None);
    session.close().await;
}

#[tokio::test]
async fn test_reconnect_reissues_kept_subscriptions() {
    // Arrange
    let (session, handle) = spawn_session(MockTransport::new());
    connect(&session).await;
    session
        .subscribe("sensors/#", QoS::AtLeastOnce, "#2a9d8f")
        .await
        .unwrap();
    wait_for_calls(&handle, "subscribe", 1).await;

    handle.lose_connection("broker restarted");
    session
        .wait_for_state(ConnectionState::Disconnected, STEP_TIMEOUT)
        .await
        .unwrap();

    // Act
    connect(&session).await;

    // Assert
    wait_for_calls(&handle, "subscribe", 2).await;
    let subscribes = handle.calls_of("subscribe").await;
    assert_eq!(
        subscribes[1],
        TransportCall::Subscribe {
            topic: "sensors/#".to_string(),
            qos: QoS::AtLeastOnce
        }
    );
    assert_eq!(session.subscriptions().await.len(), 1);

    session.close().await;
}

#[tokio::test]
async fn test_duplicate_subscribe_keeps_original() {
    // Arrange
    let (session, handle) = spawn_session(MockTransport::new());
    connect(&session).await;
    session
        .subscribe("sensors/+/temp", QoS::AtLeastOnce, "#e76f51")
        .await
        .unwrap();

    // Act
    let err = session
        .subscribe("sensors/+/temp", QoS::ExactlyOnce, "#264653")
        .await
        .unwrap_err();

    // Assert
    assert!(matches!(err, SessionError::DuplicateSubscription { ref topic } if topic == "sensors/+/temp"));
    assert_eq!(err.kind(), ErrorKind::PreconditionViolation);

    let subscriptions = session.subscriptions().await;
    assert_eq!(subscriptions.len(), 1);
    assert_eq!(subscriptions[0].qos, QoS::AtLeastOnce);
    assert_eq!(subscriptions[0].color, "#e76f51");

    wait_for_calls(&handle, "subscribe", 1).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(handle.calls_of("subscribe").await.len(), 1);

    session.close().await;
}

#[tokio::test]
async fn test_publish_while_disconnected_has_no_effect() {
    // Arrange
    let (session, handle) = spawn_session(MockTransport::new());

    // Act
    let err = session
        .publish("a/b", "payload", QoS::AtMostOnce, false)
        .await
        .unwrap_err();

    // Assert
    assert!(matches!(
        err,
        SessionError::InvalidState {
            operation: "publish",
            ..
        }
    ));
    assert!(session.messages().await.is_empty());
    assert_eq!(session.stats().published, 0);
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(handle.calls_of("publish").await.is_empty());

    session.close().await;
}

#[tokio::test]
async fn test_publish_records_history_and_reaches_transport() {
    // Arrange
    let (session, handle) = spawn_session(MockTransport::new());
    let mut events = session.events();
    connect(&session).await;

    // Act
    session
        .publish("home/light", "on", QoS::AtLeastOnce, true)
        .await
        .unwrap();

    // Assert
    let history = session.messages().await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].direction, Direction::Published);
    assert_eq!(history[0].payload_text(), "on");
    assert_eq!(session.stats().published, 1);

    loop {
        if let SessionEvent::MessagePublished(message) = next_event(&mut events).await {
            assert_eq!(message.topic, "home/light");
            break;
        }
    }

    wait_for_calls(&handle, "publish", 1).await;
    assert_eq!(
        handle.calls_of("publish").await[0],
        TransportCall::Publish {
            topic: "home/light".to_string(),
            payload: Bytes::from_static(b"on"),
            qos: QoS::AtLeastOnce,
            retain: true,
        }
    );

    session.close().await;
}

#[tokio::test]
async fn test_invalid_topics_are_rejected_without_side_effects() {
    let (session, handle) = spawn_session(MockTransport::new());
    connect(&session).await;

    let bad_filter = session.subscribe("a/#/b", QoS::AtMostOnce, "#000000").await;
    let bad_name = session.publish("a/+", "x", QoS::AtMostOnce, false).await;

    assert!(matches!(bad_filter, Err(SessionError::InvalidTopic { .. })));
    assert!(matches!(bad_name, Err(SessionError::InvalidTopic { .. })));
    assert!(session.subscriptions().await.is_empty());
    assert!(session.messages().await.is_empty());

    tokio::time::sleep(Duration::from_millis(30)).await;
    let kinds: Vec<&str> = handle.calls().await.iter().map(TransportCall::kind).collect();
    assert_eq!(kinds, vec!["connect"]);

    session.close().await;
}

#[tokio::test]
async fn test_unsubscribe_unknown_topic_is_rejected() {
    let (session, _handle) = spawn_session(MockTransport::new());
    connect(&session).await;

    let err = session.unsubscribe("never/subscribed").await.unwrap_err();
    assert!(matches!(err, SessionError::UnknownSubscription { .. }));

    session.subscribe("a/b", QoS::AtMostOnce, "#111111").await.unwrap();
    session.unsubscribe("a/b").await.unwrap();
    assert!(!session.is_subscribed("a/b").await);

    session.close().await;
}

#[tokio::test]
async fn test_commands_reach_transport_in_issue_order() {
    let (session, handle) = spawn_session(MockTransport::new());
    connect(&session).await;

    session.subscribe("a", QoS::AtMostOnce, "#111111").await.unwrap();
    session.publish("b", "1", QoS::AtMostOnce, false).await.unwrap();
    session.unsubscribe("a").await.unwrap();
    session.publish("c", "2", QoS::AtMostOnce, false).await.unwrap();

    wait_for_calls(&handle, "publish", 2).await;
    let kinds: Vec<&str> = handle.calls().await.iter().map(TransportCall::kind).collect();
    assert_eq!(
        kinds,
        vec!["connect", "subscribe", "publish", "unsubscribe", "publish"]
    );

    session.close().await;
}

#[tokio::test]
async fn test_rejected_suback_is_reported_but_subscription_kept() {
    // Arrange
    let (session, handle) = spawn_session(MockTransport::new().without_auto_suback());
    let mut events = session.events();
    connect(&session).await;
    session
        .subscribe("restricted/#", QoS::AtLeastOnce, "#9b2226")
        .await
        .unwrap();
    wait_for_calls(&handle, "subscribe", 1).await;

    // Act
    handle.inject(TransportEvent::SubscribeAck { success: false });

    // Assert
    loop {
        if let SessionEvent::SubscriptionAcknowledged { success } = next_event(&mut events).await {
            assert!(!success);
            break;
        }
    }
    assert!(session.is_subscribed("restricted/#").await);

    session.close().await;
}

#[tokio::test]
async fn test_inbound_messages_are_delivered_in_batches() {
    // Arrange
    let (session, handle) = spawn_session(MockTransport::new());
    let mut events = session.events();
    connect(&session).await;
    session.subscribe("sensors/#", QoS::AtMostOnce, "#2a9d8f").await.unwrap();

    // Act
    for i in 0..5 {
        handle.inject_message("sensors/temp", &format!("{i}"));
    }

    // Assert: every message arrives, in order, without one event per message
    let mut delivered = Vec::new();
    let mut batches = 0;
    while delivered.len() < 5 {
        if let SessionEvent::MessagesReceived(batch) = next_event(&mut events).await {
            batches += 1;
            delivered.extend(batch.into_iter().map(|m| m.payload_text()));
        }
    }
    assert_eq!(delivered, vec!["0", "1", "2", "3", "4"]);
    assert!(batches < 5, "expected coalescing, got {batches} batches");

    let history = session.messages().await;
    assert_eq!(history.len(), 5);
    assert!(history.iter().all(|m| m.direction == Direction::Received));
    assert_eq!(session.stats().received, 5);
    assert_eq!(session.color_for("sensors/temp").await.as_deref(), Some("#2a9d8f"));

    session.clear_messages().await;
    assert!(session.messages().await.is_empty());

    session.close().await;
}

#[tokio::test]
async fn test_close_tears_down_live_link() {
    let (session, handle) = spawn_session(MockTransport::new());
    connect(&session).await;

    timeout(STEP_TIMEOUT, session.close())
        .await
        .expect("close should finish");

    assert_eq!(session.state(), ConnectionState::Disconnected);
    assert_eq!(handle.calls_of("disconnect").await.len(), 1);
}
