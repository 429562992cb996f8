//! Messages recorded in a session's history

use crate::profile::QoS;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Who produced a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Published,
    Received,
}

/// One message in a session's history. Never mutated once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub direction: Direction,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn received(topic: impl Into<String>, payload: Bytes, qos: QoS, retain: bool) -> Self {
        Self {
            topic: topic.into(),
            payload,
            qos,
            retain,
            direction: Direction::Received,
            timestamp: Utc::now(),
        }
    }

    pub fn published(topic: impl Into<String>, payload: Bytes, qos: QoS, retain: bool) -> Self {
        Self {
            topic: topic.into(),
            payload,
            qos,
            retain,
            direction: Direction::Published,
            timestamp: Utc::now(),
        }
    }

    /// Payload as text, with invalid UTF-8 replaced
    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Counters for a session since it was created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionStats {
    pub received: u64,
    pub published: u64,
    /// Time since the current connection was established, if connected
    pub connected_for: Option<Duration>,
}
