//! Per-session subscription set
//!
//! Pure in-memory bookkeeping. The session issues the matching wire
//! commands; nothing here touches the network.

use crate::profile::QoS;
use crate::topic::matches_filter;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub topic: String,
    pub qos: QoS,
    /// Display tag, typically `#rrggbb`
    pub color: String,
    pub enabled: bool,
}

/// Ordered set of subscriptions keyed by topic filter
#[derive(Debug, Clone, Default)]
pub struct SubscriptionRegistry {
    entries: Vec<Subscription>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscription. Returns false, leaving the existing entry
    /// untouched, if the topic is already present.
    pub fn add(&mut self, topic: impl Into<String>, qos: QoS, color: impl Into<String>) -> bool {
        let topic = topic.into();
        if self.contains(&topic) {
            return false;
        }
        self.entries.push(Subscription {
            topic,
            qos,
            color: color.into(),
            enabled: true,
        });
        true
    }

    /// Remove a subscription. Returns false if the topic was absent.
    pub fn remove(&mut self, topic: &str) -> bool {
        match self.position(topic) {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.position(topic).is_some()
    }

    pub fn get(&self, topic: &str) -> Option<&Subscription> {
        self.entries.iter().find(|s| s.topic == topic)
    }

    /// Subscriptions in insertion order
    pub fn list(&self) -> &[Subscription] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Toggle the display flag. Returns false if the topic was absent.
    pub fn set_enabled(&mut self, topic: &str, enabled: bool) -> bool {
        match self.entries.iter_mut().find(|s| s.topic == topic) {
            Some(subscription) => {
                subscription.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Color of the first enabled subscription whose filter matches `topic`
    pub fn color_for(&self, topic: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|s| s.enabled && matches_filter(&s.topic, topic))
            .map(|s| s.color.as_str())
    }

    fn position(&self, topic: &str) -> Option<usize> {
        self.entries.iter().position(|s| s.topic == topic)
    }
}
