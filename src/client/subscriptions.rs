//! Client-side record of active subscriptions

use crate::protocol::{topic_matches, Message, QoS};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// One subscribed filter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub filter: String,
    pub requested_qos: QoS,
    /// QoS granted in the SUBACK, `None` until it arrives
    pub granted_qos: Option<QoS>,
    /// Cleared by the first retained delivery matching the filter
    pub expect_retained: bool,
}

/// Filter to subscription map, ordered by filter so resubscription is stable
#[derive(Debug, Default)]
pub struct SubscriptionTable {
    entries: BTreeMap<String, Subscription>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite the entry for `filter`
    pub fn insert(&mut self, filter: &str, qos: QoS, expect_retained: bool) {
        let previous = self.entries.insert(
            filter.to_string(),
            Subscription {
                filter: filter.to_string(),
                requested_qos: qos,
                granted_qos: None,
                expect_retained,
            },
        );
        if let Some(previous) = previous {
            debug!(filter, old_qos = %previous.requested_qos, new_qos = %qos, "Replacing subscription");
        }
    }

    pub fn set_granted(&mut self, filter: &str, granted: QoS) {
        if let Some(entry) = self.entries.get_mut(filter) {
            entry.granted_qos = Some(granted);
        }
    }

    pub fn remove(&mut self, filter: &str) -> Option<Subscription> {
        self.entries.remove(filter)
    }

    pub fn contains(&self, filter: &str) -> bool {
        self.entries.contains_key(filter)
    }

    pub fn get(&self, filter: &str) -> Option<&Subscription> {
        self.entries.get(filter)
    }

    /// True if any subscription matches the concrete topic
    pub fn matches(&self, topic: &str) -> bool {
        self.entries.keys().any(|filter| topic_matches(filter, topic))
    }

    /// Account for an inbound message: consumes the expect-retained marker of
    /// every matching filter and reports deliveries nothing subscribed to.
    pub fn record_delivery(&mut self, message: &Message) {
        let mut matched = false;
        for entry in self
            .entries
            .values_mut()
            .filter(|entry| topic_matches(&entry.filter, &message.topic))
        {
            matched = true;
            if entry.expect_retained && message.retained {
                entry.expect_retained = false;
                debug!(filter = %entry.filter, "Expected retained message arrived");
            }
        }
        if !matched {
            warn!(topic = %message.topic, "Message arrived for a topic with no subscription");
        }
    }

    /// Filters still waiting for their retained message
    pub fn awaiting_retained(&self) -> Vec<String> {
        self.entries
            .values()
            .filter(|entry| entry.expect_retained)
            .map(|entry| entry.filter.clone())
            .collect()
    }

    pub fn snapshot(&self) -> Vec<Subscription> {
        self.entries.values().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
