//! Application messages

use crate::protocol::{Publish, QoS};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;

/// An application message: topic, opaque payload and delivery flags.
///
/// `duplicate` is only ever set by the engine when it retransmits a publish, or
/// by the broker when it redelivers one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    #[serde(default)]
    pub retained: bool,
    #[serde(default)]
    pub duplicate: bool,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retained: false,
            duplicate: false,
        }
    }

    pub fn with_retained(mut self, retained: bool) -> Self {
        self.retained = retained;
        self
    }

    /// Payload as text, replacing invalid UTF-8
    pub fn payload_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    /// Build the PUBLISH packet that carries this message
    pub fn to_publish(&self, packet_id: Option<u16>) -> Publish {
        Publish {
            topic: self.topic.clone(),
            payload: self.payload.clone(),
            qos: self.qos,
            retain: self.retained,
            dup: self.duplicate,
            packet_id,
        }
    }
}

impl From<&Publish> for Message {
    fn from(publish: &Publish) -> Self {
        Self {
            topic: publish.topic.clone(),
            payload: publish.payload.clone(),
            qos: publish.qos,
            retained: publish.retain,
            duplicate: publish.dup,
        }
    }
}
