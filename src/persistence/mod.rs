//! Durable storage for unacknowledged packets
//!
//! The delivery engine writes every outbound QoS 1/2 publish (and every inbound
//! QoS 2 publish awaiting PUBREL) here before it touches the wire, and purges the
//! record once the handshake completes. A persistent session reconnect, or a new
//! client on the same store, replays what is left.
//!
//! Stores are shared behind an `Arc` and must be safe to call from any thread.

pub mod file;
pub mod memory;

pub use file::FilePersistence;
pub use memory::MemoryPersistence;

use crate::error::{MqttError, MqttResult};
use crate::protocol::Message;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// Which half of a handshake a persisted record belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Direction {
    /// Sent by this client, awaiting acknowledgment
    Outbound,
    /// QoS 2 publish received from the broker, awaiting PUBREL
    Inbound,
}

/// Store key: one record per direction and packet id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PersistenceKey {
    pub direction: Direction,
    pub packet_id: u16,
}

impl PersistenceKey {
    pub fn outbound(packet_id: u16) -> Self {
        Self {
            direction: Direction::Outbound,
            packet_id,
        }
    }

    pub fn inbound(packet_id: u16) -> Self {
        Self {
            direction: Direction::Inbound,
            packet_id,
        }
    }
}

impl fmt::Display for PersistenceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = match self.direction {
            Direction::Outbound => "s",
            Direction::Inbound => "r",
        };
        write!(f, "{prefix}-{}", self.packet_id)
    }
}

impl FromStr for PersistenceKey {
    type Err = MqttError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (prefix, id) = s
            .split_once('-')
            .ok_or_else(|| MqttError::persistence(format!("malformed key '{s}'")))?;
        let direction = match prefix {
            "s" => Direction::Outbound,
            "r" => Direction::Inbound,
            _ => return Err(MqttError::persistence(format!("unknown key prefix '{s}'"))),
        };
        let packet_id = id
            .parse::<u16>()
            .map_err(|e| MqttError::persistence(format!("bad packet id in '{s}': {e}")))?;
        Ok(Self {
            direction,
            packet_id,
        })
    }
}

/// Handshake stage recorded with a persisted packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryStage {
    /// QoS 1 PUBLISH sent
    AwaitingPubAck,
    /// QoS 2 PUBLISH sent
    AwaitingPubRec,
    /// QoS 2 PUBREC received, PUBREL sent
    AwaitingPubComp,
    /// Inbound QoS 2 PUBLISH delivered, PUBREC sent
    AwaitingPubRel,
}

/// Snapshot of an in-flight packet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedPacket {
    pub packet_id: u16,
    pub message: Message,
    pub stage: DeliveryStage,
    /// Monotonic per-client counter, replay happens in ascending order
    pub sequence: u64,
}

/// Key/value store for in-flight packets
pub trait Persistence: Send + Sync {
    /// Insert or overwrite the record for `key`
    fn store(&self, key: PersistenceKey, packet: &PersistedPacket) -> MqttResult<()>;

    fn retrieve(&self, key: PersistenceKey) -> MqttResult<Option<PersistedPacket>>;

    /// Removing a missing key is not an error
    fn remove(&self, key: PersistenceKey) -> MqttResult<()>;

    fn all_keys(&self) -> MqttResult<HashSet<PersistenceKey>>;

    fn clear(&self) -> MqttResult<()>;
}
