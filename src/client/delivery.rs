//! QoS 0/1/2 delivery state machines
//!
//! The delivery engine is sans-I/O: every operation returns the
//! [`DeliveryAction`]s the engine task must carry out (packets to send,
//! messages to hand to the application, tokens to settle). It owns packet id
//! allocation and keeps the persistence store in step with its in-flight
//! table, so a record exists for exactly as long as its handshake is open.
//!
//! Outbound flows:
//!
//! ```text
//! QoS 1: PUBLISH -> PUBACK
//! QoS 2: PUBLISH -> PUBREC, PUBREL -> PUBCOMP
//! ```
//!
//! Unacknowledged packets are resent with a doubling timeout. Once
//! `max_retries` resends went unanswered the token fails with
//! `DeliveryTimeout` and the record is purged.

use crate::client::tokens::TokenId;
use crate::error::{MqttError, MqttResult};
use crate::observability::metrics;
use crate::persistence::{
    DeliveryStage, Direction, PersistedPacket, Persistence, PersistenceKey,
};
use crate::protocol::{Message, Packet, Publish, QoS};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// Retransmission policy for unacknowledged QoS 1/2 packets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Wait before the first resend
    pub ack_timeout: Duration,
    /// Upper bound for the doubled wait
    pub max_retry_interval: Duration,
    /// Resends before the delivery is abandoned
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(10),
            max_retry_interval: Duration::from_secs(60),
            max_retries: 3,
        }
    }
}

impl RetryPolicy {
    /// Wait after the `retries`-th resend (0 is the original send)
    pub fn interval(&self, retries: u32) -> Duration {
        let factor = 1u32.checked_shl(retries.min(31)).unwrap_or(u32::MAX);
        self.ack_timeout
            .saturating_mul(factor)
            .min(self.max_retry_interval)
    }
}

/// Hands out non-zero packet ids, at most `capacity` at a time
#[derive(Debug)]
pub struct PacketIdAllocator {
    next_id: u16,
    in_use: HashSet<u16>,
    capacity: usize,
}

impl PacketIdAllocator {
    pub fn new(capacity: usize) -> Self {
        Self {
            next_id: 1,
            in_use: HashSet::new(),
            capacity: capacity.clamp(1, usize::from(u16::MAX)),
        }
    }

    pub fn allocate(&mut self) -> MqttResult<u16> {
        if self.in_use.len() >= self.capacity {
            return Err(MqttError::NoPacketIdAvailable {
                max_inflight: self.capacity,
            });
        }

        for _ in 0..u16::MAX {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if self.next_id == 0 {
                self.next_id = 1;
            }
            if self.in_use.insert(id) {
                return Ok(id);
            }
        }

        Err(MqttError::NoPacketIdAvailable {
            max_inflight: self.capacity,
        })
    }

    /// Claim a specific id (restored from persistence). Ignores the capacity.
    pub fn reserve(&mut self, id: u16) -> bool {
        id != 0 && self.in_use.insert(id)
    }

    pub fn release(&mut self, id: u16) -> bool {
        self.in_use.remove(&id)
    }

    pub fn in_use(&self) -> usize {
        self.in_use.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Work the engine task must perform on behalf of the delivery engine
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryAction {
    Send(Packet),
    Deliver(Message),
    Complete(TokenId),
    Fail(TokenId, MqttError),
}

#[derive(Debug, Clone)]
struct InFlight {
    token: TokenId,
    message: Message,
    stage: DeliveryStage,
    retries: u32,
    deadline: Instant,
    sequence: u64,
    published_at: Instant,
}

impl InFlight {
    fn record(&self, packet_id: u16) -> PersistedPacket {
        PersistedPacket {
            packet_id,
            message: self.message.clone(),
            stage: self.stage,
            sequence: self.sequence,
        }
    }

    /// Packet to resend for the current stage
    fn retransmission(&self, packet_id: u16) -> Packet {
        match self.stage {
            DeliveryStage::AwaitingPubComp => Packet::PubRel(packet_id),
            _ => {
                let mut publish = self.message.to_publish(Some(packet_id));
                publish.dup = true;
                Packet::Publish(publish)
            }
        }
    }
}

/// Outbound and inbound QoS handshake state of one session
pub struct DeliveryEngine {
    persistence: Arc<dyn Persistence>,
    policy: RetryPolicy,
    ids: PacketIdAllocator,
    outbound: BTreeMap<u16, InFlight>,
    inbound: HashSet<u16>,
    next_sequence: u64,
}

impl DeliveryEngine {
    pub fn new(persistence: Arc<dyn Persistence>, policy: RetryPolicy, max_inflight: usize) -> Self {
        Self {
            persistence,
            policy,
            ids: PacketIdAllocator::new(max_inflight),
            outbound: BTreeMap::new(),
            inbound: HashSet::new(),
            next_sequence: 0,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Number of outbound QoS 1/2 publishes awaiting acknowledgment
    pub fn in_flight(&self) -> usize {
        self.outbound.len()
    }

    pub fn is_idle(&self) -> bool {
        self.outbound.is_empty()
    }

    pub fn stage_of(&self, packet_id: u16) -> Option<DeliveryStage> {
        self.outbound.get(&packet_id).map(|entry| entry.stage)
    }

    /// Inbound QoS 2 ids awaiting PUBREL
    pub fn pending_inbound(&self) -> usize {
        self.inbound.len()
    }

    /// Packet id for a SUBSCRIBE or UNSUBSCRIBE
    pub fn allocate_id(&mut self) -> MqttResult<u16> {
        self.ids.allocate()
    }

    pub fn release_id(&mut self, packet_id: u16) {
        self.ids.release(packet_id);
    }

    /// Start delivering `message`. Returns the packet id used (QoS 1/2).
    pub fn publish(
        &mut self,
        token: TokenId,
        message: Message,
        now: Instant,
    ) -> MqttResult<(Option<u16>, Vec<DeliveryAction>)> {
        if message.qos == QoS::AtMostOnce {
            metrics().mqtt_message_published();
            let packet = Packet::Publish(message.to_publish(None));
            return Ok((
                None,
                vec![DeliveryAction::Send(packet), DeliveryAction::Complete(token)],
            ));
        }

        let packet_id = self.ids.allocate()?;
        let stage = match message.qos {
            QoS::AtLeastOnce => DeliveryStage::AwaitingPubAck,
            _ => DeliveryStage::AwaitingPubRec,
        };
        let entry = InFlight {
            token,
            message,
            stage,
            retries: 0,
            deadline: now + self.policy.interval(0),
            sequence: self.next_sequence,
            published_at: now,
        };

        if let Err(e) = self
            .persistence
            .store(PersistenceKey::outbound(packet_id), &entry.record(packet_id))
        {
            self.ids.release(packet_id);
            return Err(e);
        }
        self.next_sequence += 1;
        metrics().mqtt_message_published();

        let packet = Packet::Publish(entry.message.to_publish(Some(packet_id)));
        debug!(packet_id, token, qos = %entry.message.qos, "Publish in flight");
        self.outbound.insert(packet_id, entry);
        Ok((Some(packet_id), vec![DeliveryAction::Send(packet)]))
    }

    pub fn on_puback(&mut self, packet_id: u16) -> Vec<DeliveryAction> {
        match self.outbound.get(&packet_id).map(|entry| entry.stage) {
            Some(DeliveryStage::AwaitingPubAck) => self.finish(packet_id, Instant::now()),
            stage => self.discard_ack("PUBACK", packet_id, stage),
        }
    }

    pub fn on_pubrec(&mut self, packet_id: u16, now: Instant) -> Vec<DeliveryAction> {
        let Some(entry) = self.outbound.get_mut(&packet_id) else {
            return self.discard_ack("PUBREC", packet_id, None);
        };

        match entry.stage {
            DeliveryStage::AwaitingPubRec => {
                entry.stage = DeliveryStage::AwaitingPubComp;
                entry.retries = 0;
                entry.deadline = now + self.policy.interval(0);
                let record = entry.record(packet_id);
                if let Err(e) = self
                    .persistence
                    .store(PersistenceKey::outbound(packet_id), &record)
                {
                    error!(packet_id, error = %e, "Failed to persist PUBREL stage");
                }
                vec![DeliveryAction::Send(Packet::PubRel(packet_id))]
            }
            // Broker did not see our PUBREL, repeat it
            DeliveryStage::AwaitingPubComp => {
                vec![DeliveryAction::Send(Packet::PubRel(packet_id))]
            }
            stage => self.discard_ack("PUBREC", packet_id, Some(stage)),
        }
    }

    pub fn on_pubcomp(&mut self, packet_id: u16) -> Vec<DeliveryAction> {
        match self.outbound.get(&packet_id).map(|entry| entry.stage) {
            Some(DeliveryStage::AwaitingPubComp) => self.finish(packet_id, Instant::now()),
            stage => self.discard_ack("PUBCOMP", packet_id, stage),
        }
    }

    fn discard_ack(
        &self,
        kind: &str,
        packet_id: u16,
        stage: Option<DeliveryStage>,
    ) -> Vec<DeliveryAction> {
        metrics().mqtt_ack_discarded();
        warn!(packet_id, ack = kind, ?stage, "Discarding acknowledgment with no matching handshake");
        Vec::new()
    }

    fn finish(&mut self, packet_id: u16, now: Instant) -> Vec<DeliveryAction> {
        let Some(entry) = self.purge(packet_id) else {
            return Vec::new();
        };
        metrics().mqtt_delivery_completed(now.saturating_duration_since(entry.published_at));
        debug!(packet_id, token = entry.token, "Delivery complete");
        vec![DeliveryAction::Complete(entry.token)]
    }

    fn purge(&mut self, packet_id: u16) -> Option<InFlight> {
        let entry = self.outbound.remove(&packet_id)?;
        if let Err(e) = self.persistence.remove(PersistenceKey::outbound(packet_id)) {
            error!(packet_id, error = %e, "Failed to purge persisted packet");
        }
        self.ids.release(packet_id);
        Some(entry)
    }

    /// Handle an inbound PUBLISH
    pub fn on_publish(&mut self, publish: &Publish) -> MqttResult<Vec<DeliveryAction>> {
        let message = Message::from(publish);

        let packet_id = match (publish.qos, publish.packet_id) {
            (QoS::AtMostOnce, _) => {
                metrics().mqtt_message_received();
                return Ok(vec![DeliveryAction::Deliver(message)]);
            }
            (_, Some(id)) if id != 0 => id,
            _ => {
                return Err(MqttError::protocol_violation(format!(
                    "QoS {} PUBLISH on '{}' without packet id",
                    publish.qos, publish.topic
                )))
            }
        };

        if publish.qos == QoS::AtLeastOnce {
            metrics().mqtt_message_received();
            return Ok(vec![
                DeliveryAction::Deliver(message),
                DeliveryAction::Send(Packet::PubAck(packet_id)),
            ]);
        }

        if self.inbound.contains(&packet_id) {
            metrics().mqtt_duplicate_suppressed();
            debug!(packet_id, "Duplicate QoS 2 publish, acknowledging without redelivery");
            return Ok(vec![DeliveryAction::Send(Packet::PubRec(packet_id))]);
        }

        let record = PersistedPacket {
            packet_id,
            message: message.clone(),
            stage: DeliveryStage::AwaitingPubRel,
            sequence: self.next_sequence,
        };
        self.persistence
            .store(PersistenceKey::inbound(packet_id), &record)?;
        self.next_sequence += 1;
        self.inbound.insert(packet_id);
        metrics().mqtt_message_received();

        Ok(vec![
            DeliveryAction::Deliver(message),
            DeliveryAction::Send(Packet::PubRec(packet_id)),
        ])
    }

    /// Handle an inbound PUBREL: release the id and always answer PUBCOMP
    pub fn on_pubrel(&mut self, packet_id: u16) -> Vec<DeliveryAction> {
        if self.inbound.remove(&packet_id) {
            if let Err(e) = self.persistence.remove(PersistenceKey::inbound(packet_id)) {
                error!(packet_id, error = %e, "Failed to purge inbound record");
            }
        } else {
            debug!(packet_id, "PUBREL for unknown packet id, completing anyway");
        }
        vec![DeliveryAction::Send(Packet::PubComp(packet_id))]
    }

    /// Advance retransmission timers.
    ///
    /// Timers run whether or not a connection is up; resends only happen while
    /// connected, but exhaustion is enforced either way.
    pub fn tick(&mut self, now: Instant, connected: bool) -> Vec<DeliveryAction> {
        let expired: Vec<u16> = self
            .outbound
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        let mut actions = Vec::new();
        for packet_id in expired {
            let Some(entry) = self.outbound.get_mut(&packet_id) else {
                continue;
            };

            if entry.retries >= self.policy.max_retries {
                let attempts = entry.retries + 1;
                if let Some(entry) = self.purge(packet_id) {
                    metrics().mqtt_delivery_timeout();
                    warn!(packet_id, attempts, token = entry.token, "Delivery abandoned");
                    actions.push(DeliveryAction::Fail(
                        entry.token,
                        MqttError::DeliveryTimeout {
                            packet_id,
                            attempts,
                        },
                    ));
                }
                continue;
            }

            entry.retries += 1;
            entry.deadline = now + self.policy.interval(entry.retries);
            if connected {
                metrics().mqtt_retransmission();
                debug!(packet_id, retry = entry.retries, stage = ?entry.stage, "Retransmitting");
                actions.push(DeliveryAction::Send(entry.retransmission(packet_id)));
            }
        }
        actions
    }

    /// Earliest retransmission deadline, if anything is in flight
    pub fn next_deadline(&self) -> Option<Instant> {
        self.outbound.values().map(|entry| entry.deadline).min()
    }

    /// Resend every in-flight packet in original publish order after a
    /// persistent-session reconnect. Attempt counters start over.
    pub fn replay(&mut self, now: Instant) -> Vec<DeliveryAction> {
        let mut entries: Vec<(&u16, &mut InFlight)> = self.outbound.iter_mut().collect();
        entries.sort_by_key(|(_, entry)| entry.sequence);

        let deadline = now + self.policy.interval(0);
        entries
            .into_iter()
            .map(|(packet_id, entry)| {
                entry.retries = 0;
                entry.deadline = deadline;
                debug!(packet_id, stage = ?entry.stage, "Replaying in-flight packet");
                DeliveryAction::Send(entry.retransmission(*packet_id))
            })
            .collect()
    }

    /// Load records left in the store by an earlier connection or client.
    ///
    /// `register` creates the token for each restored outbound publish.
    /// Records already tracked are left alone. Returns how many outbound
    /// publishes were restored.
    pub fn restore<F>(&mut self, now: Instant, mut register: F) -> MqttResult<usize>
    where
        F: FnMut(u16, &Message) -> TokenId,
    {
        let mut keys: Vec<PersistenceKey> = self.persistence.all_keys()?.into_iter().collect();
        keys.sort();

        let mut restored = 0;
        for key in keys {
            match key.direction {
                Direction::Inbound => {
                    self.inbound.insert(key.packet_id);
                }
                Direction::Outbound => {
                    if self.outbound.contains_key(&key.packet_id) {
                        continue;
                    }
                    let Some(record) = self.persistence.retrieve(key)? else {
                        continue;
                    };
                    if !self.ids.reserve(key.packet_id) {
                        warn!(packet_id = key.packet_id, "Persisted packet id already in use, skipping");
                        continue;
                    }
                    let token = register(key.packet_id, &record.message);
                    self.next_sequence = self.next_sequence.max(record.sequence + 1);
                    self.outbound.insert(
                        key.packet_id,
                        InFlight {
                            token,
                            message: record.message,
                            stage: record.stage,
                            retries: 0,
                            deadline: now + self.policy.interval(0),
                            sequence: record.sequence,
                            published_at: now,
                        },
                    );
                    restored += 1;
                }
            }
        }

        if restored > 0 {
            debug!(restored, "Restored in-flight publishes from persistence");
        }
        Ok(restored)
    }

    /// Drop every inbound QoS 2 record. Called when the broker resumed no
    /// session, so no PUBREL will arrive for them and their ids may be reused.
    pub fn clear_inbound(&mut self) {
        let keys = match self.persistence.all_keys() {
            Ok(keys) => keys,
            Err(e) => {
                error!(error = %e, "Failed to list persisted records");
                HashSet::new()
            }
        };
        for key in keys
            .into_iter()
            .filter(|key| key.direction == Direction::Inbound)
        {
            if let Err(e) = self.persistence.remove(key) {
                error!(packet_id = key.packet_id, error = %e, "Failed to purge inbound record");
            }
        }
        if !self.inbound.is_empty() {
            debug!(count = self.inbound.len(), "Discarding inbound QoS 2 state of the previous session");
        }
        self.inbound.clear();
    }

    /// Forget the whole session: returns the tokens of abandoned publishes
    pub fn clear_session(&mut self) -> Vec<TokenId> {
        let ids: Vec<u16> = self.outbound.keys().copied().collect();
        let mut tokens = Vec::with_capacity(ids.len());
        for packet_id in ids {
            if let Some(entry) = self.outbound.remove(&packet_id) {
                self.ids.release(packet_id);
                tokens.push(entry.token);
            }
        }
        self.inbound.clear();
        self.next_sequence = 0;
        if let Err(e) = self.persistence.clear() {
            error!(error = %e, "Failed to clear persistence store");
        }
        tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryPersistence;

    fn engine_with(policy: RetryPolicy, max_inflight: usize) -> (DeliveryEngine, Arc<MemoryPersistence>) {
        let store = Arc::new(MemoryPersistence::new());
        (DeliveryEngine::new(store.clone(), policy, max_inflight), store)
    }

    fn engine() -> (DeliveryEngine, Arc<MemoryPersistence>) {
        engine_with(RetryPolicy::default(), 100)
    }

    fn sent(actions: &[DeliveryAction]) -> Vec<Packet> {
        actions
            .iter()
            .filter_map(|action| match action {
                DeliveryAction::Send(packet) => Some(packet.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_packet_ids_skip_zero_and_wrap() {
        let mut ids = PacketIdAllocator::new(usize::from(u16::MAX));
        ids.next_id = u16::MAX;
        assert_eq!(ids.allocate().unwrap(), u16::MAX);
        assert_eq!(ids.allocate().unwrap(), 1);
        assert!(!ids.reserve(0));
    }

    #[test]
    fn test_packet_ids_are_unique_while_in_use() {
        let mut ids = PacketIdAllocator::new(3);
        let a = ids.allocate().unwrap();
        let b = ids.allocate().unwrap();
        let c = ids.allocate().unwrap();
        assert!(a != b && b != c && a != c);
        assert!(matches!(
            ids.allocate(),
            Err(MqttError::NoPacketIdAvailable { max_inflight: 3 })
        ));

        ids.release(b);
        let d = ids.allocate().unwrap();
        assert!(d != a && d != c);
    }

    #[test]
    fn test_retry_interval_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.interval(0), Duration::from_secs(10));
        assert_eq!(policy.interval(1), Duration::from_secs(20));
        assert_eq!(policy.interval(2), Duration::from_secs(40));
        assert_eq!(policy.interval(3), Duration::from_secs(60));
        assert_eq!(policy.interval(40), Duration::from_secs(60));
    }

    #[test]
    fn test_qos0_completes_immediately() {
        let (mut engine, store) = engine();
        let (packet_id, actions) = engine
            .publish(1, Message::new("a", "x", QoS::AtMostOnce), Instant::now())
            .unwrap();

        assert_eq!(packet_id, None);
        assert!(matches!(actions[0], DeliveryAction::Send(Packet::Publish(_))));
        assert_eq!(actions[1], DeliveryAction::Complete(1));
        assert!(store.is_empty());
        assert!(engine.is_idle());
    }

    #[test]
    fn test_qos1_flow_persists_until_puback() {
        let (mut engine, store) = engine();
        let (packet_id, actions) = engine
            .publish(7, Message::new("a", "x", QoS::AtLeastOnce), Instant::now())
            .unwrap();
        let packet_id = packet_id.unwrap();

        assert_eq!(sent(&actions).len(), 1);
        assert!(store
            .retrieve(PersistenceKey::outbound(packet_id))
            .unwrap()
            .is_some());

        assert_eq!(engine.on_puback(packet_id), vec![DeliveryAction::Complete(7)]);
        assert!(store.is_empty());
        assert!(engine.is_idle());

        // A second PUBACK is discarded
        assert!(engine.on_puback(packet_id).is_empty());
    }

    #[test]
    fn test_qos2_flow_records_stage() {
        let (mut engine, store) = engine();
        let now = Instant::now();
        let (packet_id, _) = engine
            .publish(3, Message::new("a", "x", QoS::ExactlyOnce), now)
            .unwrap();
        let packet_id = packet_id.unwrap();

        // PUBCOMP before PUBREC is out of order
        assert!(engine.on_pubcomp(packet_id).is_empty());

        let actions = engine.on_pubrec(packet_id, now);
        assert_eq!(sent(&actions), vec![Packet::PubRel(packet_id)]);
        assert_eq!(engine.stage_of(packet_id), Some(DeliveryStage::AwaitingPubComp));
        assert_eq!(
            store
                .retrieve(PersistenceKey::outbound(packet_id))
                .unwrap()
                .unwrap()
                .stage,
            DeliveryStage::AwaitingPubComp
        );

        // Duplicate PUBREC repeats PUBREL
        assert_eq!(
            sent(&engine.on_pubrec(packet_id, now)),
            vec![Packet::PubRel(packet_id)]
        );

        assert_eq!(engine.on_pubcomp(packet_id), vec![DeliveryAction::Complete(3)]);
        assert!(store.is_empty());
    }

    #[test]
    fn test_inbound_qos2_delivered_once() {
        let (mut engine, store) = engine();
        let publish = Publish {
            topic: "in".into(),
            payload: b"p".to_vec(),
            qos: QoS::ExactlyOnce,
            retain: false,
            dup: false,
            packet_id: Some(12),
        };

        let first = engine.on_publish(&publish).unwrap();
        assert!(matches!(first[0], DeliveryAction::Deliver(_)));
        assert_eq!(sent(&first), vec![Packet::PubRec(12)]);
        assert_eq!(store.len(), 1);

        let mut duplicate = publish.clone();
        duplicate.dup = true;
        let second = engine.on_publish(&duplicate).unwrap();
        assert_eq!(second, vec![DeliveryAction::Send(Packet::PubRec(12))]);

        assert_eq!(sent(&engine.on_pubrel(12)), vec![Packet::PubComp(12)]);
        assert!(store.is_empty());
        assert_eq!(engine.pending_inbound(), 0);

        // Unknown PUBREL still gets PUBCOMP
        assert_eq!(sent(&engine.on_pubrel(99)), vec![Packet::PubComp(99)]);
    }

    #[test]
    fn test_inbound_qos1_acks_after_delivery() {
        let (mut engine, _) = engine();
        let publish = Publish {
            topic: "in".into(),
            payload: vec![],
            qos: QoS::AtLeastOnce,
            retain: true,
            dup: false,
            packet_id: Some(4),
        };
        let actions = engine.on_publish(&publish).unwrap();
        assert!(matches!(&actions[0], DeliveryAction::Deliver(m) if m.retained));
        assert_eq!(actions[1], DeliveryAction::Send(Packet::PubAck(4)));
    }

    #[test]
    fn test_inbound_publish_without_id_is_violation() {
        let (mut engine, _) = engine();
        let publish = Publish {
            topic: "in".into(),
            payload: vec![],
            qos: QoS::AtLeastOnce,
            retain: false,
            dup: false,
            packet_id: None,
        };
        assert!(matches!(
            engine.on_publish(&publish),
            Err(MqttError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_retransmit_then_timeout() {
        let policy = RetryPolicy {
            ack_timeout: Duration::from_millis(100),
            max_retry_interval: Duration::from_millis(300),
            max_retries: 2,
        };
        let (mut engine, store) = engine_with(policy, 10);
        let start = Instant::now();
        let (packet_id, _) = engine
            .publish(5, Message::new("a", "x", QoS::AtLeastOnce), start)
            .unwrap();
        let packet_id = packet_id.unwrap();

        assert!(engine.tick(start + Duration::from_millis(50), true).is_empty());

        let first = engine.tick(start + Duration::from_millis(100), true);
        match &first[..] {
            [DeliveryAction::Send(Packet::Publish(p))] => {
                assert!(p.dup);
                assert_eq!(p.packet_id, Some(packet_id));
            }
            other => panic!("expected retransmission, got {other:?}"),
        }

        // Second resend after a doubled interval
        assert!(engine.tick(start + Duration::from_millis(250), true).is_empty());
        assert_eq!(sent(&engine.tick(start + Duration::from_millis(300), true)).len(), 1);

        // Retries exhausted: the token fails and the record is purged
        let last = engine.tick(start + Duration::from_millis(600), true);
        assert_eq!(
            last,
            vec![DeliveryAction::Fail(
                5,
                MqttError::DeliveryTimeout {
                    packet_id,
                    attempts: 3
                }
            )]
        );
        assert!(store.is_empty());
        assert!(engine.is_idle());
    }

    #[test]
    fn test_timers_run_while_disconnected_without_sending() {
        let policy = RetryPolicy {
            ack_timeout: Duration::from_millis(10),
            max_retry_interval: Duration::from_millis(10),
            max_retries: 1,
        };
        let (mut engine, _) = engine_with(policy, 10);
        let start = Instant::now();
        engine
            .publish(1, Message::new("a", "x", QoS::ExactlyOnce), start)
            .unwrap();

        assert!(engine.tick(start + Duration::from_millis(10), false).is_empty());
        let actions = engine.tick(start + Duration::from_millis(20), false);
        assert!(matches!(actions[..], [DeliveryAction::Fail(1, _)]));
    }

    #[test]
    fn test_replay_in_sequence_order_with_stage() {
        let (mut engine, _) = engine();
        let now = Instant::now();
        let (first, _) = engine
            .publish(1, Message::new("a", "1", QoS::ExactlyOnce), now)
            .unwrap();
        let (second, _) = engine
            .publish(2, Message::new("b", "2", QoS::AtLeastOnce), now)
            .unwrap();
        engine.on_pubrec(first.unwrap(), now);

        let replayed = sent(&engine.replay(now));
        assert_eq!(replayed[0], Packet::PubRel(first.unwrap()));
        match &replayed[1] {
            Packet::Publish(p) => {
                assert!(p.dup);
                assert_eq!(p.packet_id, second);
            }
            other => panic!("unexpected {other}"),
        }
    }

    #[test]
    fn test_restore_from_shared_store() {
        let store = Arc::new(MemoryPersistence::new());
        let now = Instant::now();
        {
            let mut previous = DeliveryEngine::new(store.clone(), RetryPolicy::default(), 10);
            previous
                .publish(1, Message::new("a", "1", QoS::AtLeastOnce), now)
                .unwrap();
            previous
                .publish(2, Message::new("b", "2", QoS::ExactlyOnce), now)
                .unwrap();
        }

        let mut engine = DeliveryEngine::new(store.clone(), RetryPolicy::default(), 10);
        let mut registered = Vec::new();
        let restored = engine
            .restore(now, |packet_id, message| {
                registered.push((packet_id, message.topic.clone()));
                100 + u64::from(packet_id)
            })
            .unwrap();

        assert_eq!(restored, 2);
        assert_eq!(registered, vec![(1, "a".to_string()), (2, "b".to_string())]);
        assert_eq!(engine.in_flight(), 2);

        // Restored ids are reserved
        let next = engine.allocate_id().unwrap();
        assert!(next != 1 && next != 2);

        // Restoring again does not duplicate
        assert_eq!(engine.restore(now, |_, _| 0).unwrap(), 0);

        assert_eq!(engine.on_puback(1), vec![DeliveryAction::Complete(101)]);
    }

    #[test]
    fn test_clear_session_returns_abandoned_tokens() {
        let (mut engine, store) = engine();
        let now = Instant::now();
        engine
            .publish(8, Message::new("a", "1", QoS::AtLeastOnce), now)
            .unwrap();
        engine
            .publish(9, Message::new("a", "2", QoS::ExactlyOnce), now)
            .unwrap();

        let abandoned = engine.clear_session();
        assert_eq!(abandoned, vec![8, 9]);
        assert!(engine.is_idle());
        assert!(store.is_empty());
    }

    #[test]
    fn test_clear_inbound_keeps_outbound_records() {
        let (mut engine, store) = engine();
        let now = Instant::now();
        let (outbound_id, _) = engine
            .publish(4, Message::new("out", "1", QoS::AtLeastOnce), now)
            .unwrap();
        let inbound = Publish {
            topic: "in".into(),
            payload: b"first".to_vec(),
            qos: QoS::ExactlyOnce,
            retain: false,
            dup: false,
            packet_id: Some(7),
        };
        engine.on_publish(&inbound).unwrap();
        assert_eq!(store.len(), 2);

        engine.clear_inbound();

        assert_eq!(engine.pending_inbound(), 0);
        let keys = store.all_keys().unwrap();
        assert_eq!(keys.len(), 1);
        assert!(keys.contains(&PersistenceKey::outbound(outbound_id.unwrap())));

        // The reused id is a new message now
        let fresh = Publish {
            payload: b"second".to_vec(),
            ..inbound
        };
        let actions = engine.on_publish(&fresh).unwrap();
        assert!(matches!(&actions[0], DeliveryAction::Deliver(m) if m.payload == b"second"));
    }

    #[test]
    fn test_failed_persist_releases_id() {
        struct Broken;
        impl Persistence for Broken {
            fn store(&self, _: PersistenceKey, _: &PersistedPacket) -> MqttResult<()> {
                Err(MqttError::persistence("disk full"))
            }
            fn retrieve(&self, _: PersistenceKey) -> MqttResult<Option<PersistedPacket>> {
                Ok(None)
            }
            fn remove(&self, _: PersistenceKey) -> MqttResult<()> {
                Ok(())
            }
            fn all_keys(&self) -> MqttResult<HashSet<PersistenceKey>> {
                Ok(HashSet::new())
            }
            fn clear(&self) -> MqttResult<()> {
                Ok(())
            }
        }

        let mut engine = DeliveryEngine::new(Arc::new(Broken), RetryPolicy::default(), 1);
        let result = engine.publish(1, Message::new("a", "x", QoS::AtLeastOnce), Instant::now());
        assert!(matches!(result, Err(MqttError::Persistence(_))));
        // The single id was given back
        assert!(engine.allocate_id().is_ok());
    }
}
