//! In-process MQTT broker for tests
//!
//! [`MockBroker`] implements [`Connector`], so a client built on it talks to
//! the broker through the same engine, reader and writer tasks it would use
//! over TCP. Packets are handled synchronously inside the client's writer
//! task, which keeps every exchange deterministic.
//!
//! The broker keeps sessions, routes publishes with QoS downgrade, stores
//! retained messages, answers every QoS handshake and publishes wills on
//! ungraceful disconnects. Faults can be injected to exercise error paths:
//! refused or failed connects, lost acknowledgments, muted pings, rejected
//! filters and dropped connections.

use crate::error::{MqttError, MqttResult};
use crate::protocol::{
    topic_matches, ConnAck, Connect, ConnectReturnCode, Message, Packet, Publish, QoS, SubAck,
    SubscribeReturnCode,
};
use crate::transport::{Connection, Connector, PacketSink, PacketSource};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace};

type ConnectionId = u64;

#[derive(Debug, Default)]
struct Session {
    subscriptions: BTreeMap<String, QoS>,
    /// QoS 2 publishes from the client awaiting PUBREL
    awaiting_rel: HashSet<u16>,
    /// QoS 2 publishes to the client released but not yet completed
    awaiting_comp: BTreeSet<u16>,
    next_packet_id: u16,
}

impl Session {
    fn next_packet_id(&mut self) -> u16 {
        self.next_packet_id = self.next_packet_id.checked_add(1).unwrap_or(1);
        self.next_packet_id
    }
}

struct Link {
    client_id: Option<String>,
    tx: mpsc::UnboundedSender<Packet>,
    clean_session: bool,
    will: Option<Message>,
}

#[derive(Debug, Default)]
struct Faults {
    refuse: Option<ConnectReturnCode>,
    fail_connect: bool,
    drop_acks: usize,
    drop_kinds: Vec<&'static str>,
    mute_pings: bool,
    reject_filters: HashSet<String>,
}

#[derive(Default)]
struct BrokerState {
    next_link: ConnectionId,
    links: HashMap<ConnectionId, Link>,
    sessions: HashMap<String, Session>,
    retained: BTreeMap<String, Message>,
    received: Vec<(String, Packet)>,
    sent: Vec<(String, Packet)>,
    faults: Faults,
}

impl BrokerState {
    fn link_name(&self, link: ConnectionId) -> String {
        self.links
            .get(&link)
            .and_then(|l| l.client_id.clone())
            .unwrap_or_else(|| format!("link-{link}"))
    }

    fn link_for(&self, client_id: &str) -> Option<ConnectionId> {
        self.links
            .iter()
            .find(|(_, l)| l.client_id.as_deref() == Some(client_id))
            .map(|(id, _)| *id)
    }

    fn send_to(&mut self, link: ConnectionId, packet: Packet) {
        let name = self.link_name(link);
        if let Some(l) = self.links.get(&link) {
            trace!(client_id = %name, packet = %packet, "Broker sending");
            if l.tx.send(packet.clone()).is_ok() {
                self.sent.push((name, packet));
            }
        }
    }

    /// Send an acknowledgment unless an injected fault swallows it
    fn ack(&mut self, link: ConnectionId, packet: Packet) {
        if let Some(index) = self
            .faults
            .drop_kinds
            .iter()
            .position(|kind| *kind == packet.name())
        {
            self.faults.drop_kinds.remove(index);
            debug!(packet = %packet, "Broker dropping acknowledgment");
            return;
        }
        if self.faults.drop_acks > 0 {
            self.faults.drop_acks -= 1;
            debug!(packet = %packet, "Broker dropping acknowledgment");
            return;
        }
        self.send_to(link, packet);
    }

    fn session_mut(&mut self, link: ConnectionId) -> Option<&mut Session> {
        let client_id = self.links.get(&link)?.client_id.clone()?;
        self.sessions.get_mut(&client_id)
    }

    fn handle(&mut self, link: ConnectionId, packet: Packet) -> MqttResult<()> {
        let name = self.link_name(link);
        self.received.push((name, packet.clone()));

        match packet {
            Packet::Connect(connect) => self.on_connect(link, connect),
            Packet::Publish(publish) => self.on_publish(link, publish),
            Packet::PubRel(packet_id) => {
                if let Some(session) = self.session_mut(link) {
                    session.awaiting_rel.remove(&packet_id);
                }
                self.ack(link, Packet::PubComp(packet_id));
            }
            Packet::PubRec(packet_id) => {
                if let Some(session) = self.session_mut(link) {
                    session.awaiting_comp.insert(packet_id);
                }
                self.ack(link, Packet::PubRel(packet_id));
            }
            Packet::PubComp(packet_id) => {
                if let Some(session) = self.session_mut(link) {
                    session.awaiting_comp.remove(&packet_id);
                }
            }
            Packet::PubAck(_) => {}
            Packet::Subscribe(subscribe) => {
                let mut return_codes = Vec::with_capacity(subscribe.filters.len());
                let mut granted = Vec::new();
                for (filter, qos) in subscribe.filters {
                    if self.faults.reject_filters.contains(&filter) {
                        return_codes.push(SubscribeReturnCode::Failure);
                        continue;
                    }
                    if let Some(session) = self.session_mut(link) {
                        session.subscriptions.insert(filter.clone(), qos);
                    }
                    return_codes.push(SubscribeReturnCode::Success(qos));
                    granted.push((filter, qos));
                }
                self.send_to(
                    link,
                    Packet::SubAck(SubAck {
                        packet_id: subscribe.packet_id,
                        return_codes,
                    }),
                );
                for (filter, qos) in granted {
                    self.send_retained(link, &filter, qos);
                }
            }
            Packet::Unsubscribe(unsubscribe) => {
                if let Some(session) = self.session_mut(link) {
                    for filter in &unsubscribe.filters {
                        session.subscriptions.remove(filter);
                    }
                }
                self.send_to(link, Packet::UnsubAck(unsubscribe.packet_id));
            }
            Packet::PingReq => {
                if !self.faults.mute_pings {
                    self.send_to(link, Packet::PingResp);
                }
            }
            Packet::Disconnect => self.close_link(link, true),
            other => {
                return Err(MqttError::protocol_violation(format!(
                    "client sent {other} to broker"
                )))
            }
        }
        Ok(())
    }

    fn on_connect(&mut self, link: ConnectionId, connect: Connect) {
        if let Some(code) = self.faults.refuse {
            self.send_to(
                link,
                Packet::ConnAck(ConnAck {
                    session_present: false,
                    code,
                }),
            );
            return;
        }

        // Session takeover
        if let Some(previous) = self.link_for(&connect.client_id) {
            debug!(client_id = %connect.client_id, "Taking over existing connection");
            self.links.remove(&previous);
        }

        let session_present = if connect.clean_session {
            self.sessions.remove(&connect.client_id);
            self.sessions
                .insert(connect.client_id.clone(), Session::default());
            false
        } else {
            let present = self.sessions.contains_key(&connect.client_id);
            self.sessions.entry(connect.client_id.clone()).or_default();
            present
        };

        if let Some(l) = self.links.get_mut(&link) {
            l.client_id = Some(connect.client_id.clone());
            l.clean_session = connect.clean_session;
            l.will = connect.will;
        }
        self.send_to(
            link,
            Packet::ConnAck(ConnAck {
                session_present,
                code: ConnectReturnCode::Accepted,
            }),
        );

        // A resumed session finishes the QoS 2 releases the last link cut off
        let pending: Vec<u16> = self
            .sessions
            .get(&connect.client_id)
            .map(|session| session.awaiting_comp.iter().copied().collect())
            .unwrap_or_default();
        for packet_id in pending {
            self.send_to(link, Packet::PubRel(packet_id));
        }
    }

    fn on_publish(&mut self, link: ConnectionId, publish: Publish) {
        match (publish.qos, publish.packet_id) {
            (QoS::AtMostOnce, _) => self.route(Message::from(&publish)),
            (QoS::AtLeastOnce, Some(packet_id)) => {
                self.route(Message::from(&publish));
                self.ack(link, Packet::PubAck(packet_id));
            }
            (QoS::ExactlyOnce, Some(packet_id)) => {
                let first = self
                    .session_mut(link)
                    .map(|session| session.awaiting_rel.insert(packet_id))
                    .unwrap_or(true);
                if first {
                    self.route(Message::from(&publish));
                } else {
                    debug!(packet_id, "Broker suppressing duplicate QoS 2 publish");
                }
                self.ack(link, Packet::PubRec(packet_id));
            }
            _ => debug!(topic = %publish.topic, "Ignoring publish without packet id"),
        }
    }

    /// Store a retained message and forward to every matching subscriber
    fn route(&mut self, message: Message) {
        if message.retained {
            if message.payload.is_empty() {
                self.retained.remove(&message.topic);
            } else {
                let mut stored = message.clone();
                stored.duplicate = false;
                self.retained.insert(message.topic.clone(), stored);
            }
        }

        let mut targets = Vec::new();
        for (id, l) in &self.links {
            let Some(client_id) = &l.client_id else {
                continue;
            };
            let Some(session) = self.sessions.get(client_id) else {
                continue;
            };
            let granted = session
                .subscriptions
                .iter()
                .filter(|(filter, _)| topic_matches(filter, &message.topic))
                .map(|(_, qos)| *qos)
                .max();
            if let Some(granted) = granted {
                targets.push((*id, granted));
            }
        }
        targets.sort_by_key(|(id, _)| *id);

        for (id, granted) in targets {
            let mut outgoing = message.clone();
            outgoing.qos = outgoing.qos.min(granted);
            outgoing.retained = false;
            outgoing.duplicate = false;
            self.deliver(id, outgoing);
        }
    }

    fn send_retained(&mut self, link: ConnectionId, filter: &str, granted: QoS) {
        let matching: Vec<Message> = self
            .retained
            .values()
            .filter(|message| topic_matches(filter, &message.topic))
            .cloned()
            .collect();
        for mut message in matching {
            message.qos = message.qos.min(granted);
            message.retained = true;
            self.deliver(link, message);
        }
    }

    fn deliver(&mut self, link: ConnectionId, message: Message) {
        let packet_id = match message.qos {
            QoS::AtMostOnce => None,
            _ => match self.session_mut(link) {
                Some(session) => Some(session.next_packet_id()),
                None => return,
            },
        };
        self.send_to(link, Packet::Publish(message.to_publish(packet_id)));
    }

    fn close_link(&mut self, link: ConnectionId, graceful: bool) {
        let Some(l) = self.links.remove(&link) else {
            return;
        };
        let Some(client_id) = l.client_id else {
            return;
        };
        debug!(client_id = %client_id, graceful, "Broker closing connection");
        if l.clean_session {
            self.sessions.remove(&client_id);
        }
        if !graceful {
            if let Some(will) = l.will {
                self.route(will);
            }
        }
    }
}

/// Shared handle to an in-process broker
#[derive(Clone, Default)]
pub struct MockBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Close the client's connection as if the network failed. The will, if
    /// any, is published. Returns false if the client is not connected.
    pub fn drop_connection(&self, client_id: &str) -> bool {
        let mut state = self.lock();
        match state.link_for(client_id) {
            Some(link) => {
                state.close_link(link, false);
                true
            }
            None => false,
        }
    }

    /// Answer every CONNECT with `code`; `None` restores normal behavior
    pub fn refuse_connections(&self, code: Option<ConnectReturnCode>) {
        self.lock().faults.refuse = code;
    }

    /// Make transport-level connects fail
    pub fn fail_connections(&self, fail: bool) {
        self.lock().faults.fail_connect = fail;
    }

    /// Swallow the next `count` PUBACK, PUBREC, PUBREL or PUBCOMP the broker would send
    pub fn drop_next_acks(&self, count: usize) {
        self.lock().faults.drop_acks = count;
    }

    /// Swallow the next acknowledgment of one kind, such as `"PUBCOMP"`,
    /// letting the others through
    pub fn drop_next_ack_of(&self, kind: &'static str) {
        self.lock().faults.drop_kinds.push(kind);
    }

    /// Stop answering PINGREQ
    pub fn mute_pings(&self, mute: bool) {
        self.lock().faults.mute_pings = mute;
    }

    /// Reject future subscriptions to `filter` with a SUBACK failure code
    pub fn reject_filter(&self, filter: impl Into<String>) {
        self.lock().faults.reject_filters.insert(filter.into());
    }

    /// Send a raw packet to a connected client
    pub fn inject(&self, client_id: &str, packet: Packet) -> bool {
        let mut state = self.lock();
        match state.link_for(client_id) {
            Some(link) => {
                state.send_to(link, packet);
                true
            }
            None => false,
        }
    }

    /// Packets received from `client_id`, oldest first
    pub fn received_packets(&self, client_id: &str) -> Vec<Packet> {
        self.lock()
            .received
            .iter()
            .filter(|(name, _)| name == client_id)
            .map(|(_, packet)| packet.clone())
            .collect()
    }

    /// Packets sent to `client_id`, oldest first
    pub fn sent_packets(&self, client_id: &str) -> Vec<Packet> {
        self.lock()
            .sent
            .iter()
            .filter(|(name, _)| name == client_id)
            .map(|(_, packet)| packet.clone())
            .collect()
    }

    pub fn clear_log(&self) {
        let mut state = self.lock();
        state.received.clear();
        state.sent.clear();
    }

    pub fn retained(&self, topic: &str) -> Option<Message> {
        self.lock().retained.get(topic).cloned()
    }

    pub fn session_subscriptions(&self, client_id: &str) -> Option<BTreeMap<String, QoS>> {
        self.lock()
            .sessions
            .get(client_id)
            .map(|session| session.subscriptions.clone())
    }

    /// Forget the stored session of `client_id`, as a broker restart would
    pub fn discard_session(&self, client_id: &str) -> bool {
        self.lock().sessions.remove(client_id).is_some()
    }

    pub fn has_session(&self, client_id: &str) -> bool {
        self.lock().sessions.contains_key(client_id)
    }

    pub fn is_connected(&self, client_id: &str) -> bool {
        self.lock().link_for(client_id).is_some()
    }

    /// Number of connections that completed CONNECT
    pub fn connection_count(&self) -> usize {
        self.lock()
            .links
            .values()
            .filter(|l| l.client_id.is_some())
            .count()
    }

    /// Poll until `client_id` holds a connection
    pub async fn wait_for_connection(&self, client_id: &str, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.is_connected(client_id) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.is_connected(client_id)
    }
}

#[async_trait::async_trait]
impl Connector for MockBroker {
    async fn connect(&self) -> MqttResult<Connection> {
        let mut state = self.lock();
        if state.faults.fail_connect {
            return Err(MqttError::transport("mock broker unavailable"));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state.next_link += 1;
        let link = state.next_link;
        state.links.insert(
            link,
            Link {
                client_id: None,
                tx,
                clean_session: true,
                will: None,
            },
        );
        drop(state);

        let sink: Box<dyn PacketSink> = Box::new(MockSink {
            broker: self.clone(),
            link,
        });
        let source: Box<dyn PacketSource> = Box::new(MockSource { rx });
        Ok((sink, source))
    }

    fn server_uri(&self) -> String {
        "mock://broker".to_string()
    }
}

struct MockSink {
    broker: MockBroker,
    link: ConnectionId,
}

#[async_trait::async_trait]
impl PacketSink for MockSink {
    async fn send(&mut self, packet: Packet) -> MqttResult<()> {
        let mut state = self.broker.lock();
        if !state.links.contains_key(&self.link) {
            return Err(MqttError::transport("connection closed by broker"));
        }
        state.handle(self.link, packet)
    }

    async fn close(&mut self) -> MqttResult<()> {
        // No-op after a DISCONNECT already removed the link
        self.broker.lock().close_link(self.link, false);
        Ok(())
    }
}

struct MockSource {
    rx: mpsc::UnboundedReceiver<Packet>,
}

#[async_trait::async_trait]
impl PacketSource for MockSource {
    async fn recv(&mut self) -> MqttResult<Option<Packet>> {
        Ok(self.rx.recv().await)
    }
}
