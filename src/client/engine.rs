//! The engine task
//!
//! One tokio task owns every piece of protocol state of a client: the
//! connection state machine, the delivery engine, the subscription table, the
//! dispatcher and the reconnect controller. It reacts to three inputs:
//!
//! - commands from [`MqttClient`](crate::client::MqttClient) handles, each
//!   answered synchronously over a oneshot channel
//! - connection events from the per-connection reader and writer tasks, tagged
//!   with the connection epoch so events from a torn-down connection are ignored
//! - a periodic tick driving connect timeouts, keepalive, retransmission and
//!   reconnect scheduling
//!
//! Because nothing else touches this state, callbacks and listeners run one at
//! a time in packet order without any locking.

use crate::client::handle::ClientSettings;
use crate::client::connection::{ConnectOptions, ConnectionState, KeepAlive};
use crate::client::delivery::{DeliveryAction, DeliveryEngine};
use crate::client::dispatcher::{ClientCallback, DispatchEvent, Dispatcher};
use crate::client::reconnect::ReconnectController;
use crate::client::subscriptions::{Subscription, SubscriptionTable};
use crate::client::tokens::{
    ActionListener, ActionResult, ActionToken, TokenId, TokenKind, TokenRegistry, TokenState,
};
use crate::error::{MqttError, MqttResult};
use crate::observability::metrics;
use crate::persistence::Persistence;
use crate::protocol::{
    check_topic_filter, check_topic_name, ConnAck, ConnectReturnCode, Message, Packet, Publish,
    QoS, SubAck, Subscribe, SubscribeReturnCode, Unsubscribe,
};
use crate::transport::{Connection, Connector, PacketSink, PacketSource};
use crate::{delivery_span, lifecycle_span, mqtt_span};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

pub(crate) type Reply<T> = oneshot::Sender<MqttResult<T>>;

/// Requests from client handles
pub(crate) enum Command {
    Connect {
        options: ConnectOptions,
        listener: Option<Arc<dyn ActionListener>>,
        reply: Reply<ActionToken>,
    },
    Disconnect {
        timeout: Duration,
        listener: Option<Arc<dyn ActionListener>>,
        reply: Reply<ActionToken>,
    },
    Publish {
        message: Message,
        listener: Option<Arc<dyn ActionListener>>,
        reply: Reply<ActionToken>,
    },
    Subscribe {
        filter: String,
        qos: QoS,
        expect_retained: bool,
        listener: Option<Arc<dyn ActionListener>>,
        reply: Reply<ActionToken>,
    },
    Unsubscribe {
        filter: String,
        listener: Option<Arc<dyn ActionListener>>,
        reply: Reply<ActionToken>,
    },
    SetCallback {
        callback: Option<Arc<dyn ClientCallback>>,
    },
    Subscriptions {
        reply: oneshot::Sender<Vec<Subscription>>,
    },
    Close {
        reply: Reply<()>,
    },
}

/// Events from connection tasks
enum ConnectionEvent {
    Opened { epoch: u64, connection: Connection },
    OpenFailed { epoch: u64, error: MqttError },
    Packet { epoch: u64, packet: Packet },
    Closed { epoch: u64, cause: MqttError },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

struct PendingConnect {
    token: Option<TokenId>,
    options: ConnectOptions,
    deadline: Instant,
    reconnect: bool,
}

struct PendingDisconnect {
    token: TokenId,
    deadline: Instant,
}

struct PendingSubscribe {
    /// `None` for automatic resubscription after reconnect
    token: Option<TokenId>,
    filter: String,
}

struct PendingUnsubscribe {
    token: TokenId,
    existed: bool,
}

pub(crate) struct Engine {
    client_id: String,
    server: String,
    connector: Arc<dyn Connector>,
    settings: ClientSettings,

    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    options: Option<ConnectOptions>,
    session_clean: bool,
    explicit_disconnect: bool,

    epoch: u64,
    writer: Option<mpsc::UnboundedSender<Packet>>,
    reader: Option<JoinHandle<()>>,
    keep_alive: Option<KeepAlive>,
    pending_connect: Option<PendingConnect>,
    pending_disconnect: Option<PendingDisconnect>,

    tokens: Arc<TokenRegistry>,
    delivery: DeliveryEngine,
    subscriptions: SubscriptionTable,
    pending_subscribes: HashMap<u16, PendingSubscribe>,
    pending_unsubscribes: HashMap<u16, PendingUnsubscribe>,
    dispatcher: Dispatcher,
    reconnect: ReconnectController,

    commands: mpsc::Receiver<Command>,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    events_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
}

impl Engine {
    pub(crate) fn new(
        client_id: String,
        connector: Arc<dyn Connector>,
        persistence: Arc<dyn Persistence>,
        settings: ClientSettings,
        tokens: Arc<TokenRegistry>,
        commands: mpsc::Receiver<Command>,
        state_tx: watch::Sender<ConnectionState>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let delivery = DeliveryEngine::new(persistence, settings.retry.clone(), settings.max_inflight);
        let reconnect = ReconnectController::new(settings.reconnect.clone());

        let mut engine = Self {
            client_id,
            server: connector.server_uri(),
            connector,
            settings,
            state: ConnectionState::Disconnected,
            state_tx,
            options: None,
            session_clean: true,
            explicit_disconnect: false,
            epoch: 0,
            writer: None,
            reader: None,
            keep_alive: None,
            pending_connect: None,
            pending_disconnect: None,
            tokens,
            delivery,
            subscriptions: SubscriptionTable::new(),
            pending_subscribes: HashMap::new(),
            pending_unsubscribes: HashMap::new(),
            dispatcher: Dispatcher::default(),
            reconnect,
            commands,
            events_tx,
            events_rx,
        };
        // Packets left by a previous client get tokens before the first connect
        engine.restore_session(Instant::now());
        engine
    }

    pub(crate) async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.settings.timer_resolution);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(client_id = %self.client_id, server = %self.server, "Client engine started");

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if self.handle_command(command) == Flow::Stop {
                            break;
                        }
                    }
                    None => {
                        debug!(client_id = %self.client_id, "All client handles dropped");
                        self.shutdown();
                        break;
                    }
                },
                Some(event) = self.events_rx.recv() => self.handle_connection_event(event),
                _ = ticker.tick() => self.handle_tick(Instant::now()),
            }
        }

        info!(client_id = %self.client_id, "Client engine stopped");
    }

    fn handle_command(&mut self, command: Command) -> Flow {
        match command {
            Command::Connect {
                options,
                listener,
                reply,
            } => {
                let _ = reply.send(self.begin_connect(options, listener));
            }
            Command::Disconnect {
                timeout,
                listener,
                reply,
            } => {
                let _ = reply.send(self.begin_disconnect(timeout, listener));
                self.check_disconnect_drained(Instant::now());
            }
            Command::Publish {
                message,
                listener,
                reply,
            } => {
                let _ = reply.send(self.begin_publish(message, listener));
            }
            Command::Subscribe {
                filter,
                qos,
                expect_retained,
                listener,
                reply,
            } => {
                let _ = reply.send(self.begin_subscribe(filter, qos, expect_retained, listener));
            }
            Command::Unsubscribe {
                filter,
                listener,
                reply,
            } => {
                let _ = reply.send(self.begin_unsubscribe(filter, listener));
            }
            Command::SetCallback { callback } => {
                self.dispatcher.set_callback(callback);
            }
            Command::Subscriptions { reply } => {
                let _ = reply.send(self.subscriptions.snapshot());
            }
            Command::Close { reply } => {
                if self.state != ConnectionState::Disconnected {
                    let _ = reply.send(Err(MqttError::StateMismatch {
                        operation: "close",
                        state: self.state,
                    }));
                    return Flow::Continue;
                }
                self.shutdown();
                let _ = reply.send(Ok(()));
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    // Connect

    fn begin_connect(
        &mut self,
        options: ConnectOptions,
        listener: Option<Arc<dyn ActionListener>>,
    ) -> MqttResult<ActionToken> {
        if self.state != ConnectionState::Disconnected {
            return Err(MqttError::AlreadyConnected);
        }
        options.validate()?;

        let _span = lifecycle_span!(client_id = %self.client_id, event = "connect").entered();
        self.reconnect.cancel();
        self.explicit_disconnect = false;
        self.options = Some(options.clone());

        let token = self.tokens.register(TokenKind::Connect, None, listener);
        self.start_attempt(options, Some(token.id()), false);
        Ok(token)
    }

    fn start_attempt(&mut self, options: ConnectOptions, token: Option<TokenId>, reconnect: bool) {
        let now = Instant::now();
        if options.clean_session {
            self.discard_session();
        } else {
            self.restore_session(now);
        }
        self.session_clean = options.clean_session;

        self.epoch += 1;
        let epoch = self.epoch;
        self.set_state(ConnectionState::Connecting);
        self.pending_connect = Some(PendingConnect {
            token,
            deadline: now + options.connection_timeout,
            options,
            reconnect,
        });
        metrics().mqtt_connection_attempt();

        let connector = Arc::clone(&self.connector);
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let event = match connector.connect().await {
                Ok(connection) => ConnectionEvent::Opened { epoch, connection },
                Err(error) => ConnectionEvent::OpenFailed { epoch, error },
            };
            let _ = events.send(event);
        });
    }

    fn on_transport_opened(&mut self, epoch: u64, connection: Connection) {
        let (sink, source) = connection;
        let current = epoch == self.epoch && self.state == ConnectionState::Connecting;
        let Some(options) = self.pending_connect.as_ref().map(|p| p.options.clone()).filter(|_| current)
        else {
            debug!(epoch, "Discarding transport opened for an abandoned attempt");
            tokio::spawn(close_sink(sink));
            return;
        };

        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(sink, writer_rx, self.events_tx.clone(), epoch));
        self.reader = Some(tokio::spawn(read_loop(source, self.events_tx.clone(), epoch)));
        self.writer = Some(writer_tx);

        debug!(client_id = %self.client_id, clean_session = options.clean_session, "Transport open, sending CONNECT");
        self.send(Packet::Connect(options.to_connect(&self.client_id)));
    }

    fn on_connack(&mut self, ack: ConnAck) {
        let Some(pending) = self.pending_connect.take() else {
            self.connection_failed(MqttError::protocol_violation("unexpected CONNACK"));
            return;
        };

        if ack.code != ConnectReturnCode::Accepted {
            self.pending_connect = Some(pending);
            self.connect_failed(MqttError::ConnectionRefused(ack.code));
            return;
        }

        let now = Instant::now();
        self.keep_alive = Some(KeepAlive::new(pending.options.keep_alive, now));
        self.set_state(ConnectionState::Connected);
        self.reconnect.reset();
        metrics().mqtt_connection_established();

        if !ack.session_present {
            self.delivery.clear_inbound();
        }
        if !self.session_clean {
            let replayed = self.delivery.replay(now);
            if !replayed.is_empty() {
                info!(client_id = %self.client_id, count = replayed.len(), "Replaying in-flight packets");
            }
            self.apply(replayed);
            if !ack.session_present {
                self.resubscribe();
            }
        }

        if let Some(token) = pending.token {
            self.complete(
                token,
                ActionResult::Connected {
                    session_present: ack.session_present,
                },
            );
        }
        self.dispatcher.dispatch(DispatchEvent::ConnectComplete {
            reconnect: pending.reconnect,
            server: self.server.clone(),
        });
    }

    /// Re-establish every subscription when the broker kept no session
    fn resubscribe(&mut self) {
        let subscriptions = self.subscriptions.snapshot();
        if subscriptions.is_empty() {
            return;
        }
        info!(client_id = %self.client_id, count = subscriptions.len(), "Resubscribing to topics");

        for subscription in subscriptions {
            match self.delivery.allocate_id() {
                Ok(packet_id) => {
                    debug!(filter = %subscription.filter, qos = %subscription.requested_qos, "Resubscribing");
                    self.pending_subscribes.insert(
                        packet_id,
                        PendingSubscribe {
                            token: None,
                            filter: subscription.filter.clone(),
                        },
                    );
                    self.send(Packet::Subscribe(Subscribe {
                        packet_id,
                        filters: vec![(subscription.filter, subscription.requested_qos)],
                    }));
                }
                Err(e) => {
                    error!(filter = %subscription.filter, error = %e, "Failed to resubscribe");
                }
            }
        }
    }

    fn connect_failed(&mut self, error: MqttError) {
        let pending = self.pending_connect.take();
        warn!(client_id = %self.client_id, error = %error, "Connect attempt failed");
        metrics().mqtt_connection_failed();

        self.teardown_transport();
        self.set_state(ConnectionState::Disconnected);

        let reconnect = pending.as_ref().map(|p| p.reconnect).unwrap_or(false);
        if let Some(token) = pending.and_then(|p| p.token) {
            self.fail(token, error);
        }
        if reconnect {
            self.reconnect.schedule(Instant::now(), self.explicit_disconnect);
        }
    }

    fn attempt_reconnect(&mut self, attempt: u32) {
        let Some(options) = self.options.clone() else {
            return;
        };
        metrics().mqtt_reconnect_attempt();
        info!(client_id = %self.client_id, attempt, "Attempting reconnection");
        self.start_attempt(options, None, true);
    }

    // Disconnect

    fn begin_disconnect(
        &mut self,
        timeout: Duration,
        listener: Option<Arc<dyn ActionListener>>,
    ) -> MqttResult<ActionToken> {
        match self.state {
            ConnectionState::Disconnected => {
                self.reconnect.cancel();
                self.explicit_disconnect = true;
                Err(MqttError::AlreadyDisconnected)
            }
            state @ (ConnectionState::Connecting | ConnectionState::Disconnecting) => {
                Err(MqttError::StateMismatch {
                    operation: "disconnect",
                    state,
                })
            }
            ConnectionState::Connected => {
                let _span = lifecycle_span!(client_id = %self.client_id, event = "disconnect").entered();
                let token = self.tokens.register(TokenKind::Disconnect, None, listener);
                self.explicit_disconnect = true;
                self.set_state(ConnectionState::Disconnecting);
                self.pending_disconnect = Some(PendingDisconnect {
                    token: token.id(),
                    deadline: Instant::now() + timeout,
                });
                Ok(token)
            }
        }
    }

    fn check_disconnect_drained(&mut self, now: Instant) {
        if self.state != ConnectionState::Disconnecting {
            return;
        }
        let Some(deadline) = self.pending_disconnect.as_ref().map(|p| p.deadline) else {
            return;
        };

        let drained = self.delivery.is_idle()
            && self.pending_subscribes.is_empty()
            && self.pending_unsubscribes.is_empty();
        if drained || now >= deadline {
            if !drained {
                warn!(
                    client_id = %self.client_id,
                    in_flight = self.delivery.in_flight(),
                    "Disconnect timeout expired with handshakes still in flight"
                );
            }
            self.finish_disconnect();
        }
    }

    fn finish_disconnect(&mut self) {
        self.send(Packet::Disconnect);
        self.teardown_transport();
        self.set_state(ConnectionState::Disconnected);
        metrics().mqtt_disconnected();

        self.fail_acknowledgment_waiters(MqttError::transport("connection closed by disconnect"));
        if self.session_clean {
            self.discard_session();
        }
        if let Some(pending) = self.pending_disconnect.take() {
            self.complete(pending.token, ActionResult::Disconnected);
        }
    }

    // Connection loss

    fn connection_failed(&mut self, cause: MqttError) {
        match self.state {
            ConnectionState::Connecting => self.connect_failed(cause),
            ConnectionState::Disconnecting => {
                debug!(client_id = %self.client_id, cause = %cause, "Transport ended while disconnecting");
                self.finish_disconnect();
            }
            ConnectionState::Connected => self.connection_lost(cause),
            ConnectionState::Disconnected => {
                trace!(cause = %cause, "Ignoring failure while disconnected");
            }
        }
    }

    fn connection_lost(&mut self, cause: MqttError) {
        error!(client_id = %self.client_id, cause = %cause, "Connection lost");
        metrics().mqtt_connection_lost();

        self.teardown_transport();
        self.set_state(ConnectionState::Disconnected);
        self.fail_acknowledgment_waiters(cause.clone());
        if self.session_clean {
            self.discard_session();
        }

        self.dispatcher.dispatch(DispatchEvent::ConnectionLost(cause));
        self.reconnect.schedule(Instant::now(), self.explicit_disconnect);
    }

    fn teardown_transport(&mut self) {
        // Dropping the queue lets the writer flush what is queued, then close
        self.writer = None;
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.keep_alive = None;
        self.epoch += 1;
    }

    /// Fail subscribe and unsubscribe tokens still waiting for their ack
    fn fail_acknowledgment_waiters(&mut self, cause: MqttError) {
        let mut subscribes: Vec<(u16, PendingSubscribe)> = self.pending_subscribes.drain().collect();
        subscribes.sort_by_key(|(packet_id, _)| *packet_id);
        for (packet_id, pending) in subscribes {
            self.delivery.release_id(packet_id);
            if let Some(token) = pending.token {
                self.fail(token, cause.clone());
            }
        }

        let mut unsubscribes: Vec<(u16, PendingUnsubscribe)> =
            self.pending_unsubscribes.drain().collect();
        unsubscribes.sort_by_key(|(packet_id, _)| *packet_id);
        for (packet_id, pending) in unsubscribes {
            self.delivery.release_id(packet_id);
            self.fail(pending.token, cause.clone());
        }
    }

    // Session

    fn discard_session(&mut self) {
        let abandoned = self.delivery.clear_session();
        if !abandoned.is_empty() {
            info!(client_id = %self.client_id, count = abandoned.len(), "Discarding in-flight publishes of clean session");
        }
        for token in abandoned {
            self.fail(token, MqttError::SessionLost);
        }
        self.subscriptions.clear();
    }

    fn restore_session(&mut self, now: Instant) {
        let tokens = Arc::clone(&self.tokens);
        let restored = self.delivery.restore(now, |packet_id, message| {
            let token = tokens.register(TokenKind::Publish, Some(message.clone()), None);
            token.set_packet_id(Some(packet_id));
            token.id()
        });
        match restored {
            Ok(0) => {}
            Ok(count) => info!(client_id = %self.client_id, count, "Restored in-flight publishes"),
            Err(e) => error!(client_id = %self.client_id, error = %e, "Failed to restore session state"),
        }
    }

    // Publish

    fn require_connected(&self, operation: &'static str) -> MqttResult<()> {
        if self.state == ConnectionState::Connected {
            Ok(())
        } else {
            Err(MqttError::StateMismatch {
                operation,
                state: self.state,
            })
        }
    }

    fn begin_publish(
        &mut self,
        mut message: Message,
        listener: Option<Arc<dyn ActionListener>>,
    ) -> MqttResult<ActionToken> {
        self.require_connected("publish")?;
        check_topic_name(&message.topic)?;
        message.duplicate = false;

        let _span = mqtt_span!(operation = "publish", topic = %message.topic, qos = %message.qos).entered();
        let token = self
            .tokens
            .register(TokenKind::Publish, Some(message.clone()), listener);
        match self.delivery.publish(token.id(), message, Instant::now()) {
            Ok((packet_id, actions)) => {
                token.set_packet_id(packet_id);
                self.apply(actions);
                Ok(token)
            }
            Err(e) => {
                self.tokens.forget(token.id());
                metrics().mqtt_publish_failed();
                Err(e)
            }
        }
    }

    fn on_publish(&mut self, publish: Publish) {
        let _span = delivery_span!(topic = %publish.topic, qos = %publish.qos, packet_id = ?publish.packet_id).entered();
        match self.delivery.on_publish(&publish) {
            Ok(actions) => self.apply(actions),
            Err(e) if e.is_connection_fatal() => self.connection_failed(e),
            Err(e) => {
                error!(topic = %publish.topic, error = %e, "Cannot record inbound publish, withholding acknowledgment");
            }
        }
    }

    // Subscribe

    fn begin_subscribe(
        &mut self,
        filter: String,
        qos: QoS,
        expect_retained: bool,
        listener: Option<Arc<dyn ActionListener>>,
    ) -> MqttResult<ActionToken> {
        self.require_connected("subscribe")?;
        check_topic_filter(&filter)?;
        let packet_id = self.delivery.allocate_id()?;

        let token = self.tokens.register(TokenKind::Subscribe, None, listener);
        token.set_packet_id(Some(packet_id));
        self.subscriptions.insert(&filter, qos, expect_retained);
        self.pending_subscribes.insert(
            packet_id,
            PendingSubscribe {
                token: Some(token.id()),
                filter: filter.clone(),
            },
        );
        self.send(Packet::Subscribe(Subscribe {
            packet_id,
            filters: vec![(filter, qos)],
        }));
        Ok(token)
    }

    fn on_suback(&mut self, ack: SubAck) {
        let Some(pending) = self.pending_subscribes.remove(&ack.packet_id) else {
            metrics().mqtt_ack_discarded();
            warn!(packet_id = ack.packet_id, "Discarding SUBACK for unknown packet id");
            return;
        };
        self.delivery.release_id(ack.packet_id);

        match ack.return_codes.first().copied() {
            Some(SubscribeReturnCode::Success(granted)) => {
                self.subscriptions.set_granted(&pending.filter, granted);
                if let Some(token) = pending.token {
                    self.complete(token, ActionResult::Subscribed { granted });
                }
            }
            Some(SubscribeReturnCode::Failure) => {
                warn!(filter = %pending.filter, "Subscription rejected by broker");
                self.subscriptions.remove(&pending.filter);
                if let Some(token) = pending.token {
                    self.fail(
                        token,
                        MqttError::SubscriptionRejected {
                            filter: pending.filter,
                        },
                    );
                }
            }
            None => {
                let violation = MqttError::protocol_violation("SUBACK without return codes");
                if let Some(token) = pending.token {
                    self.fail(token, violation.clone());
                }
                self.connection_failed(violation);
            }
        }
    }

    fn begin_unsubscribe(
        &mut self,
        filter: String,
        listener: Option<Arc<dyn ActionListener>>,
    ) -> MqttResult<ActionToken> {
        self.require_connected("unsubscribe")?;
        check_topic_filter(&filter)?;
        let packet_id = self.delivery.allocate_id()?;

        let token = self.tokens.register(TokenKind::Unsubscribe, None, listener);
        token.set_packet_id(Some(packet_id));
        let existed = self.subscriptions.remove(&filter).is_some();
        self.pending_unsubscribes.insert(
            packet_id,
            PendingUnsubscribe {
                token: token.id(),
                existed,
            },
        );
        self.send(Packet::Unsubscribe(Unsubscribe {
            packet_id,
            filters: vec![filter],
        }));
        Ok(token)
    }

    fn on_unsuback(&mut self, packet_id: u16) {
        let Some(pending) = self.pending_unsubscribes.remove(&packet_id) else {
            metrics().mqtt_ack_discarded();
            warn!(packet_id, "Discarding UNSUBACK for unknown packet id");
            return;
        };
        self.delivery.release_id(packet_id);
        self.complete(
            pending.token,
            ActionResult::Unsubscribed {
                existed: pending.existed,
            },
        );
    }

    // Inbound routing

    fn handle_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Opened { epoch, connection } => {
                self.on_transport_opened(epoch, connection);
            }
            ConnectionEvent::OpenFailed { epoch, error } => {
                if epoch == self.epoch && self.state == ConnectionState::Connecting {
                    self.connect_failed(error);
                }
            }
            ConnectionEvent::Packet { epoch, packet } => {
                if epoch != self.epoch {
                    trace!(epoch, packet = %packet, "Ignoring packet from closed connection");
                    return;
                }
                self.handle_packet(packet);
                self.check_disconnect_drained(Instant::now());
            }
            ConnectionEvent::Closed { epoch, cause } => {
                if epoch == self.epoch {
                    self.connection_failed(cause);
                }
            }
        }
    }

    fn handle_packet(&mut self, packet: Packet) {
        debug!(client_id = %self.client_id, packet = %packet, "Received");

        if self.state == ConnectionState::Connecting {
            match packet {
                Packet::ConnAck(ack) => self.on_connack(ack),
                other => self.connection_failed(MqttError::protocol_violation(format!(
                    "{other} received before CONNACK"
                ))),
            }
            return;
        }

        let now = Instant::now();
        match packet {
            Packet::Publish(publish) => self.on_publish(publish),
            Packet::PubAck(packet_id) => {
                let actions = self.delivery.on_puback(packet_id);
                self.apply(actions);
            }
            Packet::PubRec(packet_id) => {
                let actions = self.delivery.on_pubrec(packet_id, now);
                self.apply(actions);
            }
            Packet::PubRel(packet_id) => {
                let actions = self.delivery.on_pubrel(packet_id);
                self.apply(actions);
            }
            Packet::PubComp(packet_id) => {
                let actions = self.delivery.on_pubcomp(packet_id);
                self.apply(actions);
            }
            Packet::SubAck(ack) => self.on_suback(ack),
            Packet::UnsubAck(packet_id) => self.on_unsuback(packet_id),
            Packet::PingResp => {
                if let Some(keep_alive) = self.keep_alive.as_mut() {
                    keep_alive.on_ping_response();
                }
            }
            other => self.connection_failed(MqttError::protocol_violation(format!(
                "unexpected {other} from broker"
            ))),
        }
    }

    // Timers

    fn handle_tick(&mut self, now: Instant) {
        match self.state {
            ConnectionState::Connecting => {
                let expired = self
                    .pending_connect
                    .as_ref()
                    .map(|pending| now >= pending.deadline)
                    .unwrap_or(false);
                if expired {
                    self.connect_failed(MqttError::timeout("no CONNACK within connection timeout"));
                }
            }
            ConnectionState::Connected => {
                let (timed_out, ping) = match self.keep_alive.as_mut() {
                    Some(keep_alive) => {
                        let timed_out = keep_alive.timed_out(now);
                        (timed_out, !timed_out && keep_alive.should_ping(now))
                    }
                    None => (false, false),
                };
                if timed_out {
                    self.connection_failed(MqttError::timeout("no PINGRESP within keepalive grace"));
                } else if ping {
                    metrics().mqtt_ping_sent();
                    self.send(Packet::PingReq);
                }
            }
            ConnectionState::Disconnected => {
                if let Some(attempt) = self.reconnect.take_due(now) {
                    self.attempt_reconnect(attempt);
                }
            }
            ConnectionState::Disconnecting => {}
        }

        let transport_up = matches!(
            self.state,
            ConnectionState::Connected | ConnectionState::Disconnecting
        );
        let actions = self.delivery.tick(now, transport_up);
        self.apply(actions);
        self.check_disconnect_drained(now);
    }

    // Plumbing

    fn send(&mut self, packet: Packet) {
        let Some(writer) = &self.writer else {
            debug!(packet = %packet, "No transport, dropping packet");
            return;
        };
        debug!(client_id = %self.client_id, packet = %packet, "Sending");
        if writer.send(packet).is_err() {
            debug!("Writer task already finished");
        }
        if let Some(keep_alive) = self.keep_alive.as_mut() {
            keep_alive.on_send(Instant::now());
        }
    }

    fn apply(&mut self, actions: Vec<DeliveryAction>) {
        for action in actions {
            match action {
                DeliveryAction::Send(packet) => self.send(packet),
                DeliveryAction::Deliver(message) => {
                    self.subscriptions.record_delivery(&message);
                    self.dispatcher.dispatch(DispatchEvent::MessageArrived(message));
                }
                DeliveryAction::Complete(token) => self.complete(token, ActionResult::Published),
                DeliveryAction::Fail(token, error) => self.fail(token, error),
            }
        }
    }

    fn complete(&mut self, id: TokenId, result: ActionResult) {
        if let Some(token) = self.tokens.complete(id, result) {
            if token.kind() == TokenKind::Publish {
                self.dispatcher
                    .dispatch(DispatchEvent::DeliveryComplete(token.clone()));
            }
            self.dispatcher.dispatch(DispatchEvent::ActionSucceeded(token));
        }
    }

    fn fail(&mut self, id: TokenId, error: MqttError) {
        if let Some(token) = self.tokens.fail(id, error.clone()) {
            self.dispatcher
                .dispatch(DispatchEvent::ActionFailed(token, error));
        }
    }

    fn set_state(&mut self, next: ConnectionState) {
        if next == self.state {
            return;
        }
        ConnectionState::log_transition(self.state, next, &self.client_id);
        self.state = next;
        self.state_tx.send_replace(next);
    }

    fn shutdown(&mut self) {
        self.reconnect.cancel();
        self.teardown_transport();
        self.set_state(ConnectionState::Disconnected);

        let remaining = self.tokens.drain();
        if !remaining.is_empty() {
            info!(client_id = %self.client_id, count = remaining.len(), "Failing pending tokens on close");
        }
        for token in remaining {
            if token.transition(TokenState::Failed(MqttError::ClientClosed)) {
                self.dispatcher
                    .dispatch(DispatchEvent::ActionFailed(token, MqttError::ClientClosed));
            }
        }
    }
}

async fn close_sink(mut sink: Box<dyn PacketSink>) {
    if let Err(e) = sink.close().await {
        debug!(error = %e, "Error closing abandoned transport");
    }
}

async fn write_loop(
    mut sink: Box<dyn PacketSink>,
    mut queue: mpsc::UnboundedReceiver<Packet>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    epoch: u64,
) {
    while let Some(packet) = queue.recv().await {
        let last = matches!(packet, Packet::Disconnect);
        if let Err(cause) = sink.send(packet).await {
            let _ = events.send(ConnectionEvent::Closed { epoch, cause });
            return;
        }
        if last {
            break;
        }
    }
    if let Err(e) = sink.close().await {
        debug!(error = %e, "Error closing transport");
    }
}

async fn read_loop(
    mut source: Box<dyn PacketSource>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    epoch: u64,
) {
    loop {
        let event = match source.recv().await {
            Ok(Some(packet)) => ConnectionEvent::Packet { epoch, packet },
            Ok(None) => ConnectionEvent::Closed {
                epoch,
                cause: MqttError::transport("connection closed by broker"),
            },
            Err(cause) => ConnectionEvent::Closed { epoch, cause },
        };
        let closed = matches!(event, ConnectionEvent::Closed { .. });
        if events.send(event).is_err() || closed {
            return;
        }
    }
}
