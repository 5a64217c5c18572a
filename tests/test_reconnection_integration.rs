//! Integration tests for connection loss and session recovery
//!
//! Tests the reconnect controller and persistent sessions against the
//! in-process broker:
//! - Automatic reconnection after a dropped connection
//! - Replay of in-flight publishes with the DUP flag after reconnecting
//! - Restoring persisted publishes into a new client instance
//! - Keepalive timeout, refused connections and explicit disconnects


use mqtt_engine::client::{ActionResult, ConnectOptions, ConnectionState};
use mqtt_engine::error::MqttError;
use mqtt_engine::persistence::{DeliveryStage, MemoryPersistence, Persistence, PersistenceKey};
use mqtt_engine::protocol::{ConnectReturnCode, Packet, Publish, QoS};
use mqtt_engine::testing::MockBroker;
use std::sync::Arc;
use std::time::Duration;
use test_helpers::{
    connect, disconnect, eventually, fast_settings, new_client, new_client_with,
    patient_settings, WAIT,
};

fn publishes(packets: Vec<Packet>) -> Vec<Publish> {
    packets
        .into_iter()
        .filter_map(|packet| match packet {
            Packet::Publish(publish) => Some(publish),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_reconnects_after_dropped_connection() {
    // Arrange
    let broker = MockBroker::new();
    let t = new_client(&broker, "reconnect-client").await;
    connect(&t.client, true).await;

    // Act
    assert!(broker.drop_connection("reconnect-client"));

    // Assert
    assert!(eventually(|| t.callback.get_connect_completions() == vec![false, true]).await);
    assert!(t.client.is_connected());
    assert!(broker.is_connected("reconnect-client"));
    let losses = t.callback.get_connection_losses();
    assert_eq!(losses.len(), 1);
    assert!(matches!(losses[0], MqttError::Transport(_)));

    disconnect(&t.client).await;
}

#[tokio::test]
async fn test_persistent_session_keeps_subscriptions() {
    // Arrange
    let broker = MockBroker::new();
    let t = new_client(&broker, "persistent-client").await;
    connect(&t.client, false).await;
    t.client
        .subscribe("rooms/+/light", QoS::AtLeastOnce, false)
        .await
        .unwrap()
        .wait_for_completion(WAIT)
        .await
        .unwrap();
    broker.clear_log();

    // Act
    broker.drop_connection("persistent-client");
    let reconnected = eventually(|| t.callback.get_connect_completions().len() == 2).await;

    // Assert: the broker kept the session, so nothing is resent
    assert!(reconnected);
    let subscriptions = broker.session_subscriptions("persistent-client").unwrap();
    assert_eq!(subscriptions.get("rooms/+/light"), Some(&QoS::AtLeastOnce));
    assert!(!broker
        .received_packets("persistent-client")
        .iter()
        .any(|packet| matches!(packet, Packet::Subscribe(_))));

    disconnect(&t.client).await;
}

#[tokio::test]
async fn test_resubscribes_when_broker_lost_session() {
    // Arrange
    let broker = MockBroker::new();
    let t = new_client(&broker, "resubscribe-client").await;
    connect(&t.client, false).await;
    t.client
        .subscribe("rooms/+/light", QoS::ExactlyOnce, false)
        .await
        .unwrap()
        .wait_for_completion(WAIT)
        .await
        .unwrap();

    // Act
    broker.drop_connection("resubscribe-client");
    assert!(broker.discard_session("resubscribe-client"));
    let resubscribed = eventually(|| {
        broker
            .session_subscriptions("resubscribe-client")
            .map(|subscriptions| subscriptions.contains_key("rooms/+/light"))
            .unwrap_or(false)
    })
    .await;

    // Assert
    assert!(resubscribed);
    assert!(eventually(|| t.client.is_connected()).await);
    let subscriptions = t.client.subscriptions().await.unwrap();
    assert_eq!(subscriptions.len(), 1);
    assert_eq!(subscriptions[0].granted_qos, Some(QoS::ExactlyOnce));

    disconnect(&t.client).await;
}

#[tokio::test]
async fn test_persistent_session_replays_in_flight_publish() {
    // Arrange
    let broker = MockBroker::new();
    let t = new_client_with(
        &broker,
        "replay-client",
        patient_settings(),
        Arc::new(MemoryPersistence::new()),
    )
    .await;
    connect(&t.client, false).await;
    broker.drop_next_acks(1);
    let token = t
        .client
        .publish("orders/new", "order-1", QoS::AtLeastOnce, false)
        .await
        .unwrap();
    let packet_id = token.packet_id().unwrap();
    assert!(eventually(|| publishes(broker.received_packets("replay-client")).len() == 1).await);

    // Act
    broker.drop_connection("replay-client");
    let result = token.wait_for_completion(WAIT).await;

    // Assert
    assert_eq!(result.unwrap(), ActionResult::Published);
    let sent = publishes(broker.received_packets("replay-client"));
    assert_eq!(sent.len(), 2);
    assert!(sent[1].dup);
    assert_eq!(sent[1].packet_id, Some(packet_id));
    assert_eq!(t.callback.get_connect_completions(), vec![false, true]);

    disconnect(&t.client).await;
}

#[tokio::test]
async fn test_store_matches_unacknowledged_packets_across_loss() {
    // Arrange: one QoS 1 and one QoS 2 publish left open, plus an inbound QoS 2
    let broker = MockBroker::new();
    let persistence = Arc::new(MemoryPersistence::new());
    let t = new_client_with(
        &broker,
        "ledger-client",
        patient_settings(),
        persistence.clone(),
    )
    .await;
    connect(&t.client, false).await;

    broker.drop_next_acks(1);
    let qos1 = t
        .client
        .publish("ledger/a", "one", QoS::AtLeastOnce, false)
        .await
        .unwrap();
    assert!(eventually(|| publishes(broker.received_packets("ledger-client")).len() == 1).await);

    broker.drop_next_ack_of("PUBCOMP");
    let qos2 = t
        .client
        .publish("ledger/b", "two", QoS::ExactlyOnce, false)
        .await
        .unwrap();
    let qos2_id = qos2.packet_id().unwrap();
    assert!(eventually(|| broker
        .received_packets("ledger-client")
        .contains(&Packet::PubRel(qos2_id)))
    .await);

    broker.drop_next_acks(1);
    assert!(broker.inject(
        "ledger-client",
        Packet::Publish(Publish {
            topic: "ledger/in".to_string(),
            payload: b"three".to_vec(),
            qos: QoS::ExactlyOnce,
            retain: false,
            dup: false,
            packet_id: Some(9),
        })
    ));
    assert!(eventually(|| broker
        .received_packets("ledger-client")
        .contains(&Packet::PubRec(9)))
    .await);

    // Act: lose the connection and keep the broker unreachable for now
    broker.fail_connections(true);
    broker.drop_connection("ledger-client");
    assert!(eventually(|| !t.client.is_connected()).await);

    // Assert: exactly the open handshakes are persisted, at their stages
    let qos1_id = qos1.packet_id().unwrap();
    let keys = persistence.all_keys().unwrap();
    let expected: std::collections::HashSet<PersistenceKey> = [
        PersistenceKey::outbound(qos1_id),
        PersistenceKey::outbound(qos2_id),
        PersistenceKey::inbound(9),
    ]
    .into_iter()
    .collect();
    assert_eq!(keys, expected);
    let stage = |key| persistence.retrieve(key).unwrap().unwrap().stage;
    assert_eq!(stage(PersistenceKey::outbound(qos1_id)), DeliveryStage::AwaitingPubAck);
    assert_eq!(stage(PersistenceKey::outbound(qos2_id)), DeliveryStage::AwaitingPubComp);
    assert_eq!(stage(PersistenceKey::inbound(9)), DeliveryStage::AwaitingPubRel);

    // Once the broker is back every handshake finishes and the store drains
    broker.fail_connections(false);
    assert_eq!(qos1.wait_for_completion(WAIT).await.unwrap(), ActionResult::Published);
    assert_eq!(qos2.wait_for_completion(WAIT).await.unwrap(), ActionResult::Published);
    assert!(eventually(|| persistence.is_empty()).await);
    assert_eq!(t.callback.get_messages().len(), 1);

    disconnect(&t.client).await;
}

#[tokio::test]
async fn test_lost_broker_session_resets_inbound_qos2_state() {
    // Arrange: an inbound QoS 2 publish whose PUBREL never arrives
    let broker = MockBroker::new();
    let persistence = Arc::new(MemoryPersistence::new());
    let t = new_client_with(
        &broker,
        "inbound-reset-client",
        fast_settings(),
        persistence.clone(),
    )
    .await;
    connect(&t.client, false).await;
    let first = Publish {
        topic: "alerts/door".to_string(),
        payload: b"first".to_vec(),
        qos: QoS::ExactlyOnce,
        retain: false,
        dup: false,
        packet_id: Some(7),
    };
    broker.drop_next_acks(1);
    assert!(broker.inject("inbound-reset-client", Packet::Publish(first.clone())));
    assert!(eventually(|| t.callback.get_messages().len() == 1).await);
    assert!(persistence.all_keys().unwrap().contains(&PersistenceKey::inbound(7)));

    // Act: the broker forgets the session, so the id is free to reuse
    assert!(broker.discard_session("inbound-reset-client"));
    broker.drop_connection("inbound-reset-client");
    assert!(eventually(|| t.callback.get_connect_completions() == vec![false, true]).await);
    assert!(broker.inject(
        "inbound-reset-client",
        Packet::Publish(Publish {
            payload: b"second".to_vec(),
            ..first
        })
    ));

    // Assert
    assert!(eventually(|| t.callback.get_messages().len() == 2).await);
    let payloads: Vec<Vec<u8>> = t
        .callback
        .get_messages()
        .into_iter()
        .map(|message| message.payload)
        .collect();
    assert_eq!(payloads, vec![b"first".to_vec(), b"second".to_vec()]);
    assert!(eventually(|| persistence.is_empty()).await);

    disconnect(&t.client).await;
}

#[tokio::test]
async fn test_clean_session_loss_fails_in_flight_publish() {
    // Arrange
    let broker = MockBroker::new();
    let t = new_client_with(
        &broker,
        "lossy-client",
        patient_settings(),
        Arc::new(MemoryPersistence::new()),
    )
    .await;
    connect(&t.client, true).await;
    broker.drop_next_acks(1);
    let token = t
        .client
        .publish("orders/new", "order-2", QoS::ExactlyOnce, false)
        .await
        .unwrap();

    // Act
    assert!(eventually(|| !publishes(broker.received_packets("lossy-client")).is_empty()).await);
    broker.drop_connection("lossy-client");

    // Assert
    assert_eq!(
        token.wait_for_completion(WAIT).await.unwrap_err(),
        MqttError::SessionLost
    );
    assert!(eventually(|| t.client.is_connected()).await);

    disconnect(&t.client).await;
}

#[tokio::test]
async fn test_new_client_restores_persisted_publish() {
    // Arrange: the first client leaves a publish in flight in shared storage
    let broker = MockBroker::new();
    let persistence: Arc<dyn Persistence> = Arc::new(MemoryPersistence::new());
    let first = new_client_with(
        &broker,
        "restart-client",
        patient_settings(),
        Arc::clone(&persistence),
    )
    .await;
    connect(&first.client, false).await;
    broker.drop_next_acks(1);
    let abandoned = first
        .client
        .publish("ledger/entry", "credit", QoS::ExactlyOnce, false)
        .await
        .unwrap();
    first
        .client
        .disconnect(Duration::from_millis(50))
        .await
        .unwrap()
        .wait_for_completion(WAIT)
        .await
        .unwrap();
    first.client.close().await.unwrap();
    assert_eq!(
        abandoned.wait_for_completion(WAIT).await.unwrap_err(),
        MqttError::ClientClosed
    );
    assert_eq!(persistence.all_keys().unwrap().len(), 1);

    // Act
    let second = new_client_with(
        &broker,
        "restart-client",
        patient_settings(),
        Arc::clone(&persistence),
    )
    .await;
    let restored = second.client.pending_delivery_tokens();
    connect(&second.client, false).await;

    // Assert
    assert_eq!(restored.len(), 1);
    assert_eq!(restored[0].packet_id(), abandoned.packet_id());
    assert_eq!(
        restored[0].wait_for_completion(WAIT).await.unwrap(),
        ActionResult::Published
    );
    assert!(persistence.all_keys().unwrap().is_empty());
    assert!(second.client.pending_delivery_tokens().is_empty());

    disconnect(&second.client).await;
}

#[tokio::test]
async fn test_keepalive_timeout_drops_connection() {
    // Arrange
    let broker = MockBroker::new();
    let t = new_client(&broker, "keepalive-client").await;
    t.client
        .connect(ConnectOptions::default().keep_alive(Duration::from_millis(50)))
        .await
        .unwrap()
        .wait_for_completion(WAIT)
        .await
        .unwrap();

    // Act
    broker.mute_pings(true);

    // Assert
    assert!(eventually(|| !t.callback.get_connection_losses().is_empty()).await);
    assert!(matches!(
        t.callback.get_connection_losses()[0],
        MqttError::Timeout(_)
    ));
    assert!(broker
        .received_packets("keepalive-client")
        .contains(&Packet::PingReq));

    broker.mute_pings(false);
    assert!(eventually(|| t.client.is_connected()).await);
    disconnect(&t.client).await;
}

#[tokio::test]
async fn test_refused_connection_fails_token_without_retry() {
    // Arrange
    let broker = MockBroker::new();
    broker.refuse_connections(Some(ConnectReturnCode::NotAuthorized));
    let t = new_client(&broker, "refused-client").await;

    // Act
    let result = t
        .client
        .connect(ConnectOptions::default())
        .await
        .unwrap()
        .wait_for_completion(WAIT)
        .await;

    // Assert
    assert_eq!(
        result.unwrap_err(),
        MqttError::ConnectionRefused(ConnectReturnCode::NotAuthorized)
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(t.client.state(), ConnectionState::Disconnected);
    assert!(t.callback.get_connect_completions().is_empty());
}

#[tokio::test]
async fn test_unreachable_broker_fails_connect() {
    // Arrange
    let broker = MockBroker::new();
    broker.fail_connections(true);
    let t = new_client(&broker, "unreachable-client").await;

    // Act
    let result = t
        .client
        .connect(ConnectOptions::default())
        .await
        .unwrap()
        .wait_for_completion(WAIT)
        .await;

    // Assert
    assert!(matches!(result, Err(MqttError::Transport(_))));
    assert!(!t.client.is_connected());
}

#[tokio::test]
async fn test_explicit_disconnect_prevents_reconnect() {
    // Arrange
    let broker = MockBroker::new();
    let t = new_client(&broker, "explicit-client").await;
    connect(&t.client, true).await;

    // Act
    disconnect(&t.client).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Assert
    assert_eq!(t.client.state(), ConnectionState::Disconnected);
    assert_eq!(broker.connection_count(), 0);
    assert!(t.callback.get_connection_losses().is_empty());
    assert_eq!(t.callback.get_connect_completions(), vec![false]);
}

#[tokio::test]
async fn test_reconnect_gives_up_after_max_attempts() {
    // Arrange
    let broker = MockBroker::new();
    let t = new_client(&broker, "exhausted-client").await;
    connect(&t.client, true).await;

    // Act
    broker.fail_connections(true);
    broker.drop_connection("exhausted-client");
    tokio::time::sleep(Duration::from_millis(1000)).await;

    // Assert: five attempts with at most 100ms between them, then nothing
    assert_eq!(t.client.state(), ConnectionState::Disconnected);
    broker.fail_connections(false);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!t.client.is_connected());

    // An explicit connect still works
    connect(&t.client, true).await;
    disconnect(&t.client).await;
}
