//! MQTT Engine - asynchronous MQTT 3.1.1 client
//!
//! A client engine for MQTT brokers with at-most-once, at-least-once and
//! exactly-once delivery, persistent sessions and automatic reconnection.
//!
//! # Overview
//!
//! - Protocol packets, messages and topic matching ([`protocol`])
//! - Client engine, action tokens and the blocking facade ([`client`])
//! - Outbound state persistence in memory or on disk ([`persistence`])
//! - TCP transport with the MQTT wire codec ([`transport`])
//! - An in-process broker and recording callbacks ([`testing`])
//! - Replay logs and the randomized model test ([`replay`])
//!
//! # Quick Start
//!
//! ```rust
//! use mqtt_engine::client::{ClientSettings, ConnectOptions, MqttClient};
//! use mqtt_engine::persistence::MemoryPersistence;
//! use mqtt_engine::protocol::QoS;
//! use mqtt_engine::testing::MockBroker;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let broker = MockBroker::new();
//! let client = MqttClient::new(
//!     "quick-start",
//!     Arc::new(broker.clone()),
//!     Arc::new(MemoryPersistence::new()),
//!     ClientSettings::default(),
//! )?;
//!
//! let timeout = Some(Duration::from_secs(5));
//! client.connect(ConnectOptions::default()).await?.wait_for_completion(timeout).await?;
//! client
//!     .publish("sensors/1/temp", "21.5", QoS::ExactlyOnce, false)
//!     .await?
//!     .wait_for_completion(timeout)
//!     .await?;
//! client.disconnect(Duration::from_secs(1)).await?.wait_for_completion(timeout).await?;
//! # Ok::<(), mqtt_engine::MqttError>(())
//! # }).unwrap();
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod observability;
pub mod persistence;
pub mod protocol;
pub mod replay;
pub mod testing;
pub mod transport;

pub use client::{
    ActionListener, ActionResult, ActionToken, BlockingClient, ClientCallback, ClientSettings,
    ConnectOptions, ConnectionState, MqttClient,
};
pub use config::{ClientConfig, ConfigError};
pub use error::{MqttError, MqttResult};
pub use protocol::{Message, QoS};
