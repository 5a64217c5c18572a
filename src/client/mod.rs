//! MQTT client engine
//!
//! This module provides the client side of an MQTT 3.1.1 session with:
//! - A single engine task owning all protocol state ([`engine`])
//! - Action tokens tracking every asynchronous operation ([`tokens`])
//! - QoS 0/1/2 delivery backed by pluggable persistence ([`delivery`])
//! - The client-side subscription table ([`subscriptions`])
//! - Ordered callback and listener dispatch ([`dispatcher`])
//! - Exponential-backoff automatic reconnection ([`reconnect`])
//!
//! # Example
//!
//! ```rust,no_run
//! use mqtt_engine::client::{ClientSettings, ConnectOptions, MqttClient};
//! use mqtt_engine::persistence::MemoryPersistence;
//! use mqtt_engine::protocol::QoS;
//! use mqtt_engine::transport::TcpConnector;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let connector = Arc::new(TcpConnector::from_url("mqtt://localhost:1883")?);
//! let client = MqttClient::new(
//!     "sensor-1",
//!     connector,
//!     Arc::new(MemoryPersistence::new()),
//!     ClientSettings::default(),
//! )?;
//!
//! client
//!     .connect(ConnectOptions::default())
//!     .await?
//!     .wait_for_completion(Some(Duration::from_secs(10)))
//!     .await?;
//!
//! let token = client.publish("sensors/1/temp", "21.5", QoS::AtLeastOnce, false).await?;
//! token.wait_for_completion(None).await?;
//! # Ok(())
//! # }
//! ```

pub mod blocking;
pub mod connection;
pub mod delivery;
pub mod dispatcher;
pub(crate) mod engine;
pub mod handle;
pub mod reconnect;
pub mod subscriptions;
pub mod tokens;

pub use blocking::BlockingClient;
pub use connection::{ConnectOptions, ConnectionState, Credentials, KeepAlive};
pub use delivery::{DeliveryAction, DeliveryEngine, PacketIdAllocator, RetryPolicy};
pub use dispatcher::{ClientCallback, DispatchEvent, Dispatcher};
pub use handle::{ClientSettings, MqttClient};
pub use reconnect::{
    should_attempt_reconnection, ReconnectConfig, ReconnectController, ReconnectionDecision,
};
pub use subscriptions::{Subscription, SubscriptionTable};
pub use tokens::{
    ActionListener, ActionResult, ActionToken, TokenId, TokenKind, TokenRegistry, TokenState,
};
