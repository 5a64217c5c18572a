//! Synchronous facade over [`MqttClient`]
//!
//! The facade owns a small tokio runtime that hosts the engine task and blocks
//! the calling thread on each request. Tokens returned here are the same
//! [`ActionToken`]s the async client hands out; use
//! [`ActionToken::wait_for_completion_blocking`] to wait on them.
//!
//! Never use this type from inside an async context.

use crate::client::connection::{ConnectOptions, ConnectionState};
use crate::client::dispatcher::ClientCallback;
use crate::client::handle::{ClientSettings, MqttClient};
use crate::client::subscriptions::Subscription;
use crate::client::tokens::{ActionResult, ActionToken};
use crate::error::{MqttError, MqttResult};
use crate::persistence::Persistence;
use crate::protocol::QoS;
use crate::transport::Connector;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Builder, Runtime};

pub struct BlockingClient {
    runtime: Runtime,
    client: MqttClient,
}

impl BlockingClient {
    pub fn new(
        client_id: impl Into<String>,
        connector: Arc<dyn Connector>,
        persistence: Arc<dyn Persistence>,
        settings: ClientSettings,
    ) -> MqttResult<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("mqtt-engine")
            .enable_all()
            .build()
            .map_err(|e| MqttError::Config(format!("cannot start runtime: {e}")))?;

        let client = {
            let _guard = runtime.enter();
            MqttClient::new(client_id, connector, persistence, settings)?
        };

        Ok(Self { runtime, client })
    }

    /// Async handle to the same engine
    pub fn handle(&self) -> &MqttClient {
        &self.client
    }

    pub fn connect(&self, options: ConnectOptions) -> MqttResult<ActionToken> {
        self.runtime.block_on(self.client.connect(options))
    }

    /// Connect and wait for the CONNACK
    pub fn connect_and_wait(&self, options: ConnectOptions, timeout: Duration) -> MqttResult<ActionResult> {
        self.connect(options)?
            .wait_for_completion_blocking(Some(timeout))
    }

    pub fn disconnect(&self, timeout: Duration) -> MqttResult<ActionToken> {
        self.runtime.block_on(self.client.disconnect(timeout))
    }

    pub fn publish(
        &self,
        topic: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        qos: QoS,
        retained: bool,
    ) -> MqttResult<ActionToken> {
        self.runtime
            .block_on(self.client.publish(topic, payload, qos, retained))
    }

    pub fn subscribe(&self, filter: impl Into<String>, qos: QoS, expect_retained: bool) -> MqttResult<ActionToken> {
        self.runtime
            .block_on(self.client.subscribe(filter, qos, expect_retained))
    }

    pub fn unsubscribe(&self, filter: impl Into<String>) -> MqttResult<ActionToken> {
        self.runtime.block_on(self.client.unsubscribe(filter))
    }

    pub fn set_callback(&self, callback: Option<Arc<dyn ClientCallback>>) -> MqttResult<()> {
        self.runtime.block_on(self.client.set_callback(callback))
    }

    pub fn subscriptions(&self) -> MqttResult<Vec<Subscription>> {
        self.runtime.block_on(self.client.subscriptions())
    }

    pub fn close(&self) -> MqttResult<()> {
        self.runtime.block_on(self.client.close())
    }

    pub fn state(&self) -> ConnectionState {
        self.client.state()
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    pub fn pending_tokens(&self) -> Vec<ActionToken> {
        self.client.pending_tokens()
    }

    pub fn pending_delivery_tokens(&self) -> Vec<ActionToken> {
        self.client.pending_delivery_tokens()
    }
}
