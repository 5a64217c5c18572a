//! Asynchronous client handle

use crate::client::connection::{ConnectOptions, ConnectionState};
use crate::client::delivery::RetryPolicy;
use crate::client::dispatcher::ClientCallback;
use crate::client::engine::{Command, Engine};
use crate::client::reconnect::ReconnectConfig;
use crate::client::subscriptions::Subscription;
use crate::client::tokens::{ActionListener, ActionToken, TokenRegistry};
use crate::error::{MqttError, MqttResult};
use crate::persistence::Persistence;
use crate::protocol::{validate_client_id, Message, QoS};
use crate::transport::Connector;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::info;

/// Engine tuning shared by every connection of one client
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub retry: RetryPolicy,
    pub reconnect: ReconnectConfig,
    /// Upper bound on in-flight QoS 1/2 publishes and pending acks
    pub max_inflight: usize,
    /// Period of the engine tick driving timeouts and retransmission
    pub timer_resolution: Duration,
    /// Capacity of the command channel
    pub command_buffer: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            reconnect: ReconnectConfig::default(),
            max_inflight: 100,
            timer_resolution: Duration::from_millis(100),
            command_buffer: 64,
        }
    }
}

impl ClientSettings {
    pub fn validate(&self) -> MqttResult<()> {
        if self.max_inflight == 0 || self.max_inflight > u16::MAX as usize {
            return Err(MqttError::Config(format!(
                "max_inflight must be between 1 and {}, got {}",
                u16::MAX,
                self.max_inflight
            )));
        }
        if self.timer_resolution.is_zero() {
            return Err(MqttError::Config("timer_resolution must be positive".to_string()));
        }
        if self.command_buffer == 0 {
            return Err(MqttError::Config("command_buffer must be positive".to_string()));
        }
        self.reconnect.validate().map_err(MqttError::Config)
    }
}

/// Handle to a client engine.
///
/// Cloning is cheap; all clones drive the same engine task. Every operation
/// either fails synchronously (wrong state, invalid argument, exhausted packet
/// ids) or returns an [`ActionToken`] that later completes or fails exactly once.
/// The engine stops once [`close`](Self::close) succeeds or every handle is dropped.
#[derive(Clone)]
pub struct MqttClient {
    client_id: Arc<str>,
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ConnectionState>,
    tokens: Arc<TokenRegistry>,
}

impl MqttClient {
    /// Create a client and spawn its engine on the current tokio runtime.
    pub fn new(
        client_id: impl Into<String>,
        connector: Arc<dyn Connector>,
        persistence: Arc<dyn Persistence>,
        settings: ClientSettings,
    ) -> MqttResult<Self> {
        let client_id = client_id.into();
        validate_client_id(&client_id).map_err(|e| MqttError::InvalidClientId(e.to_string()))?;
        settings.validate()?;

        let (commands_tx, commands_rx) = mpsc::channel(settings.command_buffer);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let tokens = Arc::new(TokenRegistry::new());

        info!(client_id = %client_id, server = %connector.server_uri(), "Creating MQTT client");
        let engine = Engine::new(
            client_id.clone(),
            connector,
            persistence,
            settings,
            Arc::clone(&tokens),
            commands_rx,
            state_tx,
        );
        tokio::spawn(engine.run());

        Ok(Self {
            client_id: client_id.into(),
            commands: commands_tx,
            state: state_rx,
            tokens,
        })
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<MqttResult<T>>) -> Command,
    ) -> MqttResult<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(build(reply_tx))
            .await
            .map_err(|_| MqttError::ClientClosed)?;
        reply_rx.await.map_err(|_| MqttError::ClientClosed)?
    }

    pub async fn connect(&self, options: ConnectOptions) -> MqttResult<ActionToken> {
        self.connect_with_listener(options, None).await
    }

    pub async fn connect_with_listener(
        &self,
        options: ConnectOptions,
        listener: Option<Arc<dyn ActionListener>>,
    ) -> MqttResult<ActionToken> {
        self.request(|reply| Command::Connect {
            options,
            listener,
            reply,
        })
        .await
    }

    /// Disconnect once in-flight handshakes drain, or after `timeout`.
    ///
    /// On an already disconnected client this also cancels any pending
    /// automatic reconnect before failing with `AlreadyDisconnected`.
    pub async fn disconnect(&self, timeout: Duration) -> MqttResult<ActionToken> {
        self.disconnect_with_listener(timeout, None).await
    }

    pub async fn disconnect_with_listener(
        &self,
        timeout: Duration,
        listener: Option<Arc<dyn ActionListener>>,
    ) -> MqttResult<ActionToken> {
        self.request(|reply| Command::Disconnect {
            timeout,
            listener,
            reply,
        })
        .await
    }

    pub async fn publish(
        &self,
        topic: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        qos: QoS,
        retained: bool,
    ) -> MqttResult<ActionToken> {
        let message = Message::new(topic, payload, qos).with_retained(retained);
        self.publish_message(message, None).await
    }

    pub async fn publish_message(
        &self,
        message: Message,
        listener: Option<Arc<dyn ActionListener>>,
    ) -> MqttResult<ActionToken> {
        self.request(|reply| Command::Publish {
            message,
            listener,
            reply,
        })
        .await
    }

    /// Subscribe to `filter`. With `expect_retained`, the subscription entry
    /// stays marked until a retained message matching it arrives.
    pub async fn subscribe(
        &self,
        filter: impl Into<String>,
        qos: QoS,
        expect_retained: bool,
    ) -> MqttResult<ActionToken> {
        self.subscribe_with_listener(filter, qos, expect_retained, None)
            .await
    }

    pub async fn subscribe_with_listener(
        &self,
        filter: impl Into<String>,
        qos: QoS,
        expect_retained: bool,
        listener: Option<Arc<dyn ActionListener>>,
    ) -> MqttResult<ActionToken> {
        let filter = filter.into();
        self.request(|reply| Command::Subscribe {
            filter,
            qos,
            expect_retained,
            listener,
            reply,
        })
        .await
    }

    pub async fn unsubscribe(&self, filter: impl Into<String>) -> MqttResult<ActionToken> {
        self.unsubscribe_with_listener(filter, None).await
    }

    pub async fn unsubscribe_with_listener(
        &self,
        filter: impl Into<String>,
        listener: Option<Arc<dyn ActionListener>>,
    ) -> MqttResult<ActionToken> {
        let filter = filter.into();
        self.request(|reply| Command::Unsubscribe {
            filter,
            listener,
            reply,
        })
        .await
    }

    /// Install or remove the application callback
    pub async fn set_callback(&self, callback: Option<Arc<dyn ClientCallback>>) -> MqttResult<()> {
        self.commands
            .send(Command::SetCallback { callback })
            .await
            .map_err(|_| MqttError::ClientClosed)
    }

    /// Snapshot of the subscription table
    pub async fn subscriptions(&self) -> MqttResult<Vec<Subscription>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Subscriptions { reply: reply_tx })
            .await
            .map_err(|_| MqttError::ClientClosed)?;
        reply_rx.await.map_err(|_| MqttError::ClientClosed)
    }

    /// Release the client. Only allowed while disconnected; pending tokens fail
    /// with `ClientClosed` and persisted packets stay in the store.
    pub async fn close(&self) -> MqttResult<()> {
        self.request(|reply| Command::Close { reply }).await
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Wait until the connection state satisfies `predicate`
    pub async fn wait_for_state(
        &self,
        predicate: impl Fn(ConnectionState) -> bool,
        timeout: Duration,
    ) -> MqttResult<ConnectionState> {
        let mut state = self.state.clone();
        let wait = async {
            loop {
                let current = *state.borrow_and_update();
                if predicate(current) {
                    return Ok(current);
                }
                if state.changed().await.is_err() {
                    return Err(MqttError::ClientClosed);
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| MqttError::timeout(format!("connection state not reached within {timeout:?}")))?
    }

    /// Every token not yet completed, ordered by creation
    pub fn pending_tokens(&self) -> Vec<ActionToken> {
        self.tokens.pending_tokens()
    }

    /// Publish tokens not yet completed, including ones restored from persistence
    pub fn pending_delivery_tokens(&self) -> Vec<ActionToken> {
        self.tokens.pending_delivery_tokens()
    }
}

impl std::fmt::Debug for MqttClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttClient")
            .field("client_id", &self.client_id)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings_are_valid() {
        let settings = ClientSettings::default();
        assert_eq!(settings.max_inflight, 100);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_settings_validation() {
        let settings = ClientSettings {
            max_inflight: 0,
            ..Default::default()
        };
        assert!(matches!(settings.validate(), Err(MqttError::Config(_))));

        let settings = ClientSettings {
            timer_resolution: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(settings.validate(), Err(MqttError::Config(_))));

        let settings = ClientSettings {
            max_inflight: 70_000,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }
}
