//! Recording implementations of the client's callback traits
//!
//! [`RecordingCallback`] captures every [`ClientCallback`] notification and
//! additionally forwards arrived messages into a channel, so tests can await
//! the next message with a timeout instead of sleeping.
//! [`RecordingListener`] captures per-token listener outcomes.

use crate::client::{ActionListener, ActionToken, ClientCallback, TokenId, TokenKind};
use crate::error::MqttError;
use crate::protocol::Message;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// One callback notification, in arrival order
#[derive(Debug, Clone, PartialEq)]
pub enum CallbackEvent {
    MessageArrived(Message),
    DeliveryComplete {
        token: TokenId,
        packet_id: Option<u16>,
    },
    ConnectionLost(MqttError),
    ConnectComplete {
        reconnect: bool,
        server: String,
    },
}

/// Callback that records everything it is told
#[derive(Debug)]
pub struct RecordingCallback {
    pub events: Arc<Mutex<Vec<CallbackEvent>>>,
    messages_tx: mpsc::UnboundedSender<Message>,
    messages_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>,
}

impl Default for RecordingCallback {
    fn default() -> Self {
        let (messages_tx, messages_rx) = mpsc::unbounded_channel();
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            messages_tx,
            messages_rx: tokio::sync::Mutex::new(messages_rx),
        }
    }
}

impl RecordingCallback {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn record(&self, event: CallbackEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }

    pub fn get_events(&self) -> Vec<CallbackEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn get_messages(&self) -> Vec<Message> {
        self.get_events()
            .into_iter()
            .filter_map(|event| match event {
                CallbackEvent::MessageArrived(message) => Some(message),
                _ => None,
            })
            .collect()
    }

    pub fn get_connection_losses(&self) -> Vec<MqttError> {
        self.get_events()
            .into_iter()
            .filter_map(|event| match event {
                CallbackEvent::ConnectionLost(cause) => Some(cause),
                _ => None,
            })
            .collect()
    }

    /// The `reconnect` flag of every `connect_complete`
    pub fn get_connect_completions(&self) -> Vec<bool> {
        self.get_events()
            .into_iter()
            .filter_map(|event| match event {
                CallbackEvent::ConnectComplete { reconnect, .. } => Some(reconnect),
                _ => None,
            })
            .collect()
    }

    pub fn get_delivery_completions(&self) -> Vec<TokenId> {
        self.get_events()
            .into_iter()
            .filter_map(|event| match event {
                CallbackEvent::DeliveryComplete { token, .. } => Some(token),
                _ => None,
            })
            .collect()
    }

    /// Wait for the next arrived message not yet taken
    pub async fn next_message(&self, timeout: Duration) -> Option<Message> {
        let mut rx = self.messages_rx.lock().await;
        tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
    }

    /// Discard messages queued for [`next_message`](Self::next_message)
    pub async fn drain_messages(&self) -> usize {
        let mut rx = self.messages_rx.lock().await;
        let mut drained = 0;
        while rx.try_recv().is_ok() {
            drained += 1;
        }
        drained
    }

    pub fn clear_history(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }
}

impl ClientCallback for RecordingCallback {
    fn message_arrived(&self, _topic: &str, message: &Message) {
        self.record(CallbackEvent::MessageArrived(message.clone()));
        let _ = self.messages_tx.send(message.clone());
    }

    fn delivery_complete(&self, token: &ActionToken) {
        self.record(CallbackEvent::DeliveryComplete {
            token: token.id(),
            packet_id: token.packet_id(),
        });
    }

    fn connection_lost(&self, cause: &MqttError) {
        self.record(CallbackEvent::ConnectionLost(cause.clone()));
    }

    fn connect_complete(&self, reconnect: bool, server: &str) {
        self.record(CallbackEvent::ConnectComplete {
            reconnect,
            server: server.to_string(),
        });
    }
}

/// Listener outcome
#[derive(Debug, Clone, PartialEq)]
pub enum ListenerEvent {
    Success { token: TokenId, kind: TokenKind },
    Failure { token: TokenId, kind: TokenKind, error: MqttError },
}

/// Token listener that records outcomes
#[derive(Debug, Default)]
pub struct RecordingListener {
    pub events: Arc<Mutex<Vec<ListenerEvent>>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn get_events(&self) -> Vec<ListenerEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn successes(&self) -> usize {
        self.get_events()
            .iter()
            .filter(|event| matches!(event, ListenerEvent::Success { .. }))
            .count()
    }

    pub fn failures(&self) -> Vec<MqttError> {
        self.get_events()
            .into_iter()
            .filter_map(|event| match event {
                ListenerEvent::Failure { error, .. } => Some(error),
                _ => None,
            })
            .collect()
    }
}

impl ActionListener for RecordingListener {
    fn on_success(&self, token: &ActionToken) {
        if let Ok(mut events) = self.events.lock() {
            events.push(ListenerEvent::Success {
                token: token.id(),
                kind: token.kind(),
            });
        }
    }

    fn on_failure(&self, token: &ActionToken, error: &MqttError) {
        if let Ok(mut events) = self.events.lock() {
            events.push(ListenerEvent::Failure {
                token: token.id(),
                kind: token.kind(),
                error: error.clone(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::QoS;

    #[tokio::test]
    async fn test_recording_callback_queues_messages() {
        let callback = RecordingCallback::new();
        callback.message_arrived("a", &Message::new("a", "1", QoS::AtMostOnce));
        callback.connect_complete(true, "mock://broker");

        let message = callback.next_message(Duration::from_millis(100)).await;
        assert_eq!(message.unwrap().payload, b"1");
        assert!(callback.next_message(Duration::from_millis(10)).await.is_none());
        assert_eq!(callback.get_connect_completions(), vec![true]);
        assert_eq!(callback.get_messages().len(), 1);
    }
}
