//! Callback dispatch
//!
//! All application notifications flow through one [`Dispatcher`] owned by the
//! engine task, so callbacks and token listeners run strictly one after another
//! in the order packets were processed. A panicking callback is logged and
//! contained; it never takes the engine down.

use crate::client::tokens::ActionToken;
use crate::error::MqttError;
use crate::protocol::Message;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error};

/// Application callback for asynchronous client events.
///
/// Only `message_arrived` is required. Implementations run on the engine task
/// and must not block.
pub trait ClientCallback: Send + Sync {
    fn message_arrived(&self, topic: &str, message: &Message);

    /// A QoS 0 publish was handed to the transport or a QoS 1/2 handshake finished
    fn delivery_complete(&self, _token: &ActionToken) {}

    /// The connection dropped without an explicit disconnect
    fn connection_lost(&self, _cause: &MqttError) {}

    /// A connect or automatic reconnect succeeded
    fn connect_complete(&self, _reconnect: bool, _server: &str) {}
}

/// Notification produced by the engine
#[derive(Debug)]
pub enum DispatchEvent {
    MessageArrived(Message),
    DeliveryComplete(ActionToken),
    ConnectionLost(MqttError),
    ConnectComplete { reconnect: bool, server: String },
    ActionSucceeded(ActionToken),
    ActionFailed(ActionToken, MqttError),
}

impl DispatchEvent {
    fn name(&self) -> &'static str {
        match self {
            DispatchEvent::MessageArrived(_) => "message_arrived",
            DispatchEvent::DeliveryComplete(_) => "delivery_complete",
            DispatchEvent::ConnectionLost(_) => "connection_lost",
            DispatchEvent::ConnectComplete { .. } => "connect_complete",
            DispatchEvent::ActionSucceeded(_) => "on_success",
            DispatchEvent::ActionFailed(..) => "on_failure",
        }
    }
}

#[derive(Default)]
pub struct Dispatcher {
    callback: Option<Arc<dyn ClientCallback>>,
    dispatched: u64,
}

impl Dispatcher {
    pub fn new(callback: Option<Arc<dyn ClientCallback>>) -> Self {
        Self {
            callback,
            dispatched: 0,
        }
    }

    pub fn set_callback(&mut self, callback: Option<Arc<dyn ClientCallback>>) {
        self.callback = callback;
    }

    pub fn has_callback(&self) -> bool {
        self.callback.is_some()
    }

    /// Number of notifications delivered so far
    pub fn dispatched(&self) -> u64 {
        self.dispatched
    }

    /// Deliver one notification synchronously
    pub fn dispatch(&mut self, event: DispatchEvent) {
        let name = event.name();
        let callback = self.callback.clone();

        let outcome = catch_unwind(AssertUnwindSafe(|| match event {
            DispatchEvent::MessageArrived(message) => {
                if let Some(callback) = &callback {
                    callback.message_arrived(&message.topic, &message);
                } else {
                    debug!(topic = %message.topic, "No callback registered, dropping message");
                }
            }
            DispatchEvent::DeliveryComplete(token) => {
                if let Some(callback) = &callback {
                    callback.delivery_complete(&token);
                }
            }
            DispatchEvent::ConnectionLost(cause) => {
                if let Some(callback) = &callback {
                    callback.connection_lost(&cause);
                }
            }
            DispatchEvent::ConnectComplete { reconnect, server } => {
                if let Some(callback) = &callback {
                    callback.connect_complete(reconnect, &server);
                }
            }
            DispatchEvent::ActionSucceeded(token) => {
                if let Some(listener) = token.listener() {
                    listener.on_success(&token);
                }
            }
            DispatchEvent::ActionFailed(token, cause) => {
                if let Some(listener) = token.listener() {
                    listener.on_failure(&token, &cause);
                }
            }
        }));

        self.dispatched += 1;
        if outcome.is_err() {
            error!(callback = name, "Application callback panicked");
        }
    }
}
