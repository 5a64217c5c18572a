//! Error types for the MQTT client engine
//!
//! Every failure a caller, a token or a listener can observe is an [`MqttError`].
//! The type is `Clone` because a single failure is handed to the token, its
//! listener and every task waiting on that token.

use crate::client::ConnectionState;
use crate::protocol::ConnectReturnCode;
use thiserror::Error;

/// Main error type for client operations
#[derive(Debug, Clone, Error, PartialEq)]
pub enum MqttError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Delivery of packet {packet_id} timed out after {attempts} attempts")]
    DeliveryTimeout { packet_id: u16, attempts: u32 },

    #[error("Cannot {operation} while {state}")]
    StateMismatch {
        operation: &'static str,
        state: ConnectionState,
    },

    #[error("Client is already connected")]
    AlreadyConnected,

    #[error("Client is already disconnected")]
    AlreadyDisconnected,

    #[error("Session state was lost before the operation completed")]
    SessionLost,

    #[error("Connection refused by broker: {0}")]
    ConnectionRefused(ConnectReturnCode),

    #[error("No packet identifier available: {max_inflight} operations already in flight")]
    NoPacketIdAvailable { max_inflight: usize },

    #[error("Subscription to '{filter}' rejected by broker")]
    SubscriptionRejected { filter: String },

    #[error("Invalid topic '{topic}': {reason}")]
    InvalidTopic { topic: String, reason: String },

    #[error("Invalid client identifier: {0}")]
    InvalidClientId(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Client has been closed")]
    ClientClosed,
}

impl MqttError {
    /// Create transport error
    pub fn transport<S: Into<String>>(message: S) -> Self {
        Self::Transport(message.into())
    }

    /// Create protocol violation error
    pub fn protocol_violation<S: Into<String>>(message: S) -> Self {
        Self::ProtocolViolation(message.into())
    }

    /// Create timeout error
    pub fn timeout<S: Into<String>>(message: S) -> Self {
        Self::Timeout(message.into())
    }

    /// Create invalid topic error
    pub fn invalid_topic<T: Into<String>, R: Into<String>>(topic: T, reason: R) -> Self {
        Self::InvalidTopic {
            topic: topic.into(),
            reason: reason.into(),
        }
    }

    /// Create persistence error
    pub fn persistence<S: Into<String>>(message: S) -> Self {
        Self::Persistence(message.into())
    }

    /// True for failures that end the current network connection
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            MqttError::Transport(_)
                | MqttError::ProtocolViolation(_)
                | MqttError::Codec(_)
                | MqttError::Timeout(_)
        )
    }
}

impl From<std::io::Error> for MqttError {
    fn from(error: std::io::Error) -> Self {
        MqttError::Transport(error.to_string())
    }
}

impl From<serde_json::Error> for MqttError {
    fn from(error: serde_json::Error) -> Self {
        MqttError::Persistence(error.to_string())
    }
}

/// Result type for client operations
pub type MqttResult<T> = Result<T, MqttError>;
