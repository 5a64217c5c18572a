//! Connection state, connect options and keepalive tracking
//!
//! Pure types and functions used by the engine task: nothing here performs I/O.

use crate::error::{MqttError, MqttResult};
use crate::protocol::{check_topic_name, Connect, Message};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Lifecycle of the client's network session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No transport; the only state in which `connect` is accepted
    Disconnected,
    /// Transport being opened or CONNACK awaited
    Connecting,
    /// CONNACK accepted, operations allowed
    Connected,
    /// Draining in-flight handshakes before sending DISCONNECT
    Disconnecting,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }

    /// Log a state transition at a level matching its significance
    pub fn log_transition(from: ConnectionState, to: ConnectionState, client_id: &str) {
        match (from, to) {
            (ConnectionState::Connecting, ConnectionState::Connected) => {
                info!(client_id, "Connection established");
            }
            (ConnectionState::Connected, ConnectionState::Disconnected) => {
                warn!(client_id, "Connection lost");
            }
            (ConnectionState::Disconnecting, ConnectionState::Disconnected) => {
                info!(client_id, "Disconnected");
            }
            _ => {
                info!(client_id, "Connection state: {} -> {}", from, to);
            }
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
        };
        f.write_str(name)
    }
}

/// Username and optional password sent in CONNECT
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: Option<Vec<u8>>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Options for a single connect attempt.
///
/// The engine keeps a clone of the options of the last explicit `connect`, and
/// every automatic reconnect reuses it.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectOptions {
    pub clean_session: bool,
    /// Zero disables keepalive
    pub keep_alive: Duration,
    pub connection_timeout: Duration,
    pub credentials: Option<Credentials>,
    pub will: Option<Message>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            clean_session: true,
            keep_alive: Duration::from_secs(60),
            connection_timeout: Duration::from_secs(30),
            credentials: None,
            will: None,
        }
    }
}

impl ConnectOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clean_session(mut self, clean_session: bool) -> Self {
        self.clean_session = clean_session;
        self
    }

    pub fn keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn credentials(mut self, username: impl Into<String>, password: Option<Vec<u8>>) -> Self {
        self.credentials = Some(Credentials {
            username: username.into(),
            password,
        });
        self
    }

    pub fn will(mut self, will: Message) -> Self {
        self.will = Some(will);
        self
    }

    /// Check the options before a connect attempt starts
    pub fn validate(&self) -> MqttResult<()> {
        if self.keep_alive.as_secs() > u64::from(u16::MAX) {
            return Err(MqttError::Config(format!(
                "keep_alive of {}s exceeds the protocol maximum of {}s",
                self.keep_alive.as_secs(),
                u16::MAX
            )));
        }
        if self.connection_timeout.is_zero() {
            return Err(MqttError::Config(
                "connection_timeout must be greater than 0".to_string(),
            ));
        }
        if let Some(will) = &self.will {
            check_topic_name(&will.topic)?;
        }
        Ok(())
    }

    /// Build the CONNECT packet for `client_id`
    pub fn to_connect(&self, client_id: &str) -> Connect {
        let keep_alive = u16::try_from(self.keep_alive.as_secs()).unwrap_or(u16::MAX);
        Connect {
            client_id: client_id.to_string(),
            keep_alive,
            clean_session: self.clean_session,
            username: self.credentials.as_ref().map(|c| c.username.clone()),
            password: self.credentials.as_ref().and_then(|c| c.password.clone()),
            will: self.will.clone(),
        }
    }
}

/// Keepalive bookkeeping for one connection.
///
/// A PINGREQ is due once nothing has been sent for a full interval. If its
/// PINGRESP has not arrived one further interval later the connection is dead.
#[derive(Debug, Clone)]
pub struct KeepAlive {
    interval: Duration,
    last_sent: Instant,
    ping_sent_at: Option<Instant>,
}

impl KeepAlive {
    pub fn new(interval: Duration, now: Instant) -> Self {
        Self {
            interval,
            last_sent: now,
            ping_sent_at: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.interval.is_zero()
    }

    pub fn on_send(&mut self, now: Instant) {
        self.last_sent = now;
    }

    pub fn on_ping_response(&mut self) {
        self.ping_sent_at = None;
    }

    /// Returns true (and arms the response timer) when a PINGREQ should go out
    pub fn should_ping(&mut self, now: Instant) -> bool {
        if !self.is_enabled() || self.ping_sent_at.is_some() {
            return false;
        }
        if now.saturating_duration_since(self.last_sent) >= self.interval {
            self.ping_sent_at = Some(now);
            true
        } else {
            false
        }
    }

    pub fn timed_out(&self, now: Instant) -> bool {
        match self.ping_sent_at {
            Some(sent) if self.is_enabled() => now.saturating_duration_since(sent) >= self.interval,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::QoS;

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Disconnected.to_string(), "disconnected");
        assert_eq!(ConnectionState::Disconnecting.to_string(), "disconnecting");
        assert!(ConnectionState::Connected.is_connected());
        assert!(!ConnectionState::Connecting.is_connected());
    }

    #[test]
    fn test_connect_options_defaults() {
        let options = ConnectOptions::default();
        assert!(options.clean_session);
        assert_eq!(options.keep_alive, Duration::from_secs(60));
        assert_eq!(options.connection_timeout, Duration::from_secs(30));
        assert!(options.credentials.is_none());
        assert!(options.will.is_none());
    }

    #[test]
    fn test_connect_packet_from_options() {
        let options = ConnectOptions::new()
            .clean_session(false)
            .keep_alive(Duration::from_secs(15))
            .credentials("gateway", Some(b"secret".to_vec()))
            .will(Message::new("status/gw", "offline", QoS::AtLeastOnce).with_retained(true));

        let connect = options.to_connect("gw-1");
        assert_eq!(connect.client_id, "gw-1");
        assert_eq!(connect.keep_alive, 15);
        assert!(!connect.clean_session);
        assert_eq!(connect.username.as_deref(), Some("gateway"));
        assert_eq!(connect.password.as_deref(), Some(&b"secret"[..]));
        assert!(connect.will.unwrap().retained);
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let options = ConnectOptions::new().credentials("user", Some(b"hunter2".to_vec()));
        let rendered = format!("{:?}", options.credentials.unwrap());
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn test_options_validation() {
        assert!(ConnectOptions::default().validate().is_ok());
        assert!(ConnectOptions::new()
            .keep_alive(Duration::from_secs(70_000))
            .validate()
            .is_err());
        assert!(ConnectOptions::new()
            .connection_timeout(Duration::ZERO)
            .validate()
            .is_err());
        assert!(matches!(
            ConnectOptions::new()
                .will(Message::new("status/#", "x", QoS::AtMostOnce))
                .validate(),
            Err(MqttError::InvalidTopic { .. })
        ));
    }

    #[test]
    fn test_keep_alive_ping_and_timeout() {
        let start = Instant::now();
        let interval = Duration::from_secs(10);
        let mut keep_alive = KeepAlive::new(interval, start);

        assert!(!keep_alive.should_ping(start + Duration::from_secs(9)));
        assert!(keep_alive.should_ping(start + interval));
        // Only one ping outstanding at a time
        assert!(!keep_alive.should_ping(start + Duration::from_secs(11)));

        assert!(!keep_alive.timed_out(start + Duration::from_secs(19)));
        assert!(keep_alive.timed_out(start + Duration::from_secs(20)));

        keep_alive.on_ping_response();
        assert!(!keep_alive.timed_out(start + Duration::from_secs(30)));
    }

    #[test]
    fn test_keep_alive_send_postpones_ping() {
        let start = Instant::now();
        let mut keep_alive = KeepAlive::new(Duration::from_secs(10), start);

        keep_alive.on_send(start + Duration::from_secs(8));
        assert!(!keep_alive.should_ping(start + Duration::from_secs(12)));
        assert!(keep_alive.should_ping(start + Duration::from_secs(18)));
    }

    #[test]
    fn test_keep_alive_disabled() {
        let start = Instant::now();
        let mut keep_alive = KeepAlive::new(Duration::ZERO, start);
        assert!(!keep_alive.is_enabled());
        assert!(!keep_alive.should_ping(start + Duration::from_secs(1000)));
        assert!(!keep_alive.timed_out(start + Duration::from_secs(1000)));
    }
}
