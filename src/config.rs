//! TOML configuration for the client and the `mqtt-engine` binary
//!
//! Every section except `[broker]` is optional and falls back to the same
//! defaults as [`ConnectOptions`] and [`ClientSettings`]. Credentials are
//! never stored in the file: `username_env` and `password_env` name
//! environment variables that are read when connect options are built.

use crate::client::{ClientSettings, ConnectOptions, ReconnectConfig, RetryPolicy};
use crate::persistence::{FilePersistence, MemoryPersistence, Persistence};
use crate::protocol::{validate_client_id, validate_topic_name, Message, QoS};
use crate::transport::codec::MAX_REMAINING_LENGTH;
use crate::transport::tcp::{TcpConnector, DEFAULT_MAX_PACKET_SIZE};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Main client configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    pub broker: BrokerSection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub delivery: DeliverySection,
    #[serde(default)]
    pub reconnect: ReconnectSection,
    #[serde(default)]
    pub persistence: PersistenceSection,
    #[serde(default)]
    pub engine: EngineSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSection {
    /// Broker URL, `mqtt://host:port` or `tcp://host:port`
    pub url: String,
    pub client_id: String,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSection {
    #[serde(default = "default_clean_session")]
    pub clean_session: bool,
    /// Zero disables keepalive
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_connection_timeout_secs")]
    pub connection_timeout_secs: u64,
    pub will: Option<WillSection>,
}

fn default_clean_session() -> bool {
    true
}

fn default_keep_alive_secs() -> u64 {
    60
}

fn default_connection_timeout_secs() -> u64 {
    30
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            clean_session: default_clean_session(),
            keep_alive_secs: default_keep_alive_secs(),
            connection_timeout_secs: default_connection_timeout_secs(),
            will: None,
        }
    }
}

/// Last-will message published by the broker on an ungraceful close
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WillSection {
    pub topic: String,
    #[serde(default)]
    pub payload: String,
    #[serde(default)]
    pub qos: u8,
    #[serde(default)]
    pub retained: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeliverySection {
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    #[serde(default = "default_max_retry_interval_ms")]
    pub max_retry_interval_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_max_inflight")]
    pub max_inflight: usize,
}

fn default_ack_timeout_ms() -> u64 {
    10_000
}

fn default_max_retry_interval_ms() -> u64 {
    60_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_max_inflight() -> usize {
    100
}

impl Default for DeliverySection {
    fn default() -> Self {
        Self {
            ack_timeout_ms: default_ack_timeout_ms(),
            max_retry_interval_ms: default_max_retry_interval_ms(),
            max_retries: default_max_retries(),
            max_inflight: default_max_inflight(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectSection {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Consecutive attempts after one loss
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    120_000
}

fn default_max_attempts() -> u32 {
    10
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PersistenceKind {
    #[default]
    Memory,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PersistenceSection {
    #[serde(default)]
    pub kind: PersistenceKind,
    /// Base directory for `kind = "file"`; each client gets a subdirectory
    pub directory: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineSection {
    #[serde(default = "default_timer_resolution_ms")]
    pub timer_resolution_ms: u64,
    #[serde(default = "default_command_buffer")]
    pub command_buffer: usize,
    /// Largest inbound packet accepted from the broker, in bytes
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
}

fn default_timer_resolution_ms() -> u64 {
    100
}

fn default_command_buffer() -> usize {
    64
}

fn default_max_packet_size() -> usize {
    DEFAULT_MAX_PACKET_SIZE
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            timer_resolution_ms: default_timer_resolution_ms(),
            command_buffer: default_command_buffer(),
            max_packet_size: default_max_packet_size(),
        }
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid client ID: {0}")]
    InvalidClientId(String),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ClientConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        content.parse()
    }

    /// Configuration for a local broker with every default
    pub fn local(client_id: impl Into<String>) -> Self {
        Self {
            broker: BrokerSection {
                url: "mqtt://localhost:1883".to_string(),
                client_id: client_id.into(),
                username_env: None,
                password_env: None,
            },
            session: SessionSection::default(),
            delivery: DeliverySection::default(),
            reconnect: ReconnectSection::default(),
            persistence: PersistenceSection::default(),
            engine: EngineSection::default(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_client_id(&self.broker.client_id)
            .map_err(|e| ConfigError::InvalidClientId(e.to_string()))?;
        TcpConnector::from_url(&self.broker.url)
            .map_err(|e| ConfigError::InvalidBrokerUrl(e.to_string()))?;

        if let Some(will) = &self.session.will {
            validate_topic_name(&will.topic)
                .map_err(|e| ConfigError::InvalidConfig(format!("session.will.topic: {e}")))?;
            QoS::try_from(will.qos)
                .map_err(|e| ConfigError::InvalidConfig(format!("session.will.qos: {e}")))?;
        }
        if self.session.connection_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "session.connection_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.delivery.ack_timeout_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "delivery.ack_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.delivery.max_retry_interval_ms < self.delivery.ack_timeout_ms {
            return Err(ConfigError::InvalidConfig(
                "delivery.max_retry_interval_ms must not be below ack_timeout_ms".to_string(),
            ));
        }
        if self.engine.max_packet_size == 0 || self.engine.max_packet_size > MAX_REMAINING_LENGTH {
            return Err(ConfigError::InvalidConfig(format!(
                "engine.max_packet_size must be between 1 and {MAX_REMAINING_LENGTH}"
            )));
        }
        if self.persistence.kind == PersistenceKind::File && self.persistence.directory.is_none() {
            return Err(ConfigError::InvalidConfig(
                "persistence.directory is required when kind = \"file\"".to_string(),
            ));
        }

        self.client_settings()
            .validate()
            .map_err(|e| ConfigError::InvalidConfig(e.to_string()))
    }

    /// Resolve a credential from the environment variable it names
    fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
        env_var_name.and_then(|name| std::env::var(name).ok())
    }

    pub fn get_username(&self) -> Option<String> {
        Self::get_env_var_optional(self.broker.username_env.as_ref())
    }

    pub fn get_password(&self) -> Option<String> {
        Self::get_env_var_optional(self.broker.password_env.as_ref())
    }

    /// Build connect options, resolving credentials now
    pub fn connect_options(&self) -> Result<ConnectOptions, ConfigError> {
        let mut options = ConnectOptions::new()
            .clean_session(self.session.clean_session)
            .keep_alive(Duration::from_secs(self.session.keep_alive_secs))
            .connection_timeout(Duration::from_secs(self.session.connection_timeout_secs));

        if let Some(env) = &self.broker.username_env {
            let username = self
                .get_username()
                .ok_or_else(|| ConfigError::EnvVarNotFound(env.clone()))?;
            options = options.credentials(username, self.get_password().map(String::into_bytes));
        }

        if let Some(will) = &self.session.will {
            let qos = QoS::try_from(will.qos).map_err(ConfigError::InvalidConfig)?;
            options = options.will(
                Message::new(will.topic.clone(), will.payload.clone(), qos)
                    .with_retained(will.retained),
            );
        }
        Ok(options)
    }

    pub fn client_settings(&self) -> ClientSettings {
        ClientSettings {
            retry: RetryPolicy {
                ack_timeout: Duration::from_millis(self.delivery.ack_timeout_ms),
                max_retry_interval: Duration::from_millis(self.delivery.max_retry_interval_ms),
                max_retries: self.delivery.max_retries,
            },
            reconnect: ReconnectConfig {
                max_attempts: self.reconnect.max_attempts,
                initial_delay_ms: self.reconnect.initial_delay_ms,
                max_delay_ms: self.reconnect.max_delay_ms,
            },
            max_inflight: self.delivery.max_inflight,
            timer_resolution: Duration::from_millis(self.engine.timer_resolution_ms),
            command_buffer: self.engine.command_buffer,
        }
    }

    /// Open the configured persistence store
    pub fn persistence(&self) -> Result<Arc<dyn Persistence>, ConfigError> {
        match (self.persistence.kind, &self.persistence.directory) {
            (PersistenceKind::Memory, _) => Ok(Arc::new(MemoryPersistence::new())),
            (PersistenceKind::File, Some(directory)) => {
                let store = FilePersistence::for_client(directory, &self.broker.client_id)
                    .map_err(|e| ConfigError::InvalidConfig(e.to_string()))?;
                Ok(Arc::new(store))
            }
            (PersistenceKind::File, None) => Err(ConfigError::InvalidConfig(
                "persistence.directory is required when kind = \"file\"".to_string(),
            )),
        }
    }

    pub fn connector(&self) -> Result<TcpConnector, ConfigError> {
        TcpConnector::from_url(&self.broker.url)
            .map(|connector| connector.with_max_packet_size(self.engine.max_packet_size))
            .map_err(|e| ConfigError::InvalidBrokerUrl(e.to_string()))
    }
}

impl std::str::FromStr for ClientConfig {
    type Err = ConfigError;

    /// Parse and validate configuration text
    fn from_str(content: &str) -> Result<Self, Self::Err> {
        let config: ClientConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_config() {
        let toml_content = r#"
[broker]
url = "mqtt://broker.example.com:1884"
client_id = "sensor-7"
username_env = "MQTT_ENGINE_TEST_USER_FULL"

[session]
clean_session = false
keep_alive_secs = 15
connection_timeout_secs = 5

[session.will]
topic = "sensors/7/status"
payload = "offline"
qos = 1
retained = true

[delivery]
ack_timeout_ms = 500
max_retry_interval_ms = 4000
max_retries = 5
max_inflight = 20

[reconnect]
initial_delay_ms = 250
max_delay_ms = 8000
max_attempts = 3

[engine]
timer_resolution_ms = 20
command_buffer = 16
max_packet_size = 65536
"#;
        let config: ClientConfig = toml_content.parse().unwrap();
        assert_eq!(config.broker.client_id, "sensor-7");
        assert!(!config.session.clean_session);
        assert_eq!(config.delivery.max_inflight, 20);

        let settings = config.client_settings();
        assert_eq!(settings.retry.ack_timeout, Duration::from_millis(500));
        assert_eq!(settings.retry.max_retries, 5);
        assert_eq!(settings.reconnect.max_attempts, 3);
        assert_eq!(settings.timer_resolution, Duration::from_millis(20));

        let connector = config.connector().unwrap();
        assert_eq!(connector.host(), "broker.example.com");
        assert_eq!(connector.port(), 1884);
        assert_eq!(connector.max_packet_size(), 65536);

        // Username variable is not set
        assert!(matches!(
            config.connect_options(),
            Err(ConfigError::EnvVarNotFound(_))
        ));
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let toml_content = r#"
[broker]
url = "mqtt://localhost"
client_id = "minimal"
"#;
        let config: ClientConfig = toml_content.parse().unwrap();
        assert_eq!(config, {
            let mut local = ClientConfig::local("minimal");
            local.broker.url = "mqtt://localhost".to_string();
            local
        });

        let options = config.connect_options().unwrap();
        assert!(options.clean_session);
        assert_eq!(options.keep_alive, Duration::from_secs(60));
        assert!(options.credentials.is_none());
        assert!(options.will.is_none());
        assert_eq!(config.client_settings().max_inflight, 100);
    }

    #[test]
    fn test_credentials_from_environment() {
        std::env::set_var("MQTT_ENGINE_TEST_USER_CREDS", "alice");
        std::env::set_var("MQTT_ENGINE_TEST_PASS_CREDS", "secret");

        let mut config = ClientConfig::local("creds");
        config.broker.username_env = Some("MQTT_ENGINE_TEST_USER_CREDS".to_string());
        config.broker.password_env = Some("MQTT_ENGINE_TEST_PASS_CREDS".to_string());

        let credentials = config.connect_options().unwrap().credentials.unwrap();
        assert_eq!(credentials.username, "alice");
        assert_eq!(credentials.password.as_deref(), Some(b"secret".as_slice()));
    }

    #[test]
    fn test_invalid_client_id() {
        let toml_content = r#"
[broker]
url = "mqtt://localhost"
client_id = ""
"#;
        let result: Result<ClientConfig, _> = toml_content.parse();
        assert!(matches!(result, Err(ConfigError::InvalidClientId(_))));
    }

    #[test]
    fn test_tls_url_rejected() {
        let mut config = ClientConfig::local("tls");
        config.broker.url = "mqtts://localhost:8883".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidBrokerUrl(_))
        ));
    }

    #[test]
    fn test_invalid_numeric_bounds() {
        let mut config = ClientConfig::local("bounds");
        config.delivery.max_inflight = 0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidConfig(_))));

        let mut config = ClientConfig::local("bounds");
        config.delivery.max_retry_interval_ms = 10;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidConfig(_))));

        let mut config = ClientConfig::local("bounds");
        config.engine.timer_resolution_ms = 0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidConfig(_))));

        let mut config = ClientConfig::local("bounds");
        config.engine.max_packet_size = 0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_will_with_wildcard_rejected() {
        let mut config = ClientConfig::local("will");
        config.session.will = Some(WillSection {
            topic: "status/#".to_string(),
            payload: "gone".to_string(),
            qos: 0,
            retained: false,
        });
        assert!(matches!(config.validate(), Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_file_persistence_requires_directory() {
        let mut config = ClientConfig::local("files");
        config.persistence.kind = PersistenceKind::File;
        assert!(config.validate().is_err());

        let dir = tempfile::tempdir().unwrap();
        config.persistence.directory = Some(dir.path().to_path_buf());
        config.validate().unwrap();
        let store = config.persistence().unwrap();
        assert!(store.all_keys().unwrap().is_empty());
    }
}
