//! mqtt-engine command line
//!
//! Runs the randomized model test, replays recorded logs and publishes single
//! messages. The model and replay commands use the in-process broker unless
//! `--broker` is given, in which case they connect to the configured broker.

use clap::{Parser, Subcommand};
use mqtt_engine::client::{ConnectOptions, MqttClient};
use mqtt_engine::config::ClientConfig;
use mqtt_engine::observability::{init_default_logging, metrics};
use mqtt_engine::persistence::{MemoryPersistence, Persistence};
use mqtt_engine::protocol::QoS;
use mqtt_engine::replay::{parse_log, ModelRunner, ModelSettings, ReplayRecorder};
use mqtt_engine::testing::MockBroker;
use mqtt_engine::transport::Connector;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Asynchronous MQTT client engine
#[derive(Parser)]
#[command(name = "mqtt-engine")]
#[command(about = "MQTT client engine with model-based testing")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "MQTT_ENGINE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a randomized model test
    Model {
        #[arg(long, default_value_t = 500)]
        steps: usize,
        /// Seed for the operation sequence (random if omitted)
        #[arg(long)]
        seed: Option<u64>,
        /// Write the replay log to this file
        #[arg(long, value_name = "FILE")]
        log: Option<PathBuf>,
        /// Use the configured broker instead of the in-process one
        #[arg(long)]
        broker: bool,
    },
    /// Replay a recorded log
    Replay {
        file: PathBuf,
        #[arg(long)]
        broker: bool,
    },
    /// Publish one message to the configured broker
    Publish {
        #[arg(long)]
        topic: String,
        #[arg(long, default_value = "")]
        payload: String,
        #[arg(long, default_value_t = 0)]
        qos: u8,
        #[arg(long)]
        retain: bool,
    },
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    info!("Starting mqtt-engine v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Model {
            steps,
            seed,
            log,
            broker,
        } => run_model(&config, steps, seed, log, broker).await,
        Commands::Replay { file, broker } => run_replay(&config, &file, broker).await,
        Commands::Publish {
            topic,
            payload,
            qos,
            retain,
        } => publish_once(&config, topic, payload, qos, retain).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Shutdown complete");
}

fn load_configuration(config_path: Option<&Path>) -> CliResult<ClientConfig> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(ClientConfig::load_from_file(path)?);
    }

    for path_str in ["mqtt-engine.toml", "config/mqtt-engine.toml"] {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(ClientConfig::load_from_file(&path)?);
        }
    }

    info!("No configuration file found, using local defaults");
    Ok(ClientConfig::local("mqtt-engine"))
}

/// Build a client against either the configured broker or a fresh in-process one
fn build_client(config: &ClientConfig, use_broker: bool) -> CliResult<MqttClient> {
    let connector: Arc<dyn Connector> = if use_broker {
        Arc::new(config.connector()?)
    } else {
        Arc::new(MockBroker::new())
    };
    let persistence: Arc<dyn Persistence> = if use_broker {
        config.persistence()?
    } else {
        Arc::new(MemoryPersistence::new())
    };
    Ok(MqttClient::new(
        config.broker.client_id.clone(),
        connector,
        persistence,
        config.client_settings(),
    )?)
}

async fn run_model(
    config: &ClientConfig,
    steps: usize,
    seed: Option<u64>,
    log: Option<PathBuf>,
    use_broker: bool,
) -> CliResult<()> {
    let seed = seed.unwrap_or_else(rand::random);
    info!(steps, seed, "Running model test");

    let recorder = log.map(ReplayRecorder::to_file).transpose()?;
    let client = build_client(config, use_broker)?;
    let settings = ModelSettings {
        seed,
        ..Default::default()
    };

    let mut runner = ModelRunner::new(client.clone(), settings, recorder).await?;
    runner.initialise().await?;
    let report = runner.run(steps).await?;
    client.close().await?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    println!("{}", serde_json::to_string_pretty(&metrics().get_metrics())?);
    Ok(())
}

async fn run_replay(config: &ClientConfig, file: &Path, use_broker: bool) -> CliResult<()> {
    let text = std::fs::read_to_string(file)?;
    let events = parse_log(&text)?;
    info!(events = events.len(), file = %file.display(), "Replaying log");

    let client = build_client(config, use_broker)?;
    let mut runner = ModelRunner::new(client.clone(), ModelSettings::default(), None).await?;
    runner.initialise().await?;
    let report = runner.replay(&events).await?;
    client.close().await?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn publish_once(
    config: &ClientConfig,
    topic: String,
    payload: String,
    qos: u8,
    retain: bool,
) -> CliResult<()> {
    let qos = QoS::try_from(qos)?;
    let client = build_client(config, true)?;
    let timeout = Some(Duration::from_secs(config.session.connection_timeout_secs));

    let options: ConnectOptions = config.connect_options()?;
    client.connect(options).await?.wait_for_completion(timeout).await?;
    client
        .publish(topic.clone(), payload, qos, retain)
        .await?
        .wait_for_completion(timeout)
        .await?;
    info!(topic = %topic, qos = %qos, retain, "Message delivered");

    client
        .disconnect(Duration::from_secs(5))
        .await?
        .wait_for_completion(timeout)
        .await?;
    client.close().await?;
    Ok(())
}

fn handle_config_command(config: &ClientConfig, show: bool) -> CliResult<()> {
    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}
