//! mqttdesk - command-line entry point
//!
//! Manages connection profiles and drives sessions from a terminal.

use clap::{Parser, Subcommand};
use mqttdesk::observability::{init_default_logging, init_logging, LogFormat};
use mqttdesk::{
    AppConfig, ConnectionProfile, ConnectionState, MqttTransportFactory, ProfileStore,
    ProtocolVersion, QoS, SessionEvent, SessionRegistry,
};
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn, Level};

/// Default config locations tried when `--config` is not given
const DEFAULT_CONFIG_PATHS: &[&str] = &["mqttdesk.toml", "config/mqttdesk.toml"];

/// Color given to subscriptions made from the command line
const CLI_SUBSCRIPTION_COLOR: &str = "#2a9d8f";

/// MQTT connection manager
#[derive(Parser)]
#[command(name = "mqttdesk")]
#[command(about = "Manage MQTT connection profiles and sessions")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "MQTTDESK_CONFIG")]
    config: Option<PathBuf>,

    /// Profile document path, overriding the configuration
    #[arg(short, long, value_name = "FILE", env = "MQTTDESK_PROFILES")]
    profiles: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List saved profiles
    List,
    /// Add a profile and print its id
    Add {
        #[arg(long)]
        name: String,
        #[arg(long)]
        host: String,
        #[arg(long, default_value_t = 1883)]
        port: u16,
        /// Defaults to a generated `mqttdesk_` id
        #[arg(long)]
        client_id: Option<String>,
        #[arg(long, default_value = "3.1.1")]
        protocol: ProtocolVersion,
        #[arg(long, default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=2))]
        qos: u8,
        #[arg(long)]
        username: Option<String>,
        #[arg(long, requires = "username")]
        password: Option<String>,
        #[arg(long)]
        tls: bool,
        #[arg(long)]
        no_clean_session: bool,
    },
    /// Delete a profile
    Delete {
        /// Profile id
        id: String,
    },
    /// Connect, subscribe and print incoming messages until interrupted
    Watch {
        /// Profile id
        id: String,
        /// Topic filter; repeat for several. Defaults to `#`
        #[arg(short, long = "topic")]
        topics: Vec<String>,
        #[arg(long, default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=2))]
        qos: u8,
    },
    /// Connect, publish one message and disconnect
    Publish {
        /// Profile id
        id: String,
        topic: String,
        payload: String,
        #[arg(long, default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=2))]
        qos: u8,
        #[arg(long)]
        retain: bool,
    },
}

type Registry = SessionRegistry<MqttTransportFactory>;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.verbose {
        0 => init_default_logging(),
        1 => init_logging(Level::DEBUG, LogFormat::Compact, false),
        _ => init_logging(Level::TRACE, LogFormat::Compact, true),
    }

    let mut config = match load_configuration(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };
    if let Some(path) = cli.profiles {
        config.storage.profiles_file = path;
    }

    let mut registry = SessionRegistry::open(
        ProfileStore::new(config.storage.profiles_file.clone()),
        MqttTransportFactory::new(config.mqtt.clone()),
        config.session.clone(),
    );

    let result = match cli.command {
        Commands::List => list_profiles(&registry),
        Commands::Add {
            name,
            host,
            port,
            client_id,
            protocol,
            qos,
            username,
            password,
            tls,
            no_clean_session,
        } => {
            let mut profile = ConnectionProfile::new(name, host, port)
                .with_protocol(protocol)
                .with_qos(to_qos(qos))
                .with_tls(tls);
            if let Some(client_id) = client_id {
                profile.client_id = client_id;
            }
            if let Some(username) = username {
                profile = profile.with_credentials(username, password.unwrap_or_default());
            }
            profile.clean_session = !no_clean_session;
            add_profile(&mut registry, profile)
        }
        Commands::Delete { id } => delete_profile(&mut registry, &id).await,
        Commands::Watch { id, topics, qos } => {
            watch(&mut registry, &id, topics, to_qos(qos), &config).await
        }
        Commands::Publish {
            id,
            topic,
            payload,
            qos,
            retain,
        } => publish(&mut registry, &id, &topic, payload, to_qos(qos), retain, &config).await,
    };

    registry.shutdown().await;

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(path: Option<&Path>) -> Result<AppConfig, Box<dyn std::error::Error>> {
    if let Some(path) = path {
        info!("Loading configuration from: {}", path.display());
        return Ok(AppConfig::load_from_file(path)?);
    }

    for candidate in DEFAULT_CONFIG_PATHS {
        let path = Path::new(candidate);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(AppConfig::load_from_file(path)?);
        }
    }

    Ok(AppConfig::default())
}

fn to_qos(level: u8) -> QoS {
    // clap already restricts the range
    QoS::try_from(level).unwrap_or_default()
}

fn list_profiles(registry: &Registry) -> Result<(), Box<dyn std::error::Error>> {
    if registry.is_empty() {
        println!("No profiles in {}", registry.store().path().display());
        return Ok(());
    }

    for row in registry.rows() {
        println!(
            "{}  {:<20} {}:{}  v{}  qos{}  {}{}",
            row.id,
            row.name,
            row.host,
            row.port,
            row.protocol,
            row.qos,
            row.client_id,
            if row.tls { "  tls" } else { "" },
        );
    }
    Ok(())
}

fn add_profile(
    registry: &mut Registry,
    profile: ConnectionProfile,
) -> Result<(), Box<dyn std::error::Error>> {
    let id = profile.id.clone();
    registry.add_profile(profile)?;
    println!("{id}");
    Ok(())
}

async fn delete_profile(registry: &mut Registry, id: &str) -> Result<(), Box<dyn std::error::Error>> {
    if registry.profile(id).is_none() {
        return Err(format!("Unknown profile: {id}").into());
    }
    registry.delete_profile(id).await?;
    Ok(())
}

async fn connect(
    registry: &mut Registry,
    id: &str,
    config: &AppConfig,
) -> Result<std::sync::Arc<mqttdesk::Session>, Box<dyn std::error::Error>> {
    let session = registry.client(id)?;
    session.request_connect().await?;

    // Handshake budget plus a margin for the worker round trip
    let wait = Duration::from_secs(u64::from(config.mqtt.connect_timeout_secs) + 1);
    session
        .wait_for_state(ConnectionState::Connected, wait)
        .await?;
    info!(profile_id = %id, "Connected");
    Ok(session)
}

async fn watch(
    registry: &mut Registry,
    id: &str,
    mut topics: Vec<String>,
    qos: QoS,
    config: &AppConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let session = connect(registry, id, config).await?;
    let mut events = session.events();

    if topics.is_empty() {
        topics.push("#".to_string());
    }
    for topic in &topics {
        session.subscribe(topic, qos, CLI_SUBSCRIPTION_COLOR).await?;
    }

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down gracefully...");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down gracefully...");
                break;
            }
            event = events.recv() => match event {
                Ok(SessionEvent::MessagesReceived(batch)) => {
                    for message in batch {
                        println!(
                            "{} [{}] {}{}",
                            message.timestamp.format("%H:%M:%S%.3f"),
                            message.topic,
                            message.payload_text(),
                            if message.retain { " (retained)" } else { "" },
                        );
                    }
                }
                Ok(SessionEvent::SubscriptionAcknowledged { success: false }) => {
                    warn!("Broker rejected a subscription");
                }
                Ok(SessionEvent::StateChanged(ConnectionState::Disconnected)) => {
                    error!("Connection lost");
                    break;
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Output fell behind"),
                Err(RecvError::Closed) => break,
            }
        }
    }

    let stats = session.stats();
    info!(
        received = stats.received,
        published = stats.published,
        "Watch finished"
    );
    Ok(())
}

async fn publish(
    registry: &mut Registry,
    id: &str,
    topic: &str,
    payload: String,
    qos: QoS,
    retain: bool,
    config: &AppConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let session = connect(registry, id, config).await?;
    session.publish(topic, payload, qos, retain).await?;
    info!(profile_id = %id, topic, "Published");
    Ok(())
}
