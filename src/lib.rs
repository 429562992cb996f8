//! mqttdesk - MQTT connection and session engine
//!
//! Manages a persisted list of broker connection profiles and gives each one
//! a lazily created, worker-isolated client session.
//!
//! # Overview
//!
//! - Connection profiles and their JSON document store
//! - A per-profile session state machine driven by an isolated worker task
//! - Subscription tracking with per-topic QoS and display color
//! - Batched delivery of inbound messages
//! - An MQTT 3.1.1 / 5.0 transport built on rumqttc
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use mqttdesk::{
//!     ConnectionProfile, ConnectionState, MqttTransportFactory, ProfileStore, QoS,
//!     SessionRegistry,
//! };
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let config = mqttdesk::AppConfig::default();
//! let store = ProfileStore::new("connections.json");
//! let mut registry = SessionRegistry::open(
//!     store,
//!     MqttTransportFactory::new(config.mqtt.clone()),
//!     config.session.clone(),
//! );
//!
//! let profile = ConnectionProfile::new("local", "localhost", 1883);
//! let id = profile.id.clone();
//! registry.add_profile(profile)?;
//!
//! let session = registry.client(&id)?;
//! session.request_connect().await?;
//! session
//!     .wait_for_state(ConnectionState::Connected, Duration::from_secs(5))
//!     .await?;
//! session.subscribe("sensors/#", QoS::AtLeastOnce, "#2a9d8f").await?;
//! session.publish("sensors/temp", "21.5", QoS::AtMostOnce, false).await?;
//!
//! registry.shutdown().await;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod config;
pub mod error;
pub mod observability;
pub mod profile;
pub mod registry;
pub mod session;
pub mod testing;
pub mod topic;
pub mod transport;

pub use config::{AppConfig, ConfigError, MqttSection, SessionSection, StorageSection};
pub use error::{ErrorKind, SessionError, SessionResult};
pub use profile::{
    ConnectionProfile, LastWill, PersistenceError, ProfileStore, ProtocolVersion, QoS,
};
pub use registry::{ProfileRow, RegistryEvent, SessionRegistry};
pub use session::{
    ConnectionState, Direction, Message, Session, SessionEvent, SessionStats, Subscription,
};
pub use transport::{
    MqttTransport, MqttTransportFactory, Transport, TransportError, TransportEvent,
    TransportFactory,
};
