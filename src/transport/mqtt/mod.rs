//! MQTT transport built on rumqttc
//!
//! Split the same way as the rest of the transport layer: pure decisions
//! are kept apart from I/O so they can be tested without a broker.
//!
//! - [`connection`] - option building and validation for 3.1.1 and 5.0
//! - [`event_router`] - maps rumqttc events of either revision to one route
//! - [`client`] - the [`Transport`](crate::transport::Transport) itself
//!
//! # Usage
//!
//! ```rust,no_run
//! use mqttdesk::config::MqttSection;
//! use mqttdesk::profile::ConnectionProfile;
//! use mqttdesk::transport::mqtt::MqttTransport;
//! use mqttdesk::transport::Transport;
//!
//! # tokio_test::block_on(async {
//! let profile = ConnectionProfile::new("local", "localhost", 1883);
//! let mut transport = MqttTransport::new(MqttSection::default());
//! transport.connect(&profile).await?;
//! let first_event = transport.next_event().await;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod event_router;

pub use client::{MqttTransport, MqttTransportFactory};
pub use connection::{configure_v4_options, configure_v5_options, MIN_KEEP_ALIVE_SECS};
pub use event_router::{EventRoute, EventRouter};
