//! Connection profile data model
//!
//! A [`ConnectionProfile`] is the durable, user-authored description of one
//! broker connection. Its `id` is generated once and never changes; every
//! other field is plain data handed to the transport on connect.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Prefix of generated client identifiers
pub const CLIENT_ID_PREFIX: &str = "mqttdesk_";

/// Delivery-guarantee level, persisted as its ordinal (0, 1, 2)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum QoS {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

#[derive(Debug, Error, PartialEq)]
#[error("Invalid QoS level: {0} (expected 0, 1 or 2)")]
pub struct InvalidQoS(pub u8);

impl TryFrom<u8> for QoS {
    type Error = InvalidQoS;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(InvalidQoS(other)),
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
        }
    }
}

impl fmt::Display for QoS {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", u8::from(*self))
    }
}

/// MQTT protocol revision spoken by a profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ProtocolVersion {
    #[default]
    #[serde(rename = "3.1.1", alias = "v3.1.1", alias = "mqtt-3.1.1")]
    V311,
    #[serde(rename = "5.0", alias = "5", alias = "v5")]
    V5,
}

impl ProtocolVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolVersion::V311 => "3.1.1",
            ProtocolVersion::V5 => "5.0",
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProtocolVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "3.1.1" | "v3.1.1" | "mqtt-3.1.1" | "3" => Ok(ProtocolVersion::V311),
            "5.0" | "5" | "v5" => Ok(ProtocolVersion::V5),
            other => Err(format!("Unsupported protocol version: {other}")),
        }
    }
}

/// Last-will message registered with the broker on connect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastWill {
    pub topic: String,
    #[serde(default)]
    pub qos: QoS,
    #[serde(default)]
    pub retain: bool,
    #[serde(default)]
    pub payload: String,
}

/// Durable connection profile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionProfile {
    /// Opaque stable identifier, unique across the profile list
    pub id: String,
    pub name: String,
    pub client_id: String,
    pub protocol: ProtocolVersion,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub use_tls: bool,
    pub clean_session: bool,
    /// Default QoS offered to subscribe/publish forms
    pub qos: QoS,
    pub description: String,
    /// Keep-alive interval; 0 means "use the application default"
    pub keep_alive_secs: u16,
    /// Connect handshake timeout; 0 means "use the application default"
    pub connect_timeout_secs: u16,
    pub last_will: Option<LastWill>,
}

impl ConnectionProfile {
    /// Create a profile with a fresh id and a random client id
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        let mut profile = Self {
            id: generate_profile_id(),
            name: name.into(),
            client_id: generate_client_id(),
            protocol: ProtocolVersion::default(),
            host: host.into(),
            port,
            username: String::new(),
            password: String::new(),
            use_tls: false,
            clean_session: true,
            qos: QoS::AtMostOnce,
            description: String::new(),
            keep_alive_secs: 0,
            connect_timeout_secs: 0,
            last_will: None,
        };
        profile.description = profile.default_description();
        profile
    }

    /// `name@host:port`
    pub fn default_description(&self) -> String {
        format!("{}@{}:{}", self.name, self.host, self.port)
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    pub fn with_tls(mut self, use_tls: bool) -> Self {
        self.use_tls = use_tls;
        self
    }

    pub fn with_protocol(mut self, protocol: ProtocolVersion) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    pub fn has_credentials(&self) -> bool {
        !self.username.is_empty()
    }
}

/// Generate a new opaque profile id
pub fn generate_profile_id() -> String {
    Uuid::new_v4().to_string()
}

/// Generate a random client id: `mqttdesk_` followed by 8 hex digits
pub fn generate_client_id() -> String {
    let simple = Uuid::new_v4().simple().to_string();
    format!("{CLIENT_ID_PREFIX}{}", &simple[..8])
}
