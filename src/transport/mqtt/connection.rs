//! Pure option building for the MQTT transport
//!
//! Turns a [`ConnectionProfile`] plus application defaults into rumqttc
//! options for either protocol revision. Nothing here touches the network.

use crate::config::MqttSection;
use crate::profile::{ConnectionProfile, QoS};
use crate::transport::TransportError;
use rumqttc::Transport as RumqttcTransport;
use std::time::Duration;

/// rumqttc rejects shorter keep-alive intervals
pub const MIN_KEEP_ALIVE_SECS: u16 = 5;

/// Check the fields every protocol revision needs
pub fn validate_profile(profile: &ConnectionProfile) -> Result<(), TransportError> {
    if profile.host.trim().is_empty() {
        return Err(TransportError::InvalidOptions(
            "Broker host must not be empty".to_string(),
        ));
    }
    if profile.port == 0 {
        return Err(TransportError::InvalidOptions(
            "Broker port must not be 0".to_string(),
        ));
    }
    if profile.client_id.is_empty() {
        return Err(TransportError::InvalidOptions(
            "Client id must not be empty".to_string(),
        ));
    }
    if profile.client_id.starts_with(' ') {
        return Err(TransportError::InvalidOptions(
            "Client id must not start with a space".to_string(),
        ));
    }
    Ok(())
}

/// Effective keep-alive: profile value, else the default, never below the minimum
pub fn keep_alive(profile: &ConnectionProfile, defaults: &MqttSection) -> Duration {
    let secs = match profile.keep_alive_secs {
        0 => defaults.keep_alive_secs,
        secs => secs,
    };
    Duration::from_secs(u64::from(secs.max(MIN_KEEP_ALIVE_SECS)))
}

/// Effective connect handshake timeout in seconds
pub fn connect_timeout_secs(profile: &ConnectionProfile, defaults: &MqttSection) -> u64 {
    match profile.connect_timeout_secs {
        0 => u64::from(defaults.connect_timeout_secs.max(1)),
        secs => u64::from(secs),
    }
}

/// Build MQTT 3.1.1 options
pub fn configure_v4_options(
    profile: &ConnectionProfile,
    defaults: &MqttSection,
) -> Result<rumqttc::MqttOptions, TransportError> {
    validate_profile(profile)?;

    let mut options =
        rumqttc::MqttOptions::new(profile.client_id.clone(), profile.host.clone(), profile.port);
    options.set_keep_alive(keep_alive(profile, defaults));
    options.set_clean_session(profile.clean_session);

    if profile.has_credentials() {
        options.set_credentials(profile.username.clone(), profile.password.clone());
    }

    if let Some(will) = &profile.last_will {
        options.set_last_will(rumqttc::LastWill::new(
            will.topic.clone(),
            will.payload.clone(),
            to_v4_qos(will.qos),
            will.retain,
        ));
    }

    if profile.use_tls {
        options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    Ok(options)
}

/// Build MQTT 5.0 options
pub fn configure_v5_options(
    profile: &ConnectionProfile,
    defaults: &MqttSection,
) -> Result<rumqttc::v5::MqttOptions, TransportError> {
    validate_profile(profile)?;

    let mut options = rumqttc::v5::MqttOptions::new(
        profile.client_id.clone(),
        profile.host.clone(),
        profile.port,
    );
    options.set_keep_alive(keep_alive(profile, defaults));
    options.set_clean_start(profile.clean_session);
    options.set_connection_timeout(connect_timeout_secs(profile, defaults));

    if profile.has_credentials() {
        options.set_credentials(profile.username.clone(), profile.password.clone());
    }

    if let Some(will) = &profile.last_will {
        // v5 LastWill takes a trailing properties argument
        options.set_last_will(rumqttc::v5::mqttbytes::v5::LastWill::new(
            will.topic.clone(),
            will.payload.clone(),
            to_v5_qos(will.qos),
            will.retain,
            None,
        ));
    }

    if profile.use_tls {
        options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    Ok(options)
}

pub fn to_v4_qos(qos: QoS) -> rumqttc::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
    }
}

pub fn from_v4_qos(qos: rumqttc::QoS) -> QoS {
    match qos {
        rumqttc::QoS::AtMostOnce => QoS::AtMostOnce,
        rumqttc::QoS::AtLeastOnce => QoS::AtLeastOnce,
        rumqttc::QoS::ExactlyOnce => QoS::ExactlyOnce,
    }
}

pub fn to_v5_qos(qos: QoS) -> rumqttc::v5::mqttbytes::QoS {
    use rumqttc::v5::mqttbytes::QoS as V5QoS;
    match qos {
        QoS::AtMostOnce => V5QoS::AtMostOnce,
        QoS::AtLeastOnce => V5QoS::AtLeastOnce,
        QoS::ExactlyOnce => V5QoS::ExactlyOnce,
    }
}

pub fn from_v5_qos(qos: rumqttc::v5::mqttbytes::QoS) -> QoS {
    use rumqttc::v5::mqttbytes::QoS as V5QoS;
    match qos {
        V5QoS::AtMostOnce => QoS::AtMostOnce,
        V5QoS::AtLeastOnce => QoS::AtLeastOnce,
        V5QoS::ExactlyOnce => QoS::ExactlyOnce,
    }
}
