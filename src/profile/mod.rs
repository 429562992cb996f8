//! Connection profiles and their on-disk document

pub mod model;
pub mod store;

pub use model::{
    generate_client_id, generate_profile_id, ConnectionProfile, InvalidQoS, LastWill,
    ProtocolVersion, QoS, CLIENT_ID_PREFIX,
};
pub use store::{LoadedProfiles, PersistenceError, ProfileStore, CURRENT_VERSION};
