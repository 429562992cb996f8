//! Versioned JSON persistence for the profile list
//!
//! Document layout:
//!
//! ```json
//! { "version": 1,
//!   "items": [ { "id": "…", "name": "local", "clientId": "mqttdesk_1a2b3c4d",
//!                "protocol": "3.1.1", "host": "localhost", "port": 1883, "qos": 0,
//!                "username": "", "password": "", "tls": false, "cleanSession": true } ] }
//! ```
//!
//! Only [`CURRENT_VERSION`] is accepted. Any other version is a hard failure;
//! no migration and no best-effort parse is attempted.

use super::model::{generate_profile_id, ConnectionProfile, LastWill, ProtocolVersion, QoS};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// The only document version this build reads and writes
pub const CURRENT_VERSION: u32 = 1;

/// Profile document failures
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("Failed to access profile file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Malformed profile document {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Unsupported profile document version {found} (supported: {supported})")]
    UnsupportedVersion { found: u32, supported: u32 },
    #[error("Duplicate profile id {id} in {path}")]
    DuplicateId { path: PathBuf, id: String },
}

/// One entry of the `items` array
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct ProfileRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    name: String,
    #[serde(default)]
    client_id: String,
    #[serde(default)]
    protocol: ProtocolVersion,
    host: String,
    port: u16,
    #[serde(default)]
    qos: QoS,
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
    #[serde(default)]
    tls: bool,
    #[serde(default = "default_clean_session")]
    clean_session: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(default)]
    keep_alive: u16,
    #[serde(default)]
    timeout: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_will: Option<LastWill>,
}

fn default_clean_session() -> bool {
    true
}

impl From<&ConnectionProfile> for ProfileRecord {
    fn from(profile: &ConnectionProfile) -> Self {
        Self {
            id: Some(profile.id.clone()),
            name: profile.name.clone(),
            client_id: profile.client_id.clone(),
            protocol: profile.protocol,
            host: profile.host.clone(),
            port: profile.port,
            qos: profile.qos,
            username: profile.username.clone(),
            password: profile.password.clone(),
            tls: profile.use_tls,
            clean_session: profile.clean_session,
            description: Some(profile.description.clone()),
            keep_alive: profile.keep_alive_secs,
            timeout: profile.connect_timeout_secs,
            last_will: profile.last_will.clone(),
        }
    }
}

impl From<ProfileRecord> for ConnectionProfile {
    fn from(record: ProfileRecord) -> Self {
        let mut profile = ConnectionProfile {
            id: record.id.unwrap_or_else(generate_profile_id),
            name: record.name,
            client_id: record.client_id,
            protocol: record.protocol,
            host: record.host,
            port: record.port,
            username: record.username,
            password: record.password,
            use_tls: record.tls,
            clean_session: record.clean_session,
            qos: record.qos,
            description: String::new(),
            keep_alive_secs: record.keep_alive,
            connect_timeout_secs: record.timeout,
            last_will: record.last_will,
        };
        profile.description = match record.description {
            Some(description) if !description.is_empty() => description,
            _ => profile.default_description(),
        };
        profile
    }
}

/// Result of reading the document
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadedProfiles {
    pub profiles: Vec<ConnectionProfile>,
    /// Items that had no `id` and were given a fresh one
    pub generated_ids: usize,
}

impl LoadedProfiles {
    /// Fresh ids only last until they are written back
    pub fn needs_save(&self) -> bool {
        self.generated_ids > 0
    }
}

#[derive(Deserialize)]
struct VersionProbe {
    #[serde(default)]
    version: u32,
}

#[derive(Serialize, Deserialize)]
struct ProfileDocument {
    version: u32,
    #[serde(default)]
    items: Vec<ProfileRecord>,
}

/// Loads and saves the ordered profile list
#[derive(Debug, Clone)]
pub struct ProfileStore {
    path: PathBuf,
}

impl ProfileStore {
    /// The path is resolved by the caller; the store never guesses a location
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the profile list. A missing file yields an empty list.
    pub fn load(&self) -> Result<Vec<ConnectionProfile>, PersistenceError> {
        self.load_document().map(|loaded| loaded.profiles)
    }

    /// Like [`load`](Self::load), also reporting ids generated for items
    /// stored without one
    pub fn load_document(&self) -> Result<LoadedProfiles, PersistenceError> {
        let contents = match fs::read(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "Profile file absent, starting empty");
                return Ok(LoadedProfiles::default());
            }
            Err(source) => {
                return Err(PersistenceError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        parse_document(&self.path, &contents)
    }

    /// Write the full list, replacing the previous document atomically
    pub fn save(&self, profiles: &[ConnectionProfile]) -> Result<(), PersistenceError> {
        let contents = render_document(profiles).map_err(|source| PersistenceError::Malformed {
            path: self.path.clone(),
            source,
        })?;

        let io_err = |source| PersistenceError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        let tmp_path = temporary_path(&self.path);
        fs::write(&tmp_path, contents).map_err(io_err)?;
        if let Err(source) = fs::rename(&tmp_path, &self.path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(io_err(source));
        }

        debug!(path = %self.path.display(), count = profiles.len(), "Saved profile document");
        Ok(())
    }
}

fn temporary_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

fn parse_document(path: &Path, contents: &[u8]) -> Result<LoadedProfiles, PersistenceError> {
    let malformed = |source| PersistenceError::Malformed {
        path: path.to_path_buf(),
        source,
    };

    let probe: VersionProbe = serde_json::from_slice(contents).map_err(malformed)?;
    if probe.version != CURRENT_VERSION {
        return Err(PersistenceError::UnsupportedVersion {
            found: probe.version,
            supported: CURRENT_VERSION,
        });
    }

    let document: ProfileDocument = serde_json::from_slice(contents).map_err(malformed)?;
    let generated_ids = document.items.iter().filter(|item| item.id.is_none()).count();
    let profiles: Vec<ConnectionProfile> = document.items.into_iter().map(Into::into).collect();

    let mut seen = HashSet::new();
    for profile in &profiles {
        if !seen.insert(profile.id.as_str()) {
            return Err(PersistenceError::DuplicateId {
                path: path.to_path_buf(),
                id: profile.id.clone(),
            });
        }
    }

    Ok(LoadedProfiles {
        profiles,
        generated_ids,
    })
}

fn render_document(profiles: &[ConnectionProfile]) -> Result<Vec<u8>, serde_json::Error> {
    let document = ProfileDocument {
        version: CURRENT_VERSION,
        items: profiles.iter().map(ProfileRecord::from).collect(),
    };
    serde_json::to_vec_pretty(&document)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_in(dir: &TempDir) -> ProfileStore {
        ProfileStore::new(dir.path().join("connections.json"))
    }

    #[test]
    fn test_missing_file_is_empty_list() {
        let dir = TempDir::new().unwrap();
        let profiles = store_in(&dir).load().unwrap();
        assert!(profiles.is_empty());
    }

    #[test]
    fn test_save_then_load_preserves_order_and_ids() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        let mut second = ConnectionProfile::new("cloud", "broker.example.com", 8883).with_tls(true);
        second.last_will = Some(LastWill {
            topic: "clients/offline".to_string(),
            qos: QoS::AtLeastOnce,
            retain: true,
            payload: "bye".to_string(),
        });
        let profiles = vec![ConnectionProfile::new("local", "localhost", 1883), second];

        store.save(&profiles).unwrap();
        let loaded = store.load().unwrap();

        assert_eq!(loaded, profiles);
        assert!(!temporary_path(store.path()).exists());
    }

    #[test]
    fn test_rejects_unsupported_version() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        fs::write(store.path(), r#"{"version": 2, "items": []}"#).unwrap();

        let err = store.load().unwrap_err();
        assert!(matches!(
            err,
            PersistenceError::UnsupportedVersion {
                found: 2,
                supported: 1
            }
        ));
    }

    #[test]
    fn test_missing_version_is_unsupported() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        fs::write(store.path(), r#"{"items": []}"#).unwrap();

        assert!(matches!(
            store.load(),
            Err(PersistenceError::UnsupportedVersion { found: 0, .. })
        ));
    }

    #[test]
    fn test_rejects_malformed_document() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        fs::write(store.path(), "not json at all").unwrap();
        assert!(matches!(store.load(), Err(PersistenceError::Malformed { .. })));

        fs::write(store.path(), r#"{"version": 1, "items": [{"name": "x"}]}"#).unwrap();
        assert!(matches!(store.load(), Err(PersistenceError::Malformed { .. })));
    }

    #[test]
    fn test_minimal_item_gets_defaults() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        fs::write(
            store.path(),
            r#"{"version": 1, "items": [{"name": "local", "host": "localhost", "port": 1883}]}"#,
        )
        .unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 1);
        let profile = &loaded[0];
        assert!(!profile.id.is_empty());
        assert_eq!(profile.description, "local@localhost:1883");
        assert!(profile.clean_session);
        assert_eq!(profile.qos, QoS::AtMostOnce);
        assert_eq!(profile.protocol, ProtocolVersion::V311);
    }

    #[test]
    fn test_load_document_counts_generated_ids() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        fs::write(
            store.path(),
            r#"{"version": 1, "items": [
                {"id": "kept", "name": "a", "host": "h", "port": 1},
                {"name": "b", "host": "h", "port": 2}
            ]}"#,
        )
        .unwrap();

        let loaded = store.load_document().unwrap();
        assert_eq!(loaded.generated_ids, 1);
        assert!(loaded.needs_save());
        assert_eq!(loaded.profiles[0].id, "kept");

        store.save(&loaded.profiles).unwrap();
        let reloaded = store.load_document().unwrap();
        assert!(!reloaded.needs_save());
        assert_eq!(reloaded.profiles, loaded.profiles);
    }

    #[test]
    fn test_rejects_duplicate_ids() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        fs::write(
            store.path(),
            r#"{"version": 1, "items": [
                {"id": "a", "name": "one", "host": "h", "port": 1},
                {"id": "a", "name": "two", "host": "h", "port": 2}
            ]}"#,
        )
        .unwrap();

        assert!(matches!(
            store.load(),
            Err(PersistenceError::DuplicateId { ref id, .. }) if id == "a"
        ));
    }

    #[test]
    fn test_document_uses_documented_keys() {
        let profile = ConnectionProfile::new("local", "localhost", 1883);
        let rendered = render_document(std::slice::from_ref(&profile)).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&rendered).unwrap();

        assert_eq!(value["version"], 1);
        let item = &value["items"][0];
        for key in [
            "name",
            "clientId",
            "protocol",
            "host",
            "port",
            "qos",
            "username",
            "password",
            "tls",
            "cleanSession",
        ] {
            assert!(item.get(key).is_some(), "missing key {key}");
        }
        assert_eq!(item["id"], profile.id.as_str());
    }

    #[test]
    fn test_save_creates_parent_directory() {
        let dir = TempDir::new().unwrap();
        let store = ProfileStore::new(dir.path().join("nested/config/connections.json"));
        store.save(&[]).unwrap();
        assert!(store.load().unwrap().is_empty());
    }
}
