//! Profile ownership and the per-profile session cache
//!
//! [`SessionRegistry`] owns the ordered profile list and at most one cached
//! [`Session`] per profile id. It is meant to be driven from a single owner
//! (`&mut self` for every structural change); sessions themselves are shared
//! as `Arc<Session>` and can be used from anywhere.
//!
//! Observers follow the list through [`RegistryEvent`]s: row insertions and
//! removals from profile CRUD, and `RowChanged` whenever a cached session
//! changes state.

use crate::config::SessionSection;
use crate::error::{SessionError, SessionResult};
use crate::profile::{
    ConnectionProfile, LoadedProfiles, PersistenceError, ProfileStore, ProtocolVersion, QoS,
};
use crate::registry_span;
use crate::session::{ConnectionState, Session, SessionEvent};
use crate::transport::TransportFactory;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// Change notifications for the profile list
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    RowInserted { index: usize, id: String },
    RowRemoved { index: usize, id: String },
    /// The row's connection state changed
    RowChanged { id: String },
    /// The list was replaced by a reload
    Reloaded,
}

/// Flat read model of one profile plus its live connection state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileRow {
    pub id: String,
    pub name: String,
    pub client_id: String,
    pub protocol: ProtocolVersion,
    pub host: String,
    pub port: u16,
    pub qos: QoS,
    pub username: String,
    pub password: String,
    pub tls: bool,
    pub clean_session: bool,
    pub description: String,
    pub connection_state: ConnectionState,
}

impl ProfileRow {
    fn new(profile: &ConnectionProfile, connection_state: ConnectionState) -> Self {
        Self {
            id: profile.id.clone(),
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
            description: profile.description.clone(),
            connection_state,
        }
    }
}

struct CachedSession {
    session: Arc<Session>,
    forwarder: JoinHandle<()>,
}

impl CachedSession {
    async fn close(self) {
        self.session.close().await;
        self.forwarder.abort();
    }
}

/// Owns profiles and lazily creates one session per profile
pub struct SessionRegistry<F: TransportFactory> {
    store: ProfileStore,
    factory: F,
    settings: SessionSection,
    profiles: Vec<ConnectionProfile>,
    sessions: HashMap<String, CachedSession>,
    changes: broadcast::Sender<RegistryEvent>,
}

impl<F: TransportFactory> SessionRegistry<F> {
    /// Load the profile document and build the registry
    ///
    /// A load failure is logged and the registry starts empty; the document
    /// on disk is left alone until the next successful save.
    pub fn open(store: ProfileStore, factory: F, settings: SessionSection) -> Self {
        let profiles = match store.load_document() {
            Ok(loaded) => {
                info!(path = %store.path().display(), count = loaded.profiles.len(), "Loaded profiles");
                Self::persist_generated_ids(&store, &loaded);
                loaded.profiles
            }
            Err(e) => {
                error!(path = %store.path().display(), error = %e, "Failed to load profiles, starting empty");
                Vec::new()
            }
        };
        let (changes, _) = broadcast::channel(settings.event_capacity.max(1));

        Self {
            store,
            factory,
            settings,
            profiles,
            sessions: HashMap::new(),
            changes,
        }
    }

    /// Re-read the document from disk
    ///
    /// On failure the in-memory list is untouched. Cached sessions whose
    /// profile no longer exists are torn down.
    pub async fn reload(&mut self) -> SessionResult<()> {
        let loaded = self
            .store
            .load_document()
            .map_err(|e| self.persistence_failed("reload", e))?;
        Self::persist_generated_ids(&self.store, &loaded);
        let profiles = loaded.profiles;

        let stale: Vec<String> = self
            .sessions
            .keys()
            .filter(|id| !profiles.iter().any(|p| &p.id == *id))
            .cloned()
            .collect();
        for id in stale {
            if let Some(cached) = self.sessions.remove(&id) {
                debug!(profile_id = %id, "Closing session of vanished profile");
                cached.close().await;
            }
        }

        info!(count = profiles.len(), "Reloaded profiles");
        self.profiles = profiles;
        self.notify(RegistryEvent::Reloaded);
        Ok(())
    }

    /// Write back ids generated for items stored without one, so they stay
    /// stable across restarts
    fn persist_generated_ids(store: &ProfileStore, loaded: &LoadedProfiles) {
        if !loaded.needs_save() {
            return;
        }
        match store.save(&loaded.profiles) {
            Ok(()) => info!(count = loaded.generated_ids, "Persisted generated profile ids"),
            Err(e) => warn!(error = %e, "Failed to persist generated profile ids"),
        }
    }

    /// Profiles in insertion order
    pub fn all_profiles(&self) -> &[ConnectionProfile] {
        &self.profiles
    }

    pub fn profile(&self, id: &str) -> Option<&ConnectionProfile> {
        self.profiles.iter().find(|p| p.id == id)
    }

    pub fn profile_id_at(&self, index: usize) -> Option<&str> {
        self.profiles.get(index).map(|p| p.id.as_str())
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    pub fn store(&self) -> &ProfileStore {
        &self.store
    }

    /// Append a profile and persist the list
    pub fn add_profile(&mut self, profile: ConnectionProfile) -> SessionResult<()> {
        if self.index_of(&profile.id).is_some() {
            warn!(profile_id = %profile.id, "Rejected duplicate profile id");
            return Err(SessionError::DuplicateProfile { id: profile.id });
        }

        let id = profile.id.clone();
        self.profiles.push(profile);
        if let Err(e) = self.store.save(&self.profiles) {
            self.profiles.pop();
            return Err(self.persistence_failed("add profile", e));
        }

        let index = self.profiles.len() - 1;
        info!(profile_id = %id, index, "Profile added");
        self.notify(RegistryEvent::RowInserted { index, id });
        Ok(())
    }

    /// Remove a profile, tearing its session down first
    ///
    /// Unknown ids are logged and ignored.
    pub async fn delete_profile(&mut self, id: &str) -> SessionResult<()> {
        let Some(index) = self.index_of(id) else {
            warn!(profile_id = %id, "Delete requested for unknown profile");
            return Ok(());
        };

        if let Some(cached) = self.sessions.remove(id) {
            cached
                .close()
                .instrument(registry_span!(profile_id = %id))
                .await;
        }

        let removed = self.profiles.remove(index);
        if let Err(e) = self.store.save(&self.profiles) {
            self.profiles.insert(index, removed);
            return Err(self.persistence_failed("delete profile", e));
        }

        info!(profile_id = %id, index, "Profile deleted");
        self.notify(RegistryEvent::RowRemoved {
            index,
            id: id.to_string(),
        });
        Ok(())
    }

    /// Cached session for `id`, created on first access
    pub fn client(&mut self, id: &str) -> SessionResult<Arc<Session>> {
        if let Some(cached) = self.sessions.get(id) {
            return Ok(cached.session.clone());
        }

        let profile = self
            .profile(id)
            .cloned()
            .ok_or_else(|| SessionError::not_found(id))?;

        let transport = self.factory.create(&profile);
        let session = Session::spawn(profile, transport, &self.settings);
        let forwarder = spawn_forwarder(&session, self.changes.clone());

        debug!(profile_id = %id, "Session created");
        self.sessions.insert(
            id.to_string(),
            CachedSession {
                session: session.clone(),
                forwarder,
            },
        );
        Ok(session)
    }

    /// Whether a session has been created for `id`
    pub fn has_session(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn rows(&self) -> Vec<ProfileRow> {
        self.profiles
            .iter()
            .map(|p| ProfileRow::new(p, self.connection_state(&p.id)))
            .collect()
    }

    pub fn row(&self, id: &str) -> Option<ProfileRow> {
        self.profile(id)
            .map(|p| ProfileRow::new(p, self.connection_state(id)))
    }

    pub fn changes(&self) -> broadcast::Receiver<RegistryEvent> {
        self.changes.subscribe()
    }

    /// Tear down every cached session
    pub async fn shutdown(&mut self) {
        let count = self.sessions.len();
        for (id, cached) in self.sessions.drain() {
            cached
                .close()
                .instrument(registry_span!(profile_id = %id))
                .await;
        }
        info!(sessions = count, "Registry shut down");
    }

    fn connection_state(&self, id: &str) -> ConnectionState {
        self.sessions
            .get(id)
            .map(|cached| cached.session.state())
            .unwrap_or_default()
    }

    fn index_of(&self, id: &str) -> Option<usize> {
        self.profiles.iter().position(|p| p.id == id)
    }

    fn notify(&self, event: RegistryEvent) {
        let _ = self.changes.send(event);
    }

    fn persistence_failed(&self, operation: &str, e: PersistenceError) -> SessionError {
        error!(operation, path = %self.store.path().display(), error = %e, "Profile persistence failed");
        SessionError::Persistence(e)
    }
}

/// Turn a session's state changes into row refreshes
fn spawn_forwarder(
    session: &Arc<Session>,
    changes: broadcast::Sender<RegistryEvent>,
) -> JoinHandle<()> {
    let id = session.id().to_string();
    let mut events = session.events();

    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SessionEvent::StateChanged(_)) => {
                    let _ = changes.send(RegistryEvent::RowChanged { id: id.clone() });
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(profile_id = %id, skipped, "Row forwarder lagged");
                    let _ = changes.send(RegistryEvent::RowChanged { id: id.clone() });
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
