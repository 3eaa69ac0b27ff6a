//! Resource State Store
//!
//! Versioned in-memory store of typed resources keyed by
//! `(namespace, kind, id)`. Every write records the owner, bumps the
//! version and publishes a [`StateEvent`] on a broadcast channel that the
//! engine fans out to subscribed controllers.
//!
//! Lifecycle rules:
//! - only the owner may modify, tear down or destroy a resource
//! - a resource in `tearing-down` phase rejects modifications
//! - `destroy` is refused while finalizers remain

use crate::error::{Error, Result};
use crate::resources::{Kind, Namespace, ResourceSpec, Spec};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tokio::sync::broadcast;
use tracing::trace;

/// Capacity of the store event channel
const EVENT_CHANNEL_CAPACITY: usize = 4096;

// =============================================================================
// Metadata
// =============================================================================

/// Lifecycle phase of a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    #[default]
    Running,
    TearingDown,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Running => write!(f, "running"),
            Phase::TearingDown => write!(f, "tearing-down"),
        }
    }
}

/// Store address of a resource
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceKey {
    pub namespace: Namespace,
    pub kind: Kind,
    pub id: String,
}

impl ResourceKey {
    pub fn new(namespace: Namespace, kind: Kind, id: impl Into<String>) -> Self {
        Self {
            namespace,
            kind,
            id: id.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.kind, self.id)
    }
}

/// Resource metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub namespace: Namespace,
    pub kind: Kind,
    pub id: String,
    pub version: u64,
    pub owner: String,
    pub phase: Phase,
    pub finalizers: BTreeSet<String>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl Metadata {
    fn new(key: &ResourceKey, owner: &str) -> Self {
        let now = Utc::now();

        Self {
            namespace: key.namespace,
            kind: key.kind,
            id: key.id.clone(),
            version: 1,
            owner: owner.to_string(),
            phase: Phase::Running,
            finalizers: BTreeSet::new(),
            created: now,
            updated: now,
        }
    }

    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(self.namespace, self.kind, self.id.clone())
    }

    pub fn is_tearing_down(&self) -> bool {
        self.phase == Phase::TearingDown
    }

    fn bump(&mut self) {
        self.version += 1;
        self.updated = Utc::now();
    }
}

/// Typed resource snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct Resource<T> {
    pub metadata: Metadata,
    pub spec: T,
}

impl<T> Resource<T> {
    pub fn id(&self) -> &str {
        &self.metadata.id
    }

    pub fn phase(&self) -> Phase {
        self.metadata.phase
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.metadata.finalizers.contains(finalizer)
    }
}

// =============================================================================
// Events
// =============================================================================

/// Kind of change published by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Created,
    Updated,
    Destroyed,
}

/// Change notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateEvent {
    pub key: ResourceKey,
    pub kind: EventKind,
    pub phase: Phase,
    pub finalizers_empty: bool,
}

impl StateEvent {
    /// Torn-down resource with no finalizers left
    pub fn is_destroy_ready(&self) -> bool {
        self.kind != EventKind::Destroyed
            && self.phase == Phase::TearingDown
            && self.finalizers_empty
    }
}

// =============================================================================
// State
// =============================================================================

struct Entry {
    metadata: Metadata,
    spec: Spec,
}

/// The resource store
pub struct State {
    resources: RwLock<BTreeMap<ResourceKey, Entry>>,
    events: broadcast::Sender<StateEvent>,
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

impl State {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            resources: RwLock::new(BTreeMap::new()),
            events,
        }
    }

    /// Subscribe to store events
    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.events.subscribe()
    }

    fn publish(&self, metadata: &Metadata, kind: EventKind) {
        trace!(
            resource = %metadata.key(),
            version = metadata.version,
            event = ?kind,
            "state event"
        );

        // no subscribers is fine
        let _ = self.events.send(StateEvent {
            key: metadata.key(),
            kind,
            phase: metadata.phase,
            finalizers_empty: metadata.finalizers.is_empty(),
        });
    }

    fn key<T: ResourceSpec>(namespace: Namespace, id: &str) -> ResourceKey {
        ResourceKey::new(namespace, T::KIND, id)
    }

    fn check_owner(key: &ResourceKey, metadata: &Metadata, owner: &str) -> Result<()> {
        if metadata.owner != owner {
            return Err(Error::OwnerConflict {
                resource: key.to_string(),
                owner: metadata.owner.clone(),
                actor: owner.to_string(),
            });
        }

        Ok(())
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Get a resource; `None` when absent
    pub fn get<T: ResourceSpec>(&self, namespace: Namespace, id: &str) -> Option<Resource<T>> {
        let resources = self.resources.read();

        resources.get(&Self::key::<T>(namespace, id)).and_then(|entry| {
            T::from_spec(&entry.spec).map(|spec| Resource {
                metadata: entry.metadata.clone(),
                spec: spec.clone(),
            })
        })
    }

    /// List resources of a kind, sorted by id
    pub fn list<T: ResourceSpec>(&self, namespace: Namespace) -> Vec<Resource<T>> {
        let resources = self.resources.read();

        resources
            .iter()
            .filter(|(key, _)| key.namespace == namespace && key.kind == T::KIND)
            .filter_map(|(_, entry)| {
                T::from_spec(&entry.spec).map(|spec| Resource {
                    metadata: entry.metadata.clone(),
                    spec: spec.clone(),
                })
            })
            .collect()
    }

    /// Metadata of every resource of a kind, sorted by id
    pub fn list_metadata(&self, namespace: Namespace, kind: Kind) -> Vec<Metadata> {
        let resources = self.resources.read();

        resources
            .iter()
            .filter(|(key, _)| key.namespace == namespace && key.kind == kind)
            .map(|(_, entry)| entry.metadata.clone())
            .collect()
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Create a new resource
    pub fn create<T: ResourceSpec>(
        &self,
        owner: &str,
        namespace: Namespace,
        id: &str,
        spec: T,
    ) -> Result<()> {
        let key = Self::key::<T>(namespace, id);
        let mut resources = self.resources.write();

        if resources.contains_key(&key) {
            return Err(Error::ResourceExists {
                resource: key.to_string(),
            });
        }

        let metadata = Metadata::new(&key, owner);
        self.publish(&metadata, EventKind::Created);

        resources.insert(
            key,
            Entry {
                metadata,
                spec: spec.into_spec(),
            },
        );

        Ok(())
    }

    /// Modify-or-create a resource
    pub fn modify<T, F>(&self, owner: &str, namespace: Namespace, id: &str, f: F) -> Result<()>
    where
        T: ResourceSpec,
        F: FnOnce(&mut T) -> Result<()>,
    {
        self.modify_with_result(owner, namespace, id, f)
    }

    /// Modify-or-create a resource, returning the value produced by `f`
    ///
    /// A missing resource starts from `T::default()`. When `f` leaves the
    /// spec unchanged no version bump or event happens.
    pub fn modify_with_result<T, F, R>(
        &self,
        owner: &str,
        namespace: Namespace,
        id: &str,
        f: F,
    ) -> Result<R>
    where
        T: ResourceSpec,
        F: FnOnce(&mut T) -> Result<R>,
    {
        let key = Self::key::<T>(namespace, id);
        let mut resources = self.resources.write();

        match resources.get_mut(&key) {
            Some(entry) => {
                Self::check_owner(&key, &entry.metadata, owner)?;

                if entry.metadata.is_tearing_down() {
                    return Err(Error::PhaseConflict {
                        resource: key.to_string(),
                    });
                }

                let current = T::from_spec(&entry.spec).ok_or_else(|| {
                    Error::Internal(format!("{} holds a foreign spec", key))
                })?;

                let mut updated = current.clone();
                let result = f(&mut updated)?;

                if updated != *current {
                    entry.spec = updated.into_spec();
                    entry.metadata.bump();
                    self.publish(&entry.metadata, EventKind::Updated);
                }

                Ok(result)
            }
            None => {
                let mut spec = T::default();
                let result = f(&mut spec)?;

                let metadata = Metadata::new(&key, owner);
                self.publish(&metadata, EventKind::Created);

                resources.insert(
                    key,
                    Entry {
                        metadata,
                        spec: spec.into_spec(),
                    },
                );

                Ok(result)
            }
        }
    }

    /// Replace a resource spec if the stored version matches
    pub fn update<T: ResourceSpec>(
        &self,
        owner: &str,
        namespace: Namespace,
        id: &str,
        expected_version: u64,
        spec: T,
    ) -> Result<u64> {
        let key = Self::key::<T>(namespace, id);
        let mut resources = self.resources.write();

        let entry = resources.get_mut(&key).ok_or_else(|| Error::ResourceNotFound {
            resource: key.to_string(),
        })?;

        Self::check_owner(&key, &entry.metadata, owner)?;

        if entry.metadata.version != expected_version {
            return Err(Error::VersionConflict {
                resource: key.to_string(),
                expected: expected_version,
                actual: entry.metadata.version,
            });
        }

        if entry.metadata.is_tearing_down() {
            return Err(Error::PhaseConflict {
                resource: key.to_string(),
            });
        }

        let spec = spec.into_spec();

        if spec != entry.spec {
            entry.spec = spec;
            entry.metadata.bump();
            self.publish(&entry.metadata, EventKind::Updated);
        }

        Ok(entry.metadata.version)
    }

    /// Move a resource to `tearing-down`
    ///
    /// Returns true when the resource has no finalizers and may be destroyed.
    pub fn teardown<T: ResourceSpec>(&self, owner: &str, namespace: Namespace, id: &str) -> Result<bool> {
        self.teardown_key(owner, &Self::key::<T>(namespace, id))
    }

    pub(crate) fn teardown_key(&self, owner: &str, key: &ResourceKey) -> Result<bool> {
        let mut resources = self.resources.write();

        let entry = resources.get_mut(key).ok_or_else(|| Error::ResourceNotFound {
            resource: key.to_string(),
        })?;

        Self::check_owner(key, &entry.metadata, owner)?;

        if !entry.metadata.is_tearing_down() {
            entry.metadata.phase = Phase::TearingDown;
            entry.metadata.bump();
            self.publish(&entry.metadata, EventKind::Updated);
        }

        Ok(entry.metadata.finalizers.is_empty())
    }

    /// Remove a resource; refused while finalizers remain
    pub fn destroy<T: ResourceSpec>(&self, owner: &str, namespace: Namespace, id: &str) -> Result<()> {
        self.destroy_key(owner, &Self::key::<T>(namespace, id))
    }

    pub(crate) fn destroy_key(&self, owner: &str, key: &ResourceKey) -> Result<()> {
        let mut resources = self.resources.write();

        let entry = resources.get(key).ok_or_else(|| Error::ResourceNotFound {
            resource: key.to_string(),
        })?;

        Self::check_owner(key, &entry.metadata, owner)?;

        if !entry.metadata.finalizers.is_empty() {
            return Err(Error::FinalizersPresent {
                resource: key.to_string(),
                finalizers: entry
                    .metadata
                    .finalizers
                    .iter()
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(","),
            });
        }

        if let Some(entry) = resources.remove(key) {
            self.publish(&entry.metadata, EventKind::Destroyed);
        }

        Ok(())
    }

    /// Add a finalizer; any controller may hold one
    pub fn add_finalizer<T: ResourceSpec>(
        &self,
        namespace: Namespace,
        id: &str,
        finalizer: &str,
    ) -> Result<()> {
        let key = Self::key::<T>(namespace, id);
        let mut resources = self.resources.write();

        let entry = resources.get_mut(&key).ok_or_else(|| Error::ResourceNotFound {
            resource: key.to_string(),
        })?;

        if entry.metadata.finalizers.insert(finalizer.to_string()) {
            entry.metadata.bump();
            self.publish(&entry.metadata, EventKind::Updated);
        }

        Ok(())
    }

    /// Remove a finalizer; a missing resource is not an error
    pub fn remove_finalizer<T: ResourceSpec>(
        &self,
        namespace: Namespace,
        id: &str,
        finalizer: &str,
    ) -> Result<()> {
        let key = Self::key::<T>(namespace, id);
        let mut resources = self.resources.write();

        if let Some(entry) = resources.get_mut(&key) {
            if entry.metadata.finalizers.remove(finalizer) {
                entry.metadata.bump();
                self.publish(&entry.metadata, EventKind::Updated);
            }
        }

        Ok(())
    }

    /// Number of stored resources
    pub fn len(&self) -> usize {
        self.resources.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{HostnameSpec, ResolverSpec};
    use assert_matches::assert_matches;

    fn hostname(name: &str) -> HostnameSpec {
        HostnameSpec {
            hostname: name.into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_create_get_list() {
        let state = State::new();

        state
            .create("a", Namespace::Network, "b", hostname("b"))
            .unwrap();
        state
            .create("a", Namespace::Network, "a", hostname("a"))
            .unwrap();

        let err = state
            .create("a", Namespace::Network, "a", hostname("x"))
            .unwrap_err();
        assert_matches!(err, Error::ResourceExists { .. });

        let r = state.get::<HostnameSpec>(Namespace::Network, "a").unwrap();
        assert_eq!(r.spec.hostname, "a");
        assert_eq!(r.metadata.version, 1);
        assert_eq!(r.metadata.owner, "a");

        let ids: Vec<String> = state
            .list::<HostnameSpec>(Namespace::Network)
            .into_iter()
            .map(|r| r.metadata.id)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);

        assert!(state.list::<ResolverSpec>(Namespace::Network).is_empty());
        assert!(state.list::<HostnameSpec>(Namespace::Config).is_empty());
    }

    #[test]
    fn test_modify_creates_and_skips_noop() {
        let state = State::new();
        let mut events = state.subscribe();

        state
            .modify::<HostnameSpec, _>("ctrl", Namespace::Network, "hostname", |spec| {
                spec.hostname = "foo".into();
                Ok(())
            })
            .unwrap();

        assert_eq!(events.try_recv().unwrap().kind, EventKind::Created);

        state
            .modify::<HostnameSpec, _>("ctrl", Namespace::Network, "hostname", |spec| {
                spec.hostname = "foo".into();
                Ok(())
            })
            .unwrap();

        assert!(events.try_recv().is_err());

        let r = state
            .get::<HostnameSpec>(Namespace::Network, "hostname")
            .unwrap();
        assert_eq!(r.metadata.version, 1);

        let err = state
            .modify::<HostnameSpec, _>("other", Namespace::Network, "hostname", |_| Ok(()))
            .unwrap_err();
        assert_matches!(err, Error::OwnerConflict { .. });
    }

    #[test]
    fn test_update_version_check() {
        let state = State::new();
        state
            .create("a", Namespace::Network, "x", hostname("x"))
            .unwrap();

        let version = state
            .update("a", Namespace::Network, "x", 1, hostname("y"))
            .unwrap();
        assert_eq!(version, 2);

        let err = state
            .update("a", Namespace::Network, "x", 1, hostname("z"))
            .unwrap_err();
        assert_matches!(err, Error::VersionConflict { expected: 1, actual: 2, .. });
    }

    #[test]
    fn test_teardown_and_finalizers() {
        let state = State::new();
        state
            .create("owner", Namespace::Network, "x", hostname("x"))
            .unwrap();
        state
            .add_finalizer::<HostnameSpec>(Namespace::Network, "x", "spec")
            .unwrap();

        assert!(!state
            .teardown::<HostnameSpec>("owner", Namespace::Network, "x")
            .unwrap());

        let err = state
            .modify::<HostnameSpec, _>("owner", Namespace::Network, "x", |s| {
                s.hostname = "y".into();
                Ok(())
            })
            .unwrap_err();
        assert!(err.is_phase_conflict());

        let err = state
            .destroy::<HostnameSpec>("owner", Namespace::Network, "x")
            .unwrap_err();
        assert_matches!(err, Error::FinalizersPresent { .. });

        let mut events = state.subscribe();
        state
            .remove_finalizer::<HostnameSpec>(Namespace::Network, "x", "spec")
            .unwrap();

        let event = events.try_recv().unwrap();
        assert!(event.is_destroy_ready());

        assert!(state
            .teardown::<HostnameSpec>("owner", Namespace::Network, "x")
            .unwrap());

        let err = state
            .destroy::<HostnameSpec>("intruder", Namespace::Network, "x")
            .unwrap_err();
        assert_matches!(err, Error::OwnerConflict { .. });

        state
            .destroy::<HostnameSpec>("owner", Namespace::Network, "x")
            .unwrap();
        assert!(state.get::<HostnameSpec>(Namespace::Network, "x").is_none());
        assert!(state.is_empty());
    }
}
