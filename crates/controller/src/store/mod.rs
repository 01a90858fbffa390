//! Versioned object store abstraction.

use std::collections::BTreeMap;

use async_trait::async_trait;
use qualification_core::{ObjectKey, ObjectMeta, Resource};
use tokio::sync::broadcast;

use crate::error::StoreError;

mod memory;

pub use memory::InMemoryStore;

/// Change notification delivered to watchers.
#[derive(Debug, Clone)]
pub enum WatchEvent<K> {
    /// An object was created.
    Added(K),
    /// An object was updated, or deletion was requested.
    Modified {
        /// State before the change.
        old: K,
        /// State after the change.
        new: K,
    },
    /// An object was physically removed.
    Deleted(K),
}

impl<K: Resource> WatchEvent<K> {
    /// The object as of this event.
    pub fn object(&self) -> &K {
        match self {
            Self::Added(obj) | Self::Deleted(obj) => obj,
            Self::Modified { new, .. } => new,
        }
    }
}

/// Equality-based label selector. Empty selects everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector(BTreeMap<String, String>);

impl LabelSelector {
    /// Selects everything.
    pub fn everything() -> Self {
        Self::default()
    }

    /// Selects objects whose `key` label equals `value`.
    pub fn matching(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::default().and(key, value)
    }

    /// Adds a requirement.
    pub fn and(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// True if every requirement holds.
    pub fn matches(&self, meta: &ObjectMeta) -> bool {
        self.0
            .iter()
            .all(|(k, v)| meta.label(k) == Some(v.as_str()))
    }
}

/// Versioned object repository with optimistic concurrency.
///
/// `update` fails with [`StoreError::Conflict`] unless the object's
/// `resource_version` matches the stored one. `delete` of an object carrying
/// finalizers only marks it deleting; the object is removed once an update
/// clears its last finalizer.
#[async_trait]
pub trait ObjectStore<K: Resource>: Send + Sync {
    /// Reads one object.
    async fn get(&self, key: &ObjectKey) -> Result<K, StoreError>;

    /// Lists objects in a namespace matching a selector.
    async fn list(&self, namespace: &str, selector: &LabelSelector) -> Result<Vec<K>, StoreError>;

    /// Creates an object and returns it as stored.
    async fn create(&self, obj: K) -> Result<K, StoreError>;

    /// Replaces an object and returns it as stored.
    async fn update(&self, obj: K) -> Result<K, StoreError>;

    /// Requests deletion.
    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError>;

    /// Subscribes to change notifications from now on.
    fn watch(&self) -> broadcast::Receiver<WatchEvent<K>>;
}
