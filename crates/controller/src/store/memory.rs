use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use qualification_core::{now_ms, ObjectKey, Resource};
use tokio::sync::{broadcast, Mutex};
use tracing::debug;

use super::{LabelSelector, ObjectStore, WatchEvent};
use crate::error::StoreError;

const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// In-process [`ObjectStore`] with the versioning and deletion rules of a
/// real API server.
///
/// Also exposes fault hooks used by tests: delayed visibility after create,
/// injected conflicts and rejected creates.
pub struct InMemoryStore<K: Resource> {
    inner: Mutex<Inner<K>>,
    events: broadcast::Sender<WatchEvent<K>>,
}

struct Inner<K> {
    objects: BTreeMap<ObjectKey, K>,
    last_version: u64,
    /// Remaining reads for which a freshly created object stays invisible.
    hidden: HashMap<ObjectKey, u32>,
    visibility_lag: u32,
    pending_conflicts: u32,
    pending_create_failures: u32,
}

impl<K> Inner<K> {
    fn next_version(&mut self) -> u64 {
        self.last_version += 1;
        self.last_version
    }

    fn is_visible(&self, key: &ObjectKey) -> bool {
        !self.hidden.contains_key(key)
    }
}

enum DeleteTarget {
    Missing,
    Unfinalized,
    Finalized { deleting: bool },
}

impl<K: Resource> Default for InMemoryStore<K> {
    fn default() -> Self {
        Self::with_event_capacity(DEFAULT_EVENT_CAPACITY)
    }
}

impl<K: Resource> InMemoryStore<K> {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty store whose watchers lag after `capacity` unread events.
    pub fn with_event_capacity(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity);
        Self {
            inner: Mutex::new(Inner {
                objects: BTreeMap::new(),
                last_version: 0,
                hidden: HashMap::new(),
                visibility_lag: 0,
                pending_conflicts: 0,
                pending_create_failures: 0,
            }),
            events,
        }
    }

    /// Makes each subsequently created object invisible to `reads` gets.
    pub async fn set_visibility_lag(&self, reads: u32) {
        self.inner.lock().await.visibility_lag = reads;
    }

    /// Makes every created object visible immediately.
    pub async fn reveal_all(&self) {
        self.inner.lock().await.hidden.clear();
    }

    /// Fails the next `n` updates with a conflict.
    pub async fn inject_conflicts(&self, n: u32) {
        self.inner.lock().await.pending_conflicts = n;
    }

    /// Rejects the next `n` creates.
    pub async fn reject_creates(&self, n: u32) {
        self.inner.lock().await.pending_create_failures = n;
    }

    /// Every stored object, visible or not.
    pub async fn objects(&self) -> Vec<K> {
        self.inner.lock().await.objects.values().cloned().collect()
    }

    fn publish(&self, event: WatchEvent<K>) {
        if self.events.send(event).is_err() {
            debug!(kind = K::KIND, "no watchers for store event");
        }
    }

    fn not_found(key: &ObjectKey) -> StoreError {
        StoreError::NotFound {
            kind: K::KIND,
            key: key.clone(),
        }
    }
}

#[async_trait]
impl<K: Resource> ObjectStore<K> for InMemoryStore<K> {
    async fn get(&self, key: &ObjectKey) -> Result<K, StoreError> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        if let Some(remaining) = inner.hidden.get_mut(key) {
            *remaining -= 1;
            if *remaining == 0 {
                inner.hidden.remove(key);
            }
            return Err(Self::not_found(key));
        }
        inner
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| Self::not_found(key))
    }

    async fn list(&self, namespace: &str, selector: &LabelSelector) -> Result<Vec<K>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .objects
            .iter()
            .filter(|(key, obj)| {
                key.namespace == namespace && inner.is_visible(key) && selector.matches(obj.meta())
            })
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    async fn create(&self, mut obj: K) -> Result<K, StoreError> {
        let key = obj.key();
        if key.name.is_empty() || key.namespace.is_empty() {
            return Err(StoreError::Invalid {
                kind: K::KIND,
                reason: "name and namespace are required".to_string(),
            });
        }

        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        if inner.pending_create_failures > 0 {
            inner.pending_create_failures -= 1;
            return Err(StoreError::Unavailable(format!("create of {key} rejected")));
        }
        if inner.objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists { kind: K::KIND, key });
        }

        let version = inner.next_version();
        let meta = obj.meta_mut();
        meta.resource_version = version;
        meta.creation_timestamp_ms = Some(now_ms());
        meta.deletion_timestamp_ms = None;

        inner.objects.insert(key.clone(), obj.clone());
        if inner.visibility_lag > 0 {
            inner.hidden.insert(key, inner.visibility_lag);
        }
        self.publish(WatchEvent::Added(obj.clone()));
        Ok(obj)
    }

    async fn update(&self, mut obj: K) -> Result<K, StoreError> {
        let key = obj.key();
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let old = inner
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| Self::not_found(&key))?;

        let current = old.meta().resource_version;
        let expected = obj.meta().resource_version;
        if inner.pending_conflicts > 0 || expected != current {
            inner.pending_conflicts = inner.pending_conflicts.saturating_sub(1);
            return Err(StoreError::Conflict {
                kind: K::KIND,
                key,
                expected,
                current,
            });
        }

        let version = inner.next_version();
        let meta = obj.meta_mut();
        meta.resource_version = version;
        meta.creation_timestamp_ms = old.meta().creation_timestamp_ms;
        meta.deletion_timestamp_ms = old.meta().deletion_timestamp_ms;

        if obj.meta().is_deleting() && obj.meta().finalizers.is_empty() {
            inner.objects.remove(&key);
            inner.hidden.remove(&key);
            self.publish(WatchEvent::Deleted(obj.clone()));
        } else {
            inner.objects.insert(key, obj.clone());
            self.publish(WatchEvent::Modified {
                old,
                new: obj.clone(),
            });
        }
        Ok(obj)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let target = match inner.objects.get(key) {
            None => DeleteTarget::Missing,
            Some(obj) if obj.meta().finalizers.is_empty() => DeleteTarget::Unfinalized,
            Some(obj) => DeleteTarget::Finalized {
                deleting: obj.meta().is_deleting(),
            },
        };

        match target {
            DeleteTarget::Missing => Err(Self::not_found(key)),
            DeleteTarget::Unfinalized => {
                inner.hidden.remove(key);
                if let Some(obj) = inner.objects.remove(key) {
                    self.publish(WatchEvent::Deleted(obj));
                }
                Ok(())
            }
            DeleteTarget::Finalized { deleting: true } => Ok(()),
            DeleteTarget::Finalized { deleting: false } => {
                let version = inner.next_version();
                if let Some(obj) = inner.objects.get_mut(key) {
                    let old = obj.clone();
                    let meta = obj.meta_mut();
                    meta.deletion_timestamp_ms = Some(now_ms());
                    meta.resource_version = version;
                    let new = obj.clone();
                    self.publish(WatchEvent::Modified { old, new });
                }
                Ok(())
            }
        }
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent<K>> {
        self.events.subscribe()
    }
}
