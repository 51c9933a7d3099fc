//! In-memory resource store
//!
//! Backs tests and offline evaluation. Mirrors the API server's behavior
//! where the controllers depend on it: finalizers block deletion and
//! missing objects report `NotFound`.

use super::{Resource, ResourceStore, StoreError};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

type Key = (String, String);

/// Concurrent in-memory store for one resource kind
pub struct MemoryStore<T: Resource> {
    items: DashMap<Key, T>,
    /// Error returned by every call, simulating an unreachable cluster
    fail_all: RwLock<Option<StoreError>>,
    /// Names whose deletion fails with an api error
    failing_deletes: DashSet<String>,
    delete_calls: AtomicUsize,
}

impl<T: Resource> Default for MemoryStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Resource> MemoryStore<T> {
    pub fn new() -> Self {
        Self {
            items: DashMap::new(),
            fail_all: RwLock::new(None),
            failing_deletes: DashSet::new(),
            delete_calls: AtomicUsize::new(0),
        }
    }

    /// Create a store pre-populated with items
    pub fn with_items(items: impl IntoIterator<Item = T>) -> Self {
        let store = Self::new();
        for item in items {
            store.insert(item);
        }
        store
    }

    /// Insert or replace an item
    pub fn insert(&self, item: T) {
        let key = (item.namespace().to_string(), item.name().to_string());
        self.items.insert(key, item);
    }

    /// Remove an item without going through `delete`
    pub fn remove(&self, namespace: &str, name: &str) -> Option<T> {
        self.items
            .remove(&(namespace.to_string(), name.to_string()))
            .map(|(_, v)| v)
    }

    pub fn contains(&self, namespace: &str, name: &str) -> bool {
        self.items
            .contains_key(&(namespace.to_string(), name.to_string()))
    }

    /// All items, sorted by (namespace, name)
    pub fn items(&self) -> Vec<T> {
        let mut entries: Vec<(Key, T)> = self
            .items
            .iter()
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries.into_iter().map(|(_, v)| v).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Make every subsequent call fail with `Unavailable`
    pub fn fail_all(&self, message: impl Into<String>) {
        if let Ok(mut guard) = self.fail_all.write() {
            *guard = Some(StoreError::Unavailable(message.into()));
        }
    }

    /// Make deletion of the named item fail with an api error
    pub fn fail_deletes_of(&self, name: impl Into<String>) {
        self.failing_deletes.insert(name.into());
    }

    /// Number of delete calls received, successful or not
    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), StoreError> {
        match self.fail_all.read() {
            Ok(guard) => match guard.as_ref() {
                Some(err) => Err(err.clone()),
                None => Ok(()),
            },
            Err(_) => Err(StoreError::Unavailable("store lock poisoned".into())),
        }
    }

    fn not_found(namespace: &str, name: &str) -> StoreError {
        StoreError::NotFound {
            kind: T::KIND,
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl<T: Resource> ResourceStore<T> for MemoryStore<T> {
    async fn list(&self, namespace: &str) -> Result<Vec<T>, StoreError> {
        self.check_available()?;
        Ok(self
            .items()
            .into_iter()
            .filter(|item| item.namespace() == namespace)
            .collect())
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<T, StoreError> {
        self.check_available()?;
        self.items
            .get(&(namespace.to_string(), name.to_string()))
            .map(|r| r.value().clone())
            .ok_or_else(|| Self::not_found(namespace, name))
    }

    async fn create(&self, item: T) -> Result<T, StoreError> {
        self.check_available()?;
        let key = (item.namespace().to_string(), item.name().to_string());
        if self.items.contains_key(&key) {
            return Err(StoreError::AlreadyExists {
                kind: T::KIND,
                namespace: key.0,
                name: key.1,
            });
        }
        self.items.insert(key, item.clone());
        Ok(item)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        if self.failing_deletes.contains(name) {
            return Err(StoreError::Api {
                reason: "InternalError".to_string(),
                message: format!("injected delete failure for {}", name),
            });
        }

        let key = (namespace.to_string(), name.to_string());
        let finalizers = match self.items.get(&key) {
            Some(item) => item.finalizers().to_vec(),
            None => return Err(Self::not_found(namespace, name)),
        };

        if !finalizers.is_empty() {
            return Err(StoreError::FinalizersPresent {
                kind: T::KIND,
                namespace: key.0,
                name: key.1,
                finalizers,
            });
        }

        self.items.remove(&key);
        Ok(())
    }
}
