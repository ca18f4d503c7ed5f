//! Keyed collection of live connections.
//!
//! Every add and every effective removal bumps the registry's
//! [`Invalidation`], so views computed from the registry (admin emitter
//! lists, pairing inputs) recompute without polling.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

use crate::signal::Invalidation;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("Key already present: {0}")]
    DuplicateKey(String),
}

/// Live entries keyed by `K`.
pub struct Registry<K, V> {
    entries: Arc<Mutex<BTreeMap<K, V>>>,
    changes: Invalidation,
}

impl<K, V> Registry<K, V>
where
    K: Ord + Clone + Debug + Send + 'static,
    V: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self::with_invalidation(Invalidation::new())
    }

    /// Registry that reports changes on a shared counter.
    pub fn with_invalidation(changes: Invalidation) -> Self {
        Self {
            entries: Arc::new(Mutex::new(BTreeMap::new())),
            changes,
        }
    }

    /// Insert `value` under `key`; fails if the key is taken.
    pub fn add(&self, key: K, value: V) -> Result<Removal, RegistryError> {
        {
            let mut entries = self.entries.lock();
            if entries.contains_key(&key) {
                return Err(RegistryError::DuplicateKey(format!("{key:?}")));
            }
            entries.insert(key.clone(), value);
        }
        self.changes.bump();

        let entries = self.entries.clone();
        let changes = self.changes.clone();
        Ok(Removal::new(move || {
            if entries.lock().remove(&key).is_some() {
                changes.bump();
            }
        }))
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.entries.lock().get(key).cloned()
    }

    pub fn list(&self) -> Vec<V> {
        self.entries.lock().values().cloned().collect()
    }

    pub fn keys(&self) -> Vec<K> {
        self.entries.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }
}

impl<K, V> Default for Registry<K, V>
where
    K: Ord + Clone + Debug + Send + 'static,
    V: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Idempotent removal handle returned by [`Registry::add`].
pub struct Removal {
    remove: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Removal {
    fn new(remove: impl FnOnce() + Send + 'static) -> Self {
        Self {
            remove: Mutex::new(Some(Box::new(remove))),
        }
    }

    /// Remove the entry; later calls do nothing.
    pub fn remove(&self) {
        let remove = self.remove.lock().take();
        if let Some(remove) = remove {
            remove();
        }
    }
}
