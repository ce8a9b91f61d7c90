//! # Shared Keyed Table
//!
//! A mutable concurrent map behind a single reader/writer lock. Used for
//! every registry in the system: peer descriptions, reply-correlation
//! routes, pending-ack sets and per-peer task handles. Read-mostly access
//! dominates, so the lock stays a plain `RwLock` rather than anything
//! sharded.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::Hash;

pub struct SharedTable<K, V> {
    inner: RwLock<HashMap<K, V>>,
}

impl<K, V> SharedTable<K, V>
where
    K: Eq + Hash,
{
    pub fn new() -> Self {
        SharedTable {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Insert or overwrite. Returns `true` when the key was not present.
    pub fn insert(&self, key: K, value: V) -> bool {
        self.inner.write().insert(key, value).is_none()
    }

    /// Clone out the value for `key`, if any.
    pub fn get(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        self.inner.read().get(key).cloned()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner.read().contains_key(key)
    }

    /// Find-and-remove: take the value out in one step so two racing
    /// removers cannot both observe it.
    pub fn remove(&self, key: &K) -> Option<V> {
        self.inner.write().remove(key)
    }

    /// Snapshot every entry.
    pub fn entries(&self) -> Vec<(K, V)>
    where
        K: Clone,
        V: Clone,
    {
        self.inner
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Drain every entry out of the table. Unlike [`entries`], this works
    /// for values that cannot be cloned (task handles).
    ///
    /// [`entries`]: SharedTable::entries
    pub fn take_all(&self) -> Vec<(K, V)> {
        self.inner.write().drain().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    pub fn clear(&self) {
        self.inner.write().clear();
    }
}

impl<K, V> Default for SharedTable<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}
