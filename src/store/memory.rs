use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;

use crate::codec::protocol;

/// Keys longer than this are rejected with BAD_KEY.
pub const MAX_KEY_SIZE: usize = 32;
/// Values longer than this are rejected with BAD_VALUE.
pub const MAX_VALUE_SIZE: usize = 10_000;

/// Bytes kept free for caches, sockets and in-flight buffers. Admission
/// stops before the heap is actually exhausted.
const HEADROOM: usize = 2_250_000;
const DEFAULT_CAPACITY: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedValue {
    pub value: Vec<u8>,
    pub version: i32,
}

/// The bounded in-memory key-value map. Every mutation is admission-checked
/// up front so a rejected request leaves the store untouched.
pub struct LocalStore {
    entries: DashMap<Vec<u8>, VersionedValue>,
    used: AtomicUsize,
    capacity: usize,
}

impl LocalStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            used: AtomicUsize::new(0),
            capacity,
        }
    }

    /// Checks a write for admission without mutating anything. Returns
    /// SUCCESS when the write would be accepted, or the response code a
    /// client should see. Order matters: capacity pressure outranks key and
    /// value shape so an overloaded node sheds even malformed requests
    /// cheaply.
    pub fn validate_put(&self, key: &[u8], value: &[u8]) -> u8 {
        if !self.has_space(key.len() + value.len()) {
            return protocol::NO_MEM;
        }
        if key.is_empty() || key.len() > MAX_KEY_SIZE {
            return protocol::BAD_KEY;
        }
        if value.len() > MAX_VALUE_SIZE {
            return protocol::BAD_VALUE;
        }
        protocol::SUCCESS
    }

    /// Inserts or overwrites a key. Returns the response code for the
    /// client; the store is unchanged unless SUCCESS is returned.
    pub fn put(&self, key: Vec<u8>, value: Vec<u8>, version: i32) -> u8 {
        let status = self.validate_put(&key, &value);
        if status != protocol::SUCCESS {
            return status;
        }

        let key_len = key.len();
        let added = key_len + value.len();
        let replaced = self
            .entries
            .insert(key, VersionedValue { value, version });
        self.used.fetch_add(added, Ordering::Relaxed);
        if let Some(old) = replaced {
            // overwrite: the key bytes and old value were already counted
            self.used
                .fetch_sub(key_len + old.value.len(), Ordering::Relaxed);
        }
        protocol::SUCCESS
    }

    pub fn get(&self, key: &[u8]) -> Option<VersionedValue> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    /// Removes a key. NO_KEY when absent, BAD_KEY on malformed keys.
    pub fn remove(&self, key: &[u8]) -> u8 {
        if key.is_empty() || key.len() > MAX_KEY_SIZE {
            return protocol::BAD_KEY;
        }
        match self.entries.remove(key) {
            Some((k, v)) => {
                self.used
                    .fetch_sub(k.len() + v.value.len(), Ordering::Relaxed);
                protocol::SUCCESS
            }
            None => protocol::NO_KEY,
        }
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.entries.contains_key(key)
    }

    pub fn has_space(&self, incoming: usize) -> bool {
        self.used.load(Ordering::Relaxed) + incoming + HEADROOM <= self.capacity
    }

    pub fn clear(&self) {
        self.entries.clear();
        self.used.store(0, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshots every entry whose key satisfies the predicate. Used by
    /// key-range transfers when ownership moves between nodes.
    pub fn entries_where<F>(&self, mut pred: F) -> Vec<(Vec<u8>, VersionedValue)>
    where
        F: FnMut(&[u8]) -> bool,
    {
        self.entries
            .iter()
            .filter(|entry| pred(entry.key()))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}

impl Default for LocalStore {
    fn default() -> Self {
        Self::new()
    }
}
