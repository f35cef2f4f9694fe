//! Key-value store with expiry, used for auxiliary metadata (never message content).

use dashmap::DashMap;
use std::time::{Duration, Instant};

/// A stored value and its expiry
#[derive(Debug, Clone)]
pub struct StoredValue {
    /// Value bytes
    pub data: Vec<u8>,
    /// When the value was stored
    pub stored_at: Instant,
    /// Time to live
    pub ttl: Duration,
}

impl StoredValue {
    /// Whether the TTL has elapsed
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.stored_at.elapsed() >= self.ttl
    }
}

/// Concurrent expiring key-value map
#[derive(Debug, Default)]
pub struct ValueStore {
    values: DashMap<String, StoredValue>,
}

impl ValueStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` under `key` for `ttl`, replacing any previous value
    pub fn put(&self, key: impl Into<String>, value: Vec<u8>, ttl: Duration) {
        self.values.insert(
            key.into(),
            StoredValue {
                data: value,
                stored_at: Instant::now(),
                ttl,
            },
        );
    }

    /// Fetch a live value; expired entries are dropped on read
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let expired = match self.values.get(key) {
            Some(entry) if !entry.is_expired() => return Some(entry.data.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.values.remove_if(key, |_, v| v.is_expired());
        }
        None
    }

    /// Drop every expired entry, returning how many were removed
    pub fn cleanup_expired(&self) -> usize {
        let before = self.values.len();
        self.values.retain(|_, v| !v.is_expired());
        before.saturating_sub(self.values.len())
    }

    /// Number of stored entries (including not-yet-swept expired ones)
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the store is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
