//! Message ID dedup cache.
//!
//! A message ID seen within the TTL is never processed or forwarded again,
//! which bounds gossip flooding to one pass per node per message.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::time::{Duration, Instant};

/// Concurrent map of message ID to first-seen time
#[derive(Debug)]
pub struct MessageCache {
    seen: DashMap<String, Instant>,
    ttl: Duration,
}

impl MessageCache {
    /// Create a cache remembering IDs for `ttl`
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            seen: DashMap::new(),
            ttl,
        }
    }

    /// Record `id`; returns `true` only the first time within the TTL
    pub fn first_seen(&self, id: &str) -> bool {
        match self.seen.entry(id.to_string()) {
            Entry::Occupied(mut entry) => {
                if entry.get().elapsed() >= self.ttl {
                    entry.insert(Instant::now());
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(Instant::now());
                true
            }
        }
    }

    /// Whether `id` was seen within the TTL
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.seen
            .get(id)
            .is_some_and(|first| first.elapsed() < self.ttl)
    }

    /// Drop expired IDs, returning how many were removed
    pub fn cleanup(&self) -> usize {
        let before = self.seen.len();
        self.seen.retain(|_, first| first.elapsed() < self.ttl);
        before.saturating_sub(self.seen.len())
    }

    /// Number of remembered IDs
    #[must_use]
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Whether the cache is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_seen_once() {
        let cache = MessageCache::new(Duration::from_secs(60));
        assert!(cache.first_seen("a"));
        assert!(!cache.first_seen("a"));
        assert!(!cache.first_seen("a"));
        assert!(cache.first_seen("b"));
        assert!(cache.contains("a"));
        assert!(!cache.contains("c"));
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_expired_ids_are_new_again() {
        let cache = MessageCache::new(Duration::from_millis(20));
        assert!(cache.first_seen("a"));
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(!cache.contains("a"));
        assert!(cache.first_seen("a"));
    }

    #[tokio::test]
    async fn test_cleanup() {
        let cache = MessageCache::new(Duration::from_millis(20));
        cache.first_seen("a");
        cache.first_seen("b");
        tokio::time::sleep(Duration::from_millis(40)).await;
        cache.first_seen("c");

        assert_eq!(cache.cleanup(), 2);
        assert_eq!(cache.len(), 1);
        assert!(cache.contains("c"));
    }
}
