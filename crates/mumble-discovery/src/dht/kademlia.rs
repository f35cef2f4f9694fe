//! Wallet-keyed Kademlia DHT.
//!
//! Admission pipeline for announced peers:
//!
//! ```text
//!   add_node(peer)
//!     │
//!     ├─ self?                          → reject
//!     ├─ PEER_ADDITION rate limit       → reject
//!     ├─ signature present?
//!     │    ├─ recovered ≠ claimed       → reject
//!     │    └─ older than max age        → reject
//!     └─ k-bucket insert (stale-head eviction only)
//! ```
//!
//! Peers sourced from the on-chain registry go through `add_trusted_node`,
//! which skips straight to the bucket insert. Every rejection is silent: the
//! call returns `false` and the caller simply does not gain that peer.

use super::routing::{InsertOutcome, K, RoutingTable};
use super::store::ValueStore;
use super::{DhtPeer, Endpoint, NodeId};
use crate::rate_limiter::{RateLimitCategory, RateLimiter};
use mumble_crypto::{CryptoError, WalletAddress, WalletIdentity, now_millis, verify_announcement};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use thiserror::Error;

/// Protocol tag prefixed to signed announcements
pub const DEFAULT_PROTOCOL_TAG: &str = "MumbleChat";

/// DHT configuration
#[derive(Debug, Clone)]
pub struct DhtConfig {
    /// Bucket capacity
    pub k: usize,
    /// Silence after which a bucket head may be evicted
    pub stale_timeout: Duration,
    /// Maximum age (and future skew) of an announcement signature
    pub signature_max_age: Duration,
    /// Tag signed into announcements
    pub protocol_tag: String,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            k: K,
            stale_timeout: Duration::from_secs(15 * 60),
            signature_max_age: Duration::from_secs(5 * 60),
            protocol_tag: DEFAULT_PROTOCOL_TAG.to_string(),
        }
    }
}

/// DHT misuse errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DhtError {
    /// `initialize` was called again with a different wallet
    #[error("DHT already initialized for {current}, refusing to switch to {requested}")]
    AlreadyInitialized {
        /// Wallet fixed at first initialization
        current: WalletAddress,
        /// Wallet passed to the rejected call
        requested: WalletAddress,
    },
}

struct LocalNode {
    wallet: WalletAddress,
    node_id: NodeId,
    table: RoutingTable,
}

/// Snapshot of DHT state
#[derive(Debug, Clone, Default)]
pub struct DhtStats {
    /// Peers in the routing table
    pub nodes: usize,
    /// Peers flagged as relays
    pub relays: usize,
    /// Non-empty buckets
    pub active_buckets: usize,
    /// Entries in the key-value store
    pub stored_values: usize,
}

/// Kademlia routing table plus admission control and a small value store
pub struct KademliaDht {
    config: DhtConfig,
    local: OnceLock<LocalNode>,
    rate_limiter: Arc<RateLimiter>,
    store: ValueStore,
}

impl KademliaDht {
    /// Create an uninitialized DHT sharing `rate_limiter` with the rest of the node
    #[must_use]
    pub fn new(config: DhtConfig, rate_limiter: Arc<RateLimiter>) -> Self {
        Self {
            config,
            local: OnceLock::new(),
            rate_limiter,
            store: ValueStore::new(),
        }
    }

    /// Fix this node's identity
    ///
    /// Calling again with the same wallet is a no-op that returns the same ID.
    ///
    /// # Errors
    ///
    /// Returns `DhtError::AlreadyInitialized` if a different wallet was set first.
    pub fn initialize(&self, wallet: WalletAddress) -> Result<NodeId, DhtError> {
        let local = self.local.get_or_init(|| {
            let node_id = NodeId::from_wallet(&wallet);
            tracing::info!("DHT initialized for {} (node {})", wallet, node_id);
            LocalNode {
                wallet,
                node_id,
                table: RoutingTable::new(node_id, self.config.k, self.config.stale_timeout),
            }
        });

        if local.wallet == wallet {
            Ok(local.node_id)
        } else {
            Err(DhtError::AlreadyInitialized {
                current: local.wallet,
                requested: wallet,
            })
        }
    }

    /// Local NodeId, once initialized
    #[must_use]
    pub fn local_id(&self) -> Option<NodeId> {
        self.local.get().map(|l| l.node_id)
    }

    /// Local wallet, once initialized
    #[must_use]
    pub fn local_wallet(&self) -> Option<WalletAddress> {
        self.local.get().map(|l| l.wallet)
    }

    /// Configuration in use
    #[must_use]
    pub const fn config(&self) -> &DhtConfig {
        &self.config
    }

    /// Admit an announced peer, returning whether it entered the table
    pub fn add_node(&self, peer: DhtPeer) -> bool {
        let Some(local) = self.local.get() else {
            tracing::debug!("add_node before initialize, ignoring {}", peer.wallet());
            return false;
        };

        if *peer.wallet() == local.wallet {
            return false;
        }

        let key = peer.wallet().to_string();
        if !self
            .rate_limiter
            .check_and_increment(RateLimitCategory::PeerAddition, &key)
        {
            tracing::debug!("Peer addition rate-limited for {}", key);
            return false;
        }

        if let Some(signature) = &peer.signature {
            let Some(timestamp) = peer.signature_timestamp else {
                tracing::debug!("Signed announcement from {} lacks timestamp", key);
                return false;
            };

            if !verify_announcement(&self.config.protocol_tag, peer.wallet(), timestamp, signature)
            {
                tracing::warn!("Announcement signature mismatch for claimed wallet {}", key);
                return false;
            }

            if !self.signature_fresh(timestamp) {
                tracing::debug!("Stale announcement from {} (ts {})", key, timestamp);
                return false;
            }
        }

        let wallet = *peer.wallet();
        Self::log_outcome(&wallet, local.table.insert(peer))
    }

    /// Insert a peer from an authenticated source, skipping admission checks
    pub fn add_trusted_node(&self, peer: DhtPeer) -> bool {
        let Some(local) = self.local.get() else {
            return false;
        };
        if *peer.wallet() == local.wallet {
            return false;
        }
        let wallet = *peer.wallet();
        Self::log_outcome(&wallet, local.table.insert(peer))
    }

    /// Remove a peer
    pub fn remove_node(&self, wallet: &WalletAddress) -> bool {
        self.local
            .get()
            .is_some_and(|l| l.table.remove(wallet).is_some())
    }

    /// Refresh a peer's liveness
    pub fn mark_node_seen(&self, wallet: &WalletAddress) -> bool {
        self.local.get().is_some_and(|l| l.table.mark_seen(wallet))
    }

    /// Look up one peer
    #[must_use]
    pub fn get_node(&self, wallet: &WalletAddress) -> Option<DhtPeer> {
        self.local.get().and_then(|l| l.table.get(wallet))
    }

    /// Up to `count` peers sorted by ascending XOR distance to `target`
    #[must_use]
    pub fn find_closest_nodes(&self, target: &NodeId, count: usize) -> Vec<DhtPeer> {
        self.local
            .get()
            .map(|l| l.table.find_closest(target, count))
            .unwrap_or_default()
    }

    /// `find_closest_nodes` keyed by wallet address
    #[must_use]
    pub fn find_closest_to_wallet(&self, wallet: &WalletAddress, count: usize) -> Vec<DhtPeer> {
        self.find_closest_nodes(&NodeId::from_wallet(wallet), count)
    }

    /// Every known peer
    #[must_use]
    pub fn all_nodes(&self) -> Vec<DhtPeer> {
        self.local
            .get()
            .map(|l| l.table.all_peers())
            .unwrap_or_default()
    }

    /// Known relay peers
    #[must_use]
    pub fn relay_nodes(&self) -> Vec<DhtPeer> {
        self.all_nodes().into_iter().filter(|p| p.is_relay).collect()
    }

    /// Number of known peers
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.local.get().map_or(0, |l| l.table.len())
    }

    /// Store a value with expiry
    pub fn store_value(&self, key: impl Into<String>, value: Vec<u8>, ttl: Duration) {
        self.store.put(key, value, ttl);
    }

    /// Fetch a live value
    #[must_use]
    pub fn get_value(&self, key: &str) -> Option<Vec<u8>> {
        self.store.get(key)
    }

    /// Drop expired values
    pub fn cleanup_expired_values(&self) -> usize {
        self.store.cleanup_expired()
    }

    /// Build this node's signed announcement for other DHTs
    ///
    /// # Errors
    ///
    /// Returns a `CryptoError` if signing fails.
    pub fn signed_self_announcement(
        &self,
        identity: &WalletIdentity,
        endpoint: Endpoint,
        is_relay: bool,
    ) -> Result<DhtPeer, CryptoError> {
        let timestamp = now_millis();
        let signature = identity.sign_announcement(&self.config.protocol_tag, timestamp)?;
        Ok(DhtPeer::new(identity.address(), endpoint)
            .with_relay(is_relay)
            .with_signature(signature, timestamp))
    }

    /// Table statistics
    #[must_use]
    pub fn stats(&self) -> DhtStats {
        let (nodes, relays, active_buckets) = match self.local.get() {
            Some(l) => {
                let all = l.table.all_peers();
                let relays = all.iter().filter(|p| p.is_relay).count();
                (all.len(), relays, l.table.bucket_sizes().len())
            }
            None => (0, 0, 0),
        };
        DhtStats {
            nodes,
            relays,
            active_buckets,
            stored_values: self.store.len(),
        }
    }

    fn signature_fresh(&self, timestamp_ms: u64) -> bool {
        let now = now_millis();
        let max_age = self.config.signature_max_age.as_millis() as u64;
        if timestamp_ms > now {
            timestamp_ms - now <= max_age
        } else {
            now - timestamp_ms <= max_age
        }
    }

    fn log_outcome(wallet: &WalletAddress, outcome: InsertOutcome) -> bool {
        match &outcome {
            InsertOutcome::Inserted => tracing::debug!("DHT added {}", wallet),
            InsertOutcome::Updated => tracing::trace!("DHT refreshed {}", wallet),
            InsertOutcome::Evicted(old) => {
                tracing::debug!("DHT added {} evicting stale {}", wallet, old);
            }
            InsertOutcome::Full => tracing::trace!("DHT bucket full, dropped {}", wallet),
        }
        outcome.is_admitted()
    }
}
