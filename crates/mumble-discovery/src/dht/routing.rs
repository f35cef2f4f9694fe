//! K-bucket routing table.
//!
//! ```text
//!   bucket 255  ← peers whose ID differs from ours in the top bit (half the space)
//!   bucket 254
//!   ...
//!   bucket 0    ← peers differing only in the lowest bit
//! ```
//!
//! Each bucket holds at most K peers ordered least-recently-seen first. A new
//! peer only displaces the head of a full bucket when the head has gone stale,
//! so long-lived nodes are preferred over newcomers.

use super::{DhtPeer, NodeId};
use mumble_crypto::WalletAddress;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;

/// Bucket capacity
pub const K: usize = 20;

/// Number of buckets (one per bit of the NodeId)
pub const NUM_BUCKETS: usize = NodeId::BITS;

/// Result of offering a peer to a bucket
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// New entry appended at the tail
    Inserted,
    /// Existing entry refreshed and moved to the tail
    Updated,
    /// Stale head evicted to make room
    Evicted(WalletAddress),
    /// Bucket full of fresh peers; nothing changed
    Full,
}

impl InsertOutcome {
    /// Whether the peer is now in the bucket
    #[must_use]
    pub fn is_admitted(&self) -> bool {
        !matches!(self, Self::Full)
    }
}

/// Fixed-capacity list of peers, least-recently-seen at the head
#[derive(Debug, Clone)]
pub struct KBucket {
    peers: VecDeque<DhtPeer>,
    capacity: usize,
}

impl KBucket {
    /// Create an empty bucket
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            peers: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Offer a peer to the bucket
    ///
    /// Known peers are refreshed and moved to the tail. Unknown peers are
    /// appended while there is room, or replace the head if it has been silent
    /// for longer than `stale_timeout`.
    pub fn insert(&mut self, mut peer: DhtPeer, stale_timeout: Duration) -> InsertOutcome {
        if let Some(pos) = self.position(peer.wallet()) {
            self.peers.remove(pos);
            peer.touch();
            self.peers.push_back(peer);
            return InsertOutcome::Updated;
        }

        if self.peers.len() < self.capacity {
            self.peers.push_back(peer);
            return InsertOutcome::Inserted;
        }

        let head_stale = self
            .peers
            .front()
            .is_some_and(|head| head.is_stale(stale_timeout));

        if head_stale {
            if let Some(evicted) = self.peers.pop_front() {
                self.peers.push_back(peer);
                return InsertOutcome::Evicted(*evicted.wallet());
            }
        }

        InsertOutcome::Full
    }

    /// Remove a peer by wallet
    pub fn remove(&mut self, wallet: &WalletAddress) -> Option<DhtPeer> {
        let pos = self.position(wallet)?;
        self.peers.remove(pos)
    }

    /// Refresh `last_seen` and move the peer to the tail
    pub fn mark_seen(&mut self, wallet: &WalletAddress) -> bool {
        match self.position(wallet).and_then(|pos| self.peers.remove(pos)) {
            Some(mut peer) => {
                peer.touch();
                self.peers.push_back(peer);
                true
            }
            None => false,
        }
    }

    /// Look up a peer by wallet
    #[must_use]
    pub fn get(&self, wallet: &WalletAddress) -> Option<&DhtPeer> {
        self.peers.iter().find(|p| p.wallet() == wallet)
    }

    /// Peers in least-recently-seen order
    pub fn iter(&self) -> impl Iterator<Item = &DhtPeer> {
        self.peers.iter()
    }

    /// Number of peers
    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Whether the bucket is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Whether the bucket is at capacity
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.peers.len() >= self.capacity
    }

    fn position(&self, wallet: &WalletAddress) -> Option<usize> {
        self.peers.iter().position(|p| p.wallet() == wallet)
    }
}

/// Routing table: one independently locked bucket per distance prefix
pub struct RoutingTable {
    local_id: NodeId,
    buckets: Vec<Mutex<KBucket>>,
    stale_timeout: Duration,
}

impl RoutingTable {
    /// Create an empty table centred on `local_id`
    #[must_use]
    pub fn new(local_id: NodeId, bucket_capacity: usize, stale_timeout: Duration) -> Self {
        let buckets = (0..NUM_BUCKETS)
            .map(|_| Mutex::new(KBucket::new(bucket_capacity)))
            .collect();
        Self {
            local_id,
            buckets,
            stale_timeout,
        }
    }

    /// Local node's ID
    #[must_use]
    pub const fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    /// Offer a peer to its bucket
    pub fn insert(&self, peer: DhtPeer) -> InsertOutcome {
        let index = peer.node_id().bucket_index(&self.local_id);
        self.buckets[index].lock().insert(peer, self.stale_timeout)
    }

    /// Remove a peer
    pub fn remove(&self, wallet: &WalletAddress) -> Option<DhtPeer> {
        self.bucket_for(wallet).lock().remove(wallet)
    }

    /// Refresh a peer's liveness
    pub fn mark_seen(&self, wallet: &WalletAddress) -> bool {
        self.bucket_for(wallet).lock().mark_seen(wallet)
    }

    /// Look up a peer
    #[must_use]
    pub fn get(&self, wallet: &WalletAddress) -> Option<DhtPeer> {
        self.bucket_for(wallet).lock().get(wallet).cloned()
    }

    /// Up to `count` peers sorted by ascending XOR distance to `target`
    ///
    /// Scans every bucket; ties keep an arbitrary but stable order.
    #[must_use]
    pub fn find_closest(&self, target: &NodeId, count: usize) -> Vec<DhtPeer> {
        let mut all = self.all_peers();
        all.sort_by_cached_key(|p| p.node_id().distance(target));
        all.truncate(count);
        all
    }

    /// Snapshot of every peer
    #[must_use]
    pub fn all_peers(&self) -> Vec<DhtPeer> {
        let mut out = Vec::new();
        for bucket in &self.buckets {
            out.extend(bucket.lock().iter().cloned());
        }
        out
    }

    /// Total number of peers
    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.lock().len()).sum()
    }

    /// Whether the table is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|b| b.lock().is_empty())
    }

    /// Size of each non-empty bucket as `(index, len)`
    #[must_use]
    pub fn bucket_sizes(&self) -> Vec<(usize, usize)> {
        self.buckets
            .iter()
            .enumerate()
            .filter_map(|(i, b)| {
                let len = b.lock().len();
                (len > 0).then_some((i, len))
            })
            .collect()
    }

    fn bucket_for(&self, wallet: &WalletAddress) -> &Mutex<KBucket> {
        let index = NodeId::from_wallet(wallet).bucket_index(&self.local_id);
        &self.buckets[index]
    }
}
