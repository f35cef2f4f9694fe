//! Kademlia DHT Implementation
//!
//! This module provides the wallet-keyed Kademlia DHT used to locate peers.
//! Key features include:
//!
//! - 256-bit node identifiers: SHA-256 of the lowercased wallet address
//! - XOR distance metric for closest-node queries
//! - K-bucket routing table (k=20) that prefers long-lived peers
//! - Signed-announcement admission guarded by the shared rate limiter
//! - Small expiring key-value store for auxiliary metadata
//!
//! # Example Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use mumble_crypto::WalletIdentity;
//! use mumble_discovery::RateLimiter;
//! use mumble_discovery::dht::{DhtConfig, Endpoint, KademliaDht};
//!
//! let me = WalletIdentity::generate();
//! let peer = WalletIdentity::generate();
//!
//! let dht = KademliaDht::new(DhtConfig::default(), Arc::new(RateLimiter::default()));
//! dht.initialize(me.address()).unwrap();
//!
//! let announcement = dht
//!     .signed_self_announcement(&peer, Endpoint::new("10.0.0.7", 19370), false)
//!     .unwrap();
//! assert!(dht.add_node(announcement));
//!
//! let closest = dht.find_closest_to_wallet(&peer.address(), 3);
//! assert_eq!(closest[0].wallet(), &peer.address());
//! ```

pub mod kademlia;
pub mod node_id;
pub mod peer;
pub mod routing;
pub mod store;

pub use kademlia::{DEFAULT_PROTOCOL_TAG, DhtConfig, DhtError, DhtStats, KademliaDht};
pub use node_id::{InvalidNodeId, NodeId};
pub use peer::{DhtPeer, Endpoint, InvalidEndpoint};
pub use routing::{InsertOutcome, K, KBucket, NUM_BUCKETS, RoutingTable};
pub use store::{StoredValue, ValueStore};
