//! # MumbleChat Discovery
//!
//! Peer discovery layer for the MumbleChat overlay.
//!
//! This crate provides:
//! - A wallet-keyed Kademlia DHT with signed-announcement admission
//! - The shared sliding-window rate limiter with escalating blocks
//! - Bootstrap resolution from the on-chain relay registry, static config and LAN
//! - LAN discovery over UDP broadcast
//!
//! ## Kademlia DHT
//!
//! - 256-bit node identifiers (SHA-256 of the lowercased wallet address)
//! - XOR distance metric
//! - K-bucket routing (k=20) preferring long-lived peers
//! - Announcements signed with the wallet key (EIP-191, 5 minute freshness)
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use mumble_crypto::WalletIdentity;
//! use mumble_discovery::{RateLimitCategory, RateLimiter};
//! use mumble_discovery::dht::{DhtConfig, KademliaDht};
//!
//! let limiter = Arc::new(RateLimiter::default());
//! let dht = KademliaDht::new(DhtConfig::default(), Arc::clone(&limiter));
//! dht.initialize(WalletIdentity::generate().address()).unwrap();
//!
//! assert!(limiter.check_and_increment(RateLimitCategory::DhtOperation, "10.0.0.1"));
//! assert_eq!(dht.node_count(), 0);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bootstrap;
pub mod dht;
pub mod lan;
pub mod rate_limiter;

// Re-export commonly used types
pub use bootstrap::{
    BootstrapCandidate, BootstrapError, BootstrapResolver, BootstrapSource, RelayNodeInfo,
    RelayRegistry, StaticRelayRegistry,
};
pub use lan::{DEFAULT_LAN_PORT, LAN_MESSAGE_TYPE, LanAnnouncement, LanDiscovery, LanError};
pub use rate_limiter::{RateLimitCategory, RateLimitConfig, RateLimitMetrics, RateLimiter};
