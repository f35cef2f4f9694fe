//! P2P manager configuration

use crate::node::error::{NodeError, Result};
use mumble_discovery::dht::DhtConfig;
use mumble_discovery::{BootstrapCandidate, DEFAULT_LAN_PORT, RateLimitConfig};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Well-known P2P TCP port
pub const DEFAULT_P2P_PORT: u16 = 19370;

/// P2P manager configuration
#[derive(Debug, Clone)]
pub struct P2pConfig {
    /// Listen address for incoming peer connections
    pub listen_addr: SocketAddr,

    /// Fall back to an ephemeral port if `listen_addr` is taken
    pub allow_ephemeral_fallback: bool,

    /// Host advertised to peers, if different from the socket address
    pub advertised_host: Option<String>,

    /// Operate as a relay node (forward gossip, accept relay receipts)
    pub is_relay: bool,

    /// Static bootstrap list, used when the relay registry yields nothing
    pub bootstrap_nodes: Vec<BootstrapCandidate>,

    /// Connection and health-check timing
    pub network: NetworkConfig,

    /// Gossip and dedup settings
    pub gossip: GossipConfig,

    /// LAN broadcast discovery
    pub lan: LanConfig,

    /// Store-for-later queue
    pub pending: PendingConfig,

    /// Maximum receipts held for submission
    pub max_pending_receipts: usize,

    /// Reconnection policy
    pub reconnect: ReconnectConfig,

    /// Rate limiter ceilings
    pub rate_limit: RateLimitConfig,

    /// DHT settings
    pub dht: DhtConfig,

    /// Capacity of the incoming-message and receipt broadcast channels
    pub event_capacity: usize,
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            // Use port 0 (auto-select) in tests to avoid port conflicts
            #[cfg(test)]
            listen_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            #[cfg(not(test))]
            listen_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_P2P_PORT)),
            allow_ephemeral_fallback: true,
            advertised_host: None,
            is_relay: false,
            bootstrap_nodes: Vec::new(),
            network: NetworkConfig::default(),
            gossip: GossipConfig::default(),
            lan: LanConfig::default(),
            pending: PendingConfig::default(),
            max_pending_receipts: 10_000,
            reconnect: ReconnectConfig::default(),
            rate_limit: RateLimitConfig::default(),
            dht: DhtConfig::default(),
            event_capacity: 256,
        }
    }
}

impl P2pConfig {
    /// Check invariants that would make the manager misbehave
    ///
    /// # Errors
    ///
    /// Returns `NodeError::InvalidConfig` naming the offending setting.
    pub fn validate(&self) -> Result<()> {
        if self.network.alpha == 0 {
            return Err(NodeError::invalid_config("network.alpha must be at least 1"));
        }
        if self.network.peer_timeout <= self.network.ping_interval {
            return Err(NodeError::invalid_config(
                "network.peer_timeout must exceed network.ping_interval",
            ));
        }
        if self.network.connect_timeout.is_zero() || self.network.handshake_timeout.is_zero() {
            return Err(NodeError::invalid_config("network timeouts must be non-zero"));
        }
        if self.gossip.interval.is_zero() || self.network.ping_interval.is_zero() {
            return Err(NodeError::invalid_config("loop intervals must be non-zero"));
        }
        if self.pending.max_per_recipient == 0 {
            return Err(NodeError::invalid_config(
                "pending.max_per_recipient must be at least 1",
            ));
        }
        if self.max_pending_receipts == 0 {
            return Err(NodeError::invalid_config("max_pending_receipts must be at least 1"));
        }
        if self.event_capacity == 0 {
            return Err(NodeError::invalid_config("event_capacity must be at least 1"));
        }
        if self.dht.k == 0 {
            return Err(NodeError::invalid_config("dht.k must be at least 1"));
        }
        if self.lan.enabled && self.lan.interval.is_zero() {
            return Err(NodeError::invalid_config("lan.interval must be non-zero"));
        }
        Ok(())
    }
}

/// Connection and health-check timing
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Bootstrap connections to establish before stopping (Kademlia alpha)
    pub alpha: usize,

    /// TCP connect timeout
    pub connect_timeout: Duration,

    /// Time allowed for the peer's handshake line
    pub handshake_timeout: Duration,

    /// Ping / stale-peer sweep interval
    pub ping_interval: Duration,

    /// Silence after which a peer is disconnected
    pub peer_timeout: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            alpha: 3,
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(30),
            peer_timeout: Duration::from_secs(120),
        }
    }
}

/// Gossip and dedup settings
#[derive(Debug, Clone)]
pub struct GossipConfig {
    /// Cache cleanup / pending retry / receipt submission interval
    pub interval: Duration,

    /// Forwards allowed for messages this node originates
    pub default_ttl: u8,

    /// How long a message ID is remembered
    pub message_cache_ttl: Duration,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            default_ttl: 10,
            message_cache_ttl: Duration::from_secs(3600), // 1 hour
        }
    }
}

/// LAN broadcast discovery
#[derive(Debug, Clone)]
pub struct LanConfig {
    /// Enable LAN discovery
    pub enabled: bool,

    /// UDP port for announcements
    pub port: u16,

    /// Broadcast interval
    pub interval: Duration,

    /// Where announcements are sent (defaults to 255.255.255.255:port)
    pub target: Option<SocketAddr>,
}

impl Default for LanConfig {
    fn default() -> Self {
        Self {
            #[cfg(test)]
            enabled: false,
            #[cfg(not(test))]
            enabled: true,
            port: DEFAULT_LAN_PORT,
            interval: Duration::from_secs(10),
            target: None,
        }
    }
}

/// Store-for-later queue bounds
#[derive(Debug, Clone)]
pub struct PendingConfig {
    /// Messages held per recipient before the oldest is dropped
    pub max_per_recipient: usize,

    /// Lifetime of a queued message
    pub message_ttl: Duration,
}

impl Default for PendingConfig {
    fn default() -> Self {
        Self {
            max_per_recipient: 100,
            message_ttl: Duration::from_secs(24 * 3600),
        }
    }
}

/// Exponential backoff for re-joining after losing every peer
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Enable automatic reconnection
    pub enabled: bool,

    /// Attempts before settling back into genesis mode
    pub max_attempts: u32,

    /// First backoff
    pub initial_backoff: Duration,

    /// Backoff ceiling
    pub max_backoff: Duration,

    /// Backoff multiplier
    pub multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 8,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

impl ReconnectConfig {
    /// Backoff before attempt number `attempt` (0-based)
    #[must_use]
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base = self.initial_backoff.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = base.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}
