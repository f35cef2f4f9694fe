//! Bootstrap candidate resolution.
//!
//! Candidates come from three sources, merged in priority order:
//!
//! 1. The on-chain relay registry (staked relay nodes, trusted provenance)
//! 2. The static fallback list, used only when the registry yields nothing
//! 3. Peers recently heard on the LAN discovery port
//!
//! Duplicates are collapsed by endpoint, keeping the highest-priority entry.

use crate::dht::{DhtPeer, Endpoint};
use async_trait::async_trait;
use dashmap::DashMap;
use mumble_crypto::WalletAddress;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Bootstrap errors
#[derive(Debug, Error, Clone)]
pub enum BootstrapError {
    /// The relay registry could not be queried
    #[error("relay registry unavailable: {0}")]
    Registry(String),

    /// A configured bootstrap entry could not be parsed
    #[error("invalid bootstrap entry '{0}' (expected host:port or 0xwallet@host:port)")]
    InvalidEntry(String),
}

/// A staked relay node as published on chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayNodeInfo {
    /// Relay operator wallet
    pub wallet: WalletAddress,
    /// Where the relay accepts connections
    pub endpoint: Endpoint,
    /// Stake in the smallest token unit
    pub staked_amount: u128,
    /// Messages the relay has been rewarded for
    pub messages_relayed: u64,
}

/// Read access to the on-chain relay registry
#[async_trait]
pub trait RelayRegistry: Send + Sync {
    /// Currently active relay nodes
    async fn active_relay_nodes(&self) -> Result<Vec<RelayNodeInfo>, BootstrapError>;

    /// Whether `wallet` is a registered relay
    async fn is_registered_relay(&self, wallet: &WalletAddress) -> Result<bool, BootstrapError> {
        Ok(self
            .active_relay_nodes()
            .await?
            .iter()
            .any(|node| node.wallet == *wallet))
    }
}

/// Registry backed by an in-memory list
///
/// Used when relays are configured by hand and as a test double.
#[derive(Debug, Default)]
pub struct StaticRelayRegistry {
    nodes: RwLock<Vec<RelayNodeInfo>>,
}

impl StaticRelayRegistry {
    /// Create with an initial relay list
    #[must_use]
    pub fn new(nodes: Vec<RelayNodeInfo>) -> Self {
        Self {
            nodes: RwLock::new(nodes),
        }
    }

    /// Add a relay
    pub fn register(&self, node: RelayNodeInfo) {
        let mut nodes = self.nodes.write();
        nodes.retain(|n| n.wallet != node.wallet);
        nodes.push(node);
    }
}

#[async_trait]
impl RelayRegistry for StaticRelayRegistry {
    async fn active_relay_nodes(&self) -> Result<Vec<RelayNodeInfo>, BootstrapError> {
        Ok(self.nodes.read().clone())
    }
}

/// Where a candidate came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BootstrapSource {
    /// On-chain relay registry
    Chain,
    /// Static fallback list
    Static,
    /// LAN broadcast
    Lan,
}

/// A peer worth dialling at startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapCandidate {
    /// Endpoint to dial
    pub endpoint: Endpoint,
    /// Wallet, when known before the handshake
    pub wallet: Option<WalletAddress>,
    /// Whether the candidate is a staked relay
    pub is_relay: bool,
    /// Source of the candidate
    pub source: BootstrapSource,
}

impl BootstrapCandidate {
    /// Static entry without a known wallet
    #[must_use]
    pub fn from_endpoint(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            wallet: None,
            is_relay: false,
            source: BootstrapSource::Static,
        }
    }

    /// DHT entry for candidates whose wallet is known
    #[must_use]
    pub fn to_dht_peer(&self) -> Option<DhtPeer> {
        self.wallet
            .map(|w| DhtPeer::new(w, self.endpoint.clone()).with_relay(self.is_relay))
    }
}

impl From<&RelayNodeInfo> for BootstrapCandidate {
    fn from(node: &RelayNodeInfo) -> Self {
        Self {
            endpoint: node.endpoint.clone(),
            wallet: Some(node.wallet),
            is_relay: true,
            source: BootstrapSource::Chain,
        }
    }
}

impl FromStr for BootstrapCandidate {
    type Err = BootstrapError;

    /// Parse `host:port` or `0xwallet@host:port`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || BootstrapError::InvalidEntry(s.to_string());
        let (wallet, endpoint) = match s.trim().split_once('@') {
            Some((wallet, endpoint)) => (
                Some(WalletAddress::parse(wallet).map_err(|_| invalid())?),
                endpoint,
            ),
            None => (None, s.trim()),
        };
        let endpoint: Endpoint = endpoint.parse().map_err(|_| invalid())?;
        Ok(Self {
            endpoint,
            wallet,
            is_relay: false,
            source: BootstrapSource::Static,
        })
    }
}

impl fmt::Display for BootstrapCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.wallet {
            Some(w) => write!(f, "{}@{}", w, self.endpoint),
            None => write!(f, "{}", self.endpoint),
        }
    }
}

/// Merges registry, static and LAN candidates
pub struct BootstrapResolver {
    registry: Option<Arc<dyn RelayRegistry>>,
    static_nodes: Vec<BootstrapCandidate>,
    lan_peers: DashMap<WalletAddress, (Endpoint, Instant)>,
    lan_ttl: Duration,
}

impl BootstrapResolver {
    /// Create a resolver
    ///
    /// # Arguments
    ///
    /// * `registry` - On-chain relay registry, if available
    /// * `static_nodes` - Fallback list used when the registry is empty
    #[must_use]
    pub fn new(
        registry: Option<Arc<dyn RelayRegistry>>,
        static_nodes: Vec<BootstrapCandidate>,
    ) -> Self {
        Self {
            registry,
            static_nodes,
            lan_peers: DashMap::new(),
            lan_ttl: Duration::from_secs(60),
        }
    }

    /// Override how long LAN sightings remain candidates
    #[must_use]
    pub fn with_lan_ttl(mut self, ttl: Duration) -> Self {
        self.lan_ttl = ttl;
        self
    }

    /// Registry in use
    #[must_use]
    pub fn registry(&self) -> Option<&Arc<dyn RelayRegistry>> {
        self.registry.as_ref()
    }

    /// Relay nodes from the registry; empty when unavailable
    pub async fn relay_nodes(&self) -> Vec<RelayNodeInfo> {
        let Some(registry) = &self.registry else {
            return Vec::new();
        };
        match registry.active_relay_nodes().await {
            Ok(nodes) => nodes,
            Err(e) => {
                tracing::warn!("Relay registry query failed: {}", e);
                Vec::new()
            }
        }
    }

    /// Whether the registry lists `wallet` as a relay
    pub async fn is_registered_relay(&self, wallet: &WalletAddress) -> bool {
        let Some(registry) = &self.registry else {
            return false;
        };
        registry
            .is_registered_relay(wallet)
            .await
            .unwrap_or_else(|e| {
                tracing::debug!("Relay registration check failed for {}: {}", wallet, e);
                false
            })
    }

    /// Remember a peer heard on the LAN
    pub fn record_lan_peer(&self, wallet: WalletAddress, endpoint: Endpoint) {
        self.lan_peers.insert(wallet, (endpoint, Instant::now()));
    }

    /// Resolve the candidate list
    ///
    /// Registry relays first; the static list only when the registry yields
    /// none; then fresh LAN sightings. Deduplicated by endpoint.
    pub async fn resolve(&self) -> Vec<BootstrapCandidate> {
        let chain: Vec<BootstrapCandidate> = self
            .relay_nodes()
            .await
            .iter()
            .map(BootstrapCandidate::from)
            .collect();

        let mut merged = if chain.is_empty() {
            tracing::debug!(
                "No registry relays, using {} static bootstrap nodes",
                self.static_nodes.len()
            );
            self.static_nodes.clone()
        } else {
            chain
        };

        self.lan_peers
            .retain(|_, (_, seen)| seen.elapsed() < self.lan_ttl);
        merged.extend(self.lan_peers.iter().map(|entry| BootstrapCandidate {
            endpoint: entry.value().0.clone(),
            wallet: Some(*entry.key()),
            is_relay: false,
            source: BootstrapSource::Lan,
        }));

        let mut seen = HashSet::new();
        merged.retain(|c| seen.insert(c.endpoint.clone()));

        tracing::info!("Resolved {} bootstrap candidates", merged.len());
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relay(n: u8, port: u16) -> RelayNodeInfo {
        RelayNodeInfo {
            wallet: WalletAddress::from_bytes([n; 20]),
            endpoint: Endpoint::new("10.0.0.1", port),
            staked_amount: 1_000,
            messages_relayed: 0,
        }
    }

    struct FailingRegistry;

    #[async_trait]
    impl RelayRegistry for FailingRegistry {
        async fn active_relay_nodes(&self) -> Result<Vec<RelayNodeInfo>, BootstrapError> {
            Err(BootstrapError::Registry("rpc down".into()))
        }
    }

    #[test]
    fn test_parse_candidates() {
        let c: BootstrapCandidate = "10.1.1.1:19370".parse().unwrap();
        assert_eq!(c.endpoint, Endpoint::new("10.1.1.1", 19370));
        assert!(c.wallet.is_none());

        let entry = format!("0x{}@seed.example.org:19370", "ab".repeat(20));
        let c: BootstrapCandidate = entry.parse().unwrap();
        assert_eq!(c.wallet, Some(WalletAddress::from_bytes([0xAB; 20])));
        assert_eq!(c.to_string(), entry);

        assert!("not-an-entry".parse::<BootstrapCandidate>().is_err());
        assert!("0x12@host:1".parse::<BootstrapCandidate>().is_err());
    }

    #[tokio::test]
    async fn test_registry_preferred_over_static() {
        let registry = Arc::new(StaticRelayRegistry::new(vec![relay(1, 1000), relay(2, 1001)]));
        let resolver = BootstrapResolver::new(
            Some(registry),
            vec!["10.9.9.9:19370".parse().unwrap()],
        );

        let candidates = resolver.resolve().await;
        assert_eq!(candidates.len(), 2);
        assert!(candidates.iter().all(|c| c.source == BootstrapSource::Chain && c.is_relay));
    }

    #[tokio::test]
    async fn test_static_fallback_when_registry_empty_or_failing() {
        let statics = vec!["10.9.9.9:19370".parse().unwrap()];

        let resolver = BootstrapResolver::new(
            Some(Arc::new(StaticRelayRegistry::default())),
            statics.clone(),
        );
        assert_eq!(resolver.resolve().await, statics);

        let resolver = BootstrapResolver::new(Some(Arc::new(FailingRegistry)), statics.clone());
        assert_eq!(resolver.resolve().await, statics);

        let resolver = BootstrapResolver::new(None, statics.clone());
        assert_eq!(resolver.resolve().await, statics);
    }

    #[tokio::test]
    async fn test_lan_candidates_merged_and_deduplicated() {
        let resolver = BootstrapResolver::new(None, vec!["10.0.0.5:19370".parse().unwrap()]);
        resolver.record_lan_peer(
            WalletAddress::from_bytes([3; 20]),
            Endpoint::new("10.0.0.5", 19370),
        );
        resolver.record_lan_peer(
            WalletAddress::from_bytes([4; 20]),
            Endpoint::new("10.0.0.6", 19370),
        );

        let candidates = resolver.resolve().await;
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].source, BootstrapSource::Static);
        assert_eq!(candidates[1].source, BootstrapSource::Lan);
    }

    #[tokio::test]
    async fn test_lan_sightings_expire() {
        let resolver = BootstrapResolver::new(None, vec![]).with_lan_ttl(Duration::from_millis(10));
        resolver.record_lan_peer(
            WalletAddress::from_bytes([3; 20]),
            Endpoint::new("10.0.0.5", 19370),
        );
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(resolver.resolve().await.is_empty());
    }

    #[tokio::test]
    async fn test_genesis_resolves_empty() {
        let resolver =
            BootstrapResolver::new(Some(Arc::new(StaticRelayRegistry::default())), vec![]);
        assert!(resolver.resolve().await.is_empty());
    }

    #[tokio::test]
    async fn test_is_registered_relay() {
        let registry = Arc::new(StaticRelayRegistry::new(vec![relay(1, 1000)]));
        let resolver = BootstrapResolver::new(Some(registry.clone()), vec![]);
        assert!(resolver.is_registered_relay(&WalletAddress::from_bytes([1; 20])).await);
        assert!(!resolver.is_registered_relay(&WalletAddress::from_bytes([2; 20])).await);

        registry.register(relay(2, 1001));
        assert!(resolver.is_registered_relay(&WalletAddress::from_bytes([2; 20])).await);

        let no_registry = BootstrapResolver::new(None, vec![]);
        assert!(!no_registry.is_registered_relay(&WalletAddress::from_bytes([1; 20])).await);
    }
}
