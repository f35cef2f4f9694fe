//! Routing table entries.

use super::NodeId;
use mumble_crypto::WalletAddress;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

/// Network endpoint of a peer (host name or IP, plus TCP port)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    /// Host name or IP literal
    pub host: String,
    /// TCP port
    pub port: u16,
}

impl Endpoint {
    /// Create an endpoint
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl From<std::net::SocketAddr> for Endpoint {
    fn from(addr: std::net::SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

/// Error parsing an endpoint string
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid endpoint '{0}' (expected host:port)")]
pub struct InvalidEndpoint(pub String);

impl FromStr for Endpoint {
    type Err = InvalidEndpoint;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| InvalidEndpoint(s.to_string()))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let port: u16 = port.parse().map_err(|_| InvalidEndpoint(s.to_string()))?;
        if host.is_empty() || port == 0 {
            return Err(InvalidEndpoint(s.to_string()));
        }
        Ok(Self::new(host, port))
    }
}

/// A peer known to the DHT
///
/// Equality is by wallet address only; two entries for the same wallet with
/// different endpoints are the same peer.
#[derive(Clone)]
pub struct DhtPeer {
    wallet: WalletAddress,
    node_id: NodeId,
    /// Where the peer accepts TCP connections
    pub endpoint: Endpoint,
    /// Last time the peer was observed alive
    pub last_seen: Instant,
    /// Whether the peer is a staked relay node
    pub is_relay: bool,
    /// Announcement signature over `"<tag>:<wallet>:<timestamp>"`
    pub signature: Option<Vec<u8>>,
    /// Timestamp (ms since epoch) covered by `signature`
    pub signature_timestamp: Option<u64>,
}

impl DhtPeer {
    /// Create an unsigned entry, deriving the NodeId from the wallet
    #[must_use]
    pub fn new(wallet: WalletAddress, endpoint: Endpoint) -> Self {
        Self {
            node_id: NodeId::from_wallet(&wallet),
            wallet,
            endpoint,
            last_seen: Instant::now(),
            is_relay: false,
            signature: None,
            signature_timestamp: None,
        }
    }

    /// Mark as a relay node
    #[must_use]
    pub fn with_relay(mut self, is_relay: bool) -> Self {
        self.is_relay = is_relay;
        self
    }

    /// Attach an announcement signature
    #[must_use]
    pub fn with_signature(mut self, signature: Vec<u8>, timestamp_ms: u64) -> Self {
        self.signature = Some(signature);
        self.signature_timestamp = Some(timestamp_ms);
        self
    }

    /// Wallet address
    #[must_use]
    pub const fn wallet(&self) -> &WalletAddress {
        &self.wallet
    }

    /// NodeId derived from the wallet
    #[must_use]
    pub const fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Whether the peer has been silent for longer than `timeout`
    #[must_use]
    pub fn is_stale(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }

    /// Refresh `last_seen`
    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }
}

impl PartialEq for DhtPeer {
    fn eq(&self, other: &Self) -> bool {
        self.wallet == other.wallet
    }
}

impl Eq for DhtPeer {}

impl fmt::Debug for DhtPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DhtPeer")
            .field("wallet", &self.wallet)
            .field("node_id", &self.node_id)
            .field("endpoint", &self.endpoint.to_string())
            .field("is_relay", &self.is_relay)
            .field("signed", &self.signature.is_some())
            .finish()
    }
}
