//! DHT Node Identity and Distance Metric
//!
//! This module provides the NodeId type, the 256-bit coordinate used by the
//! Kademlia routing table. A NodeId is the SHA-256 digest of the lowercased,
//! `0x`-prefixed wallet address. It is only ever used for distance comparison;
//! trust comes from wallet signatures, never from the identifier itself.

use mumble_crypto::WalletAddress;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::fmt;

/// 256-bit node identifier for the Kademlia DHT
///
/// The XOR metric is used for distance calculation, which provides
/// the symmetric and unidirectional properties required by Kademlia.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeId([u8; 32]);

impl NodeId {
    /// Number of bits in a NodeId
    pub const BITS: usize = 256;

    /// Generate a random NodeId
    ///
    /// Used for tests and random-target routing table refreshes. Live nodes
    /// derive their IDs from wallet addresses with `from_wallet`.
    ///
    /// # Examples
    ///
    /// ```
    /// use mumble_discovery::dht::NodeId;
    ///
    /// let id = NodeId::random();
    /// assert_eq!(id.as_bytes().len(), 32);
    /// ```
    #[must_use]
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        let mut bytes = [0u8; 32];
        rng.fill(&mut bytes[..]);
        Self(bytes)
    }

    /// Derive a NodeId from a wallet address
    ///
    /// Hashes the lowercased `0x`-prefixed string form, so every casing of the
    /// same wallet lands on the same coordinate.
    ///
    /// # Examples
    ///
    /// ```
    /// use mumble_crypto::WalletAddress;
    /// use mumble_discovery::dht::NodeId;
    ///
    /// let a = WalletAddress::parse("0xAB5801A7D398351B8BE11C439E05C5B3259AEC9B").unwrap();
    /// let b = WalletAddress::parse("0xab5801a7d398351b8be11c439e05c5b3259aec9b").unwrap();
    /// assert_eq!(NodeId::from_wallet(&a), NodeId::from_wallet(&b));
    /// ```
    #[must_use]
    pub fn from_wallet(wallet: &WalletAddress) -> Self {
        let digest = Sha256::digest(wallet.to_string().as_bytes());
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    /// Calculate XOR distance to another NodeId
    ///
    /// # Examples
    ///
    /// ```
    /// use mumble_discovery::dht::NodeId;
    ///
    /// let id1 = NodeId::from_bytes([1u8; 32]);
    /// let id2 = NodeId::from_bytes([2u8; 32]);
    /// assert_eq!(id1.distance(&id2).as_bytes()[0], 3);
    /// ```
    #[must_use]
    pub fn distance(&self, other: &NodeId) -> NodeId {
        let mut result = [0u8; 32];
        for (i, byte) in result.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        NodeId(result)
    }

    /// Count leading zero bits (0-256)
    #[must_use]
    pub fn leading_zeros(&self) -> usize {
        let mut count = 0;
        for byte in &self.0 {
            if *byte == 0 {
                count += 8;
            } else {
                count += byte.leading_zeros() as usize;
                break;
            }
        }
        count.min(Self::BITS)
    }

    /// Get the bucket index for this NodeId relative to a local ID
    ///
    /// Equal to `255 - distance.leading_zeros()`. Identical IDs have zero
    /// distance and map to bucket 0; callers reject self before indexing.
    ///
    /// # Examples
    ///
    /// ```
    /// use mumble_discovery::dht::NodeId;
    ///
    /// let local = NodeId::from_bytes([0u8; 32]);
    /// let mut remote_bytes = [0u8; 32];
    /// remote_bytes[0] = 0b10000000;
    /// let remote = NodeId::from_bytes(remote_bytes);
    /// assert_eq!(remote.bucket_index(&local), 255);
    /// assert_eq!(local.bucket_index(&local), 0);
    /// ```
    #[must_use]
    pub fn bucket_index(&self, local_id: &NodeId) -> usize {
        let leading = self.distance(local_id).leading_zeros();
        if leading == Self::BITS {
            0
        } else {
            Self::BITS - 1 - leading
        }
    }

    /// Whether every bit is zero
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Get the raw bytes of the NodeId
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Create NodeId from raw bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Full 64-digit lowercase hex form, as carried on the wire
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse the 64-digit hex form
    ///
    /// # Errors
    ///
    /// Returns `InvalidNodeId` if the input is not 32 bytes of hex.
    pub fn from_hex(s: &str) -> Result<Self, InvalidNodeId> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s.trim(), &mut bytes).map_err(|_| InvalidNodeId(s.to_string()))?;
        Ok(Self(bytes))
    }
}

/// NodeId hex could not be parsed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid node id: {0}")]
pub struct InvalidNodeId(pub String);

impl TryFrom<String> for NodeId {
    type Error = InvalidNodeId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_hex(&value)
    }
}

impl From<NodeId> for String {
    fn from(value: NodeId) -> Self {
        value.to_hex()
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl PartialOrd for NodeId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NodeId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}
