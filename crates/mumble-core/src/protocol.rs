//! Wire protocol: newline-delimited JSON over TCP.
//!
//! Every connection starts with one [`Handshake`] line in each direction.
//! After that each line is a [`WireMessage`], dispatched on its `type` field:
//!
//! ```text
//! {"nodeId":"..","walletAddress":"0x..","publicKey":"04.."}          handshake
//! {"type":"ping","nodeId":"..","timestamp":1700000000000}
//! {"type":"find_node","targetId":".."}
//! {"type":"node_list","nodes":[{"nodeId":"..","walletAddress":"0x..","host":"..","port":19370}]}
//! {"type":"chat","id":"..","from":"0x..","to":"0x..","ciphertext":"..","nonce":"..","authTag":"..","timestamp":..}
//! {"type":"gossip", ...chat fields..., "ttl":9, "relayReceipt":{...}}
//! {"type":"ack","messageId":".."}
//! ```
//!
//! Lines longer than [`MAX_FRAME_LEN`] are discarded without closing the
//! connection; [`FrameCodec`] reports them as [`Frame::Oversized`].

use bytes::BytesMut;
use mumble_crypto::message::{NONCE_SIZE, TAG_SIZE};
use mumble_crypto::{EncryptedMessage, RelayReceipt, WalletAddress};
use mumble_discovery::dht::{DhtPeer, Endpoint, NodeId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::codec::{Decoder, LinesCodec, LinesCodecError};

/// Maximum length of one line on the wire (1 MiB)
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Protocol encode/decode errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Line was not valid JSON for the expected type
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// Encoded frame would exceed [`MAX_FRAME_LEN`]
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    TooLarge(usize),

    /// Serialization failed
    #[error("encode failed: {0}")]
    Encode(String),
}

// ═══════════════════════════════════════════════════════════════════════════
// Handshake
// ═══════════════════════════════════════════════════════════════════════════

/// First line exchanged on every connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    /// Sender NodeId (must match the wallet)
    pub node_id: NodeId,
    /// Sender wallet
    pub wallet_address: WalletAddress,
    /// Uncompressed secp256k1 public key, hex
    pub public_key: String,
    /// Port the sender accepts connections on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen_port: Option<u16>,
    /// Whether the sender operates as a relay
    #[serde(default)]
    pub is_relay: bool,
    /// Host other nodes should dial instead of the observed source address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advertised_host: Option<String>,
}

impl Handshake {
    /// Whether `node_id` is the one derived from `wallet_address`
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.node_id == NodeId::from_wallet(&self.wallet_address)
    }

    /// The advertised host, if it is a plausible hostname or address
    #[must_use]
    pub fn dial_host(&self) -> Option<&str> {
        self.advertised_host
            .as_deref()
            .filter(|h| is_valid_host(h))
    }
}

/// Non-empty, at most 253 bytes, no whitespace or control characters
#[must_use]
pub fn is_valid_host(host: &str) -> bool {
    !host.is_empty()
        && host.len() <= 253
        && !host.chars().any(|c| c.is_whitespace() || c.is_control())
}

// ═══════════════════════════════════════════════════════════════════════════
// Messages
// ═══════════════════════════════════════════════════════════════════════════

/// Liveness probe; `pong` echoes the timestamp
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ping {
    /// Sender NodeId
    pub node_id: NodeId,
    /// Milliseconds since epoch at the original sender
    pub timestamp: u64,
}

/// Request for the receiver's closest nodes to `target_id`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindNode {
    /// Lookup target
    pub target_id: NodeId,
}

/// One routing-table entry in a `node_list`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeEntry {
    /// NodeId of the entry
    pub node_id: NodeId,
    /// Wallet of the entry
    pub wallet_address: WalletAddress,
    /// Host to dial
    pub host: String,
    /// TCP port to dial
    pub port: u16,
    /// Relay flag as known to the responder
    #[serde(default)]
    pub is_relay: bool,
}

impl NodeEntry {
    /// Entry describing a DHT peer
    #[must_use]
    pub fn from_peer(peer: &DhtPeer) -> Self {
        Self {
            node_id: *peer.node_id(),
            wallet_address: *peer.wallet(),
            host: peer.endpoint.host.clone(),
            port: peer.endpoint.port,
            is_relay: peer.is_relay,
        }
    }

    /// Convert to a DHT peer, rejecting entries whose NodeId does not match the wallet
    #[must_use]
    pub fn to_peer(&self) -> Option<DhtPeer> {
        if self.node_id != NodeId::from_wallet(&self.wallet_address) || self.port == 0 {
            return None;
        }
        Some(
            DhtPeer::new(self.wallet_address, Endpoint::new(self.host.clone(), self.port))
                .with_relay(self.is_relay),
        )
    }
}

/// Response to `find_node`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeList {
    /// Closest known nodes
    pub nodes: Vec<NodeEntry>,
}

/// An encrypted chat message addressed to one wallet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Message ID, unique per sender
    pub id: String,
    /// Original sender
    pub from: WalletAddress,
    /// Final recipient
    pub to: WalletAddress,
    /// Encrypted body
    #[serde(with = "hex::serde")]
    pub ciphertext: Vec<u8>,
    /// AEAD nonce
    #[serde(with = "hex::serde")]
    pub nonce: [u8; NONCE_SIZE],
    /// AEAD tag
    #[serde(with = "hex::serde")]
    pub auth_tag: [u8; TAG_SIZE],
    /// Milliseconds since epoch at the sender
    pub timestamp: u64,
}

impl ChatMessage {
    /// Build from an encrypted payload
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        from: WalletAddress,
        to: WalletAddress,
        payload: &EncryptedMessage,
        timestamp: u64,
    ) -> Self {
        Self {
            id: id.into(),
            from,
            to,
            ciphertext: payload.ciphertext().to_vec(),
            nonce: *payload.nonce(),
            auth_tag: *payload.auth_tag(),
            timestamp,
        }
    }

    /// The encrypted payload carried by this message
    #[must_use]
    pub fn payload(&self) -> EncryptedMessage {
        EncryptedMessage::new(self.nonce, self.ciphertext.clone(), self.auth_tag)
    }
}

/// A chat message being flooded through intermediate peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GossipMessage {
    /// Message fields
    #[serde(flatten)]
    pub chat: ChatMessage,
    /// Remaining forwards
    pub ttl: u8,
    /// Receipt for the relay this copy is handed to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relay_receipt: Option<RelayReceipt>,
}

/// Delivery acknowledgement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ack {
    /// Acknowledged message ID
    pub message_id: String,
}

/// Every post-handshake frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    /// Liveness probe
    Ping(Ping),
    /// Probe response
    Pong(Ping),
    /// Closest-node query
    FindNode(FindNode),
    /// Closest-node response
    NodeList(NodeList),
    /// Direct chat message
    Chat(ChatMessage),
    /// Flooded chat message
    Gossip(GossipMessage),
    /// Delivery acknowledgement
    Ack(Ack),
    /// Any `type` this node does not understand
    #[serde(other)]
    Unknown,
}

impl WireMessage {
    /// Name of the frame type, for logging
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Ping(_) => "ping",
            Self::Pong(_) => "pong",
            Self::FindNode(_) => "find_node",
            Self::NodeList(_) => "node_list",
            Self::Chat(_) => "chat",
            Self::Gossip(_) => "gossip",
            Self::Ack(_) => "ack",
            Self::Unknown => "unknown",
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Line encoding
// ═══════════════════════════════════════════════════════════════════════════

/// Serialize `value` to a single line (without the trailing newline)
///
/// # Errors
///
/// Returns `ProtocolError::TooLarge` if the line would exceed [`MAX_FRAME_LEN`].
pub fn encode_line<T: Serialize>(value: &T) -> Result<String, ProtocolError> {
    let line = serde_json::to_string(value).map_err(|e| ProtocolError::Encode(e.to_string()))?;
    if line.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::TooLarge(line.len()));
    }
    Ok(line)
}

/// Parse one line
///
/// # Errors
///
/// Returns `ProtocolError::Malformed` for invalid JSON or missing fields.
pub fn decode_line<T: DeserializeOwned>(line: &str) -> Result<T, ProtocolError> {
    serde_json::from_str(line).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

/// A line read from the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A complete line
    Line(String),
    /// A line longer than [`MAX_FRAME_LEN`]; its bytes were discarded
    Oversized,
    /// A line that was not UTF-8; its bytes were discarded
    InvalidUtf8,
}

/// Line decoder that survives oversized and non-UTF-8 lines
///
/// `LinesCodec` reports these as errors, which would end a `FramedRead`
/// stream. This wrapper turns them into [`Frame`] variants instead.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    lines: LinesCodec,
}

impl FrameCodec {
    /// Codec with the default [`MAX_FRAME_LEN`] limit
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_length(MAX_FRAME_LEN)
    }

    /// Codec with a custom line limit
    #[must_use]
    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(max_length),
        }
    }

    fn map(result: Result<Option<String>, LinesCodecError>) -> std::io::Result<Option<Frame>> {
        match result {
            Ok(line) => Ok(line.map(Frame::Line)),
            Err(LinesCodecError::MaxLineLengthExceeded) => Ok(Some(Frame::Oversized)),
            Err(LinesCodecError::Io(e)) if e.kind() == std::io::ErrorKind::InvalidData => {
                Ok(Some(Frame::InvalidUtf8))
            }
            Err(LinesCodecError::Io(e)) => Err(e),
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = std::io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, Self::Error> {
        Self::map(self.lines.decode(buf))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, Self::Error> {
        Self::map(self.lines.decode_eof(buf))
    }
}
