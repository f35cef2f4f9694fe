//! Error types for the P2P manager
//!
//! Errors are categorized to support retry logic. Admission refusals and
//! rate-limit refusals are never errors; they surface as `false` or as a
//! fallback delivery path.
//!
//! # Error Categories
//!
//! - **Transient**: may succeed on retry (connect timeouts, closed sockets)
//! - **Permanent**: will not succeed without intervention (bad config, invalid state)
//!
//! # Example
//!
//! ```
//! use mumble_core::node::NodeError;
//!
//! let err = NodeError::timeout("connect");
//! assert!(err.is_transient());
//! assert!(!err.should_retry());
//! ```

use crate::protocol::ProtocolError;
use mumble_crypto::WalletAddress;
use std::borrow::Cow;
use thiserror::Error;

/// Errors that can occur in P2P manager operations
#[derive(Debug, Error, Clone)]
pub enum NodeError {
    // ============ Transport Errors ============
    /// Listening socket could not be opened
    #[error("Listener bind failed: {0}")]
    Bind(Cow<'static, str>),

    /// Transport operation failed
    #[error("Transport error: {0}")]
    Transport(Cow<'static, str>),

    /// Handshake failed or was refused
    #[error("Handshake failed: {0}")]
    Handshake(Cow<'static, str>),

    /// Peer has no live connection
    #[error("Peer not connected: {0}")]
    PeerNotConnected(WalletAddress),

    /// Peer's outbound queue is full
    #[error("Outbound queue full for peer {0}")]
    Backpressure(WalletAddress),

    // ============ Protocol & Crypto Errors ============
    /// Frame encode/decode failed
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Cryptographic operation failed
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Message cannot be sent as given
    #[error("Invalid message: {0}")]
    InvalidMessage(Cow<'static, str>),

    // ============ Discovery Errors ============
    /// Discovery operation failed
    #[error("Discovery error: {0}")]
    Discovery(Cow<'static, str>),

    // ============ Configuration & State Errors ============
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),

    /// Invalid state transition
    #[error("Invalid state: {0}")]
    InvalidState(Cow<'static, str>),

    // ============ Operational Errors ============
    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(Cow<'static, str>),

    /// Collaborator service failed
    #[error("Service error: {0}")]
    Service(Cow<'static, str>),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(String),
}

impl NodeError {
    /// Returns true if this error is transient and may succeed on retry
    ///
    /// Transient errors include:
    /// - Connect and handshake timeouts
    /// - Transport failures (peer went away, connection reset)
    /// - Collaborator service failures
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            NodeError::Timeout(_)
                | NodeError::Transport(_)
                | NodeError::PeerNotConnected(_)
                | NodeError::Backpressure(_)
                | NodeError::Service(_)
                | NodeError::Io(_)
        )
    }

    /// Returns true if this error is permanent and will not succeed on retry
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            NodeError::InvalidConfig(_)
                | NodeError::InvalidState(_)
                | NodeError::InvalidMessage(_)
                | NodeError::Bind(_)
        )
    }

    /// Returns true if this error should trigger a retry with exponential backoff
    #[must_use]
    pub fn should_retry(&self) -> bool {
        self.is_transient() && !matches!(self, NodeError::Timeout(_))
    }

    /// Create a transport error with static context (zero allocation)
    #[must_use]
    pub const fn transport(context: &'static str) -> Self {
        NodeError::Transport(Cow::Borrowed(context))
    }

    /// Create a timeout error with static context (zero allocation)
    #[must_use]
    pub const fn timeout(context: &'static str) -> Self {
        NodeError::Timeout(Cow::Borrowed(context))
    }

    /// Create a handshake error with static context (zero allocation)
    #[must_use]
    pub const fn handshake(context: &'static str) -> Self {
        NodeError::Handshake(Cow::Borrowed(context))
    }

    /// Create an invalid state error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_state(context: &'static str) -> Self {
        NodeError::InvalidState(Cow::Borrowed(context))
    }

    /// Create an invalid config error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_config(context: &'static str) -> Self {
        NodeError::InvalidConfig(Cow::Borrowed(context))
    }

    /// Create a discovery error with static context (zero allocation)
    #[must_use]
    pub const fn discovery(context: &'static str) -> Self {
        NodeError::Discovery(Cow::Borrowed(context))
    }
}

impl From<ProtocolError> for NodeError {
    fn from(err: ProtocolError) -> Self {
        NodeError::Protocol(err.to_string())
    }
}

impl From<mumble_crypto::CryptoError> for NodeError {
    fn from(err: mumble_crypto::CryptoError) -> Self {
        NodeError::Crypto(err.to_string())
    }
}

impl From<mumble_discovery::dht::DhtError> for NodeError {
    fn from(err: mumble_discovery::dht::DhtError) -> Self {
        NodeError::Discovery(err.to_string().into())
    }
}

impl From<std::io::Error> for NodeError {
    fn from(err: std::io::Error) -> Self {
        NodeError::Io(err.to_string())
    }
}

/// Result type for P2P manager operations
pub type Result<T> = std::result::Result<T, NodeError>;
