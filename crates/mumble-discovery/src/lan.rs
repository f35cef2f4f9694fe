//! LAN peer discovery over UDP broadcast.
//!
//! Every node periodically broadcasts a small JSON datagram on the LAN port:
//!
//! ```text
//! {"type":"mumblechat_discovery","nodeId":"<hex>","walletAddress":"0x..","port":19370,"timestamp":<ms>,"signature":"<hex>"}
//! ```
//!
//! `signature` is the sender's announcement signature over `timestamp`, the
//! same one carried by DHT node entries. Receivers ignore their own
//! announcements; a signed one from anyone else goes through DHT admission
//! and, if admitted, becomes a candidate for an outbound TCP connection.

use crate::dht::{DhtPeer, Endpoint, NodeId};
use mumble_crypto::{CryptoError, WalletAddress, WalletIdentity, now_millis};
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr};
use thiserror::Error;
use tokio::net::UdpSocket;

/// Value of the `type` field in discovery datagrams
pub const LAN_MESSAGE_TYPE: &str = "mumblechat_discovery";

/// Default LAN discovery port
pub const DEFAULT_LAN_PORT: u16 = 19371;

const MAX_DATAGRAM: usize = 2048;

/// LAN discovery errors
#[derive(Debug, Error)]
pub enum LanError {
    /// Socket setup or I/O failed
    #[error("LAN socket error: {0}")]
    Io(#[from] std::io::Error),

    /// Datagram was not a discovery announcement
    #[error("malformed LAN announcement: {0}")]
    Decode(String),
}

/// A discovery datagram
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LanAnnouncement {
    /// Always [`LAN_MESSAGE_TYPE`]
    #[serde(rename = "type")]
    pub kind: String,
    /// Hex NodeId of the sender
    pub node_id: String,
    /// Sender wallet
    pub wallet_address: WalletAddress,
    /// Sender's P2P TCP port
    pub port: u16,
    /// Milliseconds since epoch
    pub timestamp: u64,
    /// Hex announcement signature covering `timestamp`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl LanAnnouncement {
    /// Announcement for `wallet` listening on `port`
    #[must_use]
    pub fn new(wallet: WalletAddress, port: u16) -> Self {
        Self {
            kind: LAN_MESSAGE_TYPE.to_string(),
            node_id: NodeId::from_wallet(&wallet).to_hex(),
            wallet_address: wallet,
            port,
            timestamp: now_millis(),
            signature: None,
        }
    }

    /// Announcement signed by `identity` under `protocol_tag`
    ///
    /// # Errors
    ///
    /// Returns a `CryptoError` if signing fails.
    pub fn signed(
        identity: &WalletIdentity,
        port: u16,
        protocol_tag: &str,
    ) -> Result<Self, CryptoError> {
        let mut announcement = Self::new(identity.address(), port);
        let signature = identity.sign_announcement(protocol_tag, announcement.timestamp)?;
        announcement.signature = Some(hex::encode(signature));
        Ok(announcement)
    }

    /// DHT candidate for this announcement heard from `host`
    ///
    /// `None` when the announcement is unsigned or the signature is not hex.
    /// The signature itself is checked by DHT admission.
    #[must_use]
    pub fn to_peer(&self, host: impl Into<String>) -> Option<DhtPeer> {
        let signature = hex::decode(self.signature.as_deref()?).ok()?;
        Some(
            DhtPeer::new(self.wallet_address, Endpoint::new(host, self.port))
                .with_signature(signature, self.timestamp),
        )
    }

    /// Type tag matches and the NodeId is the one derived from the wallet
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.kind == LAN_MESSAGE_TYPE
            && self.port != 0
            && NodeId::from_hex(&self.node_id)
                .is_ok_and(|id| id == NodeId::from_wallet(&self.wallet_address))
    }
}

/// UDP broadcaster/listener for [`LanAnnouncement`]s
#[derive(Debug)]
pub struct LanDiscovery {
    socket: UdpSocket,
    target: SocketAddr,
}

impl LanDiscovery {
    /// Limited-broadcast target for `port`
    #[must_use]
    pub fn broadcast_target(port: u16) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::BROADCAST, port))
    }

    /// Bind on `bind_addr`, sending announcements to `target`
    ///
    /// The socket has `SO_REUSEADDR` and `SO_BROADCAST` set so several local
    /// nodes can share the discovery port.
    ///
    /// # Errors
    ///
    /// Returns [`LanError::Io`] if the socket cannot be created or bound.
    /// Must be called from within a Tokio runtime.
    pub fn bind(bind_addr: SocketAddr, target: SocketAddr) -> Result<Self, LanError> {
        let socket = Socket::new(
            Domain::for_address(bind_addr),
            Type::DGRAM,
            Some(Protocol::UDP),
        )?;
        socket.set_reuse_address(true)?;
        socket.set_broadcast(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&bind_addr.into())?;

        let std_socket: std::net::UdpSocket = socket.into();
        let socket = UdpSocket::from_std(std_socket)?;

        tracing::debug!(
            "LAN discovery bound on {} (target {})",
            socket.local_addr()?,
            target
        );
        Ok(Self { socket, target })
    }

    /// Local socket address
    ///
    /// # Errors
    ///
    /// Returns an error if the OS cannot report the address.
    pub fn local_addr(&self) -> Result<SocketAddr, LanError> {
        Ok(self.socket.local_addr()?)
    }

    /// Send one announcement to the configured target
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the send fails.
    pub async fn broadcast(&self, announcement: &LanAnnouncement) -> Result<(), LanError> {
        let bytes =
            serde_json::to_vec(announcement).map_err(|e| LanError::Decode(e.to_string()))?;
        self.socket.send_to(&bytes, self.target).await?;
        tracing::trace!("LAN announcement sent to {}", self.target);
        Ok(())
    }

    /// Wait for the next announcement
    ///
    /// # Errors
    ///
    /// Returns [`LanError::Decode`] for datagrams that are not consistent
    /// announcements (the caller should keep listening), or [`LanError::Io`]
    /// if the socket fails.
    pub async fn recv(&self) -> Result<(LanAnnouncement, SocketAddr), LanError> {
        let mut buf = [0u8; MAX_DATAGRAM];
        let (len, from) = self.socket.recv_from(&mut buf).await?;
        let announcement: LanAnnouncement =
            serde_json::from_slice(&buf[..len]).map_err(|e| LanError::Decode(e.to_string()))?;
        if !announcement.is_consistent() {
            return Err(LanError::Decode(format!(
                "inconsistent announcement from {from}"
            )));
        }
        Ok((announcement, from))
    }
}
