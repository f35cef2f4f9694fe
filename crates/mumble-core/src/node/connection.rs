//! Connection lifecycle: listener, dialing, handshake and the per-peer read loop.
//!
//! ```text
//!   dial / accept
//!        │
//!        ├─ send our handshake line
//!        ├─ read theirs (handshake_timeout)
//!        │    ├─ nodeId ≠ H(wallet)        → drop
//!        │    ├─ wallet = ours             → drop
//!        │    └─ wallet ≠ expected         → drop
//!        ├─ duplicate? keep the connection opened by the lower wallet
//!        ├─ register peer, add to routing table
//!        ├─ spawn read loop
//!        └─ flush store-for-later queue
//! ```

use crate::node::error::{NodeError, Result};
use crate::node::node::P2pManager;
use crate::node::peer::{Direction, PeerConnection};
use crate::protocol::{Frame, FrameCodec, Handshake, WireMessage, decode_line, encode_line};
use dashmap::mapref::entry::Entry;
use futures::{SinkExt, StreamExt};
use mumble_crypto::WalletAddress;
use mumble_discovery::RateLimitCategory;
use mumble_discovery::dht::{DhtPeer, Endpoint};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tokio_util::sync::CancellationToken;

type PeerReader = FramedRead<OwnedReadHalf, FrameCodec>;

impl P2pManager {
    /// Bind the peer listener, falling back to an ephemeral port if allowed
    pub(crate) async fn bind_listener(&self) -> Result<TcpListener> {
        let addr = self.inner.config.listen_addr;
        match TcpListener::bind(addr).await {
            Ok(listener) => Ok(listener),
            Err(e)
                if e.kind() == std::io::ErrorKind::AddrInUse
                    && self.inner.config.allow_ephemeral_fallback
                    && addr.port() != 0 =>
            {
                let fallback = SocketAddr::new(addr.ip(), 0);
                tracing::warn!("Port {} in use, falling back to an ephemeral port", addr.port());
                TcpListener::bind(fallback)
                    .await
                    .map_err(|e| NodeError::Bind(format!("{fallback}: {e}").into()))
            }
            Err(e) => Err(NodeError::Bind(format!("{addr}: {e}").into())),
        }
    }

    /// Accept inbound connections until cancelled
    pub(crate) async fn accept_loop(self, listener: TcpListener, cancel: CancellationToken) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        let ip = remote.ip().to_string();
                        if !self
                            .inner
                            .rate_limiter
                            .check_and_increment(RateLimitCategory::ConnectionAttempt, &ip)
                        {
                            tracing::debug!("Connection attempt from {} rate limited", remote);
                            continue;
                        }

                        let manager = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = manager.establish(stream, remote, Direction::Inbound, None).await {
                                tracing::debug!("Inbound connection from {} rejected: {}", remote, e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!("Accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
        tracing::debug!("Accept loop stopped");
    }

    /// Connect to a peer at `endpoint`
    ///
    /// Returns the peer's wallet once the handshake completes. If a live
    /// connection to that wallet already exists the new one may be dropped in
    /// its favour; the call still succeeds.
    ///
    /// # Errors
    ///
    /// Returns `NodeError::Timeout` if the TCP connect or handshake exceeds its
    /// timeout, `NodeError::Transport` if the connection fails and
    /// `NodeError::Handshake` if the peer's handshake is invalid.
    pub async fn connect_to_peer(&self, endpoint: &Endpoint) -> Result<WalletAddress> {
        self.dial(endpoint, None).await
    }

    /// Dial `endpoint`, optionally requiring the peer to be `expected`
    pub(crate) async fn dial(
        &self,
        endpoint: &Endpoint,
        expected: Option<WalletAddress>,
    ) -> Result<WalletAddress> {
        if let Some(wallet) = expected {
            if wallet == self.inner.wallet {
                return Err(NodeError::handshake("refusing to dial self"));
            }
            if self.is_connected_to(&wallet) {
                return Ok(wallet);
            }
        }

        let connect = TcpStream::connect((endpoint.host.as_str(), endpoint.port));
        let stream = tokio::time::timeout(self.inner.config.network.connect_timeout, connect)
            .await
            .map_err(|_| NodeError::timeout("TCP connect"))?
            .map_err(|e| NodeError::Transport(format!("connect to {endpoint} failed: {e}").into()))?;
        let remote = stream.peer_addr()?;

        self.establish(stream, remote, Direction::Outbound, expected).await
    }

    /// Run the handshake on a fresh stream and register the peer
    async fn establish(
        &self,
        stream: TcpStream,
        remote: SocketAddr,
        direction: Direction,
        expected: Option<WalletAddress>,
    ) -> Result<WalletAddress> {
        let Some(session) = self.session_token() else {
            return Err(NodeError::invalid_state("P2P manager not running"));
        };
        if let Err(e) = stream.set_nodelay(true) {
            tracing::trace!("set_nodelay failed for {}: {}", remote, e);
        }

        let (read_half, write_half) = stream.into_split();
        let mut reader = FramedRead::new(read_half, FrameCodec::new());
        let mut writer = FramedWrite::new(write_half, LinesCodec::new());
        let timeout = self.inner.config.network.handshake_timeout;

        let hello = encode_line(&self.local_handshake())?;
        tokio::time::timeout(timeout, writer.send(hello))
            .await
            .map_err(|_| NodeError::timeout("handshake write"))?
            .map_err(|e| NodeError::Transport(format!("handshake write failed: {e}").into()))?;

        let handshake: Handshake = match tokio::time::timeout(timeout, reader.next()).await {
            Err(_) => return Err(NodeError::timeout("handshake")),
            Ok(Some(Ok(Frame::Line(line)))) => {
                decode_line(&line).map_err(|e| NodeError::Handshake(e.to_string().into()))?
            }
            Ok(Some(Ok(_))) => return Err(NodeError::handshake("unreadable handshake line")),
            Ok(Some(Err(e))) => return Err(NodeError::Transport(e.to_string().into())),
            Ok(None) => return Err(NodeError::handshake("connection closed before handshake")),
        };
        self.validate_handshake(&handshake, expected)?;

        let wallet = handshake.wallet_address;
        let host = handshake
            .dial_host()
            .map_or_else(|| remote.ip().to_string(), str::to_owned);
        let endpoint = Endpoint::new(host, handshake.listen_port.unwrap_or_else(|| remote.port()));
        let peer = Arc::new(PeerConnection::new(
            &handshake,
            remote,
            endpoint.clone(),
            direction,
            writer,
            session.child_token(),
            self.inner.config.network.connect_timeout,
        ));
        if !peer.is_relay() && self.inner.dht.get_node(&wallet).is_some_and(|n| n.is_relay) {
            peer.set_relay(true);
        }

        if !self.register_peer(&peer) {
            tracing::debug!("Keeping existing connection to {}, dropping {:?} duplicate", wallet, direction);
            peer.close();
            peer.shutdown().await;
            return Ok(wallet);
        }

        self.inner
            .dht
            .add_trusted_node(DhtPeer::new(wallet, endpoint).with_relay(peer.is_relay()));
        self.inner.reconnect_exhausted.store(false, Ordering::SeqCst);
        tracing::info!("Connected to {} at {} ({:?})", wallet, remote, direction);

        let manager = self.clone();
        let reader_peer = Arc::clone(&peer);
        tokio::spawn(async move { manager.read_loop(reader_peer, reader).await });

        self.flush_pending(&wallet).await;
        Ok(wallet)
    }

    fn validate_handshake(&self, handshake: &Handshake, expected: Option<WalletAddress>) -> Result<()> {
        if !handshake.is_consistent() {
            return Err(NodeError::handshake("node ID does not match wallet"));
        }
        if handshake.wallet_address == self.inner.wallet {
            return Err(NodeError::handshake("connected to self"));
        }
        if let Some(expected) = expected {
            if expected != handshake.wallet_address {
                return Err(NodeError::Handshake(
                    format!("expected {}, peer is {}", expected, handshake.wallet_address).into(),
                ));
            }
        }
        Ok(())
    }

    /// Insert `peer`; `false` means an existing connection wins
    ///
    /// Both ends of a simultaneous dial apply the same rule, so they keep the
    /// same TCP connection: the one opened by the lower wallet.
    fn register_peer(&self, peer: &Arc<PeerConnection>) -> bool {
        let wallet = *peer.wallet();
        let preferred = if self.inner.wallet < wallet {
            Direction::Outbound
        } else {
            Direction::Inbound
        };

        match self.inner.peers.entry(wallet) {
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(peer));
                true
            }
            Entry::Occupied(mut slot) => {
                let existing = slot.get();
                if existing.is_online()
                    && (existing.direction() == preferred || peer.direction() != preferred)
                {
                    return false;
                }
                let replaced = slot.insert(Arc::clone(peer));
                replaced.close();
                true
            }
        }
    }

    /// Remove `wallet`'s connection and close it
    ///
    /// The peer also leaves the routing table. Returns `false` if no
    /// connection existed.
    pub fn disconnect_peer(&self, wallet: &WalletAddress) -> bool {
        match self.inner.peers.remove(wallet) {
            Some((_, peer)) => {
                peer.close();
                self.inner.dht.remove_node(wallet);
                true
            }
            None => false,
        }
    }

    /// Read frames from `peer` until it closes or is cancelled
    async fn read_loop(self, peer: Arc<PeerConnection>, mut reader: PeerReader) {
        let wallet = *peer.wallet();
        let key = wallet.to_string();
        let cancel = peer.cancel_token().clone();

        loop {
            let frame = tokio::select! {
                () = cancel.cancelled() => break,
                frame = reader.next() => frame,
            };

            match frame {
                Some(Ok(Frame::Line(line))) => {
                    peer.touch();
                    if !self
                        .inner
                        .rate_limiter
                        .check_and_increment(RateLimitCategory::MessageReceive, &key)
                    {
                        tracing::trace!("Frame from {} rate limited", wallet);
                        continue;
                    }
                    match decode_line::<WireMessage>(&line) {
                        Ok(message) => self.handle_message(&peer, message).await,
                        Err(e) => tracing::debug!("Dropping malformed frame from {}: {}", wallet, e),
                    }
                }
                Some(Ok(Frame::Oversized)) => {
                    tracing::warn!("Dropped oversized frame from {}", wallet);
                }
                Some(Ok(Frame::InvalidUtf8)) => {
                    tracing::debug!("Dropped non-UTF-8 frame from {}", wallet);
                }
                Some(Err(e)) => {
                    tracing::debug!("Read from {} failed: {}", wallet, e);
                    break;
                }
                None => break,
            }
        }

        peer.close();
        if self
            .inner
            .peers
            .remove_if(&wallet, |_, current| Arc::ptr_eq(current, &peer))
            .is_some()
        {
            self.inner.dht.remove_node(&wallet);
            tracing::info!("Peer {} disconnected", wallet);
        }
        peer.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use crate::node::config::P2pConfig;
    use crate::node::node::P2pManager;
    use crate::node::peer::Direction;
    use crate::protocol::{Handshake, encode_line};
    use mumble_crypto::WalletAddress;
    use mumble_discovery::dht::{Endpoint, NodeId};
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpStream;

    async fn started() -> P2pManager {
        let manager = P2pManager::new_random(P2pConfig::default()).unwrap();
        manager.connect().await.unwrap();
        manager
    }

    #[tokio::test]
    async fn test_connect_to_peer_returns_wallet() {
        let a = started().await;
        let b = started().await;

        let wallet = a
            .connect_to_peer(&Endpoint::from(b.local_addr().unwrap()))
            .await
            .unwrap();
        assert_eq!(wallet, b.wallet());
        assert!(a.is_connected_to(&b.wallet()));

        // Dialing again reuses the connection
        a.connect_to_peer(&Endpoint::from(b.local_addr().unwrap()))
            .await
            .unwrap();
        assert_eq!(a.connected_peer_count(), 1);

        a.disconnect().await.unwrap();
        b.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_refuses_connection_to_self() {
        let a = started().await;
        let result = a.connect_to_peer(&Endpoint::from(a.local_addr().unwrap())).await;
        assert!(result.is_err());
        assert_eq!(a.connected_peer_count(), 0);
        a.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_forged_handshake_dropped() {
        let a = started().await;
        let mut stream = TcpStream::connect(a.local_addr().unwrap()).await.unwrap();

        let claimed = WalletAddress::from_bytes([5; 20]);
        let forged = Handshake {
            node_id: NodeId::from_wallet(&WalletAddress::from_bytes([6; 20])),
            wallet_address: claimed,
            public_key: "04".into(),
            listen_port: None,
            is_relay: false,
            advertised_host: None,
        };
        let mut line = encode_line(&forged).unwrap();
        line.push('\n');
        stream.write_all(line.as_bytes()).await.unwrap();

        // The node sends its own handshake, then closes
        let mut reader = BufReader::new(stream);
        let mut first = String::new();
        reader.read_line(&mut first).await.unwrap();
        assert!(first.contains(&a.wallet().to_string()));

        let mut rest = String::new();
        let read = tokio::time::timeout(Duration::from_secs(5), reader.read_line(&mut rest))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read, 0);
        assert!(!a.is_connected_to(&claimed));

        a.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_handshake_timeout_closes_connection() {
        let mut config = P2pConfig::default();
        config.network.handshake_timeout = Duration::from_millis(100);
        let a = P2pManager::new_random(config).unwrap();
        a.connect().await.unwrap();

        let stream = TcpStream::connect(a.local_addr().unwrap()).await.unwrap();
        let mut reader = BufReader::new(stream);
        let mut hello = String::new();
        reader.read_line(&mut hello).await.unwrap();

        // Stay silent; the node gives up on us
        let mut rest = String::new();
        let read = tokio::time::timeout(Duration::from_secs(5), reader.read_line(&mut rest))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read, 0);
        assert_eq!(a.connected_peer_count(), 0);

        a.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_simultaneous_dials_converge() {
        let a = started().await;
        let b = started().await;

        let b_ep = Endpoint::from(b.local_addr().unwrap());
        let a_ep = Endpoint::from(a.local_addr().unwrap());
        let a_to_b = a.connect_to_peer(&b_ep);
        let b_to_a = b.connect_to_peer(&a_ep);
        let (r1, r2) = tokio::join!(a_to_b, b_to_a);
        assert!(r1.is_ok() && r2.is_ok());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(a.connected_peer_count(), 1);
        assert_eq!(b.connected_peer_count(), 1);

        // Both ends kept the same TCP connection
        let a_outbound = a.peers()[0].direction == Direction::Outbound;
        let b_inbound = b.peers()[0].direction == Direction::Inbound;
        assert_eq!(a_outbound, b_inbound);

        a.disconnect().await.unwrap();
        b.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_peer() {
        let a = started().await;
        let b = started().await;
        a.connect_to_peer(&Endpoint::from(b.local_addr().unwrap()))
            .await
            .unwrap();

        assert!(a.dht().get_node(&b.wallet()).is_some());
        assert!(a.disconnect_peer(&b.wallet()));
        assert!(!a.is_connected_to(&b.wallet()));
        assert!(a.dht().get_node(&b.wallet()).is_none());
        assert!(!a.disconnect_peer(&b.wallet()));

        for _ in 0..100 {
            if !b.is_connected_to(&a.wallet()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!b.is_connected_to(&a.wallet()));

        a.disconnect().await.unwrap();
        b.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_departed_peer_leaves_routing_table() {
        let a = started().await;
        let b = started().await;
        a.connect_to_peer(&Endpoint::from(b.local_addr().unwrap()))
            .await
            .unwrap();
        assert!(a.dht().get_node(&b.wallet()).is_some());

        b.disconnect().await.unwrap();
        for _ in 0..250 {
            if !a.is_connected_to(&b.wallet()) && a.dht().get_node(&b.wallet()).is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!a.is_connected_to(&b.wallet()));
        assert!(a.dht().get_node(&b.wallet()).is_none());
        assert!(a.dht().find_closest_to_wallet(&b.wallet(), 20).is_empty());

        a.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_advertised_host_recorded_by_remote() {
        let mut config = P2pConfig::default();
        config.advertised_host = Some("localhost".into());
        let a = P2pManager::new_random(config).unwrap();
        a.connect().await.unwrap();
        let b = started().await;

        a.connect_to_peer(&Endpoint::from(b.local_addr().unwrap()))
            .await
            .unwrap();
        for _ in 0..100 {
            if b.dht().get_node(&a.wallet()).is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let entry = b.dht().get_node(&a.wallet()).unwrap();
        assert_eq!(entry.endpoint.host, "localhost");
        assert_eq!(entry.endpoint.port, a.local_addr().unwrap().port());

        // No advertised host: the observed source address is used
        let seen_by_a = a.dht().get_node(&b.wallet()).unwrap();
        assert_eq!(seen_by_a.endpoint.host, "127.0.0.1");

        a.disconnect().await.unwrap();
        b.disconnect().await.unwrap();
    }
}
