//! Live peer connections
//!
//! Each peer owns a bounded outbound queue drained by its own writer task,
//! so a peer that stops reading only ever stalls its own writer.

use crate::node::error::{NodeError, Result};
use crate::protocol::{Handshake, WireMessage, encode_line};
use futures::SinkExt;
use mumble_crypto::WalletAddress;
use mumble_discovery::dht::{Endpoint, NodeId};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedWrite, LinesCodec};
use tokio_util::sync::CancellationToken;

/// Line-oriented writer over the TCP write half
pub(crate) type PeerWriter = FramedWrite<OwnedWriteHalf, LinesCodec>;

/// Frames buffered per peer before further sends are refused
pub const OUTBOUND_QUEUE_LEN: usize = 256;

/// Upper bound on flushing queued frames once a connection closes
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Which side opened the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Remote peer dialled us
    Inbound,
    /// We dialled the remote peer
    Outbound,
}

/// Session state for a connected peer
///
/// Created after a successful handshake and dropped once its read loop ends.
pub struct PeerConnection {
    wallet: WalletAddress,
    node_id: NodeId,
    public_key: String,
    remote_addr: SocketAddr,
    endpoint: Endpoint,
    direction: Direction,
    is_relay: AtomicBool,
    last_seen: Mutex<Instant>,
    connected_at: Instant,
    outbound: mpsc::Sender<String>,
    writer_task: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl PeerConnection {
    /// Create from a validated handshake and start the writer task
    ///
    /// Must be called from within a Tokio runtime.
    pub(crate) fn new(
        handshake: &Handshake,
        remote_addr: SocketAddr,
        endpoint: Endpoint,
        direction: Direction,
        writer: PeerWriter,
        cancel: CancellationToken,
        write_timeout: Duration,
    ) -> Self {
        let now = Instant::now();
        let (outbound, queue) = mpsc::channel(OUTBOUND_QUEUE_LEN);
        let writer_task = tokio::spawn(write_loop(
            writer,
            queue,
            cancel.clone(),
            write_timeout,
            handshake.wallet_address,
        ));
        Self {
            wallet: handshake.wallet_address,
            node_id: handshake.node_id,
            public_key: handshake.public_key.clone(),
            remote_addr,
            endpoint,
            direction,
            is_relay: AtomicBool::new(handshake.is_relay),
            last_seen: Mutex::new(now),
            connected_at: now,
            outbound,
            writer_task: Mutex::new(Some(writer_task)),
            cancel,
        }
    }

    /// Peer wallet
    #[must_use]
    pub const fn wallet(&self) -> &WalletAddress {
        &self.wallet
    }

    /// Peer NodeId
    #[must_use]
    pub const fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Session public key from the handshake
    #[must_use]
    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    /// Socket address of the remote end
    #[must_use]
    pub const fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Endpoint the peer accepts connections on
    #[must_use]
    pub const fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Which side opened the connection
    #[must_use]
    pub const fn direction(&self) -> Direction {
        self.direction
    }

    /// Whether the peer is a relay node
    #[must_use]
    pub fn is_relay(&self) -> bool {
        self.is_relay.load(Ordering::Relaxed)
    }

    /// Record relay status learned from the registry or DHT
    pub fn set_relay(&self, is_relay: bool) {
        self.is_relay.store(is_relay, Ordering::Relaxed);
    }

    /// Whether the connection is usable
    #[must_use]
    pub fn is_online(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Time since the last inbound frame
    #[must_use]
    pub fn idle_time(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    /// Whether the peer has been silent for longer than `timeout`
    #[must_use]
    pub fn is_stale(&self, timeout: Duration) -> bool {
        self.idle_time() > timeout
    }

    /// Refresh the last-seen timestamp
    pub fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    /// Queue one frame for the writer task
    ///
    /// Never waits on the socket. A peer whose writes stall past the write
    /// timeout is closed by its writer task.
    ///
    /// # Errors
    ///
    /// Returns `NodeError::PeerNotConnected` if the connection is closed and
    /// `NodeError::Backpressure` if the outbound queue is full; the frame is
    /// dropped in both cases.
    pub fn send(&self, message: &WireMessage) -> Result<()> {
        if !self.is_online() {
            return Err(NodeError::PeerNotConnected(self.wallet));
        }
        let line = encode_line(message)?;

        match self.outbound.try_send(line) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                tracing::debug!("Outbound queue for {} full, dropping {} frame", self.wallet, message.kind());
                Err(NodeError::Backpressure(self.wallet))
            }
            Err(TrySendError::Closed(_)) => Err(NodeError::PeerNotConnected(self.wallet)),
        }
    }

    /// Frames waiting for the writer task
    #[must_use]
    pub fn queued_frames(&self) -> usize {
        OUTBOUND_QUEUE_LEN - self.outbound.capacity()
    }

    /// Mark offline and stop the read and write loops
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Wait for the writer task to flush and shut down the write half
    pub(crate) async fn shutdown(&self) {
        let task = self.writer_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::trace!("Writer task for {} ended abnormally: {}", self.wallet, e);
            }
        }
    }

    /// Token cancelled when the connection closes
    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Snapshot for status reporting
    #[must_use]
    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            wallet: self.wallet,
            node_id: self.node_id,
            endpoint: self.endpoint.clone(),
            remote_addr: self.remote_addr,
            direction: self.direction,
            is_relay: self.is_relay(),
            idle: self.idle_time(),
            connected_for: self.connected_at.elapsed(),
        }
    }
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("wallet", &self.wallet)
            .field("remote_addr", &self.remote_addr)
            .field("direction", &self.direction)
            .field("online", &self.is_online())
            .finish_non_exhaustive()
    }
}

/// Drain `queue` onto the socket until the connection closes
async fn write_loop(
    mut writer: PeerWriter,
    mut queue: mpsc::Receiver<String>,
    cancel: CancellationToken,
    write_timeout: Duration,
    wallet: WalletAddress,
) {
    loop {
        let line = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            line = queue.recv() => match line {
                Some(line) => line,
                None => break,
            },
        };

        let written = tokio::select! {
            // A half-written line cannot be followed by anything useful
            () = cancel.cancelled() => return,
            written = tokio::time::timeout(write_timeout, writer.send(line)) => written,
        };
        match written {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!("Write to {} failed: {}", wallet, e);
                cancel.cancel();
                return;
            }
            Err(_) => {
                tracing::debug!("Write to {} stalled for {:?}, closing", wallet, write_timeout);
                cancel.cancel();
                return;
            }
        }
    }

    // Frames queued before the close still go out, within a bound
    queue.close();
    let flush = async {
        while let Ok(line) = queue.try_recv() {
            writer.feed(line).await?;
        }
        SinkExt::<String>::close(&mut writer).await
    };
    match tokio::time::timeout(FLUSH_TIMEOUT, flush).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::trace!("Closing writer for {} failed: {}", wallet, e),
        Err(_) => tracing::trace!("Flushing writer for {} timed out", wallet),
    }
}

/// Point-in-time view of a connected peer
#[derive(Debug, Clone)]
pub struct PeerInfo {
    /// Peer wallet
    pub wallet: WalletAddress,
    /// Peer NodeId
    pub node_id: NodeId,
    /// Endpoint the peer accepts connections on
    pub endpoint: Endpoint,
    /// Socket address of the remote end
    pub remote_addr: SocketAddr,
    /// Which side opened the connection
    pub direction: Direction,
    /// Relay flag
    pub is_relay: bool,
    /// Time since the last inbound frame
    pub idle: Duration,
    /// Connection age
    pub connected_for: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Ack, FrameCodec, Frame, decode_line};
    use futures::StreamExt;
    use tokio::net::{TcpListener, TcpStream};
    use tokio_util::codec::FramedRead;

    async fn connected_pair() -> (PeerConnection, FramedRead<tokio::net::tcp::OwnedReadHalf, FrameCodec>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let client = client.unwrap();
        let (server, _) = server.unwrap();

        let (_client_read, client_write) = client.into_split();
        let (server_read, _server_write) = server.into_split();

        let wallet = WalletAddress::from_bytes([4; 20]);
        let handshake = Handshake {
            node_id: NodeId::from_wallet(&wallet),
            wallet_address: wallet,
            public_key: "04".into(),
            listen_port: Some(addr.port()),
            is_relay: true,
            advertised_host: None,
        };
        let peer = PeerConnection::new(
            &handshake,
            addr,
            Endpoint::from(addr),
            Direction::Outbound,
            FramedWrite::new(client_write, LinesCodec::new()),
            CancellationToken::new(),
            Duration::from_secs(5),
        );
        (peer, FramedRead::new(server_read, FrameCodec::new()))
    }

    #[tokio::test]
    async fn test_send_writes_one_line() {
        let (peer, mut reader) = connected_pair().await;
        assert!(peer.is_relay());
        assert_eq!(peer.direction(), Direction::Outbound);

        let ack = WireMessage::Ack(Ack {
            message_id: "m-1".into(),
        });
        peer.send(&ack).unwrap();

        let Some(Ok(Frame::Line(line))) = reader.next().await else {
            panic!("expected a line");
        };
        assert_eq!(decode_line::<WireMessage>(&line).unwrap(), ack);
    }

    #[tokio::test]
    async fn test_closed_peer_refuses_sends() {
        let (peer, _reader) = connected_pair().await;
        peer.close();
        assert!(!peer.is_online());
        assert!(peer.cancel_token().is_cancelled());

        let ack = WireMessage::Ack(Ack {
            message_id: "m-1".into(),
        });
        assert!(matches!(peer.send(&ack), Err(NodeError::PeerNotConnected(_))));
    }

    #[tokio::test]
    async fn test_staleness_and_touch() {
        let (peer, _reader) = connected_pair().await;
        assert!(!peer.is_stale(Duration::from_secs(1)));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(peer.is_stale(Duration::from_millis(10)));
        peer.touch();
        assert!(!peer.is_stale(Duration::from_millis(10)));

        let info = peer.info();
        assert_eq!(info.wallet, *peer.wallet());
        assert!(info.is_relay);
    }
}
