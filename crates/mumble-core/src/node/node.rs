//! P2P manager - the overlay orchestrator
//!
//! The manager owns the listener, every peer connection, the DHT and the
//! background loops. Its methods are spread across the sibling modules:
//!
//! | Module | Concern |
//! |--------|---------|
//! | `connection` | listener, dialing, handshake, per-peer read loop |
//! | `handler` | inbound frame dispatch |
//! | `gossip` | flooding, relay receipts, periodic maintenance |
//! | `router` | the outbound delivery chain |
//! | `health` | ping loop, stale-peer eviction, reconnection |
//! | `discovery` | LAN announcements |
//!
//! # Example
//!
//! ```no_run
//! use mumble_core::node::{P2pConfig, P2pManager, Services};
//! use mumble_crypto::{EncryptedMessage, WalletAddress, WalletIdentity};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = P2pManager::new(WalletIdentity::generate(), P2pConfig::default(), Services::new())?;
//!     manager.connect().await?;
//!
//!     let recipient = WalletAddress::parse("0x00000000000000000000000000000000000000aa")?;
//!     let payload = EncryptedMessage::new([0u8; 12], b"...".to_vec(), [0u8; 16]);
//!     let result = manager.send_message(recipient, &payload, "msg-1").await?;
//!     println!("delivered: {}", result.is_delivered());
//!
//!     manager.disconnect().await?;
//!     Ok(())
//! }
//! ```

use crate::node::config::P2pConfig;
use crate::node::error::{NodeError, Result};
use crate::node::handler::IncomingMessage;
use crate::node::message_cache::MessageCache;
use crate::node::peer::{PeerConnection, PeerInfo};
use crate::node::pending::PendingQueue;
use crate::node::receipts::RelayReceiptLedger;
use crate::node::services::Services;
use crate::node::state::{ConnectionState, StateMachine};
use crate::protocol::{FindNode, Handshake, Ping, WireMessage};
use dashmap::DashMap;
use mumble_crypto::{RelayReceipt, WalletAddress, WalletIdentity, now_millis};
use mumble_discovery::dht::{DhtStats, KademliaDht, NodeId};
use mumble_discovery::{BootstrapCandidate, BootstrapResolver, RateLimitMetrics, RateLimiter};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Time allowed for background tasks to stop on disconnect
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Resources that exist only while the manager is running
pub(crate) struct Session {
    /// Cancelled on disconnect; every loop and peer token derives from it
    pub(crate) cancel: CancellationToken,
    /// Bound listener address
    pub(crate) local_addr: SocketAddr,
    /// Background loops
    pub(crate) tasks: Vec<JoinHandle<()>>,
}

/// Manager inner state
pub(crate) struct ManagerInner {
    /// Wallet identity (signs receipts)
    pub(crate) identity: WalletIdentity,
    /// Local wallet
    pub(crate) wallet: WalletAddress,
    /// Local NodeId
    pub(crate) node_id: NodeId,
    /// Configuration
    pub(crate) config: P2pConfig,
    /// Injected collaborators
    pub(crate) services: Services,
    /// Shared rate limiter
    pub(crate) rate_limiter: Arc<RateLimiter>,
    /// Kademlia routing table
    pub(crate) dht: Arc<KademliaDht>,
    /// Bootstrap candidate source
    pub(crate) resolver: BootstrapResolver,
    /// Live connections (wallet -> connection)
    pub(crate) peers: DashMap<WalletAddress, Arc<PeerConnection>>,
    /// Message IDs already processed
    pub(crate) message_cache: MessageCache,
    /// Message IDs acknowledged by their recipient
    pub(crate) acknowledged: MessageCache,
    /// Store-for-later queue
    pub(crate) pending: PendingQueue,
    /// Receipts earned as a relay
    pub(crate) receipts: RelayReceiptLedger,
    /// Connection state
    pub(crate) state: StateMachine,
    /// Delivered-message fan-out
    pub(crate) incoming: broadcast::Sender<IncomingMessage>,
    /// Running flag
    pub(crate) running: AtomicBool,
    /// A reconnection task is active
    pub(crate) reconnecting: AtomicBool,
    /// The last reconnection gave up; cleared by the next new peer
    pub(crate) reconnect_exhausted: AtomicBool,
    /// Present while running
    pub(crate) session: Mutex<Option<Session>>,
    /// Candidates resolved at connect, reused for reconnection
    pub(crate) bootstrap_set: Mutex<Vec<BootstrapCandidate>>,
}

/// MumbleChat P2P manager
///
/// Cheap to clone; all clones share one overlay node.
#[derive(Clone)]
pub struct P2pManager {
    pub(crate) inner: Arc<ManagerInner>,
}

/// Point-in-time manager statistics
#[derive(Debug, Clone)]
pub struct P2pStats {
    /// Connection state
    pub state: ConnectionState,
    /// Bound listener address
    pub local_addr: Option<SocketAddr>,
    /// Live peer connections
    pub connected_peers: usize,
    /// Live connections to relay nodes
    pub relay_peers: usize,
    /// Routing table snapshot
    pub dht: DhtStats,
    /// Messages waiting in the store-for-later queue
    pub pending_messages: usize,
    /// Receipts awaiting submission
    pub pending_receipts: usize,
    /// Message IDs in the dedup cache
    pub cached_message_ids: usize,
    /// Rate limiter counters
    pub rate_limit: RateLimitMetrics,
}

// ═══════════════════════════════════════════════════════════════════════════
// Constructors
// ═══════════════════════════════════════════════════════════════════════════

impl P2pManager {
    /// Create a manager for `identity`
    ///
    /// # Errors
    ///
    /// Returns `NodeError::InvalidConfig` if `config` fails validation.
    pub fn new(identity: WalletIdentity, config: P2pConfig, services: Services) -> Result<Self> {
        config.validate()?;

        let wallet = identity.address();
        let rate_limiter = services
            .rate_limiter
            .clone()
            .unwrap_or_else(|| Arc::new(RateLimiter::new(config.rate_limit.clone())));

        let dht = Arc::new(KademliaDht::new(config.dht.clone(), Arc::clone(&rate_limiter)));
        let node_id = dht.initialize(wallet)?;

        let resolver = BootstrapResolver::new(services.registry.clone(), config.bootstrap_nodes.clone());
        let (incoming, _) = broadcast::channel(config.event_capacity);

        let inner = ManagerInner {
            identity,
            wallet,
            node_id,
            message_cache: MessageCache::new(config.gossip.message_cache_ttl),
            acknowledged: MessageCache::new(config.gossip.message_cache_ttl),
            pending: PendingQueue::new(config.pending.max_per_recipient),
            receipts: RelayReceiptLedger::new(config.max_pending_receipts, config.event_capacity),
            config,
            services,
            rate_limiter,
            dht,
            resolver,
            peers: DashMap::new(),
            state: StateMachine::new(),
            incoming,
            running: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
            reconnect_exhausted: AtomicBool::new(false),
            session: Mutex::new(None),
            bootstrap_set: Mutex::new(Vec::new()),
        };

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Create a manager with a fresh random wallet (useful for testing)
    ///
    /// # Errors
    ///
    /// Returns `NodeError::InvalidConfig` if `config` fails validation.
    pub fn new_random(config: P2pConfig) -> Result<Self> {
        Self::new(WalletIdentity::generate(), config, Services::new())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Lifecycle
// ═══════════════════════════════════════════════════════════════════════════

impl P2pManager {
    /// Join the overlay
    ///
    /// Binds the listener, dials bootstrap candidates until `alpha` succeed,
    /// populates the routing table and starts the background loops. Zero
    /// reachable candidates is not an error: the node runs in genesis mode.
    ///
    /// # Errors
    ///
    /// Returns `NodeError::InvalidState` if already running and
    /// `NodeError::Bind` if no listener could be bound (state becomes `Error`).
    pub async fn connect(&self) -> Result<()> {
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(NodeError::invalid_state("P2P manager already running"));
        }

        if let Err(e) = self.inner.state.transition(ConnectionState::Connecting) {
            self.inner.running.store(false, Ordering::SeqCst);
            return Err(e);
        }

        let bound = match self.bind_listener().await {
            Ok(listener) => listener
                .local_addr()
                .map(|addr| (listener, addr))
                .map_err(|e| NodeError::Bind(e.to_string().into())),
            Err(e) => Err(e),
        };
        let (listener, local_addr) = match bound {
            Ok(bound) => bound,
            Err(e) => {
                tracing::error!("Failed to start listener: {}", e);
                let _ = self.inner.state.transition(ConnectionState::Error);
                self.inner.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        let cancel = CancellationToken::new();

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(self.clone().accept_loop(listener, cancel.child_token())));
        tasks.push(self.inner.rate_limiter.spawn_cleanup_task(cancel.child_token()));

        *self.inner.session.lock() = Some(Session {
            cancel: cancel.clone(),
            local_addr,
            tasks,
        });

        tracing::info!(
            "P2P node {} ({}) listening on {}",
            self.inner.wallet,
            self.inner.node_id,
            local_addr
        );

        // Bootstrap
        let candidates = self.inner.resolver.resolve().await;
        for candidate in &candidates {
            if let Some(peer) = candidate.to_dht_peer() {
                if *peer.wallet() != self.inner.wallet {
                    self.inner.dht.add_trusted_node(peer);
                }
            }
        }
        *self.inner.bootstrap_set.lock() = candidates.clone();

        let connected = self.bootstrap(&candidates).await;
        if connected == 0 {
            tracing::info!(
                "No bootstrap peers reachable ({} candidates), running as genesis node",
                candidates.len()
            );
        } else {
            tracing::info!("Connected to {} bootstrap peers", connected);
            self.populate_routing_table().await;
            self.announce().await;
        }

        self.spawn_loops(&cancel);

        if let Err(e) = self.inner.state.transition(ConnectionState::Connected) {
            // disconnect() raced with us
            tracing::debug!("Connect finished after shutdown: {}", e);
        }
        Ok(())
    }

    fn spawn_loops(&self, cancel: &CancellationToken) {
        let mut handles = vec![
            tokio::spawn(self.clone().health_loop(cancel.child_token())),
            tokio::spawn(self.clone().gossip_loop(cancel.child_token())),
        ];
        if self.inner.config.lan.enabled {
            handles.push(tokio::spawn(self.clone().lan_loop(cancel.child_token())));
        }

        let mut session = self.inner.session.lock();
        match session.as_mut() {
            Some(session) => session.tasks.extend(handles),
            None => handles.iter().for_each(JoinHandle::abort),
        }
    }

    /// Leave the overlay
    ///
    /// Stops every loop, closes every peer connection and moves to
    /// `Disconnected`. Queued messages and receipts stay in memory.
    ///
    /// # Errors
    ///
    /// Returns `NodeError::InvalidState` if the manager is not running.
    pub async fn disconnect(&self) -> Result<()> {
        if self
            .inner
            .running
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(NodeError::invalid_state("P2P manager not running"));
        }

        tracing::info!("Disconnecting P2P node {}", self.inner.wallet);

        let session = self.inner.session.lock().take();
        let peers: Vec<Arc<PeerConnection>> =
            self.inner.peers.iter().map(|e| Arc::clone(e.value())).collect();
        self.inner.peers.clear();

        for peer in &peers {
            peer.close();
        }
        for peer in &peers {
            peer.shutdown().await;
        }

        if let Some(session) = session {
            session.cancel.cancel();
            for task in session.tasks {
                match tokio::time::timeout(SHUTDOWN_TIMEOUT, task).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) if e.is_cancelled() => {}
                    Ok(Err(e)) => tracing::warn!("Background task failed: {}", e),
                    Err(_) => tracing::warn!("Background task did not stop within {:?}", SHUTDOWN_TIMEOUT),
                }
            }
        }

        self.inner.state.transition(ConnectionState::Disconnected)?;
        Ok(())
    }

    /// Whether `connect` has been called without a matching `disconnect`
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Token of the running session, `None` when stopped
    pub(crate) fn session_token(&self) -> Option<CancellationToken> {
        self.inner.session.lock().as_ref().map(|s| s.cancel.clone())
    }

    /// Dial candidates in order until `alpha` connections succeed
    pub(crate) async fn bootstrap(&self, candidates: &[BootstrapCandidate]) -> usize {
        let alpha = self.inner.config.network.alpha;
        let mut connected = 0;

        for candidate in candidates {
            if connected >= alpha {
                break;
            }
            if candidate.wallet == Some(self.inner.wallet) {
                continue;
            }
            match self.dial(&candidate.endpoint, candidate.wallet).await {
                Ok(wallet) => {
                    tracing::debug!("Bootstrap peer {} connected via {}", wallet, candidate);
                    connected += 1;
                }
                Err(e) => tracing::debug!("Bootstrap candidate {} unreachable: {}", candidate, e),
            }
        }
        connected
    }

    /// Ask every connected peer for the nodes closest to us
    pub(crate) async fn populate_routing_table(&self) {
        let request = WireMessage::FindNode(FindNode {
            target_id: self.inner.node_id,
        });
        for peer in self.live_peers() {
            if let Err(e) = peer.send(&request) {
                tracing::debug!("FIND_NODE to {} failed: {}", peer.wallet(), e);
            }
        }
    }

    /// Ping the connected peers among the closest known nodes
    pub(crate) async fn announce(&self) {
        let closest = self.inner.dht.find_closest_nodes(&self.inner.node_id, self.inner.config.dht.k);
        let ping = self.ping_message();
        for node in closest {
            if let Some(peer) = self.live_peer(node.wallet()) {
                if let Err(e) = peer.send(&ping) {
                    tracing::debug!("Announce ping to {} failed: {}", node.wallet(), e);
                }
            }
        }
    }

    pub(crate) fn local_handshake(&self) -> Handshake {
        Handshake {
            node_id: self.inner.node_id,
            wallet_address: self.inner.wallet,
            public_key: self.inner.identity.public_key_hex(),
            listen_port: self.local_addr().map(|addr| addr.port()),
            is_relay: self.inner.config.is_relay,
            advertised_host: self.inner.config.advertised_host.clone(),
        }
    }

    pub(crate) fn ping_message(&self) -> WireMessage {
        WireMessage::Ping(Ping {
            node_id: self.inner.node_id,
            timestamp: now_millis(),
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Accessors
// ═══════════════════════════════════════════════════════════════════════════

impl P2pManager {
    /// Local wallet
    #[must_use]
    pub fn wallet(&self) -> WalletAddress {
        self.inner.wallet
    }

    /// Local NodeId
    #[must_use]
    pub fn node_id(&self) -> NodeId {
        self.inner.node_id
    }

    /// Manager configuration
    #[must_use]
    pub fn config(&self) -> &P2pConfig {
        &self.inner.config
    }

    /// Bound listener address while running
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.session.lock().as_ref().map(|s| s.local_addr)
    }

    /// Current connection state
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.inner.state.current()
    }

    /// Observe connection state changes
    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Messages delivered to this node
    #[must_use]
    pub fn subscribe_messages(&self) -> broadcast::Receiver<IncomingMessage> {
        self.inner.incoming.subscribe()
    }

    /// Relay receipts earned by this node
    #[must_use]
    pub fn subscribe_receipts(&self) -> broadcast::Receiver<RelayReceipt> {
        self.inner.receipts.subscribe()
    }

    /// The routing table
    #[must_use]
    pub fn dht(&self) -> &Arc<KademliaDht> {
        &self.inner.dht
    }

    /// The shared rate limiter
    #[must_use]
    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.inner.rate_limiter
    }

    /// Bootstrap candidate source (LAN sightings are recorded here)
    #[must_use]
    pub fn bootstrap_resolver(&self) -> &BootstrapResolver {
        &self.inner.resolver
    }

    /// Connected peers
    #[must_use]
    pub fn peers(&self) -> Vec<PeerInfo> {
        self.live_peers().iter().map(|p| p.info()).collect()
    }

    /// Number of live peer connections
    #[must_use]
    pub fn connected_peer_count(&self) -> usize {
        self.inner.peers.iter().filter(|e| e.value().is_online()).count()
    }

    /// Whether a live connection to `wallet` exists
    #[must_use]
    pub fn is_connected_to(&self, wallet: &WalletAddress) -> bool {
        self.live_peer(wallet).is_some()
    }

    /// Receipts awaiting submission
    #[must_use]
    pub fn pending_receipts(&self) -> Vec<RelayReceipt> {
        self.inner.receipts.pending()
    }

    /// Messages in the store-for-later queue
    #[must_use]
    pub fn pending_message_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Messages queued for `recipient`
    #[must_use]
    pub fn pending_messages_for(&self, recipient: &WalletAddress) -> usize {
        self.inner.pending.count_for(recipient)
    }

    /// Whether the recipient acknowledged `message_id`
    #[must_use]
    pub fn is_acknowledged(&self, message_id: &str) -> bool {
        self.inner.acknowledged.contains(message_id)
    }

    /// Statistics snapshot
    #[must_use]
    pub fn stats(&self) -> P2pStats {
        let live = self.live_peers();
        P2pStats {
            state: self.connection_state(),
            local_addr: self.local_addr(),
            connected_peers: live.len(),
            relay_peers: live.iter().filter(|p| p.is_relay()).count(),
            dht: self.inner.dht.stats(),
            pending_messages: self.inner.pending.len(),
            pending_receipts: self.inner.receipts.len(),
            cached_message_ids: self.inner.message_cache.len(),
            rate_limit: self.inner.rate_limiter.metrics(),
        }
    }

    pub(crate) fn live_peer(&self, wallet: &WalletAddress) -> Option<Arc<PeerConnection>> {
        self.inner
            .peers
            .get(wallet)
            .filter(|p| p.is_online())
            .map(|p| Arc::clone(p.value()))
    }

    pub(crate) fn live_peers(&self) -> Vec<Arc<PeerConnection>> {
        self.inner
            .peers
            .iter()
            .filter(|e| e.value().is_online())
            .map(|e| Arc::clone(e.value()))
            .collect()
    }
}
