//! Peer health monitoring and reconnection.
//!
//! Every ping interval each live peer is either evicted (silent longer than
//! the peer timeout) or pinged. When the last peer is gone and a bootstrap set
//! is known, the manager moves to `Reconnecting` and retries the set with
//! exponential backoff, returning to `Connected` whether or not it succeeds.

use crate::node::node::P2pManager;
use crate::node::state::ConnectionState;
use std::sync::atomic::Ordering;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

impl P2pManager {
    /// Ping / eviction loop
    pub(crate) async fn health_loop(self, cancel: CancellationToken) {
        let mut ticker = interval(self.inner.config.network.ping_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.health_check().await;
                    self.maybe_reconnect(&cancel);
                }
            }
        }
        tracing::debug!("Health loop stopped");
    }

    /// Evict stale peers and ping the rest, returning how many were evicted
    pub async fn health_check(&self) -> usize {
        let timeout = self.inner.config.network.peer_timeout;
        let ping = self.ping_message();
        let mut evicted = 0;

        for peer in self.live_peers() {
            if peer.is_stale(timeout) {
                tracing::info!("Disconnecting stale peer {} (idle {:?})", peer.wallet(), peer.idle_time());
                self.disconnect_peer(peer.wallet());
                evicted += 1;
            } else if let Err(e) = peer.send(&ping) {
                tracing::debug!("Ping to {} failed: {}", peer.wallet(), e);
            }
        }
        evicted
    }

    fn maybe_reconnect(&self, cancel: &CancellationToken) {
        if !self.inner.config.reconnect.enabled
            || self.connection_state() != ConnectionState::Connected
            || self.connected_peer_count() > 0
            || self.inner.reconnect_exhausted.load(Ordering::SeqCst)
            || self.inner.bootstrap_set.lock().is_empty()
        {
            return;
        }
        if self
            .inner
            .reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let manager = self.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            manager.reconnect(cancel).await;
            manager.inner.reconnecting.store(false, Ordering::SeqCst);
        });
    }

    /// Retry the bootstrap set with backoff; `true` once a peer is back
    async fn reconnect(&self, cancel: CancellationToken) -> bool {
        if self.inner.state.transition(ConnectionState::Reconnecting).is_err() {
            return false;
        }
        tracing::warn!("Lost all peers, reconnecting to the bootstrap set");

        let policy = self.inner.config.reconnect.clone();
        let candidates = self.inner.bootstrap_set.lock().clone();
        let mut recovered = false;

        for attempt in 0..policy.max_attempts {
            let delay = policy.backoff_duration(attempt);
            tokio::select! {
                () = cancel.cancelled() => return false,
                () = tokio::time::sleep(delay) => {}
            }

            // An inbound peer counts as recovery too
            if self.connected_peer_count() > 0 || self.bootstrap(&candidates).await > 0 {
                recovered = true;
                tracing::info!("Reconnected after {} attempts", attempt + 1);
                break;
            }
            tracing::debug!("Reconnect attempt {}/{} failed", attempt + 1, policy.max_attempts);
        }

        if recovered {
            self.populate_routing_table().await;
        } else {
            self.inner.reconnect_exhausted.store(true, Ordering::SeqCst);
            tracing::warn!(
                "Reconnection gave up after {} attempts, continuing as genesis node",
                policy.max_attempts
            );
        }

        if let Err(e) = self.inner.state.transition(ConnectionState::Connected) {
            tracing::debug!("Reconnect finished after shutdown: {}", e);
        }
        recovered
    }
}

#[cfg(test)]
mod tests {
    use crate::node::config::P2pConfig;
    use crate::node::node::P2pManager;
    use crate::node::state::ConnectionState;
    use crate::protocol::{Handshake, encode_line};
    use mumble_crypto::WalletAddress;
    use mumble_discovery::BootstrapCandidate;
    use mumble_discovery::dht::{Endpoint, NodeId};
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn test_health_check_pings_fresh_peers() {
        let mut config = P2pConfig::default();
        config.network.ping_interval = Duration::from_secs(3600);
        config.network.peer_timeout = Duration::from_secs(7200);
        let a = P2pManager::new_random(config.clone()).unwrap();
        let b = P2pManager::new_random(config).unwrap();
        a.connect().await.unwrap();
        b.connect().await.unwrap();
        a.connect_to_peer(&Endpoint::from(b.local_addr().unwrap()))
            .await
            .unwrap();

        assert_eq!(a.health_check().await, 0);
        assert!(a.is_connected_to(&b.wallet()));

        a.disconnect().await.unwrap();
        b.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_silent_peer_disconnected() {
        let mut config = P2pConfig::default();
        config.network.ping_interval = Duration::from_millis(50);
        config.network.peer_timeout = Duration::from_millis(150);
        config.reconnect.enabled = false;
        let a = P2pManager::new_random(config).unwrap();
        a.connect().await.unwrap();

        // Handshake, then never answer a ping
        let wallet = WalletAddress::from_bytes([3; 20]);
        let hello = Handshake {
            node_id: NodeId::from_wallet(&wallet),
            wallet_address: wallet,
            public_key: "04".into(),
            listen_port: None,
            is_relay: false,
            advertised_host: None,
        };
        let mut stream = TcpStream::connect(a.local_addr().unwrap()).await.unwrap();
        let mut line = encode_line(&hello).unwrap();
        line.push('\n');
        stream.write_all(line.as_bytes()).await.unwrap();

        let mut seen = false;
        for _ in 0..50 {
            if a.is_connected_to(&wallet) {
                seen = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(seen);

        let mut gone = false;
        for _ in 0..100 {
            if !a.is_connected_to(&wallet) {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(gone);
        assert_eq!(a.connection_state(), ConnectionState::Connected);

        drop(stream);
        a.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_reconnect_recovers_when_seed_returns() {
        let seed = P2pManager::new_random(P2pConfig::default()).unwrap();
        seed.connect().await.unwrap();
        let seed_addr = seed.local_addr().unwrap();

        let mut config = P2pConfig::default();
        config.bootstrap_nodes = vec![BootstrapCandidate::from_endpoint(Endpoint::from(seed_addr))];
        config.network.ping_interval = Duration::from_millis(50);
        config.network.peer_timeout = Duration::from_secs(5);
        config.reconnect.initial_backoff = Duration::from_millis(100);
        config.reconnect.max_backoff = Duration::from_millis(200);
        config.reconnect.max_attempts = 50;
        let joiner = P2pManager::new_random(config).unwrap();
        joiner.connect().await.unwrap();

        let mut states = joiner.state_changes();
        seed.disconnect().await.unwrap();
        let reconnecting = tokio::time::timeout(
            Duration::from_secs(5),
            states.wait_for(|s| *s == ConnectionState::Reconnecting),
        )
        .await
        .is_ok_and(|r| r.is_ok());
        assert!(reconnecting);

        // Restart a node on the same address
        let mut config = P2pConfig::default();
        config.listen_addr = seed_addr;
        config.allow_ephemeral_fallback = false;
        let revived = P2pManager::new_random(config).unwrap();
        revived.connect().await.unwrap();

        let recovered = tokio::time::timeout(
            Duration::from_secs(10),
            states.wait_for(|s| *s == ConnectionState::Connected),
        )
        .await
        .is_ok_and(|r| r.is_ok());
        assert!(recovered);
        assert!(joiner.is_connected_to(&revived.wallet()));

        joiner.disconnect().await.unwrap();
        revived.disconnect().await.unwrap();
    }
}
