//! LAN peer discovery
//!
//! Broadcasts a signed [`LanAnnouncement`] every LAN interval and dials peers
//! heard on the local network. Sightings are limited per source address and
//! must pass DHT admission before they are dialed; admitted ones are also
//! recorded with the bootstrap resolver so a later reconnect can use them.

use crate::node::node::P2pManager;
use mumble_discovery::{LanAnnouncement, LanDiscovery, LanError, RateLimitCategory};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;

impl P2pManager {
    /// Broadcast / listen loop
    pub(crate) async fn lan_loop(self, cancel: CancellationToken) {
        let lan = self.inner.config.lan.clone();
        let target = lan.target.unwrap_or_else(|| LanDiscovery::broadcast_target(lan.port));
        let bind_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, lan.port));

        let discovery = match LanDiscovery::bind(bind_addr, target) {
            Ok(discovery) => discovery,
            Err(e) => {
                tracing::warn!("LAN discovery disabled: {}", e);
                return;
            }
        };
        let Some(port) = self.local_addr().map(|addr| addr.port()) else {
            return;
        };
        tracing::info!("LAN discovery on UDP {} (announcing TCP {})", lan.port, port);

        let mut ticker = interval(lan.interval);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let tag = &self.inner.dht.config().protocol_tag;
                    let announcement = match LanAnnouncement::signed(&self.inner.identity, port, tag) {
                        Ok(announcement) => announcement,
                        Err(e) => {
                            tracing::warn!("Cannot sign LAN announcement: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = discovery.broadcast(&announcement).await {
                        tracing::debug!("LAN broadcast failed: {}", e);
                    }
                }
                received = discovery.recv() => match received {
                    Ok((announcement, from)) => self.handle_lan_announcement(announcement, from),
                    Err(LanError::Decode(e)) => tracing::trace!("Ignoring LAN datagram: {}", e),
                    Err(e) => {
                        tracing::warn!("LAN receive failed: {}", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                },
            }
        }
        tracing::debug!("LAN discovery stopped");
    }

    /// Admit, record and dial a peer announced on the LAN
    pub(crate) fn handle_lan_announcement(&self, announcement: LanAnnouncement, from: SocketAddr) {
        let wallet = announcement.wallet_address;
        if wallet == self.inner.wallet || self.is_connected_to(&wallet) {
            return;
        }
        if !announcement.is_consistent() {
            tracing::debug!("LAN announcement from {} has a mismatched node ID", from);
            return;
        }

        // Counted apart from inbound TCP accepts from the same address
        let key = format!("lan:{}", from.ip());
        if !self
            .inner
            .rate_limiter
            .check_and_increment(RateLimitCategory::ConnectionAttempt, &key)
        {
            tracing::debug!("LAN sighting from {} rate limited", from);
            return;
        }

        let Some(peer) = announcement.to_peer(from.ip().to_string()) else {
            tracing::debug!("Unsigned LAN announcement for {} from {}", wallet, from);
            return;
        };
        let endpoint = peer.endpoint.clone();
        if !self.inner.dht.add_node(peer) {
            tracing::debug!("LAN peer {} at {} not admitted", wallet, endpoint);
            return;
        }
        tracing::debug!("LAN peer {} at {}", wallet, endpoint);
        self.inner.resolver.record_lan_peer(wallet, endpoint.clone());

        let manager = self.clone();
        tokio::spawn(async move {
            match manager.dial(&endpoint, Some(wallet)).await {
                Ok(_) => tracing::info!("Connected to LAN peer {} at {}", wallet, endpoint),
                Err(e) => tracing::debug!("LAN peer {} at {} unreachable: {}", wallet, endpoint, e),
            }
        });
    }
}
