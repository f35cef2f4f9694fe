//! Gossip flooding and relay receipts.
//!
//! A gossip frame is processed at most once per node (message ID cache).
//! The originator attaches a sender-signed [`RelayReceipt`] to each copy it
//! hands to a relay peer; intermediate hops strip receipts when forwarding.
//!
//! ```text
//!   gossip from P
//!     │
//!     ├─ seen before?                   → drop
//!     ├─ receipt names us and is valid  → ledger
//!     ├─ addressed to us?               → deliver, ack, stop
//!     ├─ ttl == 0?                      → stop
//!     ├─ RELAY_REQUEST limit (origin)   → drop
//!     └─ forward with ttl-1 to every peer except P and the origin
//!          └─ nobody reachable and we are a relay → store for later
//! ```

use crate::node::error::Result;
use crate::node::handler::IncomingMessage;
use crate::node::node::P2pManager;
use crate::node::peer::PeerConnection;
use crate::node::pending::PendingMessage;
use crate::protocol::{Ack, ChatMessage, GossipMessage, WireMessage};
use mumble_crypto::{RelayReceipt, WalletAddress};
use mumble_discovery::RateLimitCategory;
use std::time::Instant;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

impl P2pManager {
    /// Send `gossip` to every live peer not in `exclude`
    ///
    /// Returns the first peer that accepted a copy.
    pub(crate) async fn flood(
        &self,
        gossip: &GossipMessage,
        exclude: &[WalletAddress],
    ) -> Option<WalletAddress> {
        let originated = gossip.chat.from == self.inner.wallet;
        let message_hash = gossip.chat.payload().message_hash();
        let mut first = None;

        for peer in self.live_peers() {
            if exclude.contains(peer.wallet()) {
                continue;
            }

            let mut copy = gossip.clone();
            copy.relay_receipt = None;
            if originated && peer.is_relay() {
                match RelayReceipt::issue(&self.inner.identity, message_hash, *peer.wallet(), gossip.chat.to) {
                    Ok(receipt) => copy.relay_receipt = Some(receipt),
                    Err(e) => tracing::warn!("Could not sign relay receipt for {}: {}", peer.wallet(), e),
                }
            }

            match peer.send(&WireMessage::Gossip(copy)) {
                Ok(()) => {
                    first.get_or_insert(*peer.wallet());
                }
                Err(e) => tracing::debug!("Gossip to {} failed: {}", peer.wallet(), e),
            }
        }
        first
    }

    /// Process a gossip frame received from `peer`
    pub(crate) async fn handle_gossip(&self, peer: &PeerConnection, gossip: GossipMessage) -> Result<()> {
        let id = gossip.chat.id.clone();
        if !self.inner.message_cache.first_seen(&id) {
            tracing::trace!("Duplicate gossip {} from {}", id, peer.wallet());
            return Ok(());
        }

        if let Some(receipt) = &gossip.relay_receipt {
            self.accept_receipt(receipt, &gossip.chat).await;
        }

        if gossip.chat.to == self.inner.wallet {
            self.deliver(IncomingMessage::from_chat(&gossip.chat, *peer.wallet(), true));
            return peer.send(&WireMessage::Ack(Ack { message_id: id }));
        }

        if gossip.ttl == 0 {
            tracing::debug!("Gossip {} expired (ttl 0), not forwarding", id);
            return Ok(());
        }

        let origin = gossip.chat.from;
        if !self
            .inner
            .rate_limiter
            .check_and_increment(RateLimitCategory::RelayRequest, &origin.to_string())
        {
            tracing::debug!("Relay request from {} rate limited, dropping {}", origin, id);
            return Ok(());
        }

        let forwarded = GossipMessage {
            chat: gossip.chat,
            ttl: gossip.ttl - 1,
            relay_receipt: None,
        };
        match self.flood(&forwarded, &[*peer.wallet(), origin]).await {
            Some(_) => tracing::trace!("Forwarded gossip {} (ttl {})", id, forwarded.ttl),
            None if self.inner.config.is_relay => {
                tracing::debug!("No route for {}, holding it for {}", id, forwarded.chat.to);
                self.queue_for_later(&forwarded.chat);
            }
            None => tracing::debug!("No peers to forward gossip {} to", id),
        }
        Ok(())
    }

    /// Validate a receipt handed to us and store it if we earned it
    ///
    /// Returns whether the receipt was accepted.
    async fn accept_receipt(&self, receipt: &RelayReceipt, chat: &ChatMessage) -> bool {
        if receipt.relay_node != self.inner.wallet {
            tracing::debug!("Receipt for {} names relay {}, ignoring", chat.id, receipt.relay_node);
            return false;
        }
        if receipt.sender != chat.from || receipt.recipient != chat.to {
            tracing::debug!("Receipt for {} does not match the message parties", chat.id);
            return false;
        }
        if receipt.message_hash != chat.payload().message_hash() {
            tracing::debug!("Receipt for {} covers a different payload", chat.id);
            return false;
        }
        if !receipt.verify() {
            tracing::warn!("Receipt for {} has an invalid signature from {}", chat.id, receipt.sender);
            return false;
        }
        if !self.is_registered_relay().await {
            tracing::debug!("Not a registered relay, discarding receipt for {}", chat.id);
            return false;
        }

        if self.inner.receipts.record(receipt.clone()) {
            tracing::info!("Earned relay receipt for message {} from {}", chat.id, receipt.sender);
        }
        true
    }

    /// Whether this node may collect relay receipts
    pub async fn is_registered_relay(&self) -> bool {
        self.inner.config.is_relay || self.inner.resolver.is_registered_relay(&self.inner.wallet).await
    }

    /// Put `chat` in the store-for-later queue for its recipient
    pub(crate) fn queue_for_later(&self, chat: &ChatMessage) {
        let message = PendingMessage {
            message_id: chat.id.clone(),
            from: chat.from,
            payload: chat.payload(),
            timestamp: chat.timestamp,
            queued_at: Instant::now(),
            ttl: self.inner.config.pending.message_ttl,
        };
        self.inner.pending.push(chat.to, message);
    }

    /// Deliver queued messages for `recipient` over its live connection
    ///
    /// Messages that fail to send go back to the front of the queue.
    pub(crate) async fn flush_pending(&self, recipient: &WalletAddress) -> usize {
        let Some(peer) = self.live_peer(recipient) else {
            return 0;
        };
        let queued = self.inner.pending.take(recipient);
        if queued.is_empty() {
            return 0;
        }

        let mut delivered = 0;
        let mut remaining = Vec::new();
        let mut queued = queued.into_iter();
        while let Some(message) = queued.next() {
            let chat = ChatMessage::new(
                message.message_id.clone(),
                message.from,
                *recipient,
                &message.payload,
                message.timestamp,
            );
            match peer.send(&WireMessage::Chat(chat)) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::debug!("Flushing queue for {} failed: {}", recipient, e);
                    remaining.push(message);
                    remaining.extend(queued);
                    break;
                }
            }
        }
        self.inner.pending.restore(*recipient, remaining);

        if delivered > 0 {
            tracing::info!("Delivered {} queued messages to {}", delivered, recipient);
        }
        delivered
    }

    /// Cache cleanup, queue retry and receipt submission, once per gossip interval
    pub(crate) async fn gossip_loop(self, cancel: CancellationToken) {
        let mut ticker = interval(self.inner.config.gossip.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => self.maintenance_tick().await,
            }
        }
        tracing::debug!("Gossip loop stopped");
    }

    /// One pass of periodic maintenance
    pub async fn maintenance_tick(&self) {
        let expired_ids = self.inner.message_cache.cleanup();
        self.inner.acknowledged.cleanup();
        let expired_pending = self.inner.pending.cleanup_expired();
        let expired_values = self.inner.dht.cleanup_expired_values();

        let mut flushed = 0;
        for recipient in self.inner.pending.recipients() {
            flushed += self.flush_pending(&recipient).await;
        }

        let submitted = self.submit_receipts().await;

        tracing::debug!(
            "Maintenance: {} ids expired, {} queued messages expired, {} values expired, {} flushed, {} receipts submitted",
            expired_ids,
            expired_pending,
            expired_values,
            flushed,
            submitted
        );
    }

    /// Hand pending receipts to the sink; confirmed ones leave the ledger
    pub(crate) async fn submit_receipts(&self) -> usize {
        let Some(sink) = self.inner.services.receipt_sink.clone() else {
            return 0;
        };
        let batch = self.inner.receipts.pending();
        if batch.is_empty() {
            return 0;
        }

        match sink.submit(&batch).await {
            Ok(()) => {
                let confirmed = self.inner.receipts.confirm(&batch);
                tracing::info!("Submitted {} relay receipts", confirmed);
                confirmed
            }
            Err(e) => {
                tracing::warn!("Receipt submission failed, keeping {} receipts: {}", batch.len(), e);
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::node::config::P2pConfig;
    use crate::node::error::{NodeError, Result};
    use crate::node::node::P2pManager;
    use crate::node::services::{ReceiptSink, Services};
    use async_trait::async_trait;
    use mumble_crypto::{RelayReceipt, WalletAddress, WalletIdentity};
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct FlakySink {
        fail: AtomicBool,
        submitted: Mutex<Vec<RelayReceipt>>,
    }

    #[async_trait]
    impl ReceiptSink for FlakySink {
        async fn submit(&self, receipts: &[RelayReceipt]) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(NodeError::Service("contract unavailable".into()));
            }
            self.submitted.lock().extend_from_slice(receipts);
            Ok(())
        }
    }

    fn relay_with_sink(sink: Arc<FlakySink>) -> P2pManager {
        let config = P2pConfig {
            is_relay: true,
            ..P2pConfig::default()
        };
        P2pManager::new(
            WalletIdentity::generate(),
            config,
            Services::new().with_receipt_sink(sink),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_receipts_kept_until_submission_succeeds() {
        let sink = Arc::new(FlakySink::default());
        let relay = relay_with_sink(Arc::clone(&sink));

        let sender = WalletIdentity::generate();
        let receipt = RelayReceipt::issue(
            &sender,
            [1; 32],
            relay.wallet(),
            WalletAddress::from_bytes([2; 20]),
        )
        .unwrap();
        assert!(relay.inner.receipts.record(receipt));

        sink.fail.store(true, Ordering::SeqCst);
        relay.maintenance_tick().await;
        assert_eq!(relay.pending_receipts().len(), 1);

        sink.fail.store(false, Ordering::SeqCst);
        relay.maintenance_tick().await;
        assert!(relay.pending_receipts().is_empty());
        assert_eq!(sink.submitted.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_config_flag_makes_registered_relay() {
        let relay = relay_with_sink(Arc::new(FlakySink::default()));
        assert!(relay.is_registered_relay().await);

        let plain = P2pManager::new_random(P2pConfig::default()).unwrap();
        assert!(!plain.is_registered_relay().await);
    }
}
