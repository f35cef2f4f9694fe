//! Outbound message routing.
//!
//! Delivery strategies are tried in order until one succeeds:
//!
//! 1. **Direct** - live connection to the recipient
//! 2. **DHT-located** - recipient found in the routing table, dialled on demand
//! 3. **Gossip** - flooded to every live peer; relays get a signed receipt
//! 4. **Relay service** - handed to the internet store-and-forward service
//! 5. **Queued** - held in memory until the recipient connects

use crate::node::error::{NodeError, Result};
use crate::node::node::P2pManager;
use crate::node::services::ENCRYPTED_CONTENT_TYPE;
use crate::protocol::{ChatMessage, GossipMessage, WireMessage};
use mumble_crypto::{EncryptedMessage, WalletAddress, now_millis};
use mumble_discovery::RateLimitCategory;

/// Strategy that took the message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryPath {
    /// Existing connection to the recipient
    Direct,
    /// Connection opened after locating the recipient in the DHT
    DhtLocated,
    /// Flooded to peers; `via` is the first peer that accepted it
    Gossip {
        /// First peer that accepted a copy
        via: WalletAddress,
    },
    /// Accepted by the internet relay service
    RelayService,
    /// Held in the store-for-later queue
    Queued,
    /// The message ID was already sent; nothing was done
    Duplicate,
}

/// Outcome of [`P2pManager::send_message`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendResult {
    /// Written to a connection with the recipient
    pub direct: bool,
    /// Handed to an intermediary
    pub relayed: bool,
    /// Strategy that took the message
    pub path: DeliveryPath,
}

impl SendResult {
    const fn direct(path: DeliveryPath) -> Self {
        Self {
            direct: true,
            relayed: false,
            path,
        }
    }

    const fn relayed(path: DeliveryPath) -> Self {
        Self {
            direct: false,
            relayed: true,
            path,
        }
    }

    const fn undelivered(path: DeliveryPath) -> Self {
        Self {
            direct: false,
            relayed: false,
            path,
        }
    }

    /// Whether the message left this node
    #[must_use]
    pub const fn is_delivered(&self) -> bool {
        self.direct || self.relayed
    }
}

impl P2pManager {
    /// Send an encrypted message to `recipient` with the configured gossip TTL
    ///
    /// # Errors
    ///
    /// See [`send_message_with_ttl`](Self::send_message_with_ttl).
    pub async fn send_message(
        &self,
        recipient: WalletAddress,
        payload: &EncryptedMessage,
        message_id: impl Into<String>,
    ) -> Result<SendResult> {
        let ttl = self.inner.config.gossip.default_ttl;
        self.send_message_with_ttl(recipient, payload, message_id, ttl).await
    }

    /// Send an encrypted message, flooding with at most `ttl` forwards if gossip is needed
    ///
    /// `ttl` counts forwards beyond the originator's own flood, which is
    /// sent with `ttl` unchanged and reaches direct neighbours only. Each
    /// forwarding node decrements it, so a gossiped message travels at most
    /// `ttl + 1` hops and `ttl = 0` never leaves the originator's neighbours.
    ///
    /// Undeliverable messages are queued, which is reported through
    /// [`SendResult::path`] rather than as an error.
    ///
    /// # Errors
    ///
    /// Returns `NodeError::InvalidState` if the manager is not connected and
    /// `NodeError::InvalidMessage` for an empty ID or a message to ourselves.
    pub async fn send_message_with_ttl(
        &self,
        recipient: WalletAddress,
        payload: &EncryptedMessage,
        message_id: impl Into<String>,
        ttl: u8,
    ) -> Result<SendResult> {
        if !self.connection_state().is_online() {
            return Err(NodeError::invalid_state("P2P manager not connected"));
        }
        if recipient == self.inner.wallet {
            return Err(NodeError::InvalidMessage("cannot send a message to self".into()));
        }
        let message_id = message_id.into();
        if message_id.is_empty() {
            return Err(NodeError::InvalidMessage("message ID must not be empty".into()));
        }

        if !self.inner.message_cache.first_seen(&message_id) {
            tracing::debug!("Message {} already sent, ignoring", message_id);
            return Ok(SendResult::undelivered(DeliveryPath::Duplicate));
        }

        let chat = ChatMessage::new(message_id, self.inner.wallet, recipient, payload, now_millis());

        if !self
            .inner
            .rate_limiter
            .check_and_increment(RateLimitCategory::MessageSend, &recipient.to_string())
        {
            tracing::warn!("Send rate limit reached for {}, queueing {}", recipient, chat.id);
            self.queue_for_later(&chat);
            return Ok(SendResult::undelivered(DeliveryPath::Queued));
        }

        if self.try_direct(&chat).await {
            tracing::debug!("Message {} sent directly to {}", chat.id, recipient);
            return Ok(SendResult::direct(DeliveryPath::Direct));
        }

        if self.try_dht_located(&chat).await {
            tracing::debug!("Message {} sent to {} after DHT lookup", chat.id, recipient);
            return Ok(SendResult::direct(DeliveryPath::DhtLocated));
        }

        let gossip = GossipMessage {
            chat: chat.clone(),
            ttl,
            relay_receipt: None,
        };
        if let Some(via) = self.flood(&gossip, &[recipient]).await {
            tracing::debug!("Message {} gossiped via {}", chat.id, via);
            return Ok(SendResult::relayed(DeliveryPath::Gossip { via }));
        }

        if let Some(service) = &self.inner.services.relay_delivery {
            if service
                .send_message(&recipient, &payload.to_bytes(), &chat.id, ENCRYPTED_CONTENT_TYPE)
                .await
            {
                tracing::debug!("Message {} handed to relay service", chat.id);
                return Ok(SendResult::relayed(DeliveryPath::RelayService));
            }
            tracing::debug!("Relay service refused message {}", chat.id);
        }

        tracing::info!("No route to {}, queueing message {}", recipient, chat.id);
        self.queue_for_later(&chat);
        Ok(SendResult::undelivered(DeliveryPath::Queued))
    }

    async fn try_direct(&self, chat: &ChatMessage) -> bool {
        let Some(peer) = self.live_peer(&chat.to) else {
            return false;
        };
        match peer.send(&WireMessage::Chat(chat.clone())) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("Direct send to {} failed: {}", chat.to, e);
                false
            }
        }
    }

    async fn try_dht_located(&self, chat: &ChatMessage) -> bool {
        let Some(node) = self.inner.dht.get_node(&chat.to) else {
            return false;
        };
        if let Err(e) = self.dial(&node.endpoint, Some(chat.to)).await {
            tracing::debug!("Recipient {} at {} unreachable: {}", chat.to, node.endpoint, e);
            return false;
        }
        self.try_direct(chat).await
    }
}
