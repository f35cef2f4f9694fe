//! Inbound frame dispatch

use crate::node::error::Result;
use crate::node::node::P2pManager;
use crate::node::peer::PeerConnection;
use crate::protocol::{Ack, ChatMessage, FindNode, NodeEntry, NodeList, Ping, WireMessage};
use mumble_crypto::{EncryptedMessage, WalletAddress};
use mumble_discovery::RateLimitCategory;
use std::sync::Arc;

/// A message delivered to this node
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    /// Message ID
    pub message_id: String,
    /// Original sender
    pub from: WalletAddress,
    /// Recipient (this node)
    pub to: WalletAddress,
    /// Encrypted payload
    pub payload: EncryptedMessage,
    /// Sender timestamp, milliseconds since epoch
    pub timestamp: u64,
    /// Peer that handed us the message
    pub received_from: WalletAddress,
    /// Arrived by gossip rather than a direct chat frame
    pub via_gossip: bool,
}

impl IncomingMessage {
    pub(crate) fn from_chat(chat: &ChatMessage, received_from: WalletAddress, via_gossip: bool) -> Self {
        Self {
            message_id: chat.id.clone(),
            from: chat.from,
            to: chat.to,
            payload: chat.payload(),
            timestamp: chat.timestamp,
            received_from,
            via_gossip,
        }
    }
}

impl P2pManager {
    /// Dispatch one decoded frame from `peer`
    pub(crate) async fn handle_message(&self, peer: &Arc<PeerConnection>, message: WireMessage) {
        tracing::trace!("{} frame from {}", message.kind(), peer.wallet());

        let result = match message {
            WireMessage::Ping(ping) => self.handle_ping(peer, ping).await,
            WireMessage::Pong(_) => {
                self.inner.dht.mark_node_seen(peer.wallet());
                Ok(())
            }
            WireMessage::FindNode(request) => self.handle_find_node(peer, request).await,
            WireMessage::NodeList(list) => {
                self.handle_node_list(peer, list);
                Ok(())
            }
            WireMessage::Chat(chat) => self.handle_chat(peer, chat).await,
            WireMessage::Gossip(gossip) => self.handle_gossip(peer, gossip).await,
            WireMessage::Ack(ack) => {
                self.inner.acknowledged.first_seen(&ack.message_id);
                Ok(())
            }
            WireMessage::Unknown => Ok(()),
        };

        if let Err(e) = result {
            tracing::debug!("Handling frame from {} failed: {}", peer.wallet(), e);
        }
    }

    async fn handle_ping(&self, peer: &PeerConnection, ping: Ping) -> Result<()> {
        self.inner.dht.mark_node_seen(peer.wallet());
        let pong = WireMessage::Pong(Ping {
            node_id: self.inner.node_id,
            timestamp: ping.timestamp,
        });
        peer.send(&pong)
    }

    async fn handle_find_node(&self, peer: &PeerConnection, request: FindNode) -> Result<()> {
        let key = peer.wallet().to_string();
        if !self
            .inner
            .rate_limiter
            .check_and_increment(RateLimitCategory::DhtOperation, &key)
        {
            tracing::debug!("FIND_NODE from {} rate limited", peer.wallet());
            return Ok(());
        }

        let nodes = self
            .inner
            .dht
            .find_closest_nodes(&request.target_id, self.inner.config.dht.k)
            .iter()
            .filter(|node| node.wallet() != peer.wallet())
            .map(NodeEntry::from_peer)
            .collect();
        peer.send(&WireMessage::NodeList(NodeList { nodes }))
    }

    /// Entries from a connected peer go straight into the routing table
    fn handle_node_list(&self, peer: &PeerConnection, list: NodeList) {
        let mut added = 0usize;
        for entry in list.nodes.iter().take(self.inner.config.dht.k) {
            if entry.wallet_address == self.inner.wallet {
                continue;
            }
            match entry.to_peer() {
                Some(node) => {
                    if self.inner.dht.add_trusted_node(node) {
                        added += 1;
                    }
                }
                None => tracing::debug!(
                    "Ignoring node_list entry {} from {}: node ID mismatch",
                    entry.wallet_address,
                    peer.wallet()
                ),
            }
        }
        tracing::debug!("node_list from {}: {} of {} entries added", peer.wallet(), added, list.nodes.len());
    }

    async fn handle_chat(&self, peer: &PeerConnection, chat: ChatMessage) -> Result<()> {
        if chat.to != self.inner.wallet {
            tracing::debug!("Dropping chat {} for {} received from {}", chat.id, chat.to, peer.wallet());
            return Ok(());
        }

        if self.inner.message_cache.first_seen(&chat.id) {
            self.deliver(IncomingMessage::from_chat(&chat, *peer.wallet(), false));
        } else {
            tracing::trace!("Duplicate chat {} from {}", chat.id, peer.wallet());
        }

        // Re-acknowledge duplicates; the first ack may have been lost
        peer.send(&WireMessage::Ack(Ack { message_id: chat.id }))
    }

    /// Publish a message to subscribers
    pub(crate) fn deliver(&self, message: IncomingMessage) {
        tracing::info!(
            "Received message {} from {}{}",
            message.message_id,
            message.from,
            if message.via_gossip { " (gossip)" } else { "" }
        );
        if self.inner.incoming.send(message).is_err() {
            tracing::debug!("No subscribers for incoming messages");
        }
    }
}
