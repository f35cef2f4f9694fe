//! Store-for-later queue for unreachable recipients.
//!
//! In-memory only: queued messages do not survive a restart. Each recipient
//! holds at most `max_per_recipient` messages; when full the oldest is dropped.

use dashmap::DashMap;
use mumble_crypto::{EncryptedMessage, WalletAddress};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// A message waiting for its recipient to come online
#[derive(Debug, Clone)]
pub struct PendingMessage {
    /// Message ID
    pub message_id: String,
    /// Original sender (this node, or the origin of a relayed message)
    pub from: WalletAddress,
    /// Encrypted payload
    pub payload: EncryptedMessage,
    /// Sender timestamp, milliseconds since epoch
    pub timestamp: u64,
    /// When the message was queued here
    pub queued_at: Instant,
    /// How long the message may wait
    pub ttl: Duration,
}

impl PendingMessage {
    /// Whether the message outlived its TTL
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.queued_at.elapsed() >= self.ttl
    }
}

/// Per-recipient bounded FIFO queues
#[derive(Debug)]
pub struct PendingQueue {
    queues: DashMap<WalletAddress, VecDeque<PendingMessage>>,
    max_per_recipient: usize,
}

impl PendingQueue {
    /// Create with a per-recipient bound
    #[must_use]
    pub fn new(max_per_recipient: usize) -> Self {
        Self {
            queues: DashMap::new(),
            max_per_recipient: max_per_recipient.max(1),
        }
    }

    /// Queue `message` for `recipient`
    ///
    /// Returns the message evicted to make room, if any. A message whose ID is
    /// already queued for the same recipient is ignored.
    pub fn push(&self, recipient: WalletAddress, message: PendingMessage) -> Option<PendingMessage> {
        let mut queue = self.queues.entry(recipient).or_default();
        if queue.iter().any(|m| m.message_id == message.message_id) {
            return None;
        }
        let evicted = if queue.len() >= self.max_per_recipient {
            queue.pop_front()
        } else {
            None
        };
        if let Some(dropped) = &evicted {
            tracing::warn!(
                "Pending queue for {} full, dropped oldest message {}",
                recipient,
                dropped.message_id
            );
        }
        queue.push_back(message);
        evicted
    }

    /// Remove and return every live message for `recipient`, oldest first
    pub fn take(&self, recipient: &WalletAddress) -> Vec<PendingMessage> {
        self.queues
            .remove(recipient)
            .map(|(_, queue)| queue.into_iter().filter(|m| !m.is_expired()).collect())
            .unwrap_or_default()
    }

    /// Put messages back at the front of the queue, preserving their order
    pub fn restore(&self, recipient: WalletAddress, messages: Vec<PendingMessage>) {
        if messages.is_empty() {
            return;
        }
        let mut queue = self.queues.entry(recipient).or_default();
        for message in messages.into_iter().rev() {
            if queue.len() >= self.max_per_recipient {
                break;
            }
            queue.push_front(message);
        }
    }

    /// Recipients with at least one queued message
    #[must_use]
    pub fn recipients(&self) -> Vec<WalletAddress> {
        self.queues
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .map(|entry| *entry.key())
            .collect()
    }

    /// Messages queued for `recipient`
    #[must_use]
    pub fn count_for(&self, recipient: &WalletAddress) -> usize {
        self.queues.get(recipient).map_or(0, |q| q.len())
    }

    /// Drop expired messages and empty queues, returning how many messages were removed
    pub fn cleanup_expired(&self) -> usize {
        let mut removed = 0;
        self.queues.retain(|_, queue| {
            let before = queue.len();
            queue.retain(|m| !m.is_expired());
            removed += before - queue.len();
            !queue.is_empty()
        });
        removed
    }

    /// Total queued messages
    #[must_use]
    pub fn len(&self) -> usize {
        self.queues.iter().map(|entry| entry.value().len()).sum()
    }

    /// Whether nothing is queued
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
