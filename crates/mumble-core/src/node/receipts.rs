//! Relay receipt ledger.
//!
//! Holds receipts this node earned as a relay until they are confirmed
//! submitted to the reward contract. Bounded; when full the oldest receipt is
//! dropped. Receipts are deduplicated by (message hash, relay, sender).

use mumble_crypto::{RelayReceipt, WalletAddress};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use tokio::sync::broadcast;

type ReceiptKey = ([u8; 32], WalletAddress, WalletAddress);

#[derive(Debug, Default)]
struct LedgerState {
    queue: VecDeque<RelayReceipt>,
    keys: HashSet<ReceiptKey>,
}

/// Bounded queue of receipts awaiting submission
#[derive(Debug)]
pub struct RelayReceiptLedger {
    state: Mutex<LedgerState>,
    capacity: usize,
    events: broadcast::Sender<RelayReceipt>,
}

impl RelayReceiptLedger {
    /// Create a ledger holding at most `capacity` receipts
    #[must_use]
    pub fn new(capacity: usize, event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            state: Mutex::new(LedgerState::default()),
            capacity: capacity.max(1),
            events,
        }
    }

    /// Store a receipt; returns `false` for duplicates
    ///
    /// New receipts are also published to [`subscribe`](Self::subscribe) receivers.
    pub fn record(&self, receipt: RelayReceipt) -> bool {
        {
            let mut state = self.state.lock();
            if !state.keys.insert(receipt.key()) {
                return false;
            }
            if state.queue.len() >= self.capacity {
                if let Some(dropped) = state.queue.pop_front() {
                    state.keys.remove(&dropped.key());
                    tracing::warn!(
                        "Receipt ledger full, dropped receipt for message {}",
                        hex::encode(&dropped.message_hash[..8])
                    );
                }
            }
            state.queue.push_back(receipt.clone());
        }

        // No subscribers is fine
        let _ = self.events.send(receipt);
        true
    }

    /// Snapshot of receipts awaiting submission, oldest first
    #[must_use]
    pub fn pending(&self) -> Vec<RelayReceipt> {
        self.state.lock().queue.iter().cloned().collect()
    }

    /// Remove receipts confirmed submitted, returning how many were removed
    pub fn confirm(&self, submitted: &[RelayReceipt]) -> usize {
        let confirmed: HashSet<ReceiptKey> = submitted.iter().map(RelayReceipt::key).collect();
        let mut state = self.state.lock();
        let before = state.queue.len();
        state.queue.retain(|r| !confirmed.contains(&r.key()));
        for key in &confirmed {
            state.keys.remove(key);
        }
        before - state.queue.len()
    }

    /// Stream of newly recorded receipts
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RelayReceipt> {
        self.events.subscribe()
    }

    /// Receipts awaiting submission
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Whether nothing awaits submission
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().queue.is_empty()
    }
}
