//! Relay receipts.
//!
//! When a sender hands a gossip message to a staked relay node it attaches a
//! receipt signed with its wallet key. The relay keeps the receipt and later
//! submits it to the reward ledger as proof that it forwarded the message.
//!
//! The signed digest is
//!
//! ```text
//! keccak256(messageHash ‖ relay ‖ sender ‖ recipient ‖ timestamp_be_u64 ‖ nonce)
//! ```
//!
//! signed as an EIP-191 personal message, so any Ethereum verifier can recover
//! the sender address from `signature`.

use crate::{CryptoError, WalletAddress, WalletIdentity, identity::recover_signer, now_millis};
use alloy_primitives::keccak256;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};

/// Sender-signed proof that a relay forwarded a message
///
/// Two receipts are equal when they name the same message, relay and sender.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayReceipt {
    /// Keccak-256 of the encrypted message wire bytes
    #[serde(with = "hex::serde")]
    pub message_hash: [u8; 32],
    /// Relay node that received the message
    pub relay_node: WalletAddress,
    /// Original sender (the signer)
    pub sender: WalletAddress,
    /// Final recipient
    pub recipient: WalletAddress,
    /// Issue time (ms since epoch)
    pub timestamp: u64,
    /// Random nonce making each receipt unique
    #[serde(with = "hex::serde")]
    pub nonce: [u8; 32],
    /// 65-byte recoverable signature by `sender`
    #[serde(with = "hex::serde")]
    pub signature: Vec<u8>,
}

impl RelayReceipt {
    /// Issue a receipt for handing `message_hash` to `relay_node`
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::Signing` if the sender key cannot sign.
    pub fn issue(
        sender: &WalletIdentity,
        message_hash: [u8; 32],
        relay_node: WalletAddress,
        recipient: WalletAddress,
    ) -> Result<Self, CryptoError> {
        let mut nonce = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut nonce);

        let mut receipt = Self {
            message_hash,
            relay_node,
            sender: sender.address(),
            recipient,
            timestamp: now_millis(),
            nonce,
            signature: Vec::new(),
        };
        receipt.signature = sender.sign_message(&receipt.digest())?.to_vec();
        Ok(receipt)
    }

    /// Digest covered by the sender signature
    #[must_use]
    pub fn digest(&self) -> [u8; 32] {
        let mut buf = Vec::with_capacity(32 + 20 * 3 + 8 + 32);
        buf.extend_from_slice(&self.message_hash);
        buf.extend_from_slice(self.relay_node.as_bytes());
        buf.extend_from_slice(self.sender.as_bytes());
        buf.extend_from_slice(self.recipient.as_bytes());
        buf.extend_from_slice(&self.timestamp.to_be_bytes());
        buf.extend_from_slice(&self.nonce);
        keccak256(&buf).0
    }

    /// Whether `signature` recovers to `sender`
    #[must_use]
    pub fn verify(&self) -> bool {
        matches!(recover_signer(&self.digest(), &self.signature), Ok(addr) if addr == self.sender)
    }

    /// Identity key: (message hash, relay, sender)
    #[must_use]
    pub fn key(&self) -> ([u8; 32], WalletAddress, WalletAddress) {
        (self.message_hash, self.relay_node, self.sender)
    }
}

impl PartialEq for RelayReceipt {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for RelayReceipt {}

impl Hash for RelayReceipt {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}
