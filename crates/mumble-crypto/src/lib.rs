//! # MumbleChat Crypto
//!
//! Cryptographic identity layer for the MumbleChat overlay.
//!
//! This crate provides:
//! - Wallet addresses normalized for case-insensitive comparison
//! - Wallet identities backed by secp256k1 keys with EIP-191 message signing
//! - Recoverable-signature verification of signed peer announcements
//! - Sender-signed relay receipts that reward relay operators
//! - The `nonce ‖ ciphertext ‖ authTag` encrypted message codec
//! - A pluggable [`EncryptionService`] with a ChaCha20-Poly1305 default
//!
//! ## Cryptographic Suite
//!
//! | Function | Algorithm |
//! |----------|-----------|
//! | Identity | secp256k1 (Ethereum wallet key) |
//! | Signatures | EIP-191 personal message, 65-byte recoverable |
//! | Receipt digest | Keccak-256 |
//! | Message AEAD | ChaCha20-Poly1305 (96-bit nonce, 128-bit tag) |

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod encryption;
pub mod error;
pub mod identity;
pub mod message;
pub mod receipt;
pub mod wallet;

pub use encryption::{ChaChaEncryptionService, EncryptionService, GroupKey};
pub use error::CryptoError;
pub use identity::{WalletIdentity, announcement_message, recover_signer, verify_announcement};
pub use message::EncryptedMessage;
pub use receipt::RelayReceipt;
pub use wallet::WalletAddress;

/// Length of a recoverable secp256k1 signature (r ‖ s ‖ v)
pub const SIGNATURE_SIZE: usize = 65;

/// Current wall-clock time in milliseconds since the Unix epoch
#[must_use]
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
