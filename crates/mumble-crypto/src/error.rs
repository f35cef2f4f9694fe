//! Cryptographic error types.

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Wallet address is not `0x` followed by 40 hex digits
    #[error("invalid wallet address: {0}")]
    InvalidAddress(String),

    /// Signature bytes could not be parsed
    #[error("invalid signature encoding")]
    InvalidSignature,

    /// Signer address could not be recovered from the signature
    #[error("signature recovery failed: {0}")]
    Recovery(String),

    /// Signing operation failed
    #[error("signing failed: {0}")]
    Signing(String),

    /// Private key bytes are not a valid secp256k1 scalar
    #[error("invalid private key")]
    InvalidPrivateKey,

    /// Invalid key length
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Encrypted message is too short to hold nonce and tag
    #[error("encrypted message too short: {actual} bytes, need more than {minimum}")]
    MessageTooShort {
        /// Actual length
        actual: usize,
        /// Minimum length (exclusive)
        minimum: usize,
    },

    /// AEAD encryption failed
    #[error("encryption failed")]
    EncryptionFailed,

    /// AEAD decryption failed (authentication failure)
    #[error("decryption failed: authentication failure")]
    DecryptionFailed,

    /// Hex decoding failed
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
}
