//! Encrypted message wire encoding.
//!
//! Used for storage and relay forwarding, independent of the JSON envelope:
//!
//! ```text
//! ┌────────────┬──────────────────────────┬──────────────┐
//! │ nonce (12) │ ciphertext (variable)    │ authTag (16) │
//! └────────────┴──────────────────────────┴──────────────┘
//! ```

use crate::CryptoError;
use alloy_primitives::keccak256;

/// Nonce size (12 bytes / 96 bits)
pub const NONCE_SIZE: usize = 12;

/// Authentication tag size (16 bytes / 128 bits)
pub const TAG_SIZE: usize = 16;

/// Encoded length that carries no ciphertext; valid encodings are longer
pub const MIN_ENCODED_LEN: usize = NONCE_SIZE + TAG_SIZE;

/// An AEAD-encrypted payload split into its three parts
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncryptedMessage {
    nonce: [u8; NONCE_SIZE],
    ciphertext: Vec<u8>,
    auth_tag: [u8; TAG_SIZE],
}

impl EncryptedMessage {
    /// Assemble from parts
    #[must_use]
    pub fn new(nonce: [u8; NONCE_SIZE], ciphertext: Vec<u8>, auth_tag: [u8; TAG_SIZE]) -> Self {
        Self {
            nonce,
            ciphertext,
            auth_tag,
        }
    }

    /// Assemble from variable-length slices, as decoded from hex JSON fields
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKeyLength` if the nonce or tag has the wrong size.
    pub fn from_parts(nonce: &[u8], ciphertext: &[u8], auth_tag: &[u8]) -> Result<Self, CryptoError> {
        let nonce: [u8; NONCE_SIZE] =
            nonce
                .try_into()
                .map_err(|_| CryptoError::InvalidKeyLength {
                    expected: NONCE_SIZE,
                    actual: nonce.len(),
                })?;
        let auth_tag: [u8; TAG_SIZE] =
            auth_tag
                .try_into()
                .map_err(|_| CryptoError::InvalidKeyLength {
                    expected: TAG_SIZE,
                    actual: auth_tag.len(),
                })?;
        Ok(Self::new(nonce, ciphertext.to_vec(), auth_tag))
    }

    /// Serialize as `nonce ‖ ciphertext ‖ authTag`
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(MIN_ENCODED_LEN + self.ciphertext.len());
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.ciphertext);
        out.extend_from_slice(&self.auth_tag);
        out
    }

    /// Parse `nonce ‖ ciphertext ‖ authTag`
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::MessageTooShort` unless the input is longer than
    /// 28 bytes (12-byte nonce plus 16-byte tag).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() <= MIN_ENCODED_LEN {
            return Err(CryptoError::MessageTooShort {
                actual: bytes.len(),
                minimum: MIN_ENCODED_LEN,
            });
        }

        let (nonce, rest) = bytes.split_at(NONCE_SIZE);
        let (ciphertext, tag) = rest.split_at(rest.len() - TAG_SIZE);
        Self::from_parts(nonce, ciphertext, tag)
    }

    /// Nonce bytes
    #[must_use]
    pub const fn nonce(&self) -> &[u8; NONCE_SIZE] {
        &self.nonce
    }

    /// Ciphertext bytes (without tag)
    #[must_use]
    pub fn ciphertext(&self) -> &[u8] {
        &self.ciphertext
    }

    /// Authentication tag
    #[must_use]
    pub const fn auth_tag(&self) -> &[u8; TAG_SIZE] {
        &self.auth_tag
    }

    /// Keccak-256 of the wire encoding, the message hash relay receipts commit to
    #[must_use]
    pub fn message_hash(&self) -> [u8; 32] {
        keccak256(self.to_bytes()).0
    }
}
