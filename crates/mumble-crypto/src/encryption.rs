//! Message encryption service.
//!
//! The overlay treats encryption as an opaque collaborator that turns byte
//! buffers into [`EncryptedMessage`] values and back. [`ChaChaEncryptionService`]
//! is the default implementation used by the command-line node.

use crate::message::{NONCE_SIZE, TAG_SIZE};
use crate::{CryptoError, EncryptedMessage};
use chacha20poly1305::{
    ChaCha20Poly1305, Nonce, Tag,
    aead::{AeadInPlace, KeyInit},
};
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Symmetric key size (32 bytes / 256 bits)
pub const KEY_SIZE: usize = 32;

/// Symmetric key shared by a conversation or group
///
/// Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct GroupKey([u8; KEY_SIZE]);

impl GroupKey {
    /// Create from raw bytes
    #[must_use]
    pub const fn new(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create from slice
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKeyLength` if slice length is not 32 bytes.
    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        if slice.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: slice.len(),
            });
        }
        let mut bytes = [0u8; KEY_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Self(bytes))
    }

    /// Parse from hex
    ///
    /// # Errors
    ///
    /// Returns an error for malformed hex or a wrong key length.
    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let mut bytes = hex::decode(s.trim())?;
        let key = Self::from_slice(&bytes);
        bytes.zeroize();
        key
    }

    /// Raw key bytes
    ///
    /// # Security
    ///
    /// Exposes the raw key material.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for GroupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Encrypt/decrypt collaborator operating on opaque byte payloads
pub trait EncryptionService: Send + Sync {
    /// Encrypt `plaintext` under `key`
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::EncryptionFailed` if the cipher fails.
    fn encrypt(&self, key: &GroupKey, plaintext: &[u8]) -> Result<EncryptedMessage, CryptoError>;

    /// Decrypt and authenticate `message` under `key`
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::DecryptionFailed` on authentication failure.
    fn decrypt(&self, key: &GroupKey, message: &EncryptedMessage) -> Result<Vec<u8>, CryptoError>;

    /// Generate a fresh random group key
    fn generate_group_key(&self) -> GroupKey;
}

/// ChaCha20-Poly1305 with random 96-bit nonces
#[derive(Debug, Default, Clone, Copy)]
pub struct ChaChaEncryptionService;

impl EncryptionService for ChaChaEncryptionService {
    fn encrypt(&self, key: &GroupKey, plaintext: &[u8]) -> Result<EncryptedMessage, CryptoError> {
        let cipher = ChaCha20Poly1305::new(key.as_bytes().into());

        let mut nonce = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce);

        let mut buffer = plaintext.to_vec();
        let tag = cipher
            .encrypt_in_place_detached(Nonce::from_slice(&nonce), b"", &mut buffer)
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut auth_tag = [0u8; TAG_SIZE];
        auth_tag.copy_from_slice(tag.as_slice());
        Ok(EncryptedMessage::new(nonce, buffer, auth_tag))
    }

    fn decrypt(&self, key: &GroupKey, message: &EncryptedMessage) -> Result<Vec<u8>, CryptoError> {
        let cipher = ChaCha20Poly1305::new(key.as_bytes().into());

        let mut buffer = message.ciphertext().to_vec();
        cipher
            .decrypt_in_place_detached(
                Nonce::from_slice(message.nonce()),
                b"",
                &mut buffer,
                Tag::from_slice(message.auth_tag()),
            )
            .map_err(|_| CryptoError::DecryptionFailed)?;
        Ok(buffer)
    }

    fn generate_group_key(&self) -> GroupKey {
        let mut bytes = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        GroupKey::new(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt() {
        let service = ChaChaEncryptionService;
        let key = service.generate_group_key();

        let encrypted = service.encrypt(&key, b"hello mesh").unwrap();
        assert_eq!(encrypted.ciphertext().len(), 10);

        let decrypted = service.decrypt(&key, &encrypted).unwrap();
        assert_eq!(decrypted, b"hello mesh");
    }

    #[test]
    fn test_survives_wire_encoding() {
        let service = ChaChaEncryptionService;
        let key = service.generate_group_key();

        let encrypted = service.encrypt(&key, b"over the wire").unwrap();
        let decoded = EncryptedMessage::from_bytes(&encrypted.to_bytes()).unwrap();
        assert_eq!(service.decrypt(&key, &decoded).unwrap(), b"over the wire");
    }

    #[test]
    fn test_wrong_key_fails() {
        let service = ChaChaEncryptionService;
        let key = service.generate_group_key();
        let other = service.generate_group_key();

        let encrypted = service.encrypt(&key, b"secret").unwrap();
        assert!(matches!(
            service.decrypt(&other, &encrypted),
            Err(CryptoError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let service = ChaChaEncryptionService;
        let key = service.generate_group_key();

        let encrypted = service.encrypt(&key, b"secret").unwrap();
        let mut bytes = encrypted.to_bytes();
        bytes[NONCE_SIZE] ^= 0x01;
        let tampered = EncryptedMessage::from_bytes(&bytes).unwrap();
        assert!(service.decrypt(&key, &tampered).is_err());
    }

    #[test]
    fn test_nonces_are_random() {
        let service = ChaChaEncryptionService;
        let key = service.generate_group_key();
        let a = service.encrypt(&key, b"same").unwrap();
        let b = service.encrypt(&key, b"same").unwrap();
        assert_ne!(a.nonce(), b.nonce());
    }

    #[test]
    fn test_group_key_hex() {
        let key = GroupKey::from_hex(&"ab".repeat(32)).unwrap();
        assert_eq!(key.as_bytes(), &[0xAB; 32]);
        assert!(GroupKey::from_hex("abcd").is_err());
        assert!(format!("{key:?}").contains("REDACTED"));
    }
}
