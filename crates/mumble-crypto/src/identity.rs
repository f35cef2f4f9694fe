//! Wallet identity and signed peer announcements.
//!
//! A node proves ownership of its wallet address by signing the announcement
//! string `"<tag>:<lowercased wallet>:<timestamp>"` with the wallet key. Other
//! nodes recover the signer address from the 65-byte signature and compare it
//! against the claimed wallet; no public key needs to travel with the claim.

use crate::{CryptoError, SIGNATURE_SIZE, WalletAddress};
use alloy_primitives::Signature;
use alloy_signer::SignerSync;
use alloy_signer::k256::elliptic_curve::sec1::ToEncodedPoint;
use alloy_signer_local::PrivateKeySigner;
use zeroize::Zeroizing;

/// Node identity backed by a secp256k1 wallet key
///
/// # Examples
///
/// ```
/// use mumble_crypto::{WalletIdentity, verify_announcement};
///
/// let identity = WalletIdentity::generate();
/// let signature = identity.sign_announcement("MumbleChat", 1_700_000_000_000).unwrap();
/// assert!(verify_announcement(
///     "MumbleChat",
///     &identity.address(),
///     1_700_000_000_000,
///     &signature,
/// ));
/// ```
#[derive(Clone)]
pub struct WalletIdentity {
    signer: PrivateKeySigner,
    address: WalletAddress,
}

impl WalletIdentity {
    /// Generate a fresh random wallet key
    #[must_use]
    pub fn generate() -> Self {
        Self::from_signer(PrivateKeySigner::random())
    }

    /// Wrap an existing signer
    #[must_use]
    pub fn from_signer(signer: PrivateKeySigner) -> Self {
        let address = WalletAddress::from_address(signer.address());
        Self { signer, address }
    }

    /// Load a wallet key from 32 raw bytes
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKeyLength` for a slice of the wrong size and
    /// `CryptoError::InvalidPrivateKey` if the bytes are not a valid scalar.
    pub fn from_private_key_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != 32 {
            return Err(CryptoError::InvalidKeyLength {
                expected: 32,
                actual: bytes.len(),
            });
        }
        let signer =
            PrivateKeySigner::from_slice(bytes).map_err(|_| CryptoError::InvalidPrivateKey)?;
        Ok(Self::from_signer(signer))
    }

    /// Load a wallet key from hex, with or without `0x`
    ///
    /// # Errors
    ///
    /// Returns an error if the hex is malformed or the key is invalid.
    pub fn from_private_key_hex(hex_key: &str) -> Result<Self, CryptoError> {
        let trimmed = hex_key.trim();
        let body = trimmed.strip_prefix("0x").unwrap_or(trimmed);
        let bytes = Zeroizing::new(hex::decode(body)?);
        Self::from_private_key_bytes(&bytes)
    }

    /// Export the private key as hex
    ///
    /// # Security
    ///
    /// The returned string is wiped on drop; do not clone it into plain storage.
    #[must_use]
    pub fn private_key_hex(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(self.signer.to_bytes()))
    }

    /// Wallet address owned by this identity
    #[must_use]
    pub const fn address(&self) -> WalletAddress {
        self.address
    }

    /// Uncompressed SEC1 public key as hex (65 bytes, `04` prefix)
    #[must_use]
    pub fn public_key_hex(&self) -> String {
        let point = self
            .signer
            .credential()
            .verifying_key()
            .to_encoded_point(false);
        hex::encode(point.as_bytes())
    }

    /// Sign an arbitrary message with the EIP-191 personal-message prefix
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::Signing` if the signer rejects the message.
    pub fn sign_message(&self, message: &[u8]) -> Result<[u8; SIGNATURE_SIZE], CryptoError> {
        let signature = self
            .signer
            .sign_message_sync(message)
            .map_err(|e| CryptoError::Signing(e.to_string()))?;
        Ok(signature.as_bytes())
    }

    /// Sign this node's presence announcement
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::Signing` if signing fails.
    pub fn sign_announcement(
        &self,
        protocol_tag: &str,
        timestamp_ms: u64,
    ) -> Result<Vec<u8>, CryptoError> {
        let message = announcement_message(protocol_tag, &self.address, timestamp_ms);
        Ok(self.sign_message(message.as_bytes())?.to_vec())
    }
}

impl std::fmt::Debug for WalletIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalletIdentity")
            .field("address", &self.address)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// Build the announcement string a wallet signs to claim a DHT entry
#[must_use]
pub fn announcement_message(protocol_tag: &str, wallet: &WalletAddress, timestamp_ms: u64) -> String {
    format!("{protocol_tag}:{wallet}:{timestamp_ms}")
}

/// Recover the wallet that produced an EIP-191 signature over `message`
///
/// # Errors
///
/// Returns `CryptoError::InvalidSignature` for malformed signature bytes and
/// `CryptoError::Recovery` if no public key can be recovered.
pub fn recover_signer(message: &[u8], signature: &[u8]) -> Result<WalletAddress, CryptoError> {
    let signature = Signature::try_from(signature).map_err(|_| CryptoError::InvalidSignature)?;
    let address = signature
        .recover_address_from_msg(message)
        .map_err(|e| CryptoError::Recovery(e.to_string()))?;
    Ok(WalletAddress::from_address(address))
}

/// Check that `signature` was produced by `claimed` over its announcement
#[must_use]
pub fn verify_announcement(
    protocol_tag: &str,
    claimed: &WalletAddress,
    timestamp_ms: u64,
    signature: &[u8],
) -> bool {
    let message = announcement_message(protocol_tag, claimed, timestamp_ms);
    matches!(recover_signer(message.as_bytes(), signature), Ok(recovered) if recovered == *claimed)
}
