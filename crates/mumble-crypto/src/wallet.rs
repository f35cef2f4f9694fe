//! Wallet addresses.
//!
//! Every participant is named by a 20-byte Ethereum-style address. Peers
//! compare addresses case-insensitively, so the address is stored as raw bytes
//! and always rendered as lowercase `0x`-prefixed hex.

use crate::CryptoError;
use alloy_primitives::Address;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A participant's wallet address
///
/// Equality, hashing and ordering operate on the raw 20 bytes, which makes
/// `0xABC...` and `0xabc...` the same wallet.
///
/// # Examples
///
/// ```
/// use mumble_crypto::WalletAddress;
///
/// let upper = WalletAddress::parse("0xAB5801A7D398351B8BE11C439E05C5B3259AEC9B").unwrap();
/// let lower = WalletAddress::parse("0xab5801a7d398351b8be11c439e05c5b3259aec9b").unwrap();
/// assert_eq!(upper, lower);
/// assert_eq!(upper.to_string(), "0xab5801a7d398351b8be11c439e05c5b3259aec9b");
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WalletAddress(Address);

impl WalletAddress {
    /// Number of raw address bytes
    pub const LEN: usize = 20;

    /// Parse an address from `0x`-prefixed (or bare) hex in any letter case
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidAddress` if the input is not 40 hex digits.
    pub fn parse(s: &str) -> Result<Self, CryptoError> {
        let trimmed = s.trim();
        let body = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);

        if body.len() != Self::LEN * 2 {
            return Err(CryptoError::InvalidAddress(s.to_string()));
        }

        let bytes = hex::decode(body).map_err(|_| CryptoError::InvalidAddress(s.to_string()))?;
        Ok(Self(Address::from_slice(&bytes)))
    }

    /// Wrap an alloy address
    #[must_use]
    pub const fn from_address(address: Address) -> Self {
        Self(address)
    }

    /// Create from raw bytes
    #[must_use]
    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(Address::from(bytes))
    }

    /// Underlying alloy address
    #[must_use]
    pub const fn address(&self) -> Address {
        self.0
    }

    /// Raw address bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_slice()
    }
}

impl fmt::Display for WalletAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0.as_slice()))
    }
}

impl fmt::Debug for WalletAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WalletAddress({self})")
    }
}

impl FromStr for WalletAddress {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for WalletAddress {
    type Error = CryptoError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<WalletAddress> for String {
    fn from(value: WalletAddress) -> Self {
        value.to_string()
    }
}

impl From<Address> for WalletAddress {
    fn from(value: Address) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_normalizes_case() {
        let mixed = WalletAddress::parse("0xAb5801a7D398351b8bE11C439e05C5B3259aeC9B").unwrap();
        assert_eq!(
            mixed.to_string(),
            "0xab5801a7d398351b8be11c439e05c5b3259aec9b"
        );
    }

    #[test]
    fn test_parse_without_prefix() {
        let bare = WalletAddress::parse("ab5801a7d398351b8be11c439e05c5b3259aec9b").unwrap();
        let prefixed = WalletAddress::parse("0xab5801a7d398351b8be11c439e05c5b3259aec9b").unwrap();
        assert_eq!(bare, prefixed);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(WalletAddress::parse("").is_err());
        assert!(WalletAddress::parse("0x1234").is_err());
        assert!(WalletAddress::parse("0xzz5801a7d398351b8be11c439e05c5b3259aec9b").is_err());
        assert!(WalletAddress::parse("0xab5801a7d398351b8be11c439e05c5b3259aec9b00").is_err());
    }

    #[test]
    fn test_serde_as_lowercase_string() {
        let addr = WalletAddress::from_bytes([0xAB; 20]);
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, format!("\"0x{}\"", "ab".repeat(20)));

        let back: WalletAddress = serde_json::from_str(&json.to_uppercase().replace("0X", "0x")).unwrap();
        assert_eq!(back, addr);
    }

    #[test]
    fn test_debug_display() {
        let addr = WalletAddress::from_bytes([0x01; 20]);
        assert!(format!("{addr:?}").starts_with("WalletAddress(0x0101"));
    }
}
