//! Mail addressing
//!
//! Relays never route on plain addresses. Every address is reduced to an
//! [`AddressHash`]: the SHA-256 of the lower-cased address, hex encoded.
//!
//! # Examples
//!
//! ```
//! use relaymail::address::AddressHash;
//!
//! let hash = AddressHash::from_address("John@Example!");
//! assert_eq!(hash, AddressHash::from_address("john@example!"));
//! assert_eq!(hash.as_str().len(), 64);
//! ```

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error type for address hash parsing
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("invalid address hash: expected 64 hex characters, got '{0}'")]
    InvalidHash(String),
}

/// Hashed mail address
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AddressHash(String);

impl AddressHash {
    /// Hash a plain address
    pub fn from_address(address: &str) -> Self {
        let digest = Sha256::digest(address.trim().to_lowercase().as_bytes());
        Self(hex::encode(digest))
    }

    /// Get the hex representation
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Raw bytes of the hex representation, used as proof-of-work data
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for AddressHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for AddressHash {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        if s.len() != 64 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(AddressError::InvalidHash(s));
        }
        Ok(Self(s))
    }
}

impl TryFrom<String> for AddressHash {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AddressHash> for String {
    fn from(hash: AddressHash) -> Self {
        hash.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_normalised() {
        let a = AddressHash::from_address("  Jane@Example! ");
        let b = AddressHash::from_address("jane@example!");
        assert_eq!(a, b);
    }

    #[test]
    fn test_parse_round_trip() {
        let hash = AddressHash::from_address("john@example!");
        let parsed: AddressHash = hash.to_string().parse().unwrap();
        assert_eq!(parsed, hash);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("not-a-hash".parse::<AddressHash>().is_err());
        assert!("zz".repeat(32).parse::<AddressHash>().is_err());
    }

    #[test]
    fn test_serde_validates() {
        let json = serde_json::to_string(&AddressHash::from_address("a@b!")).unwrap();
        let back: AddressHash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, AddressHash::from_address("a@b!"));
        assert!(serde_json::from_str::<AddressHash>("\"abc\"").is_err());
    }
}
