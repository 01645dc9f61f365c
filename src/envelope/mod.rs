//! Envelope encryption
//!
//! Message content is protected in two layers:
//!
//! 1. Every block and attachment is optionally zlib-compressed and encrypted
//!    with AES-256-CFB under its own random key and IV.
//! 2. Those keys live in the [`Catalog`], which is serialized to JSON and
//!    encrypted as a whole under one more random key.
//!
//! Only the catalog key has to reach the recipient out of band; [`seal_key`]
//! wraps it for the recipient's X25519 public key.
//!
//! # Example
//!
//! ```
//! use relaymail::envelope::{generate_keypair, open_key, seal_key, Catalog};
//!
//! let (secret, public) = generate_keypair();
//!
//! let mut catalog = Catalog::new("john@example!", "jane@example!", "Hello");
//! let part = catalog.add_block("text/plain", b"hi jane").unwrap();
//! let (key, sealed_catalog) = catalog.encrypt().unwrap();
//! let sealed_key = seal_key(&public, &key).unwrap();
//!
//! let key = open_key(&secret, &sealed_key).unwrap();
//! let opened = Catalog::decrypt(&key, &sealed_catalog).unwrap();
//! assert_eq!(opened.open_part(&part.id, &part.data).unwrap(), b"hi jane");
//! ```

mod catalog;
mod cipher;
mod seal;

pub use catalog::{AttachmentDescriptor, BlockDescriptor, Catalog, Contact, EncryptedPart};
pub use cipher::{Compression, SymmetricKey, COMPRESSION_THRESHOLD, IV_SIZE, KEY_SIZE};
pub use seal::{generate_keypair, open_key, parse_public_key, parse_secret_key, seal_key};

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

/// Algorithm identifier recorded in message headers
pub const CRYPTO_ALGORITHM: &str = "aes256-cfb";

/// Checksums keyed by algorithm name, e.g. `{"sha256": "ab12..."}`
pub type ChecksumList = BTreeMap<String, String>;

/// Error type for envelope operations
#[derive(Error, Debug)]
pub enum EnvelopeError {
    #[error("compression failed: {0}")]
    Compression(#[source] std::io::Error),

    #[error("decompression failed: {0}")]
    Decompression(#[source] std::io::Error),

    #[error("catalog has no block or attachment {0}")]
    UnknownPart(Uuid),

    #[error("checksum mismatch for {0}")]
    ChecksumMismatch(String),

    #[error("catalog encoding: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("key sealing failed")]
    Seal,

    #[error("sealed key could not be opened")]
    Unseal,
}

/// Compute the checksum list for a byte string
pub fn checksums(data: &[u8]) -> ChecksumList {
    let mut list = ChecksumList::new();
    list.insert("sha256".to_string(), hex::encode(Sha256::digest(data)));
    list
}

/// Check `data` against every algorithm in `expected` that we know how to compute
///
/// An empty list verifies trivially.
pub fn verify_checksums(expected: &ChecksumList, data: &[u8]) -> bool {
    match expected.get("sha256") {
        Some(want) => hex::encode(Sha256::digest(data)).eq_ignore_ascii_case(want),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksums_verify() {
        let list = checksums(b"abc");
        assert_eq!(
            list["sha256"],
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert!(verify_checksums(&list, b"abc"));
        assert!(!verify_checksums(&list, b"abd"));
        assert!(verify_checksums(&ChecksumList::new(), b"anything"));
    }
}
