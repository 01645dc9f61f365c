//! Message header

use crate::address::AddressHash;
use crate::envelope::ChecksumList;
use crate::pow::ProofOfWork;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderFrom {
    pub address: AddressHash,

    /// Sender X25519 public key, hex encoded
    pub public_key: String,

    /// Proof the sender computed over their own address hash
    pub proof_of_work: ProofOfWork,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderTo {
    pub address: AddressHash,
}

/// What a relay may know about the catalog without decrypting it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogInfo {
    /// Size of the catalog in bytes
    pub size: u64,

    /// Checksums of the encrypted catalog
    pub checksum: ChecksumList,

    /// Cipher identifier, see [`crate::envelope::CRYPTO_ALGORITHM`]
    pub crypto: String,

    /// Catalog key and IV sealed to the recipient
    #[serde(with = "crate::base64_serde")]
    pub encrypted_key: Vec<u8>,
}

/// Routing header; never modified once a message is queued
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub from: HeaderFrom,
    pub to: HeaderTo,
    pub catalog: CatalogInfo,
}

impl Header {
    /// Whether the sender's own proof is bound to their address and meets `min_bits`
    pub fn sender_proof_is_valid(&self, min_bits: u32) -> bool {
        let pow = &self.from.proof_of_work;
        pow.bits >= min_bits && pow.data == self.from.address.as_bytes() && pow.is_valid()
    }
}
