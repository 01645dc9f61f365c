//! Proof-of-work admission puzzles
//!
//! A hashcash-style puzzle: find a `proof` such that
//! `SHA-256(data || lowercase_hex(proof))` starts with at least `bits` zero bits.
//! Solving costs about `2^bits` hashes, checking costs one.
//!
//! # Example
//!
//! ```
//! use relaymail::pow::ProofOfWork;
//!
//! let mut pow = ProofOfWork::new(8, b"john@example!".to_vec(), 0);
//! assert!(!pow.is_valid());
//!
//! pow.work();
//! assert_eq!(pow.proof, 88);
//! assert!(pow.is_valid());
//! ```

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

/// Number of nonces tried between two checks of the abort flag and deadline
const CHECK_INTERVAL: u64 = 4096;

/// A proof-of-work puzzle and its (candidate) solution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofOfWork {
    /// Required number of leading zero bits
    pub bits: u32,

    /// Challenge data the proof is bound to
    #[serde(with = "crate::base64_serde")]
    pub data: Vec<u8>,

    /// Candidate nonce
    pub proof: u64,
}

/// How a cancellable search ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkStatus {
    /// A valid proof was found and stored
    Solved(u64),
    /// The abort flag was raised
    Aborted,
    /// The deadline passed before a proof was found
    Expired,
}

impl ProofOfWork {
    /// Create a puzzle, optionally with an already known proof
    pub fn new(bits: u32, data: impl Into<Vec<u8>>, proof: u64) -> Self {
        Self {
            bits,
            data: data.into(),
            proof,
        }
    }

    /// Whether a proof has been filled in
    ///
    /// A proof of zero counts as "no work done", even in the rare case where
    /// nonce zero happens to satisfy the puzzle.
    pub fn has_done_work(&self) -> bool {
        self.proof > 0
    }

    /// Check the current proof; a single hash regardless of difficulty
    pub fn is_valid(&self) -> bool {
        let hasher = self.prefix_hasher();
        leading_zero_bits(&digest_with(hasher, self.proof)) >= self.bits
    }

    /// Search for the smallest valid proof, starting at zero
    pub fn work(&mut self) {
        let never = AtomicBool::new(false);
        // Without an abort flag or deadline the search can only end solved.
        let _ = self.work_until(&never, None);
    }

    /// Search for the smallest valid proof, giving up when `abort` is raised
    /// or `deadline` passes
    pub fn work_until(&mut self, abort: &AtomicBool, deadline: Option<Instant>) -> WorkStatus {
        let prefix = self.prefix_hasher();
        let mut nonce: u64 = 0;

        loop {
            if leading_zero_bits(&digest_with(prefix.clone(), nonce)) >= self.bits {
                self.proof = nonce;
                return WorkStatus::Solved(nonce);
            }

            nonce = match nonce.checked_add(1) {
                Some(n) => n,
                None => return WorkStatus::Expired,
            };

            if nonce % CHECK_INTERVAL == 0 {
                if abort.load(Ordering::Relaxed) {
                    return WorkStatus::Aborted;
                }
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    return WorkStatus::Expired;
                }
            }
        }
    }

    fn prefix_hasher(&self) -> Sha256 {
        let mut hasher = Sha256::new();
        hasher.update(&self.data);
        hasher
    }
}

fn digest_with(mut hasher: Sha256, nonce: u64) -> [u8; 32] {
    hasher.update(format!("{:x}", nonce).as_bytes());
    hasher.finalize().into()
}

/// Count the leading zero bits of a digest
pub fn leading_zero_bits(digest: &[u8]) -> u32 {
    let mut count = 0;
    for byte in digest {
        if *byte == 0 {
            count += 8;
        } else {
            count += byte.leading_zeros();
            break;
        }
    }
    count
}
