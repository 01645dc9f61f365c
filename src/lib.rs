//! relaymail - Decentralized mail relay
//!
//! A relay accepts encrypted messages from other relays, queues them on disk
//! and delivers them either into a local mailbox or onward to the relay that
//! hosts the recipient. Remote relays admit uploads through time-bounded
//! tickets that may require a proof-of-work puzzle to be solved first.
//!
//! # Architecture
//!
//! - **pow**: Proof-of-work puzzles (SHA-256 leading zero bits)
//! - **envelope**: Block encryption, compression, catalog and key sealing
//! - **message**: Message IDs, headers and composition
//! - **queue**: Sectioned queue store (filesystem and memory) and scoreboard
//! - **account**: Local mailboxes
//! - **resolver**: Local-first address resolution with directory fallback
//! - **transport**: Relay client and upload tickets
//! - **delivery**: Local delivery and the remote ticket protocol
//! - **dispatcher**: Coordination loop with retry and stuck timers
//! - **server**: HTTP side of the ticket protocol
//!
//! ```
//! use relaymail::pow::ProofOfWork;
//!
//! let mut pow = ProofOfWork::new(8, "john@example!", 0);
//! pow.work();
//! assert!(pow.is_valid());
//! ```

pub mod account;
pub mod address;
mod base64_serde;
pub mod config;
pub mod delivery;
pub mod dispatcher;
pub mod envelope;
pub mod error;
pub mod logging;
pub mod message;
pub mod metrics;
pub mod pow;
pub mod queue;
pub mod resolver;
pub mod server;
pub mod transport;

// Re-exports
pub use error::{RelayError, Result};
