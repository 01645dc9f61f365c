//! Error types for relaymail
//!
//! Each subsystem defines its own thiserror enum; this module gathers them into
//! a single crate-level error for the binary and the configuration layer.

use crate::account::AccountError;
use crate::address::AddressError;
use crate::envelope::EnvelopeError;
use crate::queue::QueueError;
use crate::resolver::ResolveError;
use crate::server::TicketError;
use crate::transport::TransportError;
use thiserror::Error;

/// Result type alias for relaymail operations
pub type Result<T> = std::result::Result<T, RelayError>;

/// Crate-level error type
#[derive(Error, Debug)]
pub enum RelayError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Storage errors outside the queue (ticket store, mailboxes)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Network/HTTP errors
    #[error("Network error: {0}")]
    Network(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// SQLite database errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// HTTP request errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Address parsing errors
    #[error("Address error: {0}")]
    Address(#[from] AddressError),

    /// Queue store errors
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Envelope encryption errors
    #[error("Envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    /// Mailbox repository errors
    #[error("Account error: {0}")]
    Account(#[from] AccountError),

    /// Address resolution errors
    #[error("Resolve error: {0}")]
    Resolve(#[from] ResolveError),

    /// Relay client errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Ticket store errors
    #[error("Ticket error: {0}")]
    Ticket(#[from] TicketError),

    /// Other errors
    #[error("{0}")]
    Other(String),

    /// Anyhow errors (for more context)
    #[error("{0:#}")]
    Anyhow(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversions_keep_message() {
        let err: RelayError = QueueError::NotFound {
            section: crate::queue::Section::Retry,
            id: "abc".into(),
        }
        .into();
        assert!(err.to_string().starts_with("Queue error:"));
        assert!(err.to_string().contains("abc"));

        let err: RelayError = std::io::Error::new(std::io::ErrorKind::Other, "disk gone").into();
        assert_eq!(err.to_string(), "I/O error: disk gone");
    }

    #[test]
    fn test_context_chain_is_rendered() {
        use anyhow::Context;

        let read: std::result::Result<Vec<u8>, std::io::Error> = Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "no such file",
        ));
        let err: RelayError = read.context("Failed to read attachment a.bin").unwrap_err().into();
        assert!(matches!(err, RelayError::Anyhow(_)));
        assert_eq!(err.to_string(), "Failed to read attachment a.bin: no such file");
    }
}
