//! Relay-to-relay transport
//!
//! The client side of the ticket protocol. [`RelayClient`] is the seam the
//! delivery pipeline talks through; [`HttpRelayClient`] implements it over
//! HTTPS with reqwest.

mod http;
mod ticket;

pub use http::{normalize_server, HttpClientFactory, HttpRelayClient};
pub use ticket::{ProofSubmission, Ticket, TicketRequest};

use crate::address::AddressHash;
use crate::message::Header;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Port relays listen on when none is given
pub const DEFAULT_PORT: u16 = 2424;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("invalid server address: {0}")]
    InvalidServer(String),
}

impl TransportError {
    pub fn status(&self) -> Option<u16> {
        match self {
            TransportError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, TransportError>;

/// JSON error body returned by relays
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Client side of the ticket protocol
#[async_trait]
pub trait RelayClient: Send + Sync {
    /// Ask for a ticket to upload a message from `from` to `to`
    async fn request_ticket(&self, from: &AddressHash, to: &AddressHash) -> Result<Ticket>;

    /// Submit a solved puzzle; the server answers with the re-verified ticket
    async fn submit_proof(&self, ticket_id: &Uuid, proof: u64) -> Result<Ticket>;

    async fn upload_header(&self, ticket: &Ticket, header: &Header) -> Result<()>;

    async fn upload_catalog(&self, ticket: &Ticket, catalog: &[u8]) -> Result<()>;

    async fn upload_block(&self, ticket: &Ticket, part_id: &Uuid, data: &[u8]) -> Result<()>;

    /// Tell the server every part has arrived
    async fn complete_upload(&self, ticket: &Ticket) -> Result<()>;

    /// Drop everything uploaded under the ticket; unknown tickets count as deleted
    async fn delete_upload(&self, ticket: &Ticket) -> Result<()>;
}

/// Creates clients for remote relays
pub trait ClientFactory: Send + Sync {
    fn connect(&self, server: &str) -> Result<Arc<dyn RelayClient>>;
}
