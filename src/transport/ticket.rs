//! Upload tickets

use crate::address::AddressHash;
use crate::message::MessageId;
use crate::pow::ProofOfWork;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A relay's time-bounded permission to upload one message
///
/// A ticket is valid when it was issued pre-authorised or when its puzzle was
/// solved before `expires_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    pub id: Uuid,
    pub from: AddressHash,
    pub to: AddressHash,
    pub valid: bool,
    pub expires_at: DateTime<Utc>,

    /// ID the receiving relay will queue the message under
    pub message_id: MessageId,

    /// Puzzle to solve before the ticket becomes valid
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pow: Option<ProofOfWork>,
}

impl Ticket {
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }

    /// Whether the ticket may be used for uploads right now
    pub fn is_usable(&self) -> bool {
        self.valid && !self.is_expired()
    }
}

/// Body of `POST /ticket`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketRequest {
    pub from: AddressHash,
    pub to: AddressHash,
}

/// Body of `POST /ticket/{id}/proof`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProofSubmission {
    pub proof: u64,
}
