//! Message delivery
//!
//! One delivery attempt takes a message that sits in `processing` and either
//! finishes it (local inbox or remote relay) or hands it back to `retry`.
//! Every collaborator is passed in through [`DeliveryContext`].

mod local;
mod processor;
mod remote;

pub use local::deliver_local;
pub use processor::process_message;
pub use remote::{deliver_remote, RemoteState};

use crate::account::{AccountError, AccountRepository};
use crate::message::MessageId;
use crate::queue::{QueueError, QueueStore};
use crate::resolver::{ResolveError, Resolver};
use crate::transport::{ClientFactory, TransportError};
use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Default number of unreadable-header failures before a message is dead-lettered
pub const DEFAULT_MAX_HEADER_ATTEMPTS: u32 = 10;

/// How a failure is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Requeue to retry, indefinitely
    Transient,
    /// Requeue to retry until the attempt limit, then dead-letter
    UnreadableHeader,
}

/// Delivery errors
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("cannot read header of message {id}: {source}")]
    UnreadableHeader {
        id: MessageId,
        #[source]
        source: QueueError,
    },

    #[error("cannot resolve recipient: {0}")]
    Resolve(#[from] ResolveError),

    #[error("cannot deliver to local mailbox: {0}")]
    LocalMailbox(#[from] AccountError),

    #[error("cannot reach relay {server}: {source}")]
    Connect {
        server: String,
        #[source]
        source: TransportError,
    },

    #[error("ticket request failed: {0}")]
    Ticket(#[source] TransportError),

    #[error("ticket {0} still not valid after proof of work")]
    TicketRejected(Uuid),

    #[error("proof of work for ticket {ticket_id} was {reason}")]
    ProofCancelled { ticket_id: Uuid, reason: &'static str },

    #[error("upload failed: {0}")]
    Upload(#[source] TransportError),

    #[error("completion call failed: {0}")]
    Completion(#[source] TransportError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}

impl DeliveryError {
    pub fn kind(&self) -> FailureKind {
        match self {
            DeliveryError::UnreadableHeader { .. } => FailureKind::UnreadableHeader,
            _ => FailureKind::Transient,
        }
    }
}

/// Result of one delivery attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Stored in a local inbox and removed from the queue
    DeliveredLocal,
    /// Uploaded to a remote relay and removed from the queue
    UploadedRemote { server: String },
    /// Moved to retry
    Requeued { reason: String },
    /// Moved to failed after too many unreadable-header attempts
    DeadLettered,
    /// The message was no longer where the signal said it was
    Skipped,
}

impl DeliveryOutcome {
    /// Label used for metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryOutcome::DeliveredLocal => "delivered_local",
            DeliveryOutcome::UploadedRemote { .. } => "uploaded_remote",
            DeliveryOutcome::Requeued { .. } => "requeued",
            DeliveryOutcome::DeadLettered => "dead_lettered",
            DeliveryOutcome::Skipped => "skipped",
        }
    }
}

impl fmt::Display for DeliveryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryOutcome::UploadedRemote { server } => write!(f, "uploaded to {}", server),
            DeliveryOutcome::Requeued { reason } => write!(f, "requeued: {}", reason),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Tunables for delivery attempts
#[derive(Debug, Clone)]
pub struct DeliveryPolicy {
    pub max_header_attempts: u32,

    /// Upper bound on a single puzzle search, on top of the ticket expiry
    pub puzzle_timeout: Option<Duration>,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            max_header_attempts: DEFAULT_MAX_HEADER_ATTEMPTS,
            puzzle_timeout: None,
        }
    }
}

/// Collaborators shared by every delivery task
#[derive(Clone)]
pub struct DeliveryContext {
    pub queue: Arc<dyn QueueStore>,
    pub resolver: Resolver,
    pub accounts: Arc<dyn AccountRepository>,
    pub clients: Arc<dyn ClientFactory>,
    pub policy: DeliveryPolicy,

    /// Raised on shutdown; running puzzle searches give up when they see it
    pub abort: Arc<AtomicBool>,
}

impl DeliveryContext {
    pub fn new(
        queue: Arc<dyn QueueStore>,
        resolver: Resolver,
        accounts: Arc<dyn AccountRepository>,
        clients: Arc<dyn ClientFactory>,
    ) -> Self {
        Self {
            queue,
            resolver,
            accounts,
            clients,
            policy: DeliveryPolicy::default(),
            abort: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_policy(mut self, policy: DeliveryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_abort_flag(mut self, abort: Arc<AtomicBool>) -> Self {
        self.abort = abort;
        self
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-process fakes for the transport seam

    use crate::address::AddressHash;
    use crate::message::{Header, MessageId};
    use crate::pow::ProofOfWork;
    use crate::transport::{ClientFactory, RelayClient, Result, Ticket, TransportError};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};
    use uuid::Uuid;

    /// Calls seen by a [`FakeRelay`]
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Call {
        RequestTicket,
        SubmitProof(u64),
        Header,
        Catalog,
        Block(Uuid),
        Complete,
        Delete,
    }

    /// Relay that records calls and fails on demand
    #[derive(Default)]
    pub struct FakeRelay {
        pub calls: Mutex<Vec<Call>>,
        pub puzzle_bits: Option<u32>,
        pub failing_blocks: HashSet<Uuid>,
        pub fail_ticket: bool,
        pub fail_delete: bool,
        pub reject_proof: bool,
    }

    impl FakeRelay {
        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: Call) {
            self.calls.lock().unwrap().push(call);
        }

        fn ticket(&self, from: &AddressHash, to: &AddressHash) -> Ticket {
            Ticket {
                id: Uuid::new_v4(),
                from: from.clone(),
                to: to.clone(),
                valid: self.puzzle_bits.is_none(),
                expires_at: Utc::now() + chrono::Duration::minutes(30),
                message_id: MessageId::new(),
                pow: self
                    .puzzle_bits
                    .map(|bits| ProofOfWork::new(bits, b"fake challenge".to_vec(), 0)),
            }
        }

        fn failure(message: &str) -> TransportError {
            TransportError::Status {
                status: 500,
                message: message.to_string(),
            }
        }
    }

    #[async_trait]
    impl RelayClient for FakeRelay {
        async fn request_ticket(&self, from: &AddressHash, to: &AddressHash) -> Result<Ticket> {
            self.record(Call::RequestTicket);
            if self.fail_ticket {
                return Err(Self::failure("no tickets today"));
            }
            Ok(self.ticket(from, to))
        }

        async fn submit_proof(&self, ticket_id: &Uuid, proof: u64) -> Result<Ticket> {
            self.record(Call::SubmitProof(proof));
            let mut ticket = self.ticket(
                &AddressHash::from_address("john@example!"),
                &AddressHash::from_address("jane@example!"),
            );
            ticket.id = *ticket_id;
            ticket.valid = !self.reject_proof;
            Ok(ticket)
        }

        async fn upload_header(&self, _ticket: &Ticket, _header: &Header) -> Result<()> {
            self.record(Call::Header);
            Ok(())
        }

        async fn upload_catalog(&self, _ticket: &Ticket, _catalog: &[u8]) -> Result<()> {
            self.record(Call::Catalog);
            Ok(())
        }

        async fn upload_block(&self, _ticket: &Ticket, part_id: &Uuid, _data: &[u8]) -> Result<()> {
            self.record(Call::Block(*part_id));
            if self.failing_blocks.contains(part_id) {
                return Err(Self::failure("disk full"));
            }
            Ok(())
        }

        async fn complete_upload(&self, _ticket: &Ticket) -> Result<()> {
            self.record(Call::Complete);
            Ok(())
        }

        async fn delete_upload(&self, _ticket: &Ticket) -> Result<()> {
            self.record(Call::Delete);
            if self.fail_delete {
                return Err(Self::failure("delete failed"));
            }
            Ok(())
        }
    }

    /// Factory that always hands out the same fake relay
    pub struct FakeFactory {
        pub relay: Arc<FakeRelay>,
        pub connects: Mutex<Vec<String>>,
    }

    impl FakeFactory {
        pub fn new(relay: FakeRelay) -> Self {
            Self {
                relay: Arc::new(relay),
                connects: Mutex::new(Vec::new()),
            }
        }
    }

    impl ClientFactory for FakeFactory {
        fn connect(&self, server: &str) -> Result<Arc<dyn RelayClient>> {
            self.connects.lock().unwrap().push(server.to_string());
            let relay: Arc<dyn RelayClient> = self.relay.clone();
            Ok(relay)
        }
    }
}
