//! Delivery to another relay through the ticket protocol
//!
//! ```text
//! RequestTicket ──valid──────────────────────────┐
//!      │                                          v
//!      └─puzzle─> NeedsPow ─solve─> Resubmit ─> Uploading ─> Complete
//!                                                 │
//!                                                 └─any part fails─> rollback, error
//! ```
//!
//! Every attempt starts from a fresh ticket. Nothing is resumed across attempts.

use super::{DeliveryContext, DeliveryError};
use crate::message::{MessageArtifacts, MessageId};
use crate::metrics;
use crate::pow::WorkStatus;
use crate::queue::Section;
use crate::resolver::DirectoryRecord;
use crate::transport::{self, RelayClient, Ticket};
use chrono::Utc;
use futures::future::{try_join_all, BoxFuture};
use std::time::{Duration, Instant};

/// Where a remote delivery attempt currently is
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteState {
    RequestTicket,
    /// Ticket came back with a puzzle
    NeedsPow(Ticket),
    /// Puzzle solved, waiting for the server to validate the ticket
    Resubmit { ticket: Ticket, proof: u64 },
    Uploading(Ticket),
    /// Every part arrived; tell the server to take the message
    Complete(Ticket),
}

impl RemoteState {
    fn name(&self) -> &'static str {
        match self {
            RemoteState::RequestTicket => "request_ticket",
            RemoteState::NeedsPow(_) => "needs_pow",
            RemoteState::Resubmit { .. } => "resubmit",
            RemoteState::Uploading(_) => "uploading",
            RemoteState::Complete(_) => "complete",
        }
    }
}

/// Upload a processing message to the relay hosting its recipient
///
/// On success the message has been removed from `processing` and the server
/// it went to is returned. On failure the message is left in `processing` for
/// the caller to requeue.
pub async fn deliver_remote(
    ctx: &DeliveryContext,
    record: &DirectoryRecord,
    id: &MessageId,
) -> Result<String, DeliveryError> {
    let client = ctx
        .clients
        .connect(&record.server)
        .map_err(|source| DeliveryError::Connect {
            server: record.server.clone(),
            source,
        })?;
    let artifacts = ctx.queue.load(Section::Processing, id)?;

    let mut state = RemoteState::RequestTicket;
    loop {
        tracing::debug!(message_id = %id, server = %record.server, state = state.name(), "Remote delivery step");

        state = match state {
            RemoteState::RequestTicket => {
                let ticket = client
                    .request_ticket(&artifacts.header.from.address, &record.hash)
                    .await
                    .map_err(DeliveryError::Ticket)?;
                if ticket.valid {
                    RemoteState::Uploading(ticket)
                } else {
                    RemoteState::NeedsPow(ticket)
                }
            }
            RemoteState::NeedsPow(ticket) => {
                let proof = solve_puzzle(ctx, &ticket).await?;
                RemoteState::Resubmit { ticket, proof }
            }
            RemoteState::Resubmit { ticket, proof } => {
                let renewed = client
                    .submit_proof(&ticket.id, proof)
                    .await
                    .map_err(DeliveryError::Ticket)?;
                if !renewed.valid {
                    return Err(DeliveryError::TicketRejected(ticket.id));
                }
                RemoteState::Uploading(renewed)
            }
            RemoteState::Uploading(ticket) => {
                if let Err(e) = upload_parts(client.as_ref(), &ticket, &artifacts).await {
                    rollback(client.as_ref(), &ticket).await;
                    return Err(DeliveryError::Upload(e));
                }
                RemoteState::Complete(ticket)
            }
            RemoteState::Complete(ticket) => {
                client
                    .complete_upload(&ticket)
                    .await
                    .map_err(DeliveryError::Completion)?;
                tracing::debug!(message_id = %id, ticket_id = %ticket.id, "Upload completed");
                break;
            }
        };
    }

    ctx.queue.remove(Section::Processing, id)?;
    tracing::info!(message_id = %id, server = %record.server, "Delivered message to remote relay");
    Ok(record.server.clone())
}

/// Solve the ticket puzzle off the async runtime
async fn solve_puzzle(ctx: &DeliveryContext, ticket: &Ticket) -> Result<u64, DeliveryError> {
    let mut pow = ticket
        .pow
        .clone()
        .ok_or(DeliveryError::TicketRejected(ticket.id))?;
    let deadline = puzzle_deadline(ticket, ctx.policy.puzzle_timeout);
    let abort = ctx.abort.clone();

    tracing::debug!(ticket_id = %ticket.id, bits = pow.bits, "Solving ticket puzzle");
    let started = Instant::now();
    let status = tokio::task::spawn_blocking(move || pow.work_until(&abort, Some(deadline)))
        .await
        .map_err(|e| {
            tracing::error!(ticket_id = %ticket.id, error = %e, "Puzzle search task failed");
            DeliveryError::ProofCancelled {
                ticket_id: ticket.id,
                reason: "interrupted",
            }
        })?;

    match status {
        WorkStatus::Solved(proof) => {
            metrics::record_pow_solve(started.elapsed().as_secs_f64());
            Ok(proof)
        }
        WorkStatus::Aborted => Err(DeliveryError::ProofCancelled {
            ticket_id: ticket.id,
            reason: "aborted",
        }),
        WorkStatus::Expired => Err(DeliveryError::ProofCancelled {
            ticket_id: ticket.id,
            reason: "expired",
        }),
    }
}

/// The earlier of the ticket expiry and the configured search timeout
fn puzzle_deadline(ticket: &Ticket, timeout: Option<Duration>) -> Instant {
    let now = Instant::now();
    let remaining = (ticket.expires_at - Utc::now())
        .to_std()
        .unwrap_or(Duration::ZERO);
    match timeout {
        Some(timeout) => now + remaining.min(timeout),
        None => now + remaining,
    }
}

/// Upload header, catalog and every part concurrently
///
/// The first failure drops the uploads still in flight.
async fn upload_parts(
    client: &dyn RelayClient,
    ticket: &Ticket,
    artifacts: &MessageArtifacts,
) -> transport::Result<()> {
    let mut uploads: Vec<BoxFuture<'_, transport::Result<()>>> =
        Vec::with_capacity(artifacts.parts.len() + 2);
    uploads.push(client.upload_header(ticket, &artifacts.header));
    uploads.push(client.upload_catalog(ticket, &artifacts.catalog));
    for part in &artifacts.parts {
        uploads.push(client.upload_block(ticket, &part.id, &part.data));
    }

    try_join_all(uploads).await?;
    Ok(())
}

/// Best effort; a failed delete is only logged
async fn rollback(client: &dyn RelayClient, ticket: &Ticket) {
    metrics::record_rollback();
    match client.delete_upload(ticket).await {
        Ok(()) => tracing::debug!(ticket_id = %ticket.id, "Rolled back aborted upload"),
        Err(e) => {
            tracing::warn!(ticket_id = %ticket.id, error = %e, "Rollback of aborted upload failed")
        }
    }
}
