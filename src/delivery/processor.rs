//! One delivery attempt for one message

use super::{
    deliver_local, deliver_remote, DeliveryContext, DeliveryError, DeliveryOutcome, FailureKind,
};
use crate::message::MessageId;
use crate::metrics;
use crate::queue::Section;
use crate::resolver::Resolution;

/// Run a delivery attempt for a message signalled from `from`
///
/// The caller must hold the message's scoreboard entry. The message is moved
/// into `processing` first; whatever happens afterwards it ends up delivered,
/// in `retry`, or (for a permanently unreadable header) in `failed`.
pub async fn process_message(ctx: &DeliveryContext, id: MessageId, from: Section) -> DeliveryOutcome {
    let outcome = attempt(ctx, &id, from).await;
    metrics::record_delivery(outcome.as_str());
    outcome
}

async fn attempt(ctx: &DeliveryContext, id: &MessageId, from: Section) -> DeliveryOutcome {
    if from != Section::Processing {
        if let Err(e) = ctx.queue.move_message(from, Section::Processing, id) {
            if e.is_not_found() {
                tracing::debug!(message_id = %id, section = %from, "Message already gone, skipping");
            } else {
                tracing::warn!(message_id = %id, section = %from, error = %e, "Cannot claim message for processing");
            }
            return DeliveryOutcome::Skipped;
        }
    }

    tracing::debug!(message_id = %id, "Processing message");

    match deliver(ctx, id).await {
        Ok(outcome) => outcome,
        Err(DeliveryError::Queue(e)) if e.is_not_found() => {
            tracing::debug!(message_id = %id, "Message left processing during delivery");
            DeliveryOutcome::Skipped
        }
        Err(e) => handle_failure(ctx, id, e),
    }
}

async fn deliver(ctx: &DeliveryContext, id: &MessageId) -> Result<DeliveryOutcome, DeliveryError> {
    let header = ctx
        .queue
        .load_header(Section::Processing, id)
        .map_err(|source| {
            if source.is_not_found() {
                DeliveryError::Queue(source)
            } else {
                DeliveryError::UnreadableHeader { id: *id, source }
            }
        })?;

    match ctx.resolver.resolve(&header.to.address).await? {
        Resolution::Local(recipient) => {
            deliver_local(ctx, &recipient, id).await?;
            Ok(DeliveryOutcome::DeliveredLocal)
        }
        Resolution::Remote(record) => {
            let server = deliver_remote(ctx, &record, id).await?;
            Ok(DeliveryOutcome::UploadedRemote { server })
        }
    }
}

fn handle_failure(ctx: &DeliveryContext, id: &MessageId, err: DeliveryError) -> DeliveryOutcome {
    if err.kind() == FailureKind::UnreadableHeader {
        match ctx.queue.record_attempt(Section::Processing, id) {
            Ok(attempts) if attempts >= ctx.policy.max_header_attempts => {
                return dead_letter(ctx, id, attempts, &err);
            }
            Ok(attempts) => {
                tracing::warn!(message_id = %id, attempts, error = %err, "Unreadable header, retrying");
            }
            Err(e) => {
                tracing::warn!(message_id = %id, error = %e, "Cannot record header failure");
            }
        }
    } else {
        tracing::warn!(message_id = %id, error = %err, "Delivery failed, retrying");
    }

    requeue(ctx, id, err.to_string())
}

fn requeue(ctx: &DeliveryContext, id: &MessageId, reason: String) -> DeliveryOutcome {
    if let Err(e) = ctx
        .queue
        .move_message(Section::Processing, Section::Retry, id)
    {
        // Still in processing; the stuck sweep picks it up once it is stale.
        tracing::error!(message_id = %id, error = %e, "Cannot move message to retry");
    }
    DeliveryOutcome::Requeued { reason }
}

fn dead_letter(
    ctx: &DeliveryContext,
    id: &MessageId,
    attempts: u32,
    err: &DeliveryError,
) -> DeliveryOutcome {
    match ctx
        .queue
        .move_message(Section::Processing, Section::Failed, id)
    {
        Ok(()) => {
            tracing::error!(message_id = %id, attempts, error = %err, "Header unreadable too often, moved to failed");
            DeliveryOutcome::DeadLettered
        }
        Err(e) => {
            tracing::error!(message_id = %id, error = %e, "Cannot move message to failed");
            requeue(ctx, id, err.to_string())
        }
    }
}
