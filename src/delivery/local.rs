//! Delivery into a mailbox on this relay

use super::{DeliveryContext, DeliveryError};
use crate::account::BOX_INBOX;
use crate::address::AddressHash;
use crate::message::MessageId;
use crate::queue::Section;

/// Store a processing message in the recipient's inbox, then drop it from the queue
///
/// Removal only happens after the mailbox write succeeded, so a failure at any
/// point leaves the queued copy intact. Redelivery replaces the inbox copy.
pub async fn deliver_local(
    ctx: &DeliveryContext,
    recipient: &AddressHash,
    id: &MessageId,
) -> Result<(), DeliveryError> {
    let artifacts = ctx.queue.load(Section::Processing, id)?;
    ctx.accounts.send_to_box(recipient, BOX_INBOX, &artifacts)?;
    ctx.queue.remove(Section::Processing, id)?;

    tracing::info!(message_id = %id, recipient = %recipient, "Delivered message locally");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::{AccountRepository, FileAccountRepository};
    use crate::delivery::testing::{FakeFactory, FakeRelay};
    use crate::queue::testing::artifacts;
    use crate::queue::{MemoryQueue, QueueStore};
    use crate::resolver::{Resolver, StaticDirectory};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn setup() -> (DeliveryContext, Arc<FileAccountRepository>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let accounts = Arc::new(FileAccountRepository::new(temp_dir.path()).unwrap());
        let resolver = Resolver::new(accounts.clone(), Arc::new(StaticDirectory::default()));
        let ctx = DeliveryContext::new(
            Arc::new(MemoryQueue::new()),
            resolver,
            accounts.clone(),
            Arc::new(FakeFactory::new(FakeRelay::default())),
        );
        (ctx, accounts, temp_dir)
    }

    #[tokio::test]
    async fn test_deliver_local() {
        let (ctx, accounts, _dir) = setup();
        let jane = AddressHash::from_address("jane@example!");
        accounts.create(&jane).unwrap();

        let msg = artifacts(2);
        ctx.queue.enqueue(Section::Processing, &msg).unwrap();

        deliver_local(&ctx, &jane, &msg.id).await.unwrap();

        assert!(!ctx.queue.contains(Section::Processing, &msg.id).unwrap());
        assert_eq!(accounts.list_box(&jane, BOX_INBOX).unwrap(), vec![msg.id]);
    }

    #[tokio::test]
    async fn test_mailbox_failure_keeps_queued_copy() {
        let (ctx, accounts, _dir) = setup();
        let jane = AddressHash::from_address("jane@example!");
        assert!(!accounts.exists(&jane));

        let msg = artifacts(1);
        ctx.queue.enqueue(Section::Processing, &msg).unwrap();

        let err = deliver_local(&ctx, &jane, &msg.id).await.unwrap_err();
        assert!(matches!(err, DeliveryError::LocalMailbox(_)));
        assert!(ctx.queue.contains(Section::Processing, &msg.id).unwrap());
    }
}
