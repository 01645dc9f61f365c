//! Local accounts and mailboxes
//!
//! Directory structure:
//! ```text
//! <root>/
//!   <address-hash>/
//!     inbox/
//!       <message-id>/      # same layout as a queue entry
//!     outbox/
//!     trash/
//! ```

use crate::address::AddressHash;
use crate::message::{MessageArtifacts, MessageId};
use crate::queue::{read_artifacts, write_artifacts, QueueError};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

pub const BOX_INBOX: &str = "inbox";
pub const BOX_OUTBOX: &str = "outbox";
pub const BOX_TRASH: &str = "trash";

/// Boxes every account is created with
pub const MANDATORY_BOXES: [&str; 3] = [BOX_INBOX, BOX_OUTBOX, BOX_TRASH];

const STAGING_DIR: &str = ".tmp";

/// Mailbox repository errors
#[derive(Debug, Error)]
pub enum AccountError {
    #[error("account not found: {0}")]
    NotFound(AddressHash),

    #[error("invalid box name: {0}")]
    InvalidBox(String),

    #[error("message {0} not found in box")]
    MessageNotFound(MessageId),

    #[error("storage error: {0}")]
    Storage(#[from] QueueError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for account operations
pub type Result<T> = std::result::Result<T, AccountError>;

/// Account lookup and mailbox delivery
pub trait AccountRepository: Send + Sync {
    /// Whether an account exists for this address
    fn exists(&self, addr: &AddressHash) -> bool;

    /// Store a message in one of the account's boxes
    ///
    /// Storing the same message ID twice replaces the earlier copy.
    fn send_to_box(&self, addr: &AddressHash, box_name: &str, artifacts: &MessageArtifacts)
        -> Result<()>;
}

/// Filesystem account repository
pub struct FileAccountRepository {
    root: PathBuf,
}

impl FileAccountRepository {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn account_dir(&self, addr: &AddressHash) -> PathBuf {
        self.root.join(addr.as_str())
    }

    fn box_dir(&self, addr: &AddressHash, box_name: &str) -> Result<PathBuf> {
        if box_name.is_empty()
            || box_name.starts_with('.')
            || !box_name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(AccountError::InvalidBox(box_name.to_string()));
        }
        Ok(self.account_dir(addr).join(box_name))
    }

    /// Create an account with its mandatory boxes
    pub fn create(&self, addr: &AddressHash) -> Result<()> {
        let dir = self.account_dir(addr);
        tracing::debug!(address = %addr, path = %dir.display(), "Creating account");

        for name in MANDATORY_BOXES {
            fs::create_dir_all(dir.join(name))?;
        }
        Ok(())
    }

    /// Remove an account and everything in it
    pub fn delete(&self, addr: &AddressHash) -> Result<()> {
        match fs::remove_dir_all(self.account_dir(addr)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(AccountError::NotFound(addr.clone())),
            Err(e) => Err(e.into()),
        }
    }

    /// Message IDs in a box
    pub fn list_box(&self, addr: &AddressHash, box_name: &str) -> Result<Vec<MessageId>> {
        let dir = self.box_dir(addr, box_name)?;
        if !dir.exists() {
            return Err(AccountError::NotFound(addr.clone()));
        }

        let mut ids = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if let Some(id) = entry.file_name().to_str().and_then(|n| n.parse().ok()) {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Load a message from a box
    pub fn fetch(&self, addr: &AddressHash, box_name: &str, id: &MessageId) -> Result<MessageArtifacts> {
        let dir = self.box_dir(addr, box_name)?.join(id.to_string());
        if !dir.is_dir() {
            return Err(AccountError::MessageNotFound(*id));
        }
        Ok(read_artifacts(&dir, id)?)
    }

    fn replace_dir(staging: &Path, target: &Path) -> Result<()> {
        if target.exists() {
            fs::remove_dir_all(target)?;
        }
        fs::rename(staging, target)?;
        Ok(())
    }
}

impl AccountRepository for FileAccountRepository {
    fn exists(&self, addr: &AddressHash) -> bool {
        self.account_dir(addr).is_dir()
    }

    fn send_to_box(
        &self,
        addr: &AddressHash,
        box_name: &str,
        artifacts: &MessageArtifacts,
    ) -> Result<()> {
        let box_dir = self.box_dir(addr, box_name)?;
        if !self.exists(addr) {
            return Err(AccountError::NotFound(addr.clone()));
        }
        fs::create_dir_all(&box_dir)?;

        let staging = self
            .account_dir(addr)
            .join(STAGING_DIR)
            .join(Uuid::new_v4().to_string());
        let target = box_dir.join(artifacts.id.to_string());

        let result = write_artifacts(&staging, artifacts)
            .map_err(AccountError::from)
            .and_then(|_| Self::replace_dir(&staging, &target));
        if result.is_err() {
            let _ = fs::remove_dir_all(&staging);
        }
        result?;

        tracing::info!(
            address = %addr,
            box_name,
            message_id = %artifacts.id,
            "Stored message in mailbox"
        );
        Ok(())
    }
}
