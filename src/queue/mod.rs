//! Durable message queue
//!
//! A message is always in exactly one [`Section`]. Transitions between sections
//! are atomic: after a crash the message is observably in the source or the
//! destination, never both and never neither.
//!
//! Two backends implement [`QueueStore`]:
//! - [`FilesystemQueue`]: one directory per section, moves are renames
//! - [`MemoryQueue`]: a mutex-guarded map, for tests and embedding

mod filesystem;
mod memory;
mod scoreboard;

pub use filesystem::FilesystemQueue;
pub(crate) use filesystem::{read_artifacts, write_artifacts};
pub use memory::MemoryQueue;
pub use scoreboard::{ScoreEntry, ScoreGuard, Scoreboard};

use crate::message::{Header, MessageArtifacts, MessageId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Queue sections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Section {
    /// Fully received, waiting to be picked up
    Incoming,
    /// Claimed by a delivery task
    Processing,
    /// Last attempt failed, picked up by the retry sweep
    Retry,
    /// Orphaned by a crash or hung task, picked up by the stuck sweep
    Stuck,
    /// Dead letter, never picked up again
    Failed,
}

impl Section {
    pub const ALL: [Section; 5] = [
        Section::Incoming,
        Section::Processing,
        Section::Retry,
        Section::Stuck,
        Section::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Section::Incoming => "incoming",
            Section::Processing => "processing",
            Section::Retry => "retry",
            Section::Stuck => "stuck",
            Section::Failed => "failed",
        }
    }
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Section {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Section::ALL
            .into_iter()
            .find(|section| section.as_str() == s)
            .ok_or_else(|| format!("unknown queue section '{}'", s))
    }
}

/// Queue errors
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("message {id} not found in {section}")]
    NotFound { section: Section, id: String },

    #[error("message {id} already present in {section}")]
    AlreadyExists { section: Section, id: String },

    #[error("message {id} is corrupt: {reason}")]
    Corrupt { id: String, reason: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl QueueError {
    pub(crate) fn not_found(section: Section, id: &MessageId) -> Self {
        QueueError::NotFound {
            section,
            id: id.to_string(),
        }
    }

    pub(crate) fn exists(section: Section, id: &MessageId) -> Self {
        QueueError::AlreadyExists {
            section,
            id: id.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, QueueError::NotFound { .. })
    }
}

/// Result type for queue operations
pub type Result<T> = std::result::Result<T, QueueError>;

/// Lazy sequence of message IDs; each call to `list_stale` starts a fresh one
pub type StaleIter<'a> = Box<dyn Iterator<Item = Result<MessageId>> + Send + 'a>;

/// Trait for queue storage backends
pub trait QueueStore: Send + Sync {
    /// Store a complete artifact set in `section`
    fn enqueue(&self, section: Section, artifacts: &MessageArtifacts) -> Result<()>;

    /// Atomically move a message; `NotFound` if it is not in `from`
    fn move_message(&self, from: Section, to: Section, id: &MessageId) -> Result<()>;

    /// All message IDs in a section
    fn list(&self, section: Section) -> Result<Vec<MessageId>>;

    /// IDs that have been in `section` for at least `age`
    fn list_stale(&self, section: Section, age: Duration) -> Result<StaleIter<'_>>;

    /// Delete a message and all its artifacts
    fn remove(&self, section: Section, id: &MessageId) -> Result<()>;

    fn contains(&self, section: Section, id: &MessageId) -> Result<bool>;

    fn load_header(&self, section: Section, id: &MessageId) -> Result<Header>;

    fn load(&self, section: Section, id: &MessageId) -> Result<MessageArtifacts>;

    /// Increment and return the persisted failure counter of a message
    fn record_attempt(&self, section: Section, id: &MessageId) -> Result<u32>;

    fn count(&self, section: Section) -> Result<usize> {
        Ok(self.list(section)?.len())
    }

    /// Find the section currently holding a message
    fn locate(&self, id: &MessageId) -> Result<Option<Section>> {
        for section in Section::ALL {
            if self.contains(section, id)? {
                return Ok(Some(section));
            }
        }
        Ok(None)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_section_names() {
        for section in Section::ALL {
            assert_eq!(section.as_str().parse::<Section>().unwrap(), section);
        }
        assert!("outbox".parse::<Section>().is_err());
        assert_eq!(
            serde_json::to_string(&Section::Processing).unwrap(),
            "\"processing\""
        );
    }
}
