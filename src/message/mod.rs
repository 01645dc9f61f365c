//! Message identity and artifacts
//!
//! A message travels as a set of artifacts: a plaintext [`Header`] the relays
//! route on, the encrypted catalog, and one encrypted file per block or
//! attachment.

mod compose;
mod header;

pub use compose::{MessageComposer, Sender};
pub use header::{CatalogInfo, Header, HeaderFrom, HeaderTo};

use crate::envelope::EncryptedPart;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Globally unique message identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Create a new random message ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for MessageId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s.trim())?))
    }
}

/// Everything stored for one message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageArtifacts {
    pub id: MessageId,
    pub header: Header,

    /// Encrypted catalog
    pub catalog: Vec<u8>,

    /// Encrypted blocks and attachments
    pub parts: Vec<EncryptedPart>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_id_unique() {
        assert_ne!(MessageId::new(), MessageId::new());
    }

    #[test]
    fn test_message_id_parse() {
        let id = MessageId::new();
        let parsed: MessageId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("../etc/passwd".parse::<MessageId>().is_err());
    }

    #[test]
    fn test_message_id_serializes_as_string() {
        let id = MessageId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id));
    }
}
