//! Filesystem queue backend
//!
//! Directory structure:
//! ```text
//! <root>/
//!   .tmp/                  # staging area, emptied on startup
//!   incoming/
//!     <message-id>/
//!       header.json
//!       catalog
//!       meta.json          # {entered_at, attempts}
//!       parts/
//!         <part-id>
//!   processing/
//!   retry/
//!   stuck/
//!   failed/
//! ```
//!
//! Enqueue builds the whole message directory under `.tmp/` and renames it
//! into place; moves between sections are a single directory rename. Both are
//! atomic as long as `<root>` lives on one filesystem.

use super::{QueueError, QueueStore, Result, Section, StaleIter};
use crate::envelope::EncryptedPart;
use crate::message::{Header, MessageArtifacts, MessageId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

const HEADER_FILE: &str = "header.json";
const CATALOG_FILE: &str = "catalog";
const META_FILE: &str = "meta.json";
const PARTS_DIR: &str = "parts";
const STAGING_DIR: &str = ".tmp";

/// Bookkeeping stored next to the artifacts
#[derive(Debug, Clone, Serialize, Deserialize)]
struct MetaRecord {
    /// When the message entered its current section
    entered_at: DateTime<Utc>,

    /// Unreadable-header failures so far
    #[serde(default)]
    attempts: u32,
}

impl MetaRecord {
    fn fresh() -> Self {
        Self {
            entered_at: Utc::now(),
            attempts: 0,
        }
    }
}

/// Filesystem queue store
pub struct FilesystemQueue {
    root: PathBuf,
}

impl FilesystemQueue {
    /// Open (and create) a queue rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();

        for section in Section::ALL {
            fs::create_dir_all(root.join(section.as_str()))?;
        }

        // Anything left in staging is a half-written enqueue from a crash
        let staging = root.join(STAGING_DIR);
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        fs::create_dir_all(&staging)?;

        tracing::debug!(root = %root.display(), "Opened filesystem queue");

        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn section_dir(&self, section: Section) -> PathBuf {
        self.root.join(section.as_str())
    }

    fn message_dir(&self, section: Section, id: &MessageId) -> PathBuf {
        self.section_dir(section).join(id.to_string())
    }

    fn existing_dir(&self, section: Section, id: &MessageId) -> Result<PathBuf> {
        let dir = self.message_dir(section, id);
        if dir.is_dir() {
            Ok(dir)
        } else {
            Err(QueueError::not_found(section, id))
        }
    }

    fn write_meta(dir: &Path, meta: &MetaRecord) -> Result<()> {
        let tmp = dir.join(format!("{}.tmp", META_FILE));
        fs::write(&tmp, serde_json::to_vec(meta)?)?;
        fs::rename(&tmp, dir.join(META_FILE))?;
        Ok(())
    }

    fn read_meta(dir: &Path) -> Result<MetaRecord> {
        let content = fs::read(dir.join(META_FILE))?;
        Ok(serde_json::from_slice(&content)?)
    }
}

/// Write header, catalog and parts of a message into `dir`
///
/// Shared with the mailbox repository, which stores messages the same way.
pub(crate) fn write_artifacts(dir: &Path, artifacts: &MessageArtifacts) -> Result<()> {
    let parts_dir = dir.join(PARTS_DIR);
    fs::create_dir_all(&parts_dir)?;

    fs::write(
        dir.join(HEADER_FILE),
        serde_json::to_vec_pretty(&artifacts.header)?,
    )?;
    fs::write(dir.join(CATALOG_FILE), &artifacts.catalog)?;
    for part in &artifacts.parts {
        fs::write(parts_dir.join(part.id.to_string()), &part.data)?;
    }
    Ok(())
}

/// Read back what [`write_artifacts`] stored
pub(crate) fn read_artifacts(dir: &Path, id: &MessageId) -> Result<MessageArtifacts> {
    let header = read_header(dir, id)?;
    let catalog = fs::read(dir.join(CATALOG_FILE))?;
    let parts = read_parts(dir)?;

    Ok(MessageArtifacts {
        id: *id,
        header,
        catalog,
        parts,
    })
}

fn read_header(dir: &Path, id: &MessageId) -> Result<Header> {
    let content = fs::read(dir.join(HEADER_FILE)).map_err(|e| QueueError::Corrupt {
        id: id.to_string(),
        reason: format!("header unreadable: {}", e),
    })?;
    serde_json::from_slice(&content).map_err(|e| QueueError::Corrupt {
        id: id.to_string(),
        reason: format!("header invalid: {}", e),
    })
}

fn read_parts(dir: &Path) -> Result<Vec<EncryptedPart>> {
    let parts_dir = dir.join(PARTS_DIR);
    if !parts_dir.exists() {
        return Ok(Vec::new());
    }

    let mut parts = Vec::new();
    for entry in fs::read_dir(&parts_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(id) = name.to_str().and_then(|n| Uuid::parse_str(n).ok()) else {
            tracing::debug!(path = %entry.path().display(), "Skipping unexpected file in parts");
            continue;
        };
        parts.push(EncryptedPart {
            id,
            data: fs::read(entry.path())?,
        });
    }
    parts.sort_by_key(|p| p.id);
    Ok(parts)
}

/// Parse a directory entry name as a message ID
fn entry_id(entry: &fs::DirEntry) -> Option<MessageId> {
    entry.file_name().to_str().and_then(|n| n.parse().ok())
}

fn is_stale(dir: &Path, now: DateTime<Utc>, age: Duration) -> bool {
    match FilesystemQueue::read_meta(dir) {
        Ok(meta) => (now - meta.entered_at)
            .to_std()
            .map(|elapsed| elapsed >= age)
            .unwrap_or(false),
        // No usable bookkeeping: let the sweep pick it up and sort it out
        Err(_) => true,
    }
}

impl QueueStore for FilesystemQueue {
    fn enqueue(&self, section: Section, artifacts: &MessageArtifacts) -> Result<()> {
        let target = self.message_dir(section, &artifacts.id);
        if target.exists() {
            return Err(QueueError::exists(section, &artifacts.id));
        }

        let staging = self
            .root
            .join(STAGING_DIR)
            .join(Uuid::new_v4().to_string());

        let written = write_artifacts(&staging, artifacts)
            .and_then(|_| Self::write_meta(&staging, &MetaRecord::fresh()));
        if let Err(e) = written {
            let _ = fs::remove_dir_all(&staging);
            return Err(e);
        }

        if let Err(e) = fs::rename(&staging, &target) {
            let _ = fs::remove_dir_all(&staging);
            if target.exists() {
                return Err(QueueError::exists(section, &artifacts.id));
            }
            return Err(e.into());
        }

        tracing::debug!(message_id = %artifacts.id, %section, "Enqueued message");
        Ok(())
    }

    fn move_message(&self, from: Section, to: Section, id: &MessageId) -> Result<()> {
        let src = self.existing_dir(from, id)?;
        if from == to {
            return Ok(());
        }

        let dst = self.message_dir(to, id);
        if dst.exists() {
            return Err(QueueError::exists(to, id));
        }

        match fs::rename(&src, &dst) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(QueueError::not_found(from, id));
            }
            Err(e) => return Err(e.into()),
        }

        // Keep the attempt counter, restart the section clock
        let mut meta = Self::read_meta(&dst).unwrap_or_else(|_| MetaRecord::fresh());
        meta.entered_at = Utc::now();
        Self::write_meta(&dst, &meta)?;

        tracing::debug!(message_id = %id, %from, %to, "Moved message");
        Ok(())
    }

    fn list(&self, section: Section) -> Result<Vec<MessageId>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(self.section_dir(section))? {
            if let Some(id) = entry_id(&entry?) {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn list_stale(&self, section: Section, age: Duration) -> Result<StaleIter<'_>> {
        let now = Utc::now();
        let entries = fs::read_dir(self.section_dir(section))?;

        Ok(Box::new(entries.filter_map(move |entry| {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => return Some(Err(e.into())),
            };
            let id = entry_id(&entry)?;
            is_stale(&entry.path(), now, age).then_some(Ok(id))
        })))
    }

    fn remove(&self, section: Section, id: &MessageId) -> Result<()> {
        match fs::remove_dir_all(self.message_dir(section, id)) {
            Ok(()) => {
                tracing::debug!(message_id = %id, %section, "Removed message");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Err(QueueError::not_found(section, id)),
            Err(e) => Err(e.into()),
        }
    }

    fn contains(&self, section: Section, id: &MessageId) -> Result<bool> {
        Ok(self.message_dir(section, id).is_dir())
    }

    fn load_header(&self, section: Section, id: &MessageId) -> Result<Header> {
        let dir = self.existing_dir(section, id)?;
        read_header(&dir, id)
    }

    fn load(&self, section: Section, id: &MessageId) -> Result<MessageArtifacts> {
        let dir = self.existing_dir(section, id)?;
        read_artifacts(&dir, id)
    }

    fn record_attempt(&self, section: Section, id: &MessageId) -> Result<u32> {
        let dir = self.existing_dir(section, id)?;
        let mut meta = Self::read_meta(&dir).unwrap_or_else(|_| MetaRecord::fresh());
        meta.attempts += 1;
        Self::write_meta(&dir, &meta)?;
        Ok(meta.attempts)
    }
}
