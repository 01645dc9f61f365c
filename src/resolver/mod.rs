//! Address resolution
//!
//! Decides whether a recipient lives on this relay or elsewhere. Local
//! accounts are checked first, so local mail never touches the network; only
//! unknown addresses go to the directory.

use crate::account::AccountRepository;
use crate::address::AddressHash;
use crate::config::{DirectoryConfig, DirectoryEntry};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Resolution errors; all of them are worth retrying later
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("address {0} could not be resolved")]
    UnresolvedAddress(AddressHash),

    #[error("directory lookup failed: {0}")]
    Directory(String),

    #[error("directory request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// Directory answer for a remote recipient
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryRecord {
    pub hash: AddressHash,

    /// Relay hosting the recipient
    pub server: String,

    /// Recipient X25519 public key, hex encoded
    pub public_key: String,
}

impl From<DirectoryEntry> for DirectoryRecord {
    fn from(entry: DirectoryEntry) -> Self {
        Self {
            hash: entry.hash,
            server: entry.server,
            public_key: entry.public_key,
        }
    }
}

/// Where a message has to go
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Recipient has an account on this relay
    Local(AddressHash),
    /// Recipient is hosted elsewhere
    Remote(DirectoryRecord),
}

/// Authoritative lookup of remote recipients
#[async_trait]
pub trait DirectoryService: Send + Sync {
    /// `Ok(None)` when the directory does not know the address
    async fn resolve(&self, hash: &AddressHash) -> Result<Option<DirectoryRecord>, ResolveError>;
}

/// Directory backed by a fixed table
#[derive(Debug, Default)]
pub struct StaticDirectory {
    records: HashMap<AddressHash, DirectoryRecord>,
}

impl StaticDirectory {
    pub fn new(records: impl IntoIterator<Item = DirectoryRecord>) -> Self {
        Self {
            records: records.into_iter().map(|r| (r.hash.clone(), r)).collect(),
        }
    }

    pub fn insert(&mut self, record: DirectoryRecord) {
        self.records.insert(record.hash.clone(), record);
    }
}

#[async_trait]
impl DirectoryService for StaticDirectory {
    async fn resolve(&self, hash: &AddressHash) -> Result<Option<DirectoryRecord>, ResolveError> {
        Ok(self.records.get(hash).cloned())
    }
}

/// Directory served over HTTP at `GET {base}/address/{hash}`
#[derive(Debug)]
pub struct HttpDirectory {
    base_url: String,
    client: reqwest::Client,
}

impl HttpDirectory {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ResolveError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl DirectoryService for HttpDirectory {
    async fn resolve(&self, hash: &AddressHash) -> Result<Option<DirectoryRecord>, ResolveError> {
        let url = format!("{}/address/{}", self.base_url, hash);
        let response = self.client.get(&url).send().await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(ResolveError::Directory(format!(
                "{} returned {}",
                url,
                response.status()
            )));
        }

        let record: DirectoryRecord = response.json().await?;
        if &record.hash != hash {
            return Err(ResolveError::Directory(format!(
                "asked for {} but got a record for {}",
                hash, record.hash
            )));
        }
        Ok(Some(record))
    }
}

/// Build the directory described by the configuration
pub fn directory_from_config(
    config: &DirectoryConfig,
    timeout: Duration,
) -> Result<Arc<dyn DirectoryService>, ResolveError> {
    match &config.url {
        Some(url) => Ok(Arc::new(HttpDirectory::new(url.clone(), timeout)?)),
        None => Ok(Arc::new(StaticDirectory::new(
            config.entries.iter().cloned().map(DirectoryRecord::from),
        ))),
    }
}

/// Local-first resolver
#[derive(Clone)]
pub struct Resolver {
    accounts: Arc<dyn AccountRepository>,
    directory: Arc<dyn DirectoryService>,
}

impl Resolver {
    pub fn new(accounts: Arc<dyn AccountRepository>, directory: Arc<dyn DirectoryService>) -> Self {
        Self {
            accounts,
            directory,
        }
    }

    pub async fn resolve(&self, hash: &AddressHash) -> Result<Resolution, ResolveError> {
        if self.accounts.exists(hash) {
            tracing::debug!(address = %hash, "Resolved to local account");
            return Ok(Resolution::Local(hash.clone()));
        }

        match self.directory.resolve(hash).await? {
            Some(record) => {
                tracing::debug!(address = %hash, server = %record.server, "Resolved to remote relay");
                Ok(Resolution::Remote(record))
            }
            None => Err(ResolveError::UnresolvedAddress(hash.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::FileAccountRepository;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Directory that counts lookups
    struct CountingDirectory {
        inner: StaticDirectory,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DirectoryService for CountingDirectory {
        async fn resolve(
            &self,
            hash: &AddressHash,
        ) -> Result<Option<DirectoryRecord>, ResolveError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.resolve(hash).await
        }
    }

    fn record(addr: &str) -> DirectoryRecord {
        DirectoryRecord {
            hash: AddressHash::from_address(addr),
            server: "relay.example.org".into(),
            public_key: "11".repeat(32),
        }
    }

    fn setup() -> (Resolver, Arc<CountingDirectory>, Arc<FileAccountRepository>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let accounts = Arc::new(FileAccountRepository::new(temp_dir.path()).unwrap());
        let directory = Arc::new(CountingDirectory {
            inner: StaticDirectory::new([record("bob@remote!"), record("jane@example!")]),
            calls: AtomicUsize::new(0),
        });
        let resolver = Resolver::new(accounts.clone(), directory.clone());
        (resolver, directory, accounts, temp_dir)
    }

    #[tokio::test]
    async fn test_local_wins_without_directory_call() {
        let (resolver, directory, accounts, _dir) = setup();
        let jane = AddressHash::from_address("jane@example!");
        accounts.create(&jane).unwrap();

        let resolution = resolver.resolve(&jane).await.unwrap();
        assert_eq!(resolution, Resolution::Local(jane));
        assert_eq!(directory.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_remote_lookup() {
        let (resolver, directory, _accounts, _dir) = setup();
        let bob = AddressHash::from_address("bob@remote!");

        let resolution = resolver.resolve(&bob).await.unwrap();
        assert_eq!(resolution, Resolution::Remote(record("bob@remote!")));
        assert_eq!(directory.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unresolved() {
        let (resolver, _directory, _accounts, _dir) = setup();
        let ghost = AddressHash::from_address("ghost@nowhere!");
        assert!(matches!(
            resolver.resolve(&ghost).await,
            Err(ResolveError::UnresolvedAddress(h)) if h == ghost
        ));
    }

    #[test]
    fn test_directory_from_config() {
        let config = DirectoryConfig {
            url: None,
            entries: vec![DirectoryEntry {
                hash: AddressHash::from_address("bob@remote!"),
                server: "relay.example.org".into(),
                public_key: "11".repeat(32),
            }],
        };
        assert!(directory_from_config(&config, Duration::from_secs(5)).is_ok());

        let config = DirectoryConfig {
            url: Some("http://127.0.0.1:9/".into()),
            entries: Vec::new(),
        };
        assert!(directory_from_config(&config, Duration::from_secs(5)).is_ok());
    }
}
