//! Relay configuration file handling
//!
//! Loads and saves the ~/.config/relaymail/config.yaml file. Every field has a
//! default, so an empty file is a valid configuration.

use crate::address::AddressHash;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// HTTP listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to bind (relays talk to each other on 2424)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Accept self-signed certificates from other relays
    #[serde(default)]
    pub allow_insecure: bool,

    /// Largest accepted upload body in bytes
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    crate::transport::DEFAULT_PORT
}

fn default_max_body_size() -> usize {
    32 * 1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            allow_insecure: false,
            max_body_size: default_max_body_size(),
        }
    }
}

/// Where queue sections, mailboxes and the ticket database live
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
}

fn default_storage_path() -> PathBuf {
    let mut path = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push(".config");
    path.push("relaymail");
    path.push("data");
    path
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
        }
    }
}

impl StorageConfig {
    /// Root of the queue sections
    pub fn queue_dir(&self) -> PathBuf {
        self.path.join("queue")
    }

    /// Root of the account mailboxes
    pub fn accounts_dir(&self) -> PathBuf {
        self.path.join("accounts")
    }

    /// SQLite file holding issued tickets
    pub fn tickets_db(&self) -> PathBuf {
        self.path.join("tickets.db")
    }
}

/// Dispatcher timers and delivery limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Seconds between retry sweeps
    #[serde(default = "default_retry_interval")]
    pub retry_interval_secs: u64,

    /// Seconds between stuck sweeps
    #[serde(default = "default_stuck_interval")]
    pub stuck_interval_secs: u64,

    /// Age after which an unclaimed message counts as stuck
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,

    /// Upper bound on concurrently running delivery tasks
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_deliveries: usize,

    /// Unreadable-header failures tolerated before a message is dead-lettered
    #[serde(default = "default_max_header_attempts")]
    pub max_header_attempts: u32,
}

fn default_retry_interval() -> u64 {
    5
}

fn default_stuck_interval() -> u64 {
    60
}

fn default_stale_after() -> u64 {
    300
}

fn default_max_concurrent() -> usize {
    64
}

fn default_max_header_attempts() -> u32 {
    10
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            retry_interval_secs: default_retry_interval(),
            stuck_interval_secs: default_stuck_interval(),
            stale_after_secs: default_stale_after(),
            max_concurrent_deliveries: default_max_concurrent(),
            max_header_attempts: default_max_header_attempts(),
        }
    }
}

impl QueueConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    pub fn stuck_interval(&self) -> Duration {
        Duration::from_secs(self.stuck_interval_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

/// Admission policy for incoming tickets
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowConfig {
    /// Difficulty of puzzles handed to unknown senders (0 disables the gate)
    #[serde(default = "default_pow_bits")]
    pub bits: u32,

    /// Lifetime of an issued ticket in seconds
    #[serde(default = "default_ticket_ttl")]
    pub ticket_ttl_secs: u64,

    /// Difficulty of the proof senders attach to their own headers
    #[serde(default = "default_sender_bits")]
    pub sender_bits: u32,
}

fn default_pow_bits() -> u32 {
    22
}

fn default_ticket_ttl() -> u64 {
    30 * 60
}

fn default_sender_bits() -> u32 {
    8
}

impl Default for PowConfig {
    fn default() -> Self {
        Self {
            bits: default_pow_bits(),
            ticket_ttl_secs: default_ticket_ttl(),
            sender_bits: default_sender_bits(),
        }
    }
}

/// Outbound relay client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_client_timeout")]
    pub timeout_secs: u64,
}

fn default_client_timeout() -> u64 {
    30
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_client_timeout(),
        }
    }
}

impl ClientConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// A statically configured directory record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DirectoryEntry {
    /// Hashed recipient address
    pub hash: AddressHash,

    /// Relay hosting the recipient
    pub server: String,

    /// Recipient X25519 public key, hex encoded
    pub public_key: String,
}

/// Address directory settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirectoryConfig {
    /// Base URL of an HTTP directory service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Static records consulted when no URL is configured
    #[serde(default)]
    pub entries: Vec<DirectoryEntry>,
}

/// relaymail configuration
///
/// Represents the complete ~/.config/relaymail/config.yaml file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub pow: PowConfig,

    #[serde(default)]
    pub client: ClientConfig,

    #[serde(default)]
    pub directory: DirectoryConfig,

    /// Senders whose tickets are issued pre-authorised
    #[serde(default)]
    pub trusted_senders: Vec<AddressHash>,
}

impl RelayConfig {
    /// Load configuration from the default path (~/.config/relaymail/config.yaml)
    pub fn load_default() -> Result<Self> {
        Self::load(Self::default_path())
    }

    /// Load configuration from a specific path
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(crate::RelayError::Config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }

        tracing::info!(path = %path.display(), "Loading relay configuration");

        let content = fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;

        tracing::debug!(
            port = config.server.port,
            storage = %config.storage.path.display(),
            pow_bits = config.pow.bits,
            "Configuration loaded successfully"
        );

        Ok(config)
    }

    /// Save configuration to a specific path
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        tracing::info!(path = %path.display(), "Saving relay configuration");

        let yaml = serde_yaml::to_string(self)?;
        fs::write(path, yaml)?;

        Ok(())
    }

    /// Get the default config path (~/.config/relaymail/config.yaml)
    pub fn default_path() -> PathBuf {
        let mut path = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push(".config");
        path.push("relaymail");
        path.push("config.yaml");
        path
    }

    /// Whether tickets for this sender skip the puzzle
    pub fn is_trusted(&self, sender: &AddressHash) -> bool {
        self.trusted_senders.iter().any(|s| s == sender)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.server.port, 2424);
        assert_eq!(config.queue.retry_interval(), Duration::from_secs(5));
        assert_eq!(config.queue.stuck_interval(), Duration::from_secs(60));
        assert_eq!(config.queue.max_concurrent_deliveries, 64);
        assert_eq!(config.queue.max_header_attempts, 10);
        assert_eq!(config.pow.ticket_ttl_secs, 1800);
        assert_eq!(config.client.timeout(), Duration::from_secs(30));
        assert!(config.directory.url.is_none());
    }

    #[test]
    fn test_empty_yaml_is_default() {
        let config: RelayConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.pow.bits, 22);
        assert_eq!(config.queue.stale_after_secs, 300);
    }

    #[test]
    fn test_partial_yaml() {
        let yaml = r#"
server:
  port: 9000
pow:
  bits: 4
trusted_senders:
  - "8f434346648f6b96df89dda901c5176b10a6d83961dd3c1ac88b59b2dc327aa4"
"#;
        let config: RelayConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.pow.bits, 4);
        assert_eq!(config.pow.sender_bits, 8);
        assert_eq!(config.trusted_senders.len(), 1);
        assert!(config.is_trusted(&config.trusted_senders[0].clone()));
    }

    #[test]
    fn test_bad_trusted_sender_rejected() {
        let yaml = "trusted_senders: [\"nope\"]";
        assert!(serde_yaml::from_str::<RelayConfig>(yaml).is_err());
    }

    #[test]
    fn test_save_and_load() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path();

        let mut config = RelayConfig::default();
        config.storage.path = PathBuf::from("/var/lib/relaymail");
        config.directory.entries.push(DirectoryEntry {
            hash: AddressHash::from_address("jane@example!"),
            server: "mail.example.org".into(),
            public_key: "00".repeat(32),
        });
        config.save(path).unwrap();

        let loaded = RelayConfig::load(path).unwrap();
        assert_eq!(loaded.storage.path, PathBuf::from("/var/lib/relaymail"));
        assert_eq!(loaded.directory.entries, config.directory.entries);
        assert_eq!(
            loaded.storage.tickets_db(),
            PathBuf::from("/var/lib/relaymail/tickets.db")
        );
    }

    #[test]
    fn test_default_path() {
        assert!(RelayConfig::default_path().ends_with("relaymail/config.yaml"));
    }

    #[test]
    fn test_load_missing_file() {
        assert!(RelayConfig::load("/nonexistent/config.yaml").is_err());
    }
}
