//! Configuration system
//!
//! Loads ~/.config/relaymail/config.yaml with sections for:
//! - The relay's HTTP listener
//! - Queue storage and dispatcher timers
//! - Proof-of-work admission policy
//! - Outbound client behaviour
//! - The address directory and trusted senders

mod relay_config;
pub mod validation;

pub use relay_config::{
    ClientConfig, DirectoryConfig, DirectoryEntry, PowConfig, QueueConfig, RelayConfig,
    ServerConfig, StorageConfig,
};
pub use validation::{validate_config, validate_config_result, ValidationError};
