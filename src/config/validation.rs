//! Configuration validation
//!
//! Validates relay configuration for correctness:
//! - Listener port and body limit are usable
//! - Dispatcher timers and pool size are non-zero
//! - Proof-of-work difficulty is solvable
//! - Directory records are well formed

use super::relay_config::RelayConfig;
use crate::RelayError;

/// Highest difficulty accepted for either puzzle kind
pub const MAX_POW_BITS: u32 = 64;

/// Validation error details
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Validation result
pub type ValidationResult = std::result::Result<(), Vec<ValidationError>>;

/// Validate a relay configuration
pub fn validate_config(config: &RelayConfig) -> ValidationResult {
    let mut errors = Vec::new();

    if config.server.port == 0 {
        errors.push(ValidationError::new(
            "server.port",
            "Port must be greater than 0",
        ));
    }

    if config.server.max_body_size == 0 {
        errors.push(ValidationError::new(
            "server.max_body_size",
            "Body limit must be greater than 0",
        ));
    }

    let queue = &config.queue;
    for (field, value) in [
        ("queue.retry_interval_secs", queue.retry_interval_secs),
        ("queue.stuck_interval_secs", queue.stuck_interval_secs),
        ("queue.stale_after_secs", queue.stale_after_secs),
    ] {
        if value == 0 {
            errors.push(ValidationError::new(field, "Interval must be greater than 0"));
        }
    }

    if queue.max_concurrent_deliveries == 0 {
        errors.push(ValidationError::new(
            "queue.max_concurrent_deliveries",
            "At least one delivery must be allowed to run",
        ));
    }

    if queue.max_header_attempts == 0 {
        errors.push(ValidationError::new(
            "queue.max_header_attempts",
            "Must allow at least one attempt",
        ));
    }

    for (field, bits) in [
        ("pow.bits", config.pow.bits),
        ("pow.sender_bits", config.pow.sender_bits),
    ] {
        if bits > MAX_POW_BITS {
            errors.push(ValidationError::new(
                field,
                format!("Difficulty {} exceeds the maximum of {}", bits, MAX_POW_BITS),
            ));
        }
    }

    if config.pow.ticket_ttl_secs == 0 {
        errors.push(ValidationError::new(
            "pow.ticket_ttl_secs",
            "Tickets must live for at least one second",
        ));
    }

    if config.client.timeout_secs == 0 {
        errors.push(ValidationError::new(
            "client.timeout_secs",
            "Timeout must be greater than 0",
        ));
    }

    if let Some(url) = &config.directory.url {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            errors.push(ValidationError::new(
                "directory.url",
                format!("Directory URL must be http(s): {}", url),
            ));
        }
    }

    for entry in &config.directory.entries {
        if entry.server.trim().is_empty() {
            errors.push(ValidationError::new(
                "directory.entries",
                format!("Entry {} has an empty server", entry.hash),
            ));
        }
        if crate::envelope::parse_public_key(&entry.public_key).is_err() {
            errors.push(ValidationError::new(
                "directory.entries",
                format!("Entry {} has an invalid public key", entry.hash),
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Validate configuration and return a Result
pub fn validate_config_result(config: &RelayConfig) -> crate::Result<()> {
    validate_config(config).map_err(|errors| {
        let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        RelayError::Config(format!(
            "Configuration validation failed:\n  - {}",
            messages.join("\n  - ")
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::AddressHash;
    use crate::config::DirectoryEntry;

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate_config(&RelayConfig::default()).is_ok());
    }

    #[test]
    fn test_zero_values_rejected() {
        let mut config = RelayConfig::default();
        config.server.port = 0;
        config.queue.retry_interval_secs = 0;
        config.queue.max_concurrent_deliveries = 0;

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"server.port"));
        assert!(fields.contains(&"queue.retry_interval_secs"));
        assert!(fields.contains(&"queue.max_concurrent_deliveries"));
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn test_excessive_difficulty() {
        let mut config = RelayConfig::default();
        config.pow.bits = 65;
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors[0].field, "pow.bits");
    }

    #[test]
    fn test_directory_checks() {
        let mut config = RelayConfig::default();
        config.directory.url = Some("ftp://directory".into());
        config.directory.entries.push(DirectoryEntry {
            hash: AddressHash::from_address("jane@example!"),
            server: "".into(),
            public_key: "xyz".into(),
        });

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn test_result_message_lists_every_error() {
        let mut config = RelayConfig::default();
        config.server.port = 0;
        config.client.timeout_secs = 0;

        let err = validate_config_result(&config).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("server.port"));
        assert!(msg.contains("client.timeout_secs"));
    }
}
