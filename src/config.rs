//! Configuration for waybill services
//!
//! TOML configuration with two sections: `[broker]` for the transport and
//! `[component]` for the worker pool. Credentials are referenced by
//! environment variable name and resolved at connect time, never stored.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Top-level service configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComponentConfig {
    pub broker: BrokerSection,
    #[serde(default)]
    pub component: PoolSection,
}

/// Broker transport settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSection {
    /// Broker URL with scheme and optional port, e.g. `mqtt://localhost:1883`.
    pub broker_url: String,
    /// Queue to consume from. Absent for producer-only services.
    pub queue: Option<String>,
    /// Environment variable holding the broker username.
    pub username_env: Option<String>,
    /// Environment variable holding the broker password.
    pub password_env: Option<String>,
    /// Unacknowledged-delivery window per connection.
    #[serde(default = "default_prefetch")]
    pub prefetch: usize,
}

/// Worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolSection {
    /// Number of worker loops to launch.
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            workers: default_workers(),
        }
    }
}

fn default_prefetch() -> usize {
    1
}

fn default_workers() -> usize {
    4
}

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("invalid queue name: {0}")]
    InvalidQueueName(String),
}

impl ComponentConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: ComponentConfig = toml::from_str(&content)?;

        if let Some(queue) = &config.broker.queue {
            validate_queue_name(queue)?;
        }

        Ok(config)
    }
}

impl BrokerSection {
    /// Broker username from the configured environment variable, if any.
    pub fn username(&self) -> Option<String> {
        lookup_env(self.username_env.as_ref())
    }

    /// Broker password from the configured environment variable, if any.
    pub fn password(&self) -> Option<String> {
        lookup_env(self.password_env.as_ref())
    }
}

fn lookup_env(name: Option<&String>) -> Option<String> {
    name.and_then(|name| std::env::var(name).ok())
}

/// Queue names must match `[A-Za-z0-9._/-]+`.
fn validate_queue_name(queue: &str) -> Result<(), ConfigError> {
    let valid = !queue.is_empty()
        && queue
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '/' | '-'));

    if !valid {
        return Err(ConfigError::InvalidQueueName(queue.to_string()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn full_config_parses() {
        let toml_content = r#"
[broker]
broker_url = "mqtt://localhost:1883"
queue = "thumbnails/ingest"
username_env = "BROKER_USERNAME"
password_env = "BROKER_PASSWORD"
prefetch = 8

[component]
workers = 6
"#;

        let config: ComponentConfig = toml::from_str(toml_content).unwrap();
        assert_eq!(config.broker.broker_url, "mqtt://localhost:1883");
        assert_eq!(config.broker.queue.as_deref(), Some("thumbnails/ingest"));
        assert_eq!(config.broker.prefetch, 8);
        assert_eq!(config.component.workers, 6);
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let toml_content = r#"
[broker]
broker_url = "mqtt://localhost:1883"
"#;

        let config: ComponentConfig = toml::from_str(toml_content).unwrap();
        assert_eq!(config.broker.queue, None);
        assert_eq!(config.broker.prefetch, 1);
        assert_eq!(config.component.workers, 4);
    }

    #[test]
    fn queue_name_validation() {
        assert!(validate_queue_name("jobs/resize-v2.1").is_ok());
        assert!(validate_queue_name("").is_err());
        assert!(validate_queue_name("bad queue").is_err());
        assert!(validate_queue_name("bad#queue").is_err());
    }

    #[test]
    fn load_from_file_round_trip() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[broker]\nbroker_url = \"mqtt://localhost:1883\"\nqueue = \"ingest\""
        )
        .unwrap();

        let config = ComponentConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.broker.queue.as_deref(), Some("ingest"));
    }

    #[test]
    fn load_from_file_rejects_bad_queue() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[broker]\nbroker_url = \"mqtt://localhost:1883\"\nqueue = \"no spaces\""
        )
        .unwrap();

        assert!(matches!(
            ComponentConfig::load_from_file(file.path()),
            Err(ConfigError::InvalidQueueName(_))
        ));
    }
}
