//! Runtime configuration.
//!
//! Loaded once at startup from TOML; every field has a default.
//!
//! ```toml
//! heartbeat_interval_ms = 30000
//! heartbeat_timeout_ms = 45000
//! reconnect_grace_ms = 60000
//! initialize_timeout_ms = 10000
//! mailbox_capacity = 64
//! node_id = 0
//! min_players_to_start = 1
//! ```

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::state::ids::MAX_NODE_ID;

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// How often clients are expected to send HEARTBEAT.
    pub heartbeat_interval_ms: u64,

    /// Silence after which an initialized connection is considered stale.
    pub heartbeat_timeout_ms: u64,

    /// How long a disconnected, resumable connection entity is kept.
    pub reconnect_grace_ms: u64,

    /// Upper bound on waiting for INITIALIZE to settle.
    pub initialize_timeout_ms: u64,

    /// Per-machine mailbox size.
    pub mailbox_capacity: usize,

    /// Snowflake node id, 0..=1023.
    pub node_id: u16,

    /// Connected players required before a host may start a room.
    pub min_players_to_start: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 30_000,
            heartbeat_timeout_ms: 45_000,
            reconnect_grace_ms: 60_000,
            initialize_timeout_ms: 10_000,
            mailbox_capacity: 64,
            node_id: 0,
            min_players_to_start: 1,
        }
    }
}

impl Config {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id > MAX_NODE_ID {
            return Err(ConfigError::Invalid(format!(
                "node_id {} exceeds {}",
                self.node_id, MAX_NODE_ID
            )));
        }
        if self.mailbox_capacity == 0 {
            return Err(ConfigError::Invalid("mailbox_capacity must be positive".into()));
        }
        if self.heartbeat_timeout_ms <= self.heartbeat_interval_ms {
            return Err(ConfigError::Invalid(
                "heartbeat_timeout_ms must exceed heartbeat_interval_ms".into(),
            ));
        }
        if self.initialize_timeout_ms == 0 {
            return Err(ConfigError::Invalid("initialize_timeout_ms must be positive".into()));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn reconnect_grace(&self) -> Duration {
        Duration::from_millis(self.reconnect_grace_ms)
    }

    pub fn initialize_timeout(&self) -> Duration {
        Duration::from_millis(self.initialize_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.heartbeat_timeout(), Duration::from_secs(45));
    }

    #[test]
    fn test_partial_toml() {
        let config = Config::from_toml_str("initialize_timeout_ms = 250\nnode_id = 7\n").unwrap();
        assert_eq!(
            config,
            Config {
                initialize_timeout_ms: 250,
                node_id: 7,
                ..Config::default()
            }
        );
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(matches!(
            Config::from_toml_str("heartbeat = 1"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            Config::from_toml_str("node_id = 4096"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            Config::from_toml_str("heartbeat_interval_ms = 50000"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            Config::from_toml_str("mailbox_capacity = 0"),
            Err(ConfigError::Invalid(_))
        ));
    }
}
