// Node configuration
//
// Settings come from an optional JSON file named by RESONANCE_CONFIG, then
// from individual RESONANCE_* environment overrides. Every field has a
// default, so an empty file (or none at all) is a valid configuration.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::fs;

use crate::blockchain::chain::LedgerConfig;
use crate::blockchain::pow::MAX_DIFFICULTY;
use crate::consensus::engine::ConsensusConfig;
use crate::network::transport::TransportConfig;

pub const CONFIG_ENV: &str = "RESONANCE_CONFIG";
pub const PORT_ENV: &str = "RESONANCE_PORT";
pub const API_PORT_ENV: &str = "RESONANCE_API_PORT";
pub const PEERS_ENV: &str = "RESONANCE_PEERS";
pub const DIFFICULTY_ENV: &str = "RESONANCE_DIFFICULTY";
pub const SECRET_KEY_ENV: &str = "RESONANCE_SECRET_KEY";

/// Errors that can occur while loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

fn default_api_port() -> u16 {
    8080
}

/// Settings of the node process itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSettings {
    /// Port of the HTTP API
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Peers dialled on startup, as `host:port`
    #[serde(default)]
    pub bootstrap_peers: Vec<String>,

    /// Hex ed25519 secret key; a fresh identity is generated when absent
    #[serde(default)]
    pub secret_key_hex: Option<String>,
}

impl Default for NodeSettings {
    fn default() -> Self {
        NodeSettings {
            api_port: default_api_port(),
            bootstrap_peers: Vec::new(),
            secret_key_hex: None,
        }
    }
}

/// Full node configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfig {
    #[serde(default)]
    pub node: NodeSettings,

    #[serde(default)]
    pub ledger: LedgerConfig,

    #[serde(default)]
    pub consensus: ConsensusConfig,

    #[serde(default)]
    pub transport: TransportConfig,
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

impl NodeConfig {
    /// Loads configuration from the process environment
    pub fn load() -> Result<Self, ConfigError> {
        NodeConfig::load_with(|key| std::env::var(key).ok())
    }

    /// Loads configuration using `lookup` to read environment variables
    pub fn load_with(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = match lookup(CONFIG_ENV) {
            Some(path) => {
                let text = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
                    path: path.clone(),
                    source,
                })?;
                NodeConfig::from_json(&text)?
            }
            None => NodeConfig::default(),
        };

        config.apply_overrides(lookup)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Applies the individual environment overrides
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(value) = lookup(PORT_ENV) {
            self.transport.port = parse_env(PORT_ENV, &value)?;
        }
        if let Some(value) = lookup(API_PORT_ENV) {
            self.node.api_port = parse_env(API_PORT_ENV, &value)?;
        }
        if let Some(value) = lookup(PEERS_ENV) {
            self.node.bootstrap_peers = value
                .split(',')
                .map(str::trim)
                .filter(|peer| !peer.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(value) = lookup(DIFFICULTY_ENV) {
            self.ledger.difficulty = parse_env(DIFFICULTY_ENV, &value)?;
        }
        if let Some(value) = lookup(SECRET_KEY_ENV) {
            self.node.secret_key_hex = Some(value.trim().to_string());
        }
        Ok(())
    }

    /// Rejects settings the node cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ledger.difficulty > MAX_DIFFICULTY {
            return Err(ConfigError::Invalid(format!(
                "difficulty must be at most {}",
                MAX_DIFFICULTY
            )));
        }
        if self.ledger.batch_size == 0 {
            return Err(ConfigError::Invalid("batch size must be positive".to_string()));
        }
        if self.ledger.pow_chunk_size == 0 {
            return Err(ConfigError::Invalid(
                "proof-of-work chunk size must be positive".to_string(),
            ));
        }

        let thresholds = [
            ("approvalThreshold", self.consensus.approval_threshold),
            ("minAverageWeight", self.consensus.min_average_weight),
            ("minResonance", self.consensus.min_resonance),
        ];
        for (name, value) in thresholds {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Invalid(format!("{} must be within [0, 1]", name)));
            }
        }

        if self.consensus.vote_timeout_ms == 0 {
            return Err(ConfigError::Invalid("vote timeout must be positive".to_string()));
        }
        if self.transport.heartbeat_interval_ms == 0 || self.transport.heartbeat_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat interval and timeout must be positive".to_string(),
            ));
        }
        if self.transport.handshake_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "handshake timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = NodeConfig::load_with(env(&[])).unwrap();

        assert_eq!(config.ledger.batch_size, 10);
        assert_eq!(config.ledger.initial_balance, 1000);
        assert_eq!(config.consensus.approval_threshold, 0.66);
        assert_eq!(config.consensus.min_resonance, 0.5);
        assert_eq!(config.transport.heartbeat_interval_ms, 30_000);
        assert_eq!(config.transport.heartbeat_timeout_ms, 60_000);
        assert_eq!(config.transport.handshake_timeout_ms, 5_000);
        assert!(config.node.bootstrap_peers.is_empty());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config =
            NodeConfig::from_json(r#"{"ledger":{"difficulty":2},"node":{"apiPort":9000}}"#).unwrap();

        assert_eq!(config.ledger.difficulty, 2);
        assert_eq!(config.ledger.batch_size, 10);
        assert_eq!(config.node.api_port, 9000);
        assert_eq!(config.transport, TransportConfig::default());
    }

    #[test]
    fn test_environment_overrides() {
        let config = NodeConfig::load_with(env(&[
            (PORT_ENV, "7001"),
            (API_PORT_ENV, "8001"),
            (PEERS_ENV, "127.0.0.1:7002, 127.0.0.1:7003,"),
            (DIFFICULTY_ENV, "1"),
        ]))
        .unwrap();

        assert_eq!(config.transport.port, 7001);
        assert_eq!(config.node.api_port, 8001);
        assert_eq!(
            config.node.bootstrap_peers,
            vec!["127.0.0.1:7002".to_string(), "127.0.0.1:7003".to_string()]
        );
        assert_eq!(config.ledger.difficulty, 1);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(matches!(
            NodeConfig::load_with(env(&[(PORT_ENV, "not-a-port")])),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            NodeConfig::load_with(env(&[(DIFFICULTY_ENV, "65")])),
            Err(ConfigError::Invalid(_))
        ));

        let mut config = NodeConfig::default();
        config.consensus.approval_threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = NodeConfig::default();
        config.transport.heartbeat_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = NodeConfig::default();
        config.ledger.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = NodeConfig::default();
        config.consensus.vote_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_config_file() {
        let result = NodeConfig::load_with(env(&[(CONFIG_ENV, "/nonexistent/resonance.json")]));
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }
}
