//! Configuration management for CertChain nodes

use serde::{Deserialize, Deserializer};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CONFIG_FILE: &str = "certchain.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub node: NodeConfig,
    pub network: NetworkConfig,
    pub chain: ChainConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub node_id: String,
    pub public_url: String,
    /// Empty disables the admin key check.
    pub admin_api_key: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub port: u16,
    pub seed_nodes: Vec<String>,
    #[serde(deserialize_with = "humantime_duration")]
    pub peer_timeout: Duration,
    #[serde(deserialize_with = "humantime_duration")]
    pub resolve_interval: Duration,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    #[serde(deserialize_with = "humantime_duration")]
    pub block_interval: Duration,
    pub certificate_cost: usize,
    /// Upper bound on the credits a single purchase, issue or transfer may move.
    pub max_credit_amount: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    File,
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub data_dir: String,
    pub rebuild_ledger_on_start: bool,
    pub reset_ledger: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            public_url: local_url(default_port()),
            admin_api_key: String::new(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            seed_nodes: Vec::new(),
            peer_timeout: Duration::from_secs(5),
            resolve_interval: Duration::from_secs(60),
        }
    }
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            block_interval: Duration::from_secs(24 * 60 * 60),
            certificate_cost: 1,
            max_credit_amount: 10_000,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::File,
            data_dir: default_data_dir(),
            rebuild_ledger_on_start: false,
            reset_ledger: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

fn default_node_id() -> String {
    "default".to_string()
}

fn default_port() -> u16 {
    3000
}

fn local_url(port: u16) -> String {
    format!("http://localhost:{}", port)
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn humantime_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
}

fn invalid(key: &str, message: impl ToString) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

impl Config {
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(source)?;
        if config.node.public_url == local_url(default_port()) {
            config.node.public_url = local_url(config.network.port);
        }
        Ok(config)
    }

    /// Change the listening port. A `public_url` still at its localhost
    /// default follows the new port.
    pub fn set_port(&mut self, port: u16) {
        if self.node.public_url == local_url(self.network.port) {
            self.node.public_url = local_url(port);
        }
        self.network.port = port;
    }

    /// Apply `CERTCHAIN_*` overrides. `lookup` returns the raw value of a
    /// variable when it is set.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("CERTCHAIN_PORT") {
            self.set_port(port.parse().map_err(|e| invalid("CERTCHAIN_PORT", e))?);
        }
        if let Some(url) = lookup("CERTCHAIN_PUBLIC_URL") {
            self.node.public_url = url;
        }
        if let Some(id) = lookup("CERTCHAIN_NODE_ID") {
            self.node.node_id = id;
        }
        if let Some(seeds) = lookup("CERTCHAIN_SEED_NODES") {
            self.network.seed_nodes = seeds
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(interval) = lookup("CERTCHAIN_BLOCK_INTERVAL") {
            self.chain.block_interval = humantime::parse_duration(&interval)
                .map_err(|e| invalid("CERTCHAIN_BLOCK_INTERVAL", e))?;
        }
        if let Some(key) = lookup("CERTCHAIN_ADMIN_API_KEY") {
            self.node.admin_api_key = key;
        }
        if let Some(dir) = lookup("CERTCHAIN_DATA_DIR") {
            self.storage.data_dir = dir;
        }
        if let Some(reset) = lookup("CERTCHAIN_RESET_LEDGER") {
            self.storage.reset_ledger = matches!(reset.trim(), "1" | "true" | "yes");
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network.port == 0 {
            return Err(invalid("network.port", "must be non-zero"));
        }
        if self.storage.data_dir.trim().is_empty() {
            return Err(invalid("storage.data_dir", "must be set"));
        }
        if self.node.node_id.trim().is_empty() {
            return Err(invalid("node.node_id", "must be set"));
        }
        if self.chain.block_interval.is_zero() {
            return Err(invalid("chain.block_interval", "must be non-zero"));
        }
        if self.chain.max_credit_amount == 0 {
            return Err(invalid("chain.max_credit_amount", "must be non-zero"));
        }
        if self.network.resolve_interval.is_zero() {
            return Err(invalid("network.resolve_interval", "must be non-zero"));
        }
        Ok(())
    }
}

/// Load `path` (a missing file yields defaults), apply environment
/// overrides and validate the result.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let mut config = match fs::read_to_string(path) {
        Ok(source) => Config::from_toml_str(&source)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Config::default(),
        Err(source) => {
            return Err(ConfigError::Io {
                path: path.display().to_string(),
                source,
            })
        }
    };

    config.apply_overrides(|key| std::env::var(key).ok())?;
    config.validate()?;
    Ok(config)
}
