//! Configuration schema and loader for mergebox nodes.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Top-level node configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Storage settings.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Outbound replication settings.
    #[serde(default)]
    pub replication: ReplicationConfig,

    /// Inbound sync endpoint; absent means this node does not accept peers.
    #[serde(default)]
    pub endpoint: Option<EndpointConfig>,

    /// Collections to open, with their indexes.
    #[serde(default)]
    pub collections: Vec<CollectionConfig>,

    /// Optional Prometheus metrics HTTP port.
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for WAL and data files.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Fsync policy: "always", "batch", "none".
    #[serde(default = "default_fsync")]
    pub fsync: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            fsync: default_fsync(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Address of the remote endpoint to sync with. Unset disables
    /// outbound replication.
    #[serde(default)]
    pub remote: Option<String>,

    #[serde(default)]
    pub tenant: Option<String>,

    #[serde(default = "default_user_name")]
    pub user_name: String,

    #[serde(default)]
    pub auth_token: Option<String>,

    /// Readable prefix for newly created replica ids.
    #[serde(default)]
    pub replica_name: Option<String>,

    /// Documents (and tombstones) per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Tombstone lifetime in milliseconds; unset keeps tombstones forever.
    #[serde(default)]
    pub tombstone_ttl_ms: Option<u64>,

    #[serde(default = "default_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_timeout_ms")]
    pub ack_timeout_ms: u64,

    #[serde(default = "default_max_batch_retries")]
    pub max_batch_retries: u32,

    /// How often an idle session checks for unsent changes.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Wait between reconnect attempts.
    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,

    /// Tombstone collection interval in seconds.
    #[serde(default = "default_gc_interval_secs")]
    pub gc_interval_secs: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            remote: None,
            tenant: None,
            user_name: default_user_name(),
            auth_token: None,
            replica_name: None,
            batch_size: default_batch_size(),
            tombstone_ttl_ms: None,
            connect_timeout_ms: default_timeout_ms(),
            ack_timeout_ms: default_timeout_ms(),
            max_batch_retries: default_max_batch_retries(),
            poll_interval_ms: default_poll_interval_ms(),
            reconnect_backoff_ms: default_reconnect_backoff_ms(),
            gc_interval_secs: default_gc_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Listen address for incoming sync connections.
    pub listen: SocketAddr,

    /// user name -> token. Empty accepts every peer.
    #[serde(default)]
    pub credentials: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionConfig {
    pub name: String,

    #[serde(default)]
    pub indexes: Vec<IndexConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Field path, dots for nested fields.
    pub field: String,

    /// "unique", "non-unique" or "full-text".
    #[serde(rename = "type", default = "default_index_type")]
    pub index_type: String,
}

/// Index types a node can build from configuration.
pub const INDEX_TYPES: [&str; 3] = ["unique", "non-unique", "full-text"];

// --- Defaults ---

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}
fn default_fsync() -> String {
    "batch".to_string()
}
fn default_user_name() -> String {
    "mergebox".to_string()
}
fn default_batch_size() -> usize {
    10
}
fn default_timeout_ms() -> u64 {
    5000
}
fn default_max_batch_retries() -> u32 {
    3
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_reconnect_backoff_ms() -> u64 {
    1000
}
fn default_gc_interval_secs() -> u64 {
    60
}
fn default_index_type() -> String {
    "non-unique".to_string()
}

// --- Loading ---

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl NodeConfig {
    /// Validate that configuration values are consistent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let r = &self.replication;
        if r.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "replication.batch_size must be > 0".into(),
            ));
        }
        if r.user_name.is_empty() {
            return Err(ConfigError::Invalid(
                "replication.user_name must not be empty".into(),
            ));
        }
        if r.ack_timeout_ms == 0 || r.connect_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "replication.connect_timeout_ms and replication.ack_timeout_ms must be > 0".into(),
            ));
        }
        if r.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "replication.poll_interval_ms must be > 0".into(),
            ));
        }
        if r.gc_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "replication.gc_interval_secs must be > 0".into(),
            ));
        }
        if r.remote.is_some() && self.collections.is_empty() {
            return Err(ConfigError::Invalid(
                "replication.remote is set but no collections are configured".into(),
            ));
        }

        let mut names = HashSet::new();
        for c in &self.collections {
            if c.name.is_empty() || c.name.starts_with('$') {
                return Err(ConfigError::Invalid(format!(
                    "collections: invalid name '{}'",
                    c.name
                )));
            }
            if !names.insert(c.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "collections: '{}' is listed twice",
                    c.name
                )));
            }
            let mut fields = HashSet::new();
            for index in &c.indexes {
                if !INDEX_TYPES.contains(&index.index_type.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "collections.{}.indexes: unknown type '{}' on field '{}'",
                        c.name, index.index_type, index.field
                    )));
                }
                if index.field.is_empty() || !fields.insert(index.field.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "collections.{}.indexes: field '{}' is empty or indexed twice",
                        c.name, index.field
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Load a `NodeConfig` from a YAML file path.
pub fn load_from_file(path: &std::path::Path) -> Result<NodeConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    load_from_str(&contents)
}

/// Load a `NodeConfig` from a YAML string.
pub fn load_from_str(yaml: &str) -> Result<NodeConfig, ConfigError> {
    let config: NodeConfig = serde_yaml::from_str(yaml)?;
    config.validate()?;
    Ok(config)
}
