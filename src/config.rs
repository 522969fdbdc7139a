//! # Server Configuration
//!
//! Startup parameters for a Flin node, with defaults, builder-style
//! setters, JSON file loading, and validation before use.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A parameter is out of range or missing
    #[error("invalid configuration: {0}")]
    Invalid(String),

    /// Config file could not be read
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Config file could not be parsed
    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Result type for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Default binary-protocol port.
pub const DEFAULT_PORT: u16 = 7380;

/// Default worker pool size.
pub const DEFAULT_WORKERS: usize = 256;

/// Default shard count.
pub const DEFAULT_SHARDS: usize = 64;

/// Default multiplier from worker count to queue capacity.
pub const DEFAULT_QUEUE_FACTOR: usize = 32;

/// Startup parameters for one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Opaque identifier for this node in cluster mode
    pub node_id: String,

    /// Listen address
    pub host: String,

    /// Listening TCP port for the binary protocol
    pub port: u16,

    /// Root directory for on-disk shards; `None` means in-memory
    pub data_dir: Option<PathBuf>,

    /// Worker pool size
    pub workers: usize,

    /// Worker queue capacity as a multiple of the worker count
    pub worker_queue_factor: usize,

    /// Shard count, in `[1, 256]`; must match across restarts
    pub shards: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            node_id: "node-1".to_string(),
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            data_dir: None,
            workers: DEFAULT_WORKERS,
            worker_queue_factor: DEFAULT_QUEUE_FACTOR,
            shards: DEFAULT_SHARDS,
        }
    }
}

impl ServerConfig {
    /// Set the node identifier.
    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = node_id.into();
        self
    }

    /// Set the listen address.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the listening port. Zero asks the OS for an ephemeral port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the on-disk data root. An empty path means in-memory.
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        self.data_dir = if dir.as_os_str().is_empty() {
            None
        } else {
            Some(dir)
        };
        self
    }

    /// Set the worker pool size.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the shard count.
    pub fn with_shards(mut self, shards: usize) -> Self {
        self.shards = shards;
        self
    }

    /// Load a configuration from a JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every parameter before the server starts.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.node_id.is_empty() {
            return Err(ConfigError::Invalid("node_id must not be empty".to_string()));
        }
        if self.shards == 0 || self.shards > 256 {
            return Err(ConfigError::Invalid(format!(
                "shards {} out of range [1, 256]",
                self.shards
            )));
        }
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".to_string()));
        }
        if self.worker_queue_factor == 0 {
            return Err(ConfigError::Invalid(
                "worker_queue_factor must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
