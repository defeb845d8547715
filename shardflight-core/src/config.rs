use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::allocator::AllocatorKind;
use crate::delivery::DeliveryOptions;

/// Node configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub node: NodeConfig,
    pub server: ServerConfig,
    pub memory: MemoryConfig,
    pub stream: StreamConfig,
    /// Flight addresses of other nodes, keyed by node id.
    pub peers: HashMap<String, String>,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub id: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: default_node_id(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    /// 0 binds an ephemeral port.
    pub port: u16,
    /// Shared secret expected in `x-cluster-secret` and sent to peers.
    pub cluster_secret: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 47470,
            cluster_secret: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub allocator: AllocatorKind,
    pub limit_bytes: usize,
    pub validate_batches: bool,
    pub check_schema_on_load: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            allocator: AllocatorKind::Accounting,
            limit_bytes: 1 << 30,
            validate_batches: false,
            check_schema_on_load: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Default flush timeout for producers built by the node.
    pub flush_timeout_ms: u64,
    pub relay_connect_timeout_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            flush_timeout_ms: 30_000,
            relay_connect_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

fn default_node_id() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "shardflight".to_string())
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // SHARDFLIGHT_SERVER__PORT, SHARDFLIGHT_MEMORY__LIMIT_BYTES, ...
        builder = builder.add_source(
            Environment::with_prefix("SHARDFLIGHT")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node.id.is_empty() {
            return Err(ConfigError::Message("node.id must not be empty".to_string()));
        }
        if self.node.id.len() > crate::ticket::MAX_ID_LEN {
            return Err(ConfigError::Message(format!(
                "node.id is longer than {} bytes",
                crate::ticket::MAX_ID_LEN
            )));
        }
        if self.stream.flush_timeout_ms == 0 {
            return Err(ConfigError::Message(
                "stream.flush_timeout_ms must be positive".to_string(),
            ));
        }
        if let Some(peer) = self.peers.keys().find(|id| **id == self.node.id) {
            return Err(ConfigError::Message(format!(
                "peers must not list the local node ({peer})"
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    #[must_use]
    pub const fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.stream.flush_timeout_ms)
    }

    #[must_use]
    pub const fn relay_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.stream.relay_connect_timeout_ms)
    }

    #[must_use]
    pub const fn delivery_options(&self) -> DeliveryOptions {
        DeliveryOptions {
            per_stream_limit: self.memory.limit_bytes,
            validate_batches: self.memory.validate_batches,
            check_schema_on_load: self.memory.check_schema_on_load,
        }
    }
}
