use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::replication::ReplicationConfig;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TandemConfig {
    pub datastore: DatastoreSettings,
    pub replication: ReplicationConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatastoreSettings {
    /// Datastore name, part of its replication identifier
    pub name: String,
    /// Number of per-document lock stripes
    pub lock_stripes: usize,
}

impl Default for DatastoreSettings {
    fn default() -> Self {
        Self {
            name: "tandem".to_string(),
            lock_stripes: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is not set
    pub level: String,
    /// `text` or `json`
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

impl TandemConfig {
    /// Load configuration from YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: TandemConfig = serde_yaml::from_str(&content)?;
        config.validate().map_err(anyhow::Error::msg)?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.datastore.name.is_empty() {
            return Err("datastore.name must not be empty".to_string());
        }
        if self.datastore.lock_stripes == 0 {
            return Err("datastore.lock_stripes must be greater than zero".to_string());
        }
        if !matches!(self.logging.format.as_str(), "text" | "json") {
            return Err(format!(
                "logging.format must be text or json, got {}",
                self.logging.format
            ));
        }
        self.replication.validate()
    }
}
