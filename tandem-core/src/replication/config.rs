use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Replication configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Change feed entries requested per batch
    pub changes_limit: usize,

    /// Documents per bulk_get / bulk_docs request
    pub max_docs_per_request: usize,

    /// Estimated JSON bytes per bulk_docs request
    pub max_request_bytes: usize,

    /// Consecutive transport failures tolerated before a run errors
    pub max_consecutive_transport_failures: u32,

    /// Delay between transport retries in milliseconds
    pub retry_delay_ms: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            changes_limit: 500,
            max_docs_per_request: 50,
            max_request_bytes: 4 * 1024 * 1024, // 4MB
            max_consecutive_transport_failures: 3,
            retry_delay_ms: 250,
        }
    }
}

impl ReplicationConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.changes_limit == 0 {
            return Err("changes_limit must be greater than zero".to_string());
        }
        if self.max_docs_per_request == 0 {
            return Err("max_docs_per_request must be greater than zero".to_string());
        }
        if self.max_request_bytes == 0 {
            return Err("max_request_bytes must be greater than zero".to_string());
        }
        if self.max_consecutive_transport_failures == 0 {
            return Err("max_consecutive_transport_failures must be at least 1".to_string());
        }
        Ok(())
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn with_changes_limit(mut self, limit: usize) -> Self {
        self.changes_limit = limit;
        self
    }

    pub fn with_max_docs_per_request(mut self, max: usize) -> Self {
        self.max_docs_per_request = max;
        self
    }

    pub fn with_max_request_bytes(mut self, max: usize) -> Self {
        self.max_request_bytes = max;
        self
    }

    pub fn with_retry_delay_ms(mut self, delay_ms: u64) -> Self {
        self.retry_delay_ms = delay_ms;
        self
    }

    pub fn with_max_consecutive_transport_failures(mut self, max: u32) -> Self {
        self.max_consecutive_transport_failures = max;
        self
    }
}
