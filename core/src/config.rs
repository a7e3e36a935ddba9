/// Transfer engine configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// Per-session limits and timeouts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How long a task waits for its response once the write is acknowledged
    pub response_timeout_ms: u64,
    /// How long the transport may take to acknowledge a write
    pub write_timeout_ms: u64,
    /// Queued tasks beyond this are rejected
    pub max_pending_tasks: usize,
    /// Leftover bytes beyond this mean the stream is desynchronised
    pub max_buffered_bytes: usize,
    /// Capacity of the unsolicited event channel per subscriber
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: 5_000,
            write_timeout_ms: 3_000,
            max_pending_tasks: 32,
            max_buffered_bytes: 1024,
            event_capacity: 64,
        }
    }
}

impl EngineConfig {
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_max_pending_tasks(mut self, max: usize) -> Self {
        self.max_pending_tasks = max;
        self
    }

    pub fn with_max_buffered_bytes(mut self, max: usize) -> Self {
        self.max_buffered_bytes = max;
        self
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.response_timeout_ms == 0 {
            return Err(ConfigError::Zero("response_timeout_ms"));
        }
        if self.write_timeout_ms == 0 {
            return Err(ConfigError::Zero("write_timeout_ms"));
        }
        if self.max_pending_tasks == 0 {
            return Err(ConfigError::Zero("max_pending_tasks"));
        }
        if self.max_buffered_bytes == 0 {
            return Err(ConfigError::Zero("max_buffered_bytes"));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::Zero("event_capacity"));
        }
        Ok(())
    }
}
