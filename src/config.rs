//! Configuration for slotmux

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Proxy port (inference traffic)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Management API port (agent registration)
    #[serde(default = "default_management_port")]
    pub management_port: u16,

    /// Metrics port (0 to disable)
    #[serde(default)]
    pub metrics_port: u16,

    /// Maximum number of requests parked in the admission buffer
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,

    /// How long a buffered request may wait for a free slot
    #[serde(default = "default_buffer_timeout_secs")]
    pub buffer_timeout_secs: u64,

    /// Buffer drain cycle interval
    #[serde(default = "default_drain_interval_ms")]
    pub drain_interval_ms: u64,

    /// Temporal manager tick interval
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Ticks a target survives without reporting before eviction
    #[serde(default = "default_liveness_ticks")]
    pub liveness_ticks: i64,
}

fn default_port() -> u16 {
    8080
}

fn default_management_port() -> u16 {
    8085
}

fn default_buffer_capacity() -> usize {
    32
}

fn default_buffer_timeout_secs() -> u64 {
    30
}

fn default_drain_interval_ms() -> u64 {
    1000
}

fn default_tick_interval_ms() -> u64 {
    1000
}

fn default_liveness_ticks() -> i64 {
    3
}

impl Default for Config {
    fn default() -> Self {
        serde_json::from_str("{}").expect("default config is valid")
    }
}

impl Config {
    pub async fn from_file(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Config = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(config)
    }

    pub fn buffer_timeout(&self) -> Duration {
        Duration::from_secs(self.buffer_timeout_secs)
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}
