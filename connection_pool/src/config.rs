use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Tunables shared by the pool process and the pool client. Every field has
/// a default suitable for production; tests shorten the timers.
#[derive(Clone, Debug, serde::Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct PoolConfig {
    /// Name under which this pool persists its inbound-stream cursor.
    pub pool_name: String,
    /// Address for the plain-text metrics endpoint, if any.
    pub metrics_address: Option<SocketAddr>,
    /// How long a blocking stream read waits before being treated as idle.
    pub command_block_timeout_ms: u64,
    /// Interval between stream trims.
    pub trim_interval_ms: u64,
    /// Retention target when trimming by length.
    pub trim_max_len: usize,
    /// Interval between heartbeat writes.
    pub heartbeat_interval_ms: u64,
    /// How long the pool waits for the bridge to answer a server PING before
    /// answering it itself.
    pub pong_timeout_ms: u64,
    /// How long a client waits for a connection-creation attempt overall.
    pub connection_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_name: "main".to_string(),
            metrics_address: None,
            command_block_timeout_ms: 10_000,
            trim_interval_ms: 30_000,
            trim_max_len: 100_000,
            heartbeat_interval_ms: 5_000,
            pong_timeout_ms: 10_000,
            connection_timeout_ms: 30_000,
        }
    }
}

impl PoolConfig {
    pub fn load_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        Ok(serde_json::from_reader(reader)?)
    }

    pub fn command_block_timeout(&self) -> Duration {
        Duration::from_millis(self.command_block_timeout_ms)
    }

    pub fn trim_interval(&self) -> Duration {
        Duration::from_millis(self.trim_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_millis(self.pong_timeout_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = PoolConfig::default();
        assert_eq!(config.command_block_timeout(), Duration::from_secs(10));
        assert_eq!(config.trim_max_len, 100_000);
        assert!(config.metrics_address.is_none());
    }

    #[test]
    fn partial_config_fills_defaults() {
        let config: PoolConfig =
            serde_json::from_str(r#"{ "pool-name": "alt", "trim-max-len": 500 }"#).unwrap();
        assert_eq!(config.pool_name, "alt");
        assert_eq!(config.trim_max_len, 500);
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(5));
    }
}
