use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::{error::Error, error::Result, thread_pool::DEFAULT_POOL_CAPACITY};

pub const DEFAULT_EVENTS_CAPACITY: usize = 1024;
pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 100;

/// Configuration for the connection engine and its server.
///
/// Controls the bind address, worker count, per-connection buffer sizes and
/// the admission limit. Use [`EngineConfig::builder`] for ergonomic
/// construction or [`EngineConfig::from_json`] to load it; missing JSON
/// fields take their defaults.
///
/// ## Resource limits
///
/// - `max_connections`: size of the connection pool; accepts beyond it are
///   refused rather than growing memory
/// - `scratch_size`: bytes moved per read/write syscall
/// - `send_buffer_limit` / `recv_buffer_limit`: ceilings of the per-connection
///   growable buffers
/// - `max_head_size`: largest HTTP request head accepted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Address to bind to
    pub address: SocketAddr,
    /// Number of worker threads
    pub workers: usize,
    /// Connections served at once
    pub max_connections: usize,
    pub scratch_size: usize,
    pub send_buffer_limit: usize,
    pub recv_buffer_limit: usize,
    pub max_head_size: usize,
    /// Enable TCP_NODELAY on accepted sockets
    pub no_delay: bool,
    /// Events handled per poll
    pub events_capacity: usize,
    pub poll_timeout_ms: u64,
    /// Accepts performed per listener readiness event before yielding
    pub accept_per_tick: usize,
}

impl EngineConfig {
    /// Create a new builder for EngineConfig
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::new()
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("workers", self.workers),
            ("max_connections", self.max_connections),
            ("scratch_size", self.scratch_size),
            ("send_buffer_limit", self.send_buffer_limit),
            ("recv_buffer_limit", self.recv_buffer_limit),
            ("max_head_size", self.max_head_size),
            ("events_capacity", self.events_capacity),
            ("accept_per_tick", self.accept_per_tick),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(Error::Config(format!("{name} must be greater than zero")));
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(DEFAULT_POOL_CAPACITY);
        Self {
            address: SocketAddr::from(([127, 0, 0, 1], 8080)),
            workers,
            max_connections: 1024,
            scratch_size: 8192,
            send_buffer_limit: 4 * 1024 * 1024,
            recv_buffer_limit: 4 * 1024 * 1024,
            max_head_size: 16 * 1024,
            no_delay: true,
            events_capacity: DEFAULT_EVENTS_CAPACITY,
            poll_timeout_ms: DEFAULT_POLL_TIMEOUT_MS,
            accept_per_tick: 64,
        }
    }
}

/// Builder for EngineConfig.
///
/// All fields are optional and fall back to EngineConfig::default().
#[derive(Debug, Default)]
pub struct EngineConfigBuilder {
    address: Option<SocketAddr>,
    workers: Option<usize>,
    max_connections: Option<usize>,
    scratch_size: Option<usize>,
    send_buffer_limit: Option<usize>,
    recv_buffer_limit: Option<usize>,
    max_head_size: Option<usize>,
    no_delay: Option<bool>,
    events_capacity: Option<usize>,
    poll_timeout_ms: Option<u64>,
    accept_per_tick: Option<usize>,
}

impl EngineConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn address(mut self, address: SocketAddr) -> Self {
        self.address = Some(address);
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = Some(max);
        self
    }

    pub fn scratch_size(mut self, size: usize) -> Self {
        self.scratch_size = Some(size);
        self
    }

    pub fn send_buffer_limit(mut self, limit: usize) -> Self {
        self.send_buffer_limit = Some(limit);
        self
    }

    pub fn recv_buffer_limit(mut self, limit: usize) -> Self {
        self.recv_buffer_limit = Some(limit);
        self
    }

    pub fn max_head_size(mut self, size: usize) -> Self {
        self.max_head_size = Some(size);
        self
    }

    /// Enable or disable TCP_NODELAY
    pub fn no_delay(mut self, enabled: bool) -> Self {
        self.no_delay = Some(enabled);
        self
    }

    pub fn events_capacity(mut self, capacity: usize) -> Self {
        self.events_capacity = Some(capacity);
        self
    }

    pub fn poll_timeout_ms(mut self, timeout: u64) -> Self {
        self.poll_timeout_ms = Some(timeout);
        self
    }

    pub fn accept_per_tick(mut self, accepts: usize) -> Self {
        self.accept_per_tick = Some(accepts);
        self
    }

    /// Build and validate the EngineConfig
    pub fn build(self) -> Result<EngineConfig> {
        let default = EngineConfig::default();
        let config = EngineConfig {
            address: self.address.unwrap_or(default.address),
            workers: self.workers.unwrap_or(default.workers),
            max_connections: self.max_connections.unwrap_or(default.max_connections),
            scratch_size: self.scratch_size.unwrap_or(default.scratch_size),
            send_buffer_limit: self.send_buffer_limit.unwrap_or(default.send_buffer_limit),
            recv_buffer_limit: self.recv_buffer_limit.unwrap_or(default.recv_buffer_limit),
            max_head_size: self.max_head_size.unwrap_or(default.max_head_size),
            no_delay: self.no_delay.unwrap_or(default.no_delay),
            events_capacity: self.events_capacity.unwrap_or(default.events_capacity),
            poll_timeout_ms: self.poll_timeout_ms.unwrap_or(default.poll_timeout_ms),
            accept_per_tick: self.accept_per_tick.unwrap_or(default.accept_per_tick),
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_builder_overrides_defaults() {
        let config = EngineConfig::builder()
            .workers(2)
            .max_connections(10)
            .no_delay(false)
            .build()
            .unwrap();
        assert_eq!(config.workers, 2);
        assert_eq!(config.max_connections, 10);
        assert!(!config.no_delay);
        assert_eq!(config.scratch_size, EngineConfig::default().scratch_size);
    }

    #[test]
    fn test_from_json_fills_missing_fields() {
        let config =
            EngineConfig::from_json(r#"{ "address": "0.0.0.0:9000", "workers": 3 }"#).unwrap();
        assert_eq!(config.address, "0.0.0.0:9000".parse().unwrap());
        assert_eq!(config.workers, 3);
        assert_eq!(config.max_head_size, 16 * 1024);
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        assert!(matches!(
            EngineConfig::from_json("{ workers: }"),
            Err(Error::Config(_))
        ));
    }

    #[rstest]
    #[case::workers(EngineConfig::builder().workers(0))]
    #[case::pool(EngineConfig::builder().max_connections(0))]
    #[case::scratch(EngineConfig::builder().scratch_size(0))]
    #[case::accepts(EngineConfig::builder().accept_per_tick(0))]
    fn test_zero_values_rejected(#[case] builder: EngineConfigBuilder) {
        assert!(matches!(builder.build(), Err(Error::Config(_))));
    }
}
