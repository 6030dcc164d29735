//! Configuration for hotrodkv
//!
//! Centralized configuration with sensible defaults.

use std::time::Duration;

/// Maximum ranged byte array accepted from a client (16 MB)
pub const DEFAULT_MAX_RANGED_BYTES: usize = 16 * 1024 * 1024;

/// Main configuration for a hotrodkv server instance
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Network Configuration
    // -------------------------------------------------------------------------
    /// TCP listen address
    pub listen_addr: String,

    /// Max concurrent client connections
    pub max_connections: usize,

    /// Connection read timeout (milliseconds, 0 disables it)
    pub read_timeout_ms: u64,

    /// Connection write timeout (milliseconds, 0 disables it)
    pub write_timeout_ms: u64,

    /// Frames queued for a connection's writer before it reports "not writable"
    pub write_queue_capacity: usize,

    // -------------------------------------------------------------------------
    // Worker Pool Configuration
    // -------------------------------------------------------------------------
    /// Threads executing cache operations
    pub worker_threads: usize,

    /// Pending operations before submitters block
    pub worker_queue_capacity: usize,

    // -------------------------------------------------------------------------
    // Protocol Limits
    // -------------------------------------------------------------------------
    /// Longest cache name accepted in a request header (bytes)
    pub max_cache_name_length: usize,

    /// Longest key, value or other ranged byte array accepted (bytes)
    pub max_ranged_bytes: usize,

    // -------------------------------------------------------------------------
    // Cache Configuration
    // -------------------------------------------------------------------------
    /// Cache used when a request names the empty cache
    pub default_cache_name: String,

    /// Name of this node in the cluster view
    pub node_name: String,

    /// Events buffered per client listener before new ones are dropped
    pub event_queue_capacity: usize,

    /// Iteration cursors untouched for this long are reaped (milliseconds)
    pub iteration_idle_timeout_ms: u64,

    /// Committed and rolled back transactions are remembered this long (milliseconds)
    pub completed_tx_retention_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:11222".to_string(),
            max_connections: 1024,
            read_timeout_ms: 0,
            write_timeout_ms: 5000,
            write_queue_capacity: 256,
            worker_threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            worker_queue_capacity: 1024,
            max_cache_name_length: 4096,
            max_ranged_bytes: DEFAULT_MAX_RANGED_BYTES,
            default_cache_name: "default".to_string(),
            node_name: "node-1".to_string(),
            event_queue_capacity: 100,
            iteration_idle_timeout_ms: 5 * 60 * 1000, // 5 minutes
            completed_tx_retention_ms: 5 * 60 * 1000,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    pub fn iteration_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.iteration_idle_timeout_ms)
    }

    pub fn completed_tx_retention(&self) -> Duration {
        Duration::from_millis(self.completed_tx_retention_ms)
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the TCP listen address
    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.listen_addr = addr.into();
        self
    }

    /// Set the maximum number of concurrent connections
    pub fn max_connections(mut self, count: usize) -> Self {
        self.config.max_connections = count;
        self
    }

    /// Set the read timeout (in milliseconds)
    pub fn read_timeout_ms(mut self, ms: u64) -> Self {
        self.config.read_timeout_ms = ms;
        self
    }

    /// Set the write timeout (in milliseconds)
    pub fn write_timeout_ms(mut self, ms: u64) -> Self {
        self.config.write_timeout_ms = ms;
        self
    }

    /// Set the per-connection write queue capacity (in frames)
    pub fn write_queue_capacity(mut self, frames: usize) -> Self {
        self.config.write_queue_capacity = frames.max(1);
        self
    }

    /// Set the number of worker threads
    pub fn worker_threads(mut self, threads: usize) -> Self {
        self.config.worker_threads = threads.max(1);
        self
    }

    /// Set the worker queue capacity
    pub fn worker_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.worker_queue_capacity = capacity.max(1);
        self
    }

    /// Set the maximum cache name length (in bytes)
    pub fn max_cache_name_length(mut self, len: usize) -> Self {
        self.config.max_cache_name_length = len;
        self
    }

    /// Set the maximum ranged byte array length (in bytes)
    pub fn max_ranged_bytes(mut self, len: usize) -> Self {
        self.config.max_ranged_bytes = len;
        self
    }

    /// Set the default cache name
    pub fn default_cache_name(mut self, name: impl Into<String>) -> Self {
        self.config.default_cache_name = name.into();
        self
    }

    /// Set the local node name
    pub fn node_name(mut self, name: impl Into<String>) -> Self {
        self.config.node_name = name.into();
        self
    }

    /// Set the per-listener event queue capacity
    pub fn event_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.event_queue_capacity = capacity.max(1);
        self
    }

    /// Set the iteration idle timeout (in milliseconds)
    pub fn iteration_idle_timeout_ms(mut self, ms: u64) -> Self {
        self.config.iteration_idle_timeout_ms = ms;
        self
    }

    /// Set how long completed transactions are remembered (in milliseconds)
    pub fn completed_tx_retention_ms(mut self, ms: u64) -> Self {
        self.config.completed_tx_retention_ms = ms;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
