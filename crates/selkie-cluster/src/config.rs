//! Configuration for the distributed runtime
//!
//! Explicit defaults, validation, reasonable limits.

use selkie_core::constants::{
    CONNECT_TIMEOUT_MS_DEFAULT, DRAIN_TIMEOUT_MS_DEFAULT, RPC_TIMEOUT_MS_DEFAULT,
    WORKERS_COUNT_MAX,
};
use selkie_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// Configuration for the routing host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// Address to bind for worker connections
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Maximum number of connected workers
    #[serde(default = "default_workers_count_max")]
    pub workers_count_max: usize,

    /// How long graceful shutdown waits for in-flight relays, in ms
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

fn default_bind_address() -> String {
    "127.0.0.1:7600".to_string()
}

fn default_workers_count_max() -> usize {
    WORKERS_COUNT_MAX
}

fn default_drain_timeout_ms() -> u64 {
    DRAIN_TIMEOUT_MS_DEFAULT
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            workers_count_max: default_workers_count_max(),
            drain_timeout_ms: default_drain_timeout_ms(),
        }
    }
}

impl HostConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if !self.bind_address.contains(':') {
            return Err(Error::InvalidConfiguration {
                field: "host.bind_address".into(),
                reason: "must be in host:port format".into(),
            });
        }
        if self.workers_count_max == 0 {
            return Err(Error::InvalidConfiguration {
                field: "host.workers_count_max".into(),
                reason: "must be positive".into(),
            });
        }
        if self.workers_count_max > WORKERS_COUNT_MAX {
            return Err(Error::InvalidConfiguration {
                field: "host.workers_count_max".into(),
                reason: format!("exceeds limit {}", WORKERS_COUNT_MAX),
            });
        }
        Ok(())
    }
}

/// Configuration for a worker process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Address of the routing host
    pub host_address: String,

    /// This worker's stable identifier
    pub worker_id: String,

    /// Timeout for connecting to the host, in ms
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Timeout for proxied RPC calls, in ms
    ///
    /// The runtime defines no implicit per-call timeouts; this bounds only
    /// the handshake round-trip at connect time.
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
}

fn default_connect_timeout_ms() -> u64 {
    CONNECT_TIMEOUT_MS_DEFAULT
}

fn default_rpc_timeout_ms() -> u64 {
    RPC_TIMEOUT_MS_DEFAULT
}

impl WorkerConfig {
    /// Create a config with defaults for the given host and worker id
    pub fn new(host_address: impl Into<String>, worker_id: impl Into<String>) -> Self {
        Self {
            host_address: host_address.into(),
            worker_id: worker_id.into(),
            connect_timeout_ms: default_connect_timeout_ms(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if !self.host_address.contains(':') {
            return Err(Error::InvalidConfiguration {
                field: "worker.host_address".into(),
                reason: "must be in host:port format".into(),
            });
        }
        if self.worker_id.is_empty() {
            return Err(Error::InvalidConfiguration {
                field: "worker.worker_id".into(),
                reason: "must not be empty".into(),
            });
        }
        if self.connect_timeout_ms == 0 {
            return Err(Error::InvalidConfiguration {
                field: "worker.connect_timeout_ms".into(),
                reason: "must be positive".into(),
            });
        }
        Ok(())
    }
}
