//! Engine configuration
//!
//! Deserializable settings with validated defaults. Embedders construct an
//! [`EngineConfig`] directly, or load one from JSON produced by whatever
//! configuration surface hosts the engine.

use serde::{Deserialize, Serialize};

use crate::types::{EngineError, Result};

/// Configuration for the load engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum concurrent connections; the request queue holds twice this
    pub max_connections: usize,

    /// Number of worker tasks draining the request queue
    pub worker_count: usize,

    /// Default per-request timeout in milliseconds (requests may override)
    pub request_timeout_ms: u64,

    /// TCP connection registry capacity
    pub tcp_registry_capacity: usize,

    /// UDP endpoint registry capacity
    pub udp_registry_capacity: usize,

    /// MQTT connection registry capacity
    pub mqtt_registry_capacity: usize,

    /// WebSocket context registry capacity
    pub websocket_registry_capacity: usize,

    /// Database connection registry capacity
    pub database_registry_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_connections: 100,
            worker_count: 4,
            request_timeout_ms: 30_000,
            tcp_registry_capacity: 100,
            udp_registry_capacity: 100,
            mqtt_registry_capacity: 50,
            websocket_registry_capacity: 1000,
            database_registry_capacity: 100,
        }
    }
}

impl EngineConfig {
    /// Convenience constructor mirroring the engine's two load-bearing knobs
    pub fn new(max_connections: usize, worker_count: usize) -> Self {
        Self {
            max_connections,
            worker_count,
            ..Self::default()
        }
    }

    /// Load a configuration from a JSON document
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| EngineError::Config(format!("bad config JSON: {e}")))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(EngineError::Config(
                "max_connections must be positive".into(),
            ));
        }
        if self.worker_count == 0 {
            return Err(EngineError::Config("worker_count must be positive".into()));
        }
        Ok(())
    }

    /// Request queue capacity: two slots per allowed connection
    pub fn queue_capacity(&self) -> usize {
        self.max_connections * 2
    }
}
