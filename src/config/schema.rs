//! Configuration schema definitions.
//!
//! This module defines the core keys every process reads. Adapter subtrees
//! (`log`, `stats`, `net.pubsub`, ...) are deserialized by the adapter that
//! owns them.

use serde::{Deserialize, Serialize};

/// Root keys of the process configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Node name tagged on logs and metrics.
    pub node: String,

    /// Service version tagged on logs and metrics.
    pub version: String,

    /// Install the OS signal translation layer.
    pub trap_signals: bool,

    /// Heartbeat period in seconds (0 disables the heartbeat job).
    pub heartbeat_secs: u64,

    /// Inbound request handling.
    pub request: RequestConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            node: "local".to_string(),
            version: "0.0.0".to_string(),
            trap_signals: true,
            heartbeat_secs: 10,
            request: RequestConfig::default(),
        }
    }
}

/// `[request]` settings shared by every inbound transport.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RequestConfig {
    /// Per-request deadline in milliseconds (0 = none).
    pub timeout_ms: u64,

    /// Honour inbound transit/shipment sideband data.
    pub allow_context: bool,

    /// Forward transit/shipments on outbound calls.
    pub propagate_context: bool,

    /// Let handler panics escape instead of answering 500.
    pub panic: bool,

    /// Maximum request body size.
    pub max_body_bytes: usize,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 0,
            allow_context: false,
            propagate_context: false,
            panic: false,
            max_body_bytes: 2 * 1024 * 1024,
        }
    }
}
