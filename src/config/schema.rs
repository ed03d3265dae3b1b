use serde::{Deserialize, Serialize};

use crate::pipeline::BackpressurePolicy;

// Re-export WebRtcConfig from webrtc module
pub use crate::webrtc::config::{TurnServer, WebRtcConfig};

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Web server settings
    pub web: WebConfig,
    /// Peer connection settings
    pub webrtc: WebRtcConfig,
    /// Track forwarding settings
    pub forwarder: ForwarderConfig,
    /// Decoded output delivery settings
    pub delivery: DeliveryConfig,
    /// Janus subscriber settings
    pub janus: JanusConfig,
}

/// Web server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    /// HTTP port
    pub http_port: u16,
    /// Bind address
    pub bind_address: String,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            bind_address: "0.0.0.0".to_string(),
        }
    }
}

/// Track forwarder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwarderConfig {
    /// Size of the per-track RTP read buffer in bytes
    pub read_buffer_size: usize,
    /// Interval between Picture Loss Indications (ms)
    pub keyframe_interval_ms: u64,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: 1400,
            keyframe_interval_ms: 3000,
        }
    }
}

/// Decoded buffer delivery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Bounded queue capacity per track
    pub capacity: usize,
    /// Behaviour when the queue is full
    pub policy: BackpressurePolicy,
    /// Log decoded bytes instead of sizes
    pub dump_bytes: bool,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            capacity: 64,
            policy: BackpressurePolicy::default(),
            dump_bytes: false,
        }
    }
}

/// Janus VideoRoom subscriber configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JanusConfig {
    /// WebSocket endpoint of the Janus server
    pub url: String,
    /// VideoRoom room id
    pub room: u64,
    /// Publisher feed id to subscribe to
    pub feed: u64,
    /// Session keepalive interval (ms)
    pub keepalive_interval_ms: u64,
    /// Timeout for a single request/response exchange (ms)
    pub request_timeout_ms: u64,
}

impl Default for JanusConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8188/janus".to_string(),
            room: 1234,
            feed: 1,
            keepalive_interval_ms: 5000,
            request_timeout_ms: 10_000,
        }
    }
}
