//! Application configuration
//!
//! Settings come from an optional TOML file; every section and field has a
//! default so a partial file (or none at all) is valid. Command line flags
//! are applied on top by `main`.

mod schema;

pub use schema::*;

use std::path::Path;

use tracing::info;

use crate::error::{AppError, Result};

impl AppConfig {
    /// Load configuration from `path`, or the defaults when `None`
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                let text = tokio::fs::read_to_string(path).await.map_err(|e| {
                    AppError::Config(format!("Failed to read {}: {}", path.display(), e))
                })?;
                let config = Self::from_toml(&text)?;
                info!("Loaded configuration from {}", path.display());
                config
            }
            None => Self::default(),
        };

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| AppError::Config(format!("Invalid configuration: {}", e)))
    }

    /// Reject settings the runtime cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.forwarder.read_buffer_size == 0 {
            return Err(AppError::Config(
                "forwarder.read_buffer_size must be greater than 0".to_string(),
            ));
        }
        if self.forwarder.keyframe_interval_ms == 0 {
            return Err(AppError::Config(
                "forwarder.keyframe_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.delivery.capacity == 0 {
            return Err(AppError::Config(
                "delivery.capacity must be greater than 0".to_string(),
            ));
        }
        if self.webrtc.max_sessions == 0 {
            return Err(AppError::Config(
                "webrtc.max_sessions must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

impl JanusConfig {
    /// Checks that only matter when subscribing through Janus
    pub fn validate(&self) -> Result<()> {
        if self.keepalive_interval_ms == 0 {
            return Err(AppError::Config(
                "janus.keepalive_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.request_timeout_ms == 0 {
            return Err(AppError::Config(
                "janus.request_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if !(self.url.starts_with("ws://") || self.url.starts_with("wss://")) {
            return Err(AppError::Config(format!(
                "janus.url must be a ws:// or wss:// URL, got {}",
                self.url
            )));
        }
        Ok(())
    }
}
