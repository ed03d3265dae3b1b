//! Janus VideoRoom subscriber
//!
//! Talks to a Janus gateway over its WebSocket API, joins a room as a
//! subscriber to one feed and answers the offer Janus sends with a local
//! peer session. Media then flows through the same track forwarding path as
//! the HTTP signaling server.

pub mod client;
pub mod protocol;
pub mod subscriber;

pub use client::JanusClient;
pub use protocol::{HandleEvent, Reply, Request};
pub use subscriber::run_subscriber;

use thiserror::Error;

/// Janus errors
#[derive(Error, Debug)]
pub enum JanusError {
    #[error("Failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Connection to Janus closed")]
    Disconnected,

    #[error("No reply to {0} request in time")]
    Timeout(&'static str),

    #[error("Janus returned error {code}: {reason}")]
    Server { code: i64, reason: String },

    #[error("VideoRoom returned error {code}: {reason}")]
    Plugin { code: i64, reason: String },

    #[error("Unexpected reply: {0}")]
    Protocol(String),

    #[error("Keepalive failed: {0}")]
    Keepalive(String),

    #[error("Failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),
}
