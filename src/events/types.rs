//! Session event types
//!
//! Defines all event types that can be broadcast through the event bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Session lifecycle events
///
/// Serialized as `{"event": "<name>", "data": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum SessionEvent {
    /// Peer connection negotiated and registered
    #[serde(rename = "session.created")]
    SessionCreated {
        session_id: String,
        /// Which bootstrap created it: "http" or "janus"
        origin: String,
        created_at: DateTime<Utc>,
    },

    /// Inbound track accepted and its pipeline started
    #[serde(rename = "track.started")]
    TrackStarted {
        session_id: String,
        track_id: String,
        /// Codec name, e.g. "h264"
        codec: String,
        payload_type: u8,
        ssrc: u32,
    },

    /// Track forwarder finished
    #[serde(rename = "track.ended")]
    TrackEnded {
        session_id: String,
        track_id: String,
        packets: u64,
        bytes: u64,
        /// Failure reason, None on a normal end
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Session torn down
    #[serde(rename = "session.closed")]
    SessionClosed { session_id: String, reason: String },
}

impl SessionEvent {
    /// Dotted event name, e.g. `track.ended`
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::SessionCreated { .. } => "session.created",
            Self::TrackStarted { .. } => "track.started",
            Self::TrackEnded { .. } => "track.ended",
            Self::SessionClosed { .. } => "session.closed",
        }
    }

    /// Session the event belongs to
    pub fn session_id(&self) -> &str {
        match self {
            Self::SessionCreated { session_id, .. }
            | Self::TrackStarted { session_id, .. }
            | Self::TrackEnded { session_id, .. }
            | Self::SessionClosed { session_id, .. } => session_id,
        }
    }
}
