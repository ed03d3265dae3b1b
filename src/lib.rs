//! rtp-gst-bridge - forward inbound WebRTC media into GStreamer
//!
//! A browser (over `POST /doSignaling`) or a Janus VideoRoom subscription
//! negotiates a receive-only peer connection. Every remote track is read
//! packet by packet and pushed into a codec-specific GStreamer decode
//! pipeline, while a keyframe request is sent to the sender periodically.

pub mod config;
pub mod error;
pub mod events;
pub mod janus;
pub mod pipeline;
pub mod state;
pub mod web;
pub mod webrtc;

pub use error::{AppError, Result};
