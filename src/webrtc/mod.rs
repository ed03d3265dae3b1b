//! WebRTC receiving side
//!
//! Architecture:
//! ```text
//! Browser / Janus  ---- SDP offer ---->  SessionManager::negotiate
//!        |                                     |
//!        |                                PeerSession (RTCPeerConnection)
//!        |                                     |
//!        +------ RTP ------> on_track -> run_track
//!                                          |        \
//!                               forward (read_rtp)   request_keyframes (PLI)
//!                                          |
//!                                      Pipeline (GStreamer)
//! ```

pub mod config;
pub mod forwarder;
pub mod peer;
pub mod session;
pub mod signaling;

pub use config::{CodecSet, TurnServer, WebRtcConfig};
pub use forwarder::{ForwardStats, KeyframeRequester, MediaSink, RtpSource, TrackInfo};
pub use peer::{MediaApi, PeerSession, SessionInfo, SessionOrigin};
pub use session::{SessionManager, TrackExit};
pub use signaling::{ConnectionState, SdpType, SessionDescription};
