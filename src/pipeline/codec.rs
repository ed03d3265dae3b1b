//! Codec selection for decode pipelines
//!
//! Each supported codec maps to one GStreamer launch description. Only VP8
//! and Opus carry the negotiated payload type, since their depayloaders need
//! the dynamic RTP mapping in the caps.

use std::fmt;

use super::PipelineError;

/// Ingestion point shared by every graph: a live appsrc that timestamps
/// buffers on arrival.
const SOURCE_PREFIX: &str =
    "appsrc format=time is-live=true do-timestamp=true name=src ! application/x-rtp";

/// Sink shared by every graph.
const SINK_SUFFIX: &str = "decodebin ! appsink name=sink";

/// Name of the appsrc element in every description
pub const SOURCE_NAME: &str = "src";
/// Name of the appsink element in every description
pub const SINK_NAME: &str = "sink";

/// Codec of an inbound track
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Vp8 { payload_type: u8 },
    Opus { payload_type: u8 },
    Vp9,
    H264,
    G722,
}

impl Codec {
    /// Resolve a codec from its name (case-insensitive)
    pub fn from_name(payload_type: u8, name: &str) -> Result<Self, PipelineError> {
        match name.trim().to_ascii_lowercase().as_str() {
            "vp8" => Ok(Self::Vp8 { payload_type }),
            "opus" => Ok(Self::Opus { payload_type }),
            "vp9" => Ok(Self::Vp9),
            "h264" => Ok(Self::H264),
            "g722" => Ok(Self::G722),
            _ => Err(PipelineError::UnsupportedCodec(name.to_string())),
        }
    }

    /// Resolve a codec from an RTP mime type such as `video/H264`
    pub fn from_mime_type(payload_type: u8, mime_type: &str) -> Result<Self, PipelineError> {
        let name = mime_type
            .split_once('/')
            .map(|(_, subtype)| subtype)
            .unwrap_or(mime_type);
        Self::from_name(payload_type, name)
    }

    /// Lowercase codec name
    pub fn name(&self) -> &'static str {
        match self {
            Codec::Vp8 { .. } => "vp8",
            Codec::Opus { .. } => "opus",
            Codec::Vp9 => "vp9",
            Codec::H264 => "h264",
            Codec::G722 => "g722",
        }
    }

    /// RTP depayloader element for this codec
    pub fn depayloader(&self) -> &'static str {
        match self {
            Codec::Vp8 { .. } => "rtpvp8depay",
            Codec::Opus { .. } => "rtpopusdepay",
            Codec::Vp9 => "rtpvp9depay",
            Codec::H264 => "rtph264depay",
            Codec::G722 => "rtpg722depay",
        }
    }

    /// Extra caps fields appended after `application/x-rtp`
    fn caps_fields(&self) -> String {
        match self {
            Codec::Vp8 { payload_type } => {
                format!(", payload={}, encoding-name=VP8-DRAFT-IETF-01", payload_type)
            }
            Codec::Opus { payload_type } => {
                format!(", payload={}, encoding-name=OPUS", payload_type)
            }
            Codec::G722 => ", clock-rate=8000".to_string(),
            Codec::Vp9 | Codec::H264 => String::new(),
        }
    }

    /// Full `gst-launch` style description of the decode graph
    pub fn launch_description(&self) -> String {
        format!(
            "{}{} ! {} ! {}",
            SOURCE_PREFIX,
            self.caps_fields(),
            self.depayloader(),
            SINK_SUFFIX
        )
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Codec::Vp8 { payload_type } => write!(f, "VP8 (pt {})", payload_type),
            Codec::Opus { payload_type } => write!(f, "Opus (pt {})", payload_type),
            Codec::Vp9 => write!(f, "VP9"),
            Codec::H264 => write!(f, "H.264"),
            Codec::G722 => write!(f, "G.722"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_name_case_insensitive() {
        assert_eq!(Codec::from_name(96, "H264").unwrap(), Codec::H264);
        assert_eq!(Codec::from_name(96, "h264").unwrap(), Codec::H264);
        assert_eq!(
            Codec::from_name(100, "Vp8").unwrap(),
            Codec::Vp8 { payload_type: 100 }
        );
        assert_eq!(
            Codec::from_name(111, "OPUS").unwrap(),
            Codec::Opus { payload_type: 111 }
        );
        assert_eq!(Codec::from_name(98, "vP9").unwrap(), Codec::Vp9);
        assert_eq!(Codec::from_name(9, "G722").unwrap(), Codec::G722);
    }

    #[test]
    fn test_unknown_codec_rejected() {
        for name in ["unknown", "av1", "", "h265", "pcmu"] {
            match Codec::from_name(96, name) {
                Err(PipelineError::UnsupportedCodec(n)) => assert_eq!(n, name),
                other => panic!("expected UnsupportedCodec for {:?}, got {:?}", name, other),
            }
        }
    }

    #[test]
    fn test_from_mime_type() {
        assert_eq!(Codec::from_mime_type(96, "video/H264").unwrap(), Codec::H264);
        assert_eq!(
            Codec::from_mime_type(111, "audio/opus").unwrap(),
            Codec::Opus { payload_type: 111 }
        );
        assert!(Codec::from_mime_type(96, "video/AV1").is_err());
    }

    #[test]
    fn test_descriptions_select_depayloader() {
        let cases = [
            ("vp8", "rtpvp8depay"),
            ("opus", "rtpopusdepay"),
            ("vp9", "rtpvp9depay"),
            ("h264", "rtph264depay"),
            ("g722", "rtpg722depay"),
        ];
        for (name, depay) in cases {
            let desc = Codec::from_name(96, name).unwrap().launch_description();
            assert!(desc.starts_with(SOURCE_PREFIX), "{}", desc);
            assert!(desc.contains(&format!("! {} !", depay)), "{}", desc);
            assert!(desc.ends_with("decodebin ! appsink name=sink"), "{}", desc);
        }
    }

    #[test]
    fn test_payload_type_only_where_needed() {
        let vp8 = Codec::from_name(101, "vp8").unwrap().launch_description();
        assert!(vp8.contains("payload=101"));
        assert!(vp8.contains("encoding-name=VP8-DRAFT-IETF-01"));

        let opus = Codec::from_name(111, "opus").unwrap().launch_description();
        assert!(opus.contains("payload=111"));
        assert!(opus.contains("encoding-name=OPUS"));

        let h264 = Codec::from_name(96, "h264").unwrap().launch_description();
        assert!(!h264.contains("payload="));

        let g722 = Codec::from_name(9, "g722").unwrap().launch_description();
        assert!(g722.contains("clock-rate=8000"));
        assert!(!g722.contains("payload="));
    }
}
