//! Track forwarding
//!
//! Per inbound track two loops run side by side:
//!
//! ```text
//! TrackRemote --read_rtp--> [read buffer] --push--> Pipeline (appsrc)
//!
//! interval(3s) --PLI(media_ssrc)--> RTCPeerConnection::write_rtcp
//! ```
//!
//! The packet loop ends when the track closes, the pipeline refuses a
//! buffer, or the track's cancellation token fires. The keyframe loop only
//! ends on cancellation, which the packet loop triggers on its way out.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::track::track_remote::TrackRemote;
use webrtc::util::{Marshal, MarshalSize};

use crate::config::{DeliveryConfig, ForwarderConfig};
use crate::error::{AppError, Result};
use crate::pipeline::{delivery_channel, log_decoded_buffers, Codec, Pipeline, PipelineError};

/// Why a packet read did not produce data
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReadError {
    /// Track ended (EOF or transport closed)
    #[error("track closed")]
    Closed,
    #[error("{0}")]
    Failed(String),
}

/// Source of raw RTP packets
#[async_trait]
pub trait RtpSource: Send + Sync {
    /// Read one packet into `buf`, returning the number of bytes written.
    /// A zero-length read carries no packet.
    async fn read_packet(&self, buf: &mut [u8]) -> std::result::Result<usize, ReadError>;
}

/// Consumer of raw RTP packets
pub trait MediaSink: Send + Sync {
    fn push(&self, data: &[u8]) -> std::result::Result<(), PipelineError>;
}

/// Something that can ask the remote sender for a keyframe
#[async_trait]
pub trait KeyframeRequester: Send + Sync {
    async fn request_keyframe(&self, media_ssrc: u32) -> Result<()>;
}

#[async_trait]
impl RtpSource for TrackRemote {
    async fn read_packet(&self, buf: &mut [u8]) -> std::result::Result<usize, ReadError> {
        let (packet, _) = self.read_rtp().await.map_err(classify_read_error)?;

        let size = packet.marshal_size();
        if size > buf.len() {
            warn!(
                "Dropping {} byte RTP packet on track {}: read buffer is {} bytes",
                size,
                self.id(),
                buf.len()
            );
            return Ok(0);
        }

        packet
            .marshal_to(buf)
            .map_err(|e| ReadError::Failed(format!("marshal failed: {}", e)))
    }
}

impl MediaSink for Pipeline {
    fn push(&self, data: &[u8]) -> std::result::Result<(), PipelineError> {
        Pipeline::push(self, data)
    }
}

#[async_trait]
impl KeyframeRequester for RTCPeerConnection {
    async fn request_keyframe(&self, media_ssrc: u32) -> Result<()> {
        let pli = PictureLossIndication {
            sender_ssrc: 0,
            media_ssrc,
        };
        let packets: Vec<Box<dyn webrtc::rtcp::packet::Packet + Send + Sync>> = vec![Box::new(pli)];

        self.write_rtcp(&packets)
            .await
            .map(|_| ())
            .map_err(|e| AppError::WebRtcError(format!("Failed to send PLI: {}", e)))
    }
}

fn classify_read_error(e: webrtc::Error) -> ReadError {
    if is_track_closed(&e) {
        ReadError::Closed
    } else {
        ReadError::Failed(e.to_string())
    }
}

/// Errors that mean the track or its transport ended
fn is_track_closed(e: &webrtc::Error) -> bool {
    use webrtc::interceptor;

    match e {
        webrtc::Error::ErrClosedPipe | webrtc::Error::ErrConnectionClosed => true,
        webrtc::Error::Util(e) => is_util_closed(e),
        webrtc::Error::Srtp(e) => is_srtp_closed(e),
        webrtc::Error::Interceptor(interceptor::Error::ErrIoEOF) => true,
        webrtc::Error::Interceptor(interceptor::Error::Util(e)) => is_util_closed(e),
        webrtc::Error::Interceptor(interceptor::Error::Srtp(e)) => is_srtp_closed(e),
        _ => false,
    }
}

fn is_srtp_closed(e: &webrtc::srtp::Error) -> bool {
    use webrtc::srtp::Error;

    match e {
        Error::SessionEof | Error::ErrStreamAlreadyClosed | Error::SessionSrtpAlreadyClosed => true,
        Error::Util(e) => is_util_closed(e),
        _ => false,
    }
}

fn is_util_closed(e: &webrtc::util::Error) -> bool {
    use webrtc::util::Error;

    match e {
        Error::ErrBufferClosed | Error::ErrUseClosedNetworkConn | Error::ErrAlreadyClosed => true,
        Error::Io(io) => io.0.kind() == std::io::ErrorKind::UnexpectedEof,
        _ => false,
    }
}

/// Identity of an inbound track
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackInfo {
    pub id: String,
    pub ssrc: u32,
    pub payload_type: u8,
    /// e.g. `video/H264`
    pub mime_type: String,
}

impl TrackInfo {
    pub fn from_remote(track: &TrackRemote) -> Self {
        Self {
            id: track.id(),
            ssrc: track.ssrc(),
            payload_type: track.payload_type(),
            mime_type: track.codec().capability.mime_type,
        }
    }
}

/// Counters reported when a track ends
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForwardStats {
    /// Packets pushed into the pipeline
    pub packets: u64,
    /// Bytes pushed into the pipeline
    pub bytes: u64,
    /// Reads that carried nothing
    pub empty_reads: u64,
    /// Keyframe requests attempted
    pub keyframe_requests: u64,
}

/// Forward packets from `source` into `sink` until the source closes, the
/// sink fails, or `cancel` fires.
pub async fn forward<S, K>(
    source: &S,
    sink: &K,
    buffer_size: usize,
    cancel: &CancellationToken,
) -> Result<ForwardStats>
where
    S: RtpSource + ?Sized,
    K: MediaSink + ?Sized,
{
    let mut buf = vec![0u8; buffer_size];
    let mut stats = ForwardStats::default();

    loop {
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Forwarder cancelled after {} packets", stats.packets);
                return Ok(stats);
            }
            read = source.read_packet(&mut buf) => read,
        };

        match read {
            Ok(0) => stats.empty_reads += 1,
            Ok(n) => {
                sink.push(&buf[..n])?;
                stats.packets += 1;
                stats.bytes += n as u64;
            }
            Err(ReadError::Closed) => {
                debug!("Track closed after {} packets", stats.packets);
                return Ok(stats);
            }
            Err(ReadError::Failed(reason)) => {
                return Err(AppError::WebRtcError(format!("Track read failed: {}", reason)));
            }
        }
    }
}

/// Send a keyframe request for `media_ssrc` every `period` until `cancel`
/// fires. The first request goes out one period after the call. Returns the
/// number of requests attempted.
pub async fn request_keyframes<K>(
    requester: &K,
    media_ssrc: u32,
    period: Duration,
    cancel: &CancellationToken,
) -> u64
where
    K: KeyframeRequester + ?Sized,
{
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut attempts = 0;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                attempts += 1;
                if let Err(e) = requester.request_keyframe(media_ssrc).await {
                    warn!("Keyframe request for SSRC {} failed: {}", media_ssrc, e);
                }
            }
        }
    }

    attempts
}

/// Run one inbound track to completion: build and start its pipeline, drive
/// the packet and keyframe loops, and tear the pipeline down afterwards.
///
/// `on_started` runs once the pipeline is playing, and never if the codec is
/// unknown or the pipeline could not be built or started.
#[allow(clippy::too_many_arguments)]
pub async fn run_track<S, K, F>(
    label: &str,
    info: &TrackInfo,
    source: &S,
    requester: Arc<K>,
    forwarder: &ForwarderConfig,
    delivery: &DeliveryConfig,
    cancel: CancellationToken,
    on_started: F,
) -> Result<ForwardStats>
where
    S: RtpSource + ?Sized,
    K: KeyframeRequester + ?Sized + 'static,
    F: FnOnce(Codec),
{
    // Ends the keyframe loop on every exit path
    let _guard = cancel.clone().drop_guard();

    let codec = Codec::from_mime_type(info.payload_type, &info.mime_type)?;
    info!(
        "[{}] Track {} has started, of type {}: {}",
        label, info.id, info.payload_type, codec
    );

    let keyframes = {
        let cancel = cancel.clone();
        let period = Duration::from_millis(forwarder.keyframe_interval_ms);
        let ssrc = info.ssrc;
        tokio::spawn(async move { request_keyframes(&*requester, ssrc, period, &cancel).await })
    };

    let (tx, rx) = delivery_channel(delivery.capacity, delivery.policy);
    let pipeline = Pipeline::with_codec(info.payload_type, codec, tx)?;
    pipeline.start()?;
    on_started(codec);

    tokio::spawn(log_decoded_buffers(
        rx,
        format!("{}/{}", label, codec.name()),
        delivery.dump_bytes,
    ));

    let result = forward(source, &pipeline, forwarder.read_buffer_size, &cancel).await;

    cancel.cancel();
    if let Err(e) = pipeline.stop() {
        warn!("[{}] Failed to stop {} pipeline: {}", label, codec, e);
    }
    drop(pipeline);

    let keyframe_requests = keyframes.await.unwrap_or_default();

    result.map(|stats| ForwardStats {
        keyframe_requests,
        ..stats
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Source replaying a fixed script, then reporting closed
    struct ScriptedSource {
        script: Mutex<VecDeque<std::result::Result<Vec<u8>, ReadError>>>,
    }

    impl ScriptedSource {
        fn new(script: Vec<std::result::Result<Vec<u8>, ReadError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
            }
        }
    }

    #[async_trait]
    impl RtpSource for ScriptedSource {
        async fn read_packet(&self, buf: &mut [u8]) -> std::result::Result<usize, ReadError> {
            match self.script.lock().pop_front() {
                Some(Ok(data)) => {
                    buf[..data.len()].copy_from_slice(&data);
                    Ok(data.len())
                }
                Some(Err(e)) => Err(e),
                None => Err(ReadError::Closed),
            }
        }
    }

    /// Source that never yields
    struct SilentSource;

    #[async_trait]
    impl RtpSource for SilentSource {
        async fn read_packet(&self, _buf: &mut [u8]) -> std::result::Result<usize, ReadError> {
            std::future::pending().await
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        pushed: Mutex<Vec<Vec<u8>>>,
        fail_after: Option<usize>,
    }

    impl MediaSink for RecordingSink {
        fn push(&self, data: &[u8]) -> std::result::Result<(), PipelineError> {
            let mut pushed = self.pushed.lock();
            if self.fail_after == Some(pushed.len()) {
                return Err(PipelineError::NotRunning);
            }
            pushed.push(data.to_vec());
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingRequester {
        calls: AtomicU64,
        fail: bool,
    }

    #[async_trait]
    impl KeyframeRequester for CountingRequester {
        async fn request_keyframe(&self, media_ssrc: u32) -> Result<()> {
            assert_eq!(media_ssrc, 0xdead_beef);
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(AppError::WebRtcError("transport closed".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn test_forward_pushes_non_empty_reads_in_order() {
        let source = ScriptedSource::new(vec![
            Ok(vec![1, 1]),
            Ok(vec![]),
            Ok(vec![2, 2, 2]),
            Ok(vec![3]),
        ]);
        let sink = RecordingSink::default();

        let stats = forward(&source, &sink, 1400, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(*sink.pushed.lock(), vec![vec![1, 1], vec![2, 2, 2], vec![3]]);
        assert_eq!(stats.packets, 3);
        assert_eq!(stats.bytes, 6);
        assert_eq!(stats.empty_reads, 1);
    }

    #[tokio::test]
    async fn test_forward_stops_on_read_failure() {
        let source = ScriptedSource::new(vec![
            Ok(vec![1]),
            Err(ReadError::Failed("srtp auth failed".to_string())),
            Ok(vec![2]),
        ]);
        let sink = RecordingSink::default();

        let err = forward(&source, &sink, 1400, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::WebRtcError(_)));
        assert_eq!(sink.pushed.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_forward_stops_on_sink_failure() {
        let source = ScriptedSource::new(vec![Ok(vec![1]), Ok(vec![2]), Ok(vec![3])]);
        let sink = RecordingSink {
            fail_after: Some(1),
            ..Default::default()
        };

        let err = forward(&source, &sink, 1400, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::Pipeline(PipelineError::NotRunning)));
        assert_eq!(*sink.pushed.lock(), vec![vec![1]]);
    }

    #[tokio::test]
    async fn test_forward_honours_cancellation() {
        let cancel = CancellationToken::new();
        let sink = RecordingSink::default();

        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move { forward(&SilentSource, &sink, 1400, &cancel).await })
        };
        cancel.cancel();

        let stats = task.await.unwrap().unwrap();
        assert_eq!(stats, ForwardStats::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keyframe_loop_one_request_per_interval() {
        let requester = Arc::new(CountingRequester::default());
        let cancel = CancellationToken::new();

        let task = {
            let requester = requester.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                request_keyframes(&*requester, 0xdead_beef, Duration::from_secs(3), &cancel).await
            })
        };

        tokio::time::sleep(Duration::from_millis(2_900)).await;
        assert_eq!(requester.calls.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(6_600)).await;
        cancel.cancel();

        assert_eq!(task.await.unwrap(), 3);
        assert_eq!(requester.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keyframe_loop_continues_after_failures() {
        let requester = Arc::new(CountingRequester {
            fail: true,
            ..Default::default()
        });
        let cancel = CancellationToken::new();

        let task = {
            let requester = requester.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                request_keyframes(&*requester, 0xdead_beef, Duration::from_secs(3), &cancel).await
            })
        };

        tokio::time::sleep(Duration::from_millis(12_500)).await;
        cancel.cancel();

        assert_eq!(task.await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_run_track_rejects_unknown_codec() {
        let info = TrackInfo {
            id: "video0".to_string(),
            ssrc: 0xdead_beef,
            payload_type: 45,
            mime_type: "video/AV1".to_string(),
        };
        let requester = Arc::new(CountingRequester::default());
        let cancel = CancellationToken::new();
        let mut started = false;

        let err = run_track(
            "test",
            &info,
            &SilentSource,
            requester.clone(),
            &ForwarderConfig::default(),
            &DeliveryConfig::default(),
            cancel.clone(),
            |_| started = true,
        )
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            AppError::Pipeline(PipelineError::UnsupportedCodec(ref name)) if name == "AV1"
        ));
        assert!(cancel.is_cancelled());
        assert_eq!(requester.calls.load(Ordering::SeqCst), 0);
        assert!(!started);
    }

    #[tokio::test]
    async fn test_run_track_reports_start_after_pipeline_plays() {
        let ready = gst::init().is_ok()
            && ["appsrc", "appsink", "decodebin", "rtpvp8depay"]
                .iter()
                .all(|name| gst::ElementFactory::find(name).is_some());
        if !ready {
            eprintln!("skipping test_run_track_reports_start_after_pipeline_plays: no VP8 depayloader");
            return;
        }
        let info = TrackInfo {
            id: "video0".to_string(),
            ssrc: 0xdead_beef,
            payload_type: 100,
            mime_type: "video/VP8".to_string(),
        };
        let source = ScriptedSource::new(vec![]);
        let mut started = Vec::new();

        let stats = run_track(
            "test",
            &info,
            &source,
            Arc::new(CountingRequester::default()),
            &ForwarderConfig::default(),
            &DeliveryConfig::default(),
            CancellationToken::new(),
            |codec| started.push(codec),
        )
        .await
        .unwrap();

        assert_eq!(started, vec![Codec::Vp8 { payload_type: 100 }]);
        assert_eq!(stats.packets, 0);
    }

    #[test]
    fn test_closed_transport_errors_end_the_track() {
        use webrtc::{interceptor, srtp, util};

        for e in [
            webrtc::Error::ErrClosedPipe,
            webrtc::Error::ErrConnectionClosed,
            webrtc::Error::Interceptor(interceptor::Error::ErrIoEOF),
            webrtc::Error::Util(util::Error::ErrBufferClosed),
            webrtc::Error::Srtp(srtp::Error::SessionEof),
            webrtc::Error::Srtp(srtp::Error::Util(util::Error::ErrUseClosedNetworkConn)),
        ] {
            let text = e.to_string();
            assert!(
                matches!(classify_read_error(e), ReadError::Closed),
                "{} should end the track",
                text
            );
        }
    }

    #[test]
    fn test_other_read_errors_fail_the_track() {
        use webrtc::interceptor;

        // Messages mentioning "closed" or "eof" are not enough on their own
        for e in [
            webrtc::Error::new("stream closed by a misbehaving peer".to_string()),
            webrtc::Error::Interceptor(interceptor::Error::Other("eof marker".to_string())),
            webrtc::Error::ErrUnknownType,
        ] {
            match classify_read_error(e) {
                ReadError::Failed(reason) => assert!(!reason.is_empty()),
                ReadError::Closed => panic!("read error treated as a clean close"),
            }
        }
    }
}
