//! GStreamer decode pipeline wrapper
//!
//! One [`Pipeline`] is built per inbound track. RTP packets go in through an
//! `appsrc`, the codec specific depayloader and `decodebin` run on
//! GStreamer's own streaming threads, and decoded buffers come out of an
//! `appsink` into a [`DeliverySender`].
//!
//! ```text
//! push(&[u8]) -> appsrc -> application/x-rtp -> rtpXXXdepay -> decodebin -> appsink
//!                                                                             |
//!                                                              DeliverySender (bounded)
//! ```

pub mod codec;
pub mod delivery;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use gst::prelude::*;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub use codec::Codec;
pub use delivery::{
    delivery_channel, log_decoded_buffers, BackpressurePolicy, DecodedBuffer, DeliveryError,
    DeliveryReceiver, DeliverySender, DeliveryStats,
};

/// Pipeline errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error("Unsupported codec: {0}")]
    UnsupportedCodec(String),

    #[error("GStreamer initialization failed: {0}")]
    Init(String),

    #[error("Failed to construct pipeline: {0}")]
    Construct(String),

    #[error("Pipeline element '{0}' missing or of unexpected type")]
    MissingElement(&'static str),

    #[error("State change failed: {0}")]
    StateChange(String),

    #[error("Pipeline is not running")]
    NotRunning,

    #[error("Buffer push refused: {0}")]
    Flow(String),

    #[error("Pipeline reported an error: {0}")]
    Native(String),
}

/// Lifecycle state of a [`Pipeline`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Constructed,
    Started,
    Stopped,
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineState::Constructed => write!(f, "constructed"),
            PipelineState::Started => write!(f, "started"),
            PipelineState::Stopped => write!(f, "stopped"),
        }
    }
}

/// A decode graph bound to a single codec
pub struct Pipeline {
    codec: Codec,
    payload_type: u8,
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
    state: Mutex<PipelineState>,
    /// First error posted on the bus, recorded from the streaming thread
    failure: Arc<Mutex<Option<String>>>,
}

impl Pipeline {
    /// Build a pipeline for `codec_name` (case-insensitive)
    pub fn new(
        payload_type: u8,
        codec_name: &str,
        delivery: DeliverySender,
    ) -> Result<Self, PipelineError> {
        let codec = Codec::from_name(payload_type, codec_name)?;
        Self::with_codec(payload_type, codec, delivery)
    }

    /// Build a pipeline for an already resolved codec
    pub fn with_codec(
        payload_type: u8,
        codec: Codec,
        delivery: DeliverySender,
    ) -> Result<Self, PipelineError> {
        Self::from_description(codec, payload_type, &codec.launch_description(), delivery)
    }

    fn from_description(
        codec: Codec,
        payload_type: u8,
        description: &str,
        delivery: DeliverySender,
    ) -> Result<Self, PipelineError> {
        gst::init().map_err(|e| PipelineError::Init(e.to_string()))?;

        debug!("Creating {} pipeline: {}", codec, description);

        let pipeline = gst::parse::launch(description)
            .map_err(|e| PipelineError::Construct(e.to_string()))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| PipelineError::Construct("description is not a pipeline".to_string()))?;

        let appsrc = pipeline
            .by_name(codec::SOURCE_NAME)
            .ok_or(PipelineError::MissingElement(codec::SOURCE_NAME))?
            .downcast::<gst_app::AppSrc>()
            .map_err(|_| PipelineError::MissingElement(codec::SOURCE_NAME))?;

        let appsink = pipeline
            .by_name(codec::SINK_NAME)
            .ok_or(PipelineError::MissingElement(codec::SINK_NAME))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| PipelineError::MissingElement(codec::SINK_NAME))?;

        let failure = Arc::new(Mutex::new(None));

        install_delivery(&appsink, delivery, failure.clone());

        let bus = pipeline
            .bus()
            .ok_or_else(|| PipelineError::Construct("pipeline has no bus".to_string()))?;
        let bus_failure = failure.clone();
        bus.set_sync_handler(move |_, msg| {
            match msg.view() {
                gst::MessageView::Error(err) => {
                    let source = err
                        .src()
                        .map(|s| s.path_string().to_string())
                        .unwrap_or_default();
                    let reason = format!("{} ({})", err.error(), source);
                    error!(
                        "Pipeline error from {}: {} {:?}",
                        source,
                        err.error(),
                        err.debug()
                    );
                    bus_failure.lock().get_or_insert(reason);
                }
                gst::MessageView::Warning(w) => {
                    warn!("Pipeline warning: {} {:?}", w.error(), w.debug());
                }
                gst::MessageView::Eos(_) => {
                    debug!("Pipeline reached end of stream");
                }
                _ => {}
            }
            gst::BusSyncReply::Drop
        });

        Ok(Self {
            codec,
            payload_type,
            pipeline,
            appsrc,
            state: Mutex::new(PipelineState::Constructed),
            failure,
        })
    }

    /// Transition the graph to Playing. Repeated calls are no-ops.
    pub fn start(&self) -> Result<(), PipelineError> {
        let mut state = self.state.lock();
        match *state {
            PipelineState::Started => return Ok(()),
            PipelineState::Stopped => {
                return Err(PipelineError::StateChange(
                    "pipeline has already been stopped".to_string(),
                ))
            }
            PipelineState::Constructed => {}
        }

        self.pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| PipelineError::StateChange(e.to_string()))?;
        *state = PipelineState::Started;

        info!("{} pipeline started", self.codec);
        Ok(())
    }

    /// Transition the graph to Null, releasing its native resources.
    /// Safe to call more than once.
    pub fn stop(&self) -> Result<(), PipelineError> {
        let mut state = self.state.lock();
        if *state == PipelineState::Stopped {
            return Ok(());
        }

        // Mark stopped first so no push can slip in even if teardown fails
        *state = PipelineState::Stopped;
        self.pipeline
            .set_state(gst::State::Null)
            .map_err(|e| PipelineError::StateChange(e.to_string()))?;

        info!("{} pipeline stopped", self.codec);
        Ok(())
    }

    /// Copy `data` into a new buffer and hand it to the ingestion point.
    ///
    /// The caller may reuse `data` as soon as this returns. Timestamps are
    /// assigned by appsrc on arrival.
    pub fn push(&self, data: &[u8]) -> Result<(), PipelineError> {
        if let Some(reason) = self.failure.lock().clone() {
            return Err(PipelineError::Native(reason));
        }

        let state = self.state.lock();
        if *state != PipelineState::Started {
            return Err(PipelineError::NotRunning);
        }

        let buffer = gst::Buffer::from_slice(data.to_vec());
        self.appsrc
            .push_buffer(buffer)
            .map(|_| ())
            .map_err(|e| PipelineError::Flow(format!("{:?}", e)))
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    pub fn payload_type(&self) -> u8 {
        self.payload_type
    }

    pub fn state(&self) -> PipelineState {
        *self.state.lock()
    }

    /// First native error reported by the graph, if any
    pub fn failure(&self) -> Option<String> {
        self.failure.lock().clone()
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if *self.state.get_mut() != PipelineState::Stopped {
            let _ = self.pipeline.set_state(gst::State::Null);
        }
    }
}

fn install_delivery(
    appsink: &gst_app::AppSink,
    delivery: DeliverySender,
    failure: Arc<Mutex<Option<String>>>,
) {
    appsink.set_callbacks(
        gst_app::AppSinkCallbacks::builder()
            .new_sample(move |appsink| {
                let sample = appsink.pull_sample().map_err(|_| gst::FlowError::Eos)?;
                let buffer = sample.buffer().ok_or(gst::FlowError::Error)?;
                let map = buffer.map_readable().map_err(|_| gst::FlowError::Error)?;

                let decoded = DecodedBuffer {
                    data: Bytes::copy_from_slice(map.as_slice()),
                    duration: buffer.duration().map(|d| Duration::from_nanos(d.nseconds())),
                };

                match delivery.deliver(decoded) {
                    Ok(()) => Ok(gst::FlowSuccess::Ok),
                    Err(DeliveryError::Full) => {
                        failure
                            .lock()
                            .get_or_insert_with(|| "decoded buffer queue full".to_string());
                        Err(gst::FlowError::Error)
                    }
                    Err(DeliveryError::Closed) => Err(gst::FlowError::Eos),
                }
            })
            .build(),
    );
}
