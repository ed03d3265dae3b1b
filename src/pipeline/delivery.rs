//! Delivery of decoded buffers out of the native pipeline
//!
//! The appsink callback runs on a GStreamer streaming thread. It hands each
//! decoded buffer to a bounded channel whose behaviour when full is chosen
//! by [`BackpressurePolicy`]:
//!
//! ```text
//! appsink (streaming thread)
//!        |
//!        v  DeliverySender::deliver()
//!   bounded channel  -- Block:      wait for space (mpsc)
//!        |           -- DropOldest: overwrite oldest (broadcast ring)
//!        |           -- Error:      fail the sample (mpsc try_send)
//!        v
//! DeliveryReceiver::recv() (tokio task)
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

/// What the producer does when the delivery channel is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Stall the streaming thread until the consumer catches up
    Block,
    /// Keep the newest buffers and discard the oldest unread ones
    #[default]
    DropOldest,
    /// Fail the pipeline
    Error,
}

impl std::fmt::Display for BackpressurePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackpressurePolicy::Block => write!(f, "block"),
            BackpressurePolicy::DropOldest => write!(f, "drop_oldest"),
            BackpressurePolicy::Error => write!(f, "error"),
        }
    }
}

/// One decoded output unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedBuffer {
    /// Decoded bytes (owned copy, the native buffer is released after the callback)
    pub data: Bytes,
    /// Buffer duration if the decoder set one
    pub duration: Option<Duration>,
}

impl DecodedBuffer {
    pub fn new(data: impl Into<Bytes>, duration: Option<Duration>) -> Self {
        Self {
            data: data.into(),
            duration,
        }
    }
}

/// Reason a buffer could not be delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    /// Channel full under [`BackpressurePolicy::Error`]
    Full,
    /// Receiver dropped
    Closed,
}

/// Delivery counters shared by both ends
#[derive(Debug, Default)]
pub struct DeliveryStats {
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl DeliveryStats {
    /// Buffers handed to the consumer
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Buffers lost to backpressure
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

enum SenderInner {
    Queue {
        tx: mpsc::Sender<DecodedBuffer>,
        block: bool,
    },
    Ring(broadcast::Sender<DecodedBuffer>),
}

/// Producer half, owned by the appsink callback
pub struct DeliverySender {
    inner: SenderInner,
    stats: Arc<DeliveryStats>,
}

enum ReceiverInner {
    Queue(mpsc::Receiver<DecodedBuffer>),
    Ring(broadcast::Receiver<DecodedBuffer>),
}

/// Consumer half
pub struct DeliveryReceiver {
    inner: ReceiverInner,
    stats: Arc<DeliveryStats>,
}

/// Create a bounded delivery channel
pub fn delivery_channel(
    capacity: usize,
    policy: BackpressurePolicy,
) -> (DeliverySender, DeliveryReceiver) {
    let capacity = capacity.max(1);
    let stats = Arc::new(DeliveryStats::default());

    let (inner_tx, inner_rx) = match policy {
        BackpressurePolicy::Block | BackpressurePolicy::Error => {
            let (tx, rx) = mpsc::channel(capacity);
            (
                SenderInner::Queue {
                    tx,
                    block: policy == BackpressurePolicy::Block,
                },
                ReceiverInner::Queue(rx),
            )
        }
        BackpressurePolicy::DropOldest => {
            let (tx, rx) = broadcast::channel(capacity);
            (SenderInner::Ring(tx), ReceiverInner::Ring(rx))
        }
    };

    (
        DeliverySender {
            inner: inner_tx,
            stats: stats.clone(),
        },
        DeliveryReceiver {
            inner: inner_rx,
            stats,
        },
    )
}

impl DeliverySender {
    /// Hand one buffer to the consumer.
    ///
    /// Must not be called from a tokio worker under `Block`: it parks the
    /// calling thread.
    pub fn deliver(&self, buffer: DecodedBuffer) -> Result<(), DeliveryError> {
        match &self.inner {
            SenderInner::Queue { tx, block: true } => {
                tx.blocking_send(buffer).map_err(|_| DeliveryError::Closed)
            }
            SenderInner::Queue { tx, block: false } => tx.try_send(buffer).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    DeliveryError::Full
                }
                mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
            }),
            SenderInner::Ring(tx) => tx
                .send(buffer)
                .map(|_| ())
                .map_err(|_| DeliveryError::Closed),
        }
    }

    pub fn stats(&self) -> Arc<DeliveryStats> {
        self.stats.clone()
    }
}

impl DeliveryReceiver {
    /// Receive the next decoded buffer, `None` once the producer is gone
    pub async fn recv(&mut self) -> Option<DecodedBuffer> {
        let buffer = match &mut self.inner {
            ReceiverInner::Queue(rx) => rx.recv().await,
            ReceiverInner::Ring(rx) => loop {
                match rx.recv().await {
                    Ok(buffer) => break Some(buffer),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        self.stats.dropped.fetch_add(n, Ordering::Relaxed);
                        warn!("Decoded buffer consumer lagged, dropped {} oldest buffers", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break None,
                }
            },
        };

        if buffer.is_some() {
            self.stats.delivered.fetch_add(1, Ordering::Relaxed);
        }
        buffer
    }

    pub fn stats(&self) -> Arc<DeliveryStats> {
        self.stats.clone()
    }
}

/// Drain a delivery channel, logging every decoded buffer.
///
/// Returns the number of buffers consumed once the pipeline side closes.
pub async fn log_decoded_buffers(mut rx: DeliveryReceiver, label: String, dump_bytes: bool) -> u64 {
    let mut count: u64 = 0;

    while let Some(buffer) = rx.recv().await {
        count += 1;
        info!("[{}] {}", label, describe_buffer(count, &buffer, dump_bytes));
    }

    let stats = rx.stats();
    info!(
        "[{}] decoded buffer consumer finished ({} received, {} dropped)",
        label,
        count,
        stats.dropped()
    );
    count
}

/// One log line per decoded buffer: size and duration, plus the raw bytes
/// when `dump_bytes` is set
fn describe_buffer(index: u64, buffer: &DecodedBuffer, dump_bytes: bool) -> String {
    let mut line = format!(
        "decoded buffer #{}: {} bytes, duration {:?}",
        index,
        buffer.data.len(),
        buffer.duration
    );
    if dump_bytes {
        line.push_str(&format!(", data {:?}", buffer.data.as_ref()));
    }
    line
}
