//! Event system for session lifecycle notifications
//!
//! A process-wide event bus broadcasting session and track events to any
//! interested subscriber, such as the Janus subscriber watching its own
//! peer session.

pub mod types;

pub use types::SessionEvent;

use tokio::sync::broadcast;
use tracing::trace;

/// Event channel capacity (ring buffer size)
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Broadcast bus for [`SessionEvent`]s. Subscribers only see events
/// published after they subscribed.
///
/// ```
/// use rtp_gst_bridge::events::{EventBus, SessionEvent};
///
/// let bus = EventBus::new();
/// let mut rx = bus.subscribe();
/// bus.publish(SessionEvent::SessionClosed {
///     session_id: "abc".to_string(),
///     reason: "hangup".to_string(),
/// });
/// assert_eq!(rx.try_recv().unwrap().event_name(), "session.closed");
/// ```
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    /// Create a new event bus
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event to all subscribers
    ///
    /// If there are no active subscribers, the event is silently dropped.
    pub fn publish(&self, event: SessionEvent) {
        trace!("Publishing {} for {}", event.event_name(), event.session_id());
        let _ = self.tx.send(event);
    }

    /// Subscribe to events
    ///
    /// A subscriber that falls too far behind receives `Lagged` and misses
    /// the oldest events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
