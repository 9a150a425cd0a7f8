use crate::telemetry::DataFrame;
use crate::vehicle::{RemoteState, Vehicle};
use tokio::sync::broadcast;
use tracing::trace;

// Per-subscriber delivery queue depths. A subscriber that stops reading
// lags and loses the oldest messages; the publisher never blocks.
const RC_STATE_CAPACITY: usize = 64;
const CAMERA_FRAME_CAPACITY: usize = 16;
const STATE_UPDATE_CAPACITY: usize = 256;
const TELEMETRY_CAPACITY: usize = 256;

/// A named broadcast channel carrying one payload type.
///
/// Every subscriber gets a dedicated delivery queue and sees every payload
/// published after it subscribed, in publish order. Publishing is
/// non-blocking and cannot fail from the publisher's perspective.
#[derive(Debug)]
pub struct Topic<T> {
    name: &'static str,
    tx: broadcast::Sender<T>,
}

impl<T: Clone> Topic<T> {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { name, tx }
    }

    /// Topic key, used for diagnostics only.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Enqueue `payload` for every current subscriber.
    ///
    /// A topic with no subscribers drops the payload silently; that is the
    /// normal state before consumers have started.
    pub fn publish(&self, payload: T) {
        let delivered = self.tx.send(payload).unwrap_or(0);
        trace!(topic = self.name, subscribers = delivered, "published");
    }

    /// Open a dedicated delivery stream for the caller.
    ///
    /// Subscriptions persist until the receiver is dropped; the bus itself
    /// is never torn down.
    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Process-wide event router.
///
/// Constructed once in `main` and passed by `Arc` into every component;
/// it lives for the process lifetime. Each topic carries exactly one payload
/// type, so a publisher/subscriber type mismatch is a compile error rather
/// than a runtime defect.
#[derive(Debug)]
pub struct EventBus {
    /// Remote-control input, published by the RC receiver.
    pub rc_state: Topic<RemoteState>,
    /// Latest camera frame, published by the frame receiver.
    pub camera_frame: Topic<Vec<u8>>,
    /// Point-in-time vehicle snapshots for external observers.
    pub state_update: Topic<Vehicle>,
    /// Telemetry frames bound for the external collector.
    pub telemetry: Topic<DataFrame>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            rc_state: Topic::new("rc-state", RC_STATE_CAPACITY),
            camera_frame: Topic::new("camera-frame", CAMERA_FRAME_CAPACITY),
            state_update: Topic::new("state-update", STATE_UPDATE_CAPACITY),
            telemetry: Topic::new("telemetry", TELEMETRY_CAPACITY),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
