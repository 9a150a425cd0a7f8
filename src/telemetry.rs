use crate::bus::EventBus;
use crate::metrics::{Meter, MeterScheduler};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport unavailable: {0}")]
    Unavailable(String),
    #[error("publish failed: {0}")]
    Publish(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    KeyValue,
    Blob,
}

/// Frame body. The variant determines which wire field is populated;
/// `data` and `blob` can never both appear.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FramePayload {
    KeyValue {
        data: BTreeMap<String, String>,
    },
    Blob {
        #[serde(with = "base64_bytes")]
        blob: Vec<u8>,
    },
}

/// Telemetry envelope sent to the external collector.
///
/// Immutable once constructed; created per publish and consumed once by the
/// forwarder. Wire shape:
/// `{"deviceId": .., "batch": .., "ts": .., "data": {..} | "blob": ".."}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataFrame {
    #[serde(rename = "deviceId")]
    pub device_id: String,
    pub batch: i64,
    pub ts: i64,
    #[serde(flatten)]
    pub payload: FramePayload,
}

impl DataFrame {
    pub fn key_value(
        device_id: impl Into<String>,
        batch: i64,
        ts: i64,
        data: BTreeMap<String, String>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            batch,
            ts,
            payload: FramePayload::KeyValue { data },
        }
    }

    pub fn blob(device_id: impl Into<String>, batch: i64, ts: i64, blob: Vec<u8>) -> Self {
        Self {
            device_id: device_id.into(),
            batch,
            ts,
            payload: FramePayload::Blob { blob },
        }
    }

    pub fn kind(&self) -> FrameKind {
        match self.payload {
            FramePayload::KeyValue { .. } => FrameKind::KeyValue,
            FramePayload::Blob { .. } => FrameKind::Blob,
        }
    }
}

// JSON has no raw-bytes type; blobs travel base64-encoded.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        STANDARD.encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Outbound transport seam. The real MQTT client lives outside this crate;
/// delivery is at-most-once and no acknowledgement is awaited.
pub trait TransportSink: Send + Sync {
    fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), TransportError>;
}

/// Sink that only logs, for local runs without a collector.
#[derive(Debug, Default)]
pub struct LogSink;

impl TransportSink for LogSink {
    fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), TransportError> {
        debug!(queue, bytes = payload.len(), "telemetry frame");
        Ok(())
    }
}

/// Subscribes to the telemetry topic, serializes each frame, and hands it
/// to the transport sink under a fixed queue name.
///
/// A pure sink: marshal or publish failures are logged and the frame is
/// dropped, with no retry and no backpressure toward the producer.
pub struct TelemetryForwarder {
    queue: String,
    sink: Arc<dyn TransportSink>,
    bus: Arc<EventBus>,
    send_meter: Meter,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl TelemetryForwarder {
    pub fn new(
        queue: impl Into<String>,
        sink: Arc<dyn TransportSink>,
        bus: Arc<EventBus>,
        scheduler: &MeterScheduler,
    ) -> Self {
        Self {
            queue: queue.into(),
            sink,
            bus,
            send_meter: scheduler.meter("telemetry.send"),
            shutdown: CancellationToken::new(),
            task: None,
        }
    }

    /// Rate meter of successful forwards.
    pub fn send_meter(&self) -> &Meter {
        &self.send_meter
    }

    /// Spawn the forwarding loop. Must be called from within a tokio runtime.
    pub fn start(&mut self) {
        info!(queue = %self.queue, topic = self.bus.telemetry.name(), "starting telemetry forwarder");

        let mut rx = self.bus.telemetry.subscribe();
        let queue = self.queue.clone();
        let sink = Arc::clone(&self.sink);
        let meter = self.send_meter.clone();
        let token = self.shutdown.clone();

        self.task = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    received = rx.recv() => match received {
                        Ok(frame) => forward_frame(&queue, sink.as_ref(), &meter, &frame),
                        Err(RecvError::Lagged(missed)) => {
                            warn!(missed, "telemetry subscriber lagged, frames lost");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        }));
    }

    /// Cancel the forwarding loop and wait for it to exit.
    pub async fn stop(&mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

fn forward_frame(queue: &str, sink: &dyn TransportSink, meter: &Meter, frame: &DataFrame) {
    match serde_json::to_vec(frame) {
        Ok(payload) => match sink.publish(queue, &payload) {
            Ok(()) => meter.mark(1),
            Err(err) => warn!(%err, "telemetry publish failed, frame dropped"),
        },
        Err(err) => warn!(%err, "telemetry marshal failed, frame dropped"),
    }
}
