use crate::bus::EventBus;
use crate::metrics::{Meter, MeterScheduler};
use crate::obu::OnboardUnit;
use crate::telemetry::DataFrame;
use crate::{unix_millis, unix_nanos, PilotError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default period of the telemetry tick, about 25 frames per second.
pub const DEFAULT_TICK: Duration = Duration::from_millis(40);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DriveMode {
    Driving,
    Stopped,
}

impl fmt::Display for DriveMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriveMode::Driving => write!(f, "DRIVING"),
            DriveMode::Stopped => write!(f, "STOPPED"),
        }
    }
}

/// Authoritative vehicle state.
///
/// Owned exclusively by the [`VehicleStateManager`]; everything published
/// to the bus is a point-in-time clone, never a shared reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vehicle {
    pub mode: DriveMode,
    /// Throttle in -100..=100.
    #[serde(rename = "th")]
    pub throttle: f32,
    /// Steering in degrees, 0 is straight ahead.
    #[serde(rename = "st")]
    pub steering: f32,
    /// Heading, 0 is north, 90 is east.
    #[serde(rename = "head")]
    pub heading: f32,
    /// Recording-session identifier.
    pub batch: i64,
    /// Timestamp in nanoseconds.
    pub ts: i64,
}

impl Default for Vehicle {
    fn default() -> Self {
        Self {
            mode: DriveMode::Stopped,
            throttle: 0.0,
            steering: 0.0,
            heading: 0.0,
            batch: 0,
            ts: unix_nanos(),
        }
    }
}

impl Vehicle {
    /// Key-value telemetry frame of the current fields, stamped with `ts`.
    pub fn to_key_value_frame(&self, device_id: &str, ts: i64) -> DataFrame {
        let mut data = BTreeMap::new();
        data.insert("mode".to_string(), self.mode.to_string());
        data.insert("th".to_string(), self.throttle.to_string());
        data.insert("st".to_string(), self.steering.to_string());
        data.insert("head".to_string(), self.heading.to_string());
        DataFrame::key_value(device_id, self.batch, ts, data)
    }
}

/// Remote-control input, one per event on the rc-state topic.
///
/// Steering and throttle are normalized to [-1, 1]; an out-of-vocabulary
/// mode string is rejected when the receiver deserializes it, before it
/// ever reaches the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteState {
    pub mode: DriveMode,
    pub steering: f32,
    pub throttle: f32,
    pub recording: bool,
}

#[derive(Debug, Clone)]
pub struct VehicleConfig {
    pub device_id: String,
    /// Maximum steering servo deflection in degrees. Required, no default.
    pub max_steering_angle_deg: f32,
    /// Period of the telemetry tick.
    pub tick: Duration,
    /// Recording collector base URL; `None` disables start/stop
    /// notifications (virtual rigs, tests).
    pub collector_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordingAction {
    Start(i64),
    Stop,
}

/// Vehicle, recording flag, latest camera frame, and the actuators.
/// The only multi-writer shared state in the core; guarded end-to-end by
/// one lock.
struct VehicleShared {
    vehicle: Vehicle,
    recording: bool,
    image: Vec<u8>,
    obu: Box<dyn OnboardUnit>,
}

/// Serializes concurrent state mutation, applies control-mode transitions,
/// and drives the onboard unit.
///
/// Three handlers run against the shared state: the remote-state handler
/// (control input), the camera-frame handler (last-write-wins image), and
/// the periodic telemetry task.
pub struct VehicleStateManager {
    cfg: Arc<VehicleConfig>,
    bus: Arc<EventBus>,
    shared: Arc<Mutex<VehicleShared>>,
    http: reqwest::Client,
    state_meter: Meter,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl VehicleStateManager {
    /// Build the manager and initialize the onboard unit.
    ///
    /// An actuator that cannot be initialized aborts startup.
    pub fn new(
        cfg: VehicleConfig,
        bus: Arc<EventBus>,
        mut obu: Box<dyn OnboardUnit>,
        scheduler: &MeterScheduler,
    ) -> Result<Self, PilotError> {
        obu.init()?;
        Ok(Self {
            cfg: Arc::new(cfg),
            bus,
            shared: Arc::new(Mutex::new(VehicleShared {
                vehicle: Vehicle::default(),
                recording: false,
                image: Vec::new(),
                obu,
            })),
            http: reqwest::Client::new(),
            state_meter: scheduler.meter("vehicle.state-update"),
            shutdown: CancellationToken::new(),
            tasks: Vec::new(),
        })
    }

    /// Spawn the three handlers. Must be called from within a tokio runtime.
    pub fn start(&mut self) {
        self.tasks.push(tokio::spawn(remote_state_loop(
            Arc::clone(&self.shared),
            Arc::clone(&self.cfg),
            Arc::clone(&self.bus),
            self.http.clone(),
            self.shutdown.clone(),
        )));
        self.tasks.push(tokio::spawn(camera_frame_loop(
            Arc::clone(&self.shared),
            Arc::clone(&self.bus),
            self.shutdown.clone(),
        )));
        self.tasks.push(tokio::spawn(periodic_loop(
            Arc::clone(&self.shared),
            Arc::clone(&self.cfg),
            Arc::clone(&self.bus),
            self.state_meter.clone(),
            self.shutdown.clone(),
        )));
    }

    /// Cancel the handlers, wait for them, and shut the onboard unit down.
    pub async fn stop(&mut self) {
        self.shutdown.cancel();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        let mut shared = self.shared.lock().await;
        if let Err(err) = shared.obu.shutdown() {
            warn!(%err, "onboard unit shutdown failed");
        }
    }

    /// Point-in-time copy of the vehicle state.
    pub async fn snapshot(&self) -> Vehicle {
        self.shared.lock().await.vehicle.clone()
    }

    pub async fn recording(&self) -> bool {
        self.shared.lock().await.recording
    }

    /// Rate meter of periodic state-update ticks.
    pub fn state_meter(&self) -> &Meter {
        &self.state_meter
    }
}

/// Apply one remote-control event to the guarded state.
///
/// Leaving DRIVING forces throttle and steering to zero; entering it keeps
/// the last (zeroed) values until the next input. While the mode is stable,
/// controls are recomputed from the normalized input. Returns the recording
/// notification to issue once the lock is released.
fn apply_remote_state(
    shared: &mut VehicleShared,
    cfg: &VehicleConfig,
    input: &RemoteState,
) -> Option<RecordingAction> {
    if input.mode != shared.vehicle.mode {
        if input.mode != DriveMode::Driving {
            shared.vehicle.throttle = 0.0;
            shared.vehicle.steering = 0.0;
        }
        shared.vehicle.mode = input.mode;
    } else {
        shared.vehicle.steering =
            100.0 * (cfg.max_steering_angle_deg / 90.0) * input.steering;
        shared.vehicle.throttle = 100.0 * input.throttle;
    }

    let action = if input.recording != shared.recording {
        if input.recording {
            shared.recording = true;
            shared.vehicle.batch = unix_millis();
            Some(RecordingAction::Start(shared.vehicle.batch))
        } else {
            shared.recording = false;
            Some(RecordingAction::Stop)
        }
    } else {
        None
    };

    shared.vehicle.ts = unix_nanos();
    action
}

async fn remote_state_loop(
    shared: Arc<Mutex<VehicleShared>>,
    cfg: Arc<VehicleConfig>,
    bus: Arc<EventBus>,
    http: reqwest::Client,
    token: CancellationToken,
) {
    info!(
        rx = bus.rc_state.name(),
        tx = bus.state_update.name(),
        "starting remote state handler"
    );

    let mut rx = bus.rc_state.subscribe();
    loop {
        let input = tokio::select! {
            _ = token.cancelled() => break,
            received = rx.recv() => match received {
                Ok(input) => input,
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "remote control subscriber lagged");
                    continue;
                }
                Err(RecvError::Closed) => break,
            },
        };

        let action = {
            let mut shared = shared.lock().await;
            let action = apply_remote_state(&mut shared, &cfg, &input);

            bus.state_update.publish(shared.vehicle.clone());

            // Actuator application stays inside the lock; its failure never
            // rolls back the state that was just applied.
            let steering = shared.vehicle.steering as i32;
            let throttle = shared.vehicle.throttle as i32;
            if let Err(err) = shared.obu.direction(steering) {
                warn!(%err, steering, "direction actuation failed");
            }
            if let Err(err) = shared.obu.throttle(throttle) {
                warn!(%err, throttle, "throttle actuation failed");
            }
            action
        };

        // Collector notification is best effort and runs outside the lock.
        if let Some(action) = action {
            notify_recorder(&http, cfg.collector_url.as_deref(), action).await;
        }
    }
}

async fn notify_recorder(
    http: &reqwest::Client,
    base_url: Option<&str>,
    action: RecordingAction,
) {
    let Some(base_url) = base_url else {
        debug!("recording toggled, no collector configured");
        return;
    };
    let url = match action {
        RecordingAction::Start(batch) => format!("{base_url}/start?ts={batch}"),
        RecordingAction::Stop => format!("{base_url}/stop"),
    };
    match http.get(&url).send().await {
        Ok(_) => match action {
            RecordingAction::Start(batch) => info!(batch, "started recording"),
            RecordingAction::Stop => info!("stopped recording"),
        },
        Err(err) => warn!(%err, url, "recording toggle notification failed"),
    }
}

async fn camera_frame_loop(
    shared: Arc<Mutex<VehicleShared>>,
    bus: Arc<EventBus>,
    token: CancellationToken,
) {
    info!(rx = bus.camera_frame.name(), "starting camera frame handler");

    let mut rx = bus.camera_frame.subscribe();
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            received = rx.recv() => match received {
                // Last write wins, no history is kept.
                Ok(frame) => shared.lock().await.image = frame,
                Err(RecvError::Lagged(missed)) => {
                    debug!(missed, "camera subscriber lagged, catching up to latest");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
}

async fn periodic_loop(
    shared: Arc<Mutex<VehicleShared>>,
    cfg: Arc<VehicleConfig>,
    bus: Arc<EventBus>,
    meter: Meter,
    token: CancellationToken,
) {
    info!(period_ms = cfg.tick.as_millis() as u64, "starting periodic telemetry");

    // First emission comes one full period after startup, not immediately.
    let start = tokio::time::Instant::now() + cfg.tick;
    let mut interval = tokio::time::interval_at(start, cfg.tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => {}
        }

        {
            let shared = shared.lock().await;
            if shared.recording {
                let ts = unix_nanos();
                bus.telemetry
                    .publish(shared.vehicle.to_key_value_frame(&cfg.device_id, ts));
                bus.telemetry.publish(DataFrame::blob(
                    cfg.device_id.as_str(),
                    shared.vehicle.batch,
                    ts,
                    shared.image.clone(),
                ));
            }
        }

        meter.mark(1);
    }
}
