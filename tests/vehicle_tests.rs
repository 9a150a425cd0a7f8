use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use telepilot::bus::EventBus;
use telepilot::metrics::MeterScheduler;
use telepilot::obu::{ObuError, OnboardUnit};
use telepilot::telemetry::FrameKind;
use telepilot::vehicle::{DriveMode, RemoteState, VehicleConfig, VehicleStateManager};
use tokio::sync::broadcast::error::TryRecvError;

/// Records every actuation call for later assertions.
#[derive(Debug, Default, Clone)]
struct ProbeLog {
    directions: Arc<Mutex<Vec<i32>>>,
    throttles: Arc<Mutex<Vec<i32>>>,
    initialized: Arc<AtomicBool>,
    shut_down: Arc<AtomicBool>,
}

impl ProbeLog {
    fn last_direction(&self) -> Option<i32> {
        self.directions.lock().unwrap().last().copied()
    }

    fn last_throttle(&self) -> Option<i32> {
        self.throttles.lock().unwrap().last().copied()
    }
}

#[derive(Debug)]
struct ProbeObu {
    log: ProbeLog,
}

impl OnboardUnit for ProbeObu {
    fn init(&mut self) -> Result<(), ObuError> {
        self.log.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn shutdown(&mut self) -> Result<(), ObuError> {
        self.log.shut_down.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn direction(&mut self, angle_deg: i32) -> Result<(), ObuError> {
        self.log.directions.lock().unwrap().push(angle_deg);
        Ok(())
    }

    fn throttle(&mut self, value: i32) -> Result<(), ObuError> {
        self.log.throttles.lock().unwrap().push(value);
        Ok(())
    }

    fn set_channel_pulse(&mut self, _: u8, _: u16, _: u16) -> Result<(), ObuError> {
        Ok(())
    }
}

fn test_cfg() -> VehicleConfig {
    VehicleConfig {
        device_id: "rover-1".to_string(),
        max_steering_angle_deg: 30.0,
        tick: Duration::from_millis(40),
        collector_url: None,
    }
}

/// Manager with all handlers running and subscribed. The trailing sleep on
/// the paused clock guarantees the spawned tasks reached their receive
/// points before the test publishes anything.
async fn started_manager(
    bus: &Arc<EventBus>,
    scheduler: &MeterScheduler,
    log: ProbeLog,
) -> VehicleStateManager {
    let obu = Box::new(ProbeObu { log });
    let mut manager =
        VehicleStateManager::new(test_cfg(), Arc::clone(bus), obu, scheduler).unwrap();
    manager.start();
    tokio::time::sleep(Duration::from_millis(1)).await;
    manager
}

async fn publish_rc(bus: &EventBus, input: RemoteState) {
    bus.rc_state.publish(input);
    // Yield until the remote-state handler has drained the event.
    tokio::time::sleep(Duration::from_millis(1)).await;
}

fn driving(steering: f32, throttle: f32, recording: bool) -> RemoteState {
    RemoteState {
        mode: DriveMode::Driving,
        steering,
        throttle,
        recording,
    }
}

#[tokio::test(start_paused = true)]
async fn test_driving_input_scales_and_actuates() {
    let bus = Arc::new(EventBus::new());
    let scheduler = MeterScheduler::new();
    let log = ProbeLog::default();
    let manager = started_manager(&bus, &scheduler, log.clone()).await;
    assert!(log.initialized.load(Ordering::SeqCst));

    let mut updates = bus.state_update.subscribe();

    // First event switches the mode; controls stay zero.
    publish_rc(&bus, driving(0.5, 0.8, false)).await;
    let update = updates.recv().await.unwrap();
    assert_eq!(update.mode, DriveMode::Driving);
    assert_eq!(update.steering, 0.0);
    assert_eq!(update.throttle, 0.0);

    // Second event in the same mode applies the scale transform:
    // steering = 100 * (30/90) * 0.5, throttle = 100 * 0.8.
    publish_rc(&bus, driving(0.5, 0.8, false)).await;
    let update = updates.recv().await.unwrap();
    assert!((update.steering - 100.0 * (30.0 / 90.0) * 0.5).abs() < 1e-4);
    assert!((update.throttle - 80.0).abs() < 1e-4);

    assert_eq!(log.last_direction(), Some(16));
    assert_eq!(log.last_throttle(), Some(80));

    let snapshot = manager.snapshot().await;
    assert_eq!(snapshot.mode, DriveMode::Driving);
    assert!((snapshot.throttle - 80.0).abs() < 1e-4);
}

#[tokio::test(start_paused = true)]
async fn test_leaving_driving_zeroes_actuators() {
    let bus = Arc::new(EventBus::new());
    let scheduler = MeterScheduler::new();
    let log = ProbeLog::default();
    let _manager = started_manager(&bus, &scheduler, log.clone()).await;

    publish_rc(&bus, driving(0.0, 0.0, false)).await;
    publish_rc(&bus, driving(0.9, 0.9, false)).await;
    assert_eq!(log.last_throttle(), Some(90));

    let mut updates = bus.state_update.subscribe();
    publish_rc(
        &bus,
        RemoteState {
            mode: DriveMode::Stopped,
            steering: 0.9,
            throttle: 0.9,
            recording: false,
        },
    )
    .await;

    let update = updates.recv().await.unwrap();
    assert_eq!(update.mode, DriveMode::Stopped);
    assert_eq!(update.steering, 0.0);
    assert_eq!(update.throttle, 0.0);
    assert_eq!(log.last_direction(), Some(0));
    assert_eq!(log.last_throttle(), Some(0));
}

#[tokio::test(start_paused = true)]
async fn test_recording_toggle_assigns_and_keeps_batch() {
    let bus = Arc::new(EventBus::new());
    let scheduler = MeterScheduler::new();
    let manager = started_manager(&bus, &scheduler, ProbeLog::default()).await;

    publish_rc(&bus, driving(0.0, 0.0, false)).await;
    assert_eq!(manager.snapshot().await.batch, 0);
    assert!(!manager.recording().await);

    publish_rc(&bus, driving(0.0, 0.0, true)).await;
    let first = manager.snapshot().await.batch;
    assert!(first > 0);
    assert!(manager.recording().await);

    // Still recording: the session identifier must not churn.
    publish_rc(&bus, driving(0.2, 0.2, true)).await;
    assert_eq!(manager.snapshot().await.batch, first);

    // Stopping keeps the last batch for any trailing frames.
    publish_rc(&bus, driving(0.2, 0.2, false)).await;
    assert_eq!(manager.snapshot().await.batch, first);
    assert!(!manager.recording().await);

    // Batches come from the wall clock, so a later session sorts after.
    std::thread::sleep(Duration::from_millis(2));
    publish_rc(&bus, driving(0.0, 0.0, true)).await;
    assert!(manager.snapshot().await.batch > first);
}

#[tokio::test(start_paused = true)]
async fn test_no_telemetry_while_not_recording() {
    let bus = Arc::new(EventBus::new());
    let scheduler = MeterScheduler::new();
    let manager = started_manager(&bus, &scheduler, ProbeLog::default()).await;

    let mut frames = bus.telemetry.subscribe();
    publish_rc(&bus, driving(0.0, 0.0, false)).await;

    tokio::time::sleep(Duration::from_secs(1)).await;

    assert!(matches!(frames.try_recv(), Err(TryRecvError::Empty)));
    // The periodic tick still runs and still feeds the meter.
    assert!(manager.state_meter().count() >= 24);
}

#[tokio::test(start_paused = true)]
async fn test_periodic_tick_waits_one_full_period() {
    let bus = Arc::new(EventBus::new());
    let scheduler = MeterScheduler::new();
    let manager = started_manager(&bus, &scheduler, ProbeLog::default()).await;

    // Nothing fires at startup; the first tick lands one period in.
    assert_eq!(manager.state_meter().count(), 0);

    tokio::time::sleep(Duration::from_millis(45)).await;
    assert_eq!(manager.state_meter().count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_recording_emits_state_and_image_frame_pairs() {
    let bus = Arc::new(EventBus::new());
    let scheduler = MeterScheduler::new();
    let manager = started_manager(&bus, &scheduler, ProbeLog::default()).await;

    publish_rc(&bus, driving(0.0, 0.0, false)).await;
    publish_rc(&bus, driving(0.3, 0.6, true)).await;
    bus.camera_frame.publish(vec![7u8; 16]);
    tokio::time::sleep(Duration::from_millis(1)).await;

    let batch = manager.snapshot().await.batch;
    let mut frames = bus.telemetry.subscribe();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let state_frame = frames.recv().await.unwrap();
    let image_frame = frames.recv().await.unwrap();

    assert_eq!(state_frame.kind(), FrameKind::KeyValue);
    assert_eq!(state_frame.device_id, "rover-1");
    assert_eq!(state_frame.batch, batch);

    assert_eq!(image_frame.kind(), FrameKind::Blob);
    assert_eq!(image_frame.batch, batch);
    // Both halves of a tick carry the same timestamp.
    assert_eq!(image_frame.ts, state_frame.ts);

    let value = serde_json::to_value(&state_frame).unwrap();
    assert_eq!(value["data"]["mode"], "DRIVING");
    assert_eq!(value["data"]["th"], "60");

    let value = serde_json::to_value(&image_frame).unwrap();
    assert!(value["blob"].is_string());
}

#[tokio::test(start_paused = true)]
async fn test_state_update_timestamp_advances() {
    let bus = Arc::new(EventBus::new());
    let scheduler = MeterScheduler::new();
    let manager = started_manager(&bus, &scheduler, ProbeLog::default()).await;

    let before = manager.snapshot().await.ts;
    std::thread::sleep(Duration::from_millis(1));

    let mut updates = bus.state_update.subscribe();
    publish_rc(&bus, driving(0.0, 0.0, false)).await;

    let update = updates.recv().await.unwrap();
    assert!(update.ts > before);
}

#[tokio::test(start_paused = true)]
async fn test_stop_joins_handlers_and_shuts_down_obu() {
    let bus = Arc::new(EventBus::new());
    let scheduler = MeterScheduler::new();
    let log = ProbeLog::default();
    let mut manager = started_manager(&bus, &scheduler, log.clone()).await;

    publish_rc(&bus, driving(0.0, 0.0, false)).await;
    manager.stop().await;
    assert!(log.shut_down.load(Ordering::SeqCst));

    // Handlers are gone: further input changes nothing.
    let snapshot = manager.snapshot().await;
    bus.rc_state.publish(driving(0.9, 0.9, true));
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(manager.snapshot().await, snapshot);
}
