//! # Telepilot
//!
//! Runtime core for a remotely-driven vehicle. Inbound remote-control
//! commands are turned into actuator signals, vehicle and sensor state is
//! streamed to a remote collector at a fixed cadence, and the runtime keeps
//! exponentially-weighted rate metrics of its own event throughput.
//!
//! ## Features
//!
//! - **Typed event bus**: broadcast topics decouple the remote-control and
//!   camera receivers from the actuator driver and telemetry sender
//! - **Vehicle state machine**: one lock serializes control input, camera
//!   frames, and the periodic telemetry tick
//! - **Rate metrics**: 1/5/15-minute EWMA meters ticked by a single
//!   background scheduler
//! - **Pluggable actuation**: the [`obu::OnboardUnit`] contract is satisfied
//!   by real hardware drivers or the software-only [`obu::VirtualObu`]
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use telepilot::bus::EventBus;
//! use telepilot::metrics::MeterScheduler;
//! use telepilot::obu::{ObuConfig, VirtualObu};
//! use telepilot::vehicle::{VehicleConfig, VehicleStateManager};
//!
//! # fn run() -> Result<(), telepilot::PilotError> {
//! let bus = Arc::new(EventBus::new());
//! let scheduler = MeterScheduler::new();
//! scheduler.start();
//!
//! let cfg = VehicleConfig {
//!     device_id: "telepilot".into(),
//!     max_steering_angle_deg: 30.0,
//!     tick: Duration::from_millis(40),
//!     collector_url: None,
//! };
//! let obu = Box::new(VirtualObu::new(ObuConfig::default()));
//! let mut manager = VehicleStateManager::new(cfg, Arc::clone(&bus), obu, &scheduler)?;
//! manager.start();
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`bus`] - typed publish/subscribe topics
//! - [`metrics`] - EWMA rate meters and their tick scheduler
//! - [`obu`] - onboard-unit actuation contract and virtual implementation
//! - [`vehicle`] - authoritative vehicle state and mode transitions
//! - [`telemetry`] - data frames and the transport-facing forwarder

#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]

pub mod bus;
pub mod metrics;
pub mod obu;
pub mod telemetry;
pub mod vehicle;

// Re-export main public types for convenience
pub use bus::EventBus;
pub use metrics::{Meter, MeterScheduler, MeterSnapshot};
pub use obu::{ObuError, OnboardUnit, VirtualObu};
pub use telemetry::{DataFrame, TelemetryForwarder, TransportSink};
pub use vehicle::{DriveMode, RemoteState, Vehicle, VehicleStateManager};

use thiserror::Error;

/// Top-level error for component construction and startup.
///
/// Transient I/O (telemetry publish failures, recording notifications) is
/// logged and dropped inside the components and never surfaces here.
#[derive(Debug, Error)]
pub enum PilotError {
    #[error("onboard unit error: {0}")]
    Obu(#[from] obu::ObuError),
    #[error("transport error: {0}")]
    Transport(#[from] telemetry::TransportError),
}

/// Wall-clock timestamp in nanoseconds since the Unix epoch.
pub(crate) fn unix_nanos() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Wall-clock timestamp in milliseconds since the Unix epoch.
pub(crate) fn unix_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
