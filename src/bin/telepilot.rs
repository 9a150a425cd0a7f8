use clap::{App, Arg};
use colored::*;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use telepilot::bus::EventBus;
use telepilot::metrics::MeterScheduler;
use telepilot::obu::{ObuConfig, VirtualObu};
use telepilot::telemetry::{LogSink, TelemetryForwarder};
use telepilot::vehicle::{DriveMode, RemoteState, VehicleConfig, VehicleStateManager};
use tracing::{error, info};

const DEFAULT_DEVICE_ID: &str = "telepilot";
const DEFAULT_TICK_MS: &str = "40";
const DEFAULT_QUEUE: &str = "telemetry";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let matches = App::new("telepilot")
        .version("0.1.0")
        .about("🏎️  Remotely-driven vehicle runtime")
        .arg(
            Arg::with_name("device-id")
                .short("d")
                .long("device-id")
                .value_name("ID")
                .help("Device identifier stamped on every telemetry frame")
                .takes_value(true)
                .default_value(DEFAULT_DEVICE_ID),
        )
        .arg(
            Arg::with_name("max-steering-angle")
                .short("a")
                .long("max-steering-angle")
                .value_name("DEGREES")
                .help("Maximum steering servo deflection in degrees")
                .takes_value(true)
                .required(true)
                .validator(|v| match v.parse::<f32>() {
                    Ok(angle) if angle > 0.0 && angle <= 90.0 => Ok(()),
                    Ok(_) => Err("Angle must be in (0, 90] degrees".into()),
                    Err(_) => Err("Angle must be a valid number".into()),
                }),
        )
        .arg(
            Arg::with_name("tick-ms")
                .short("t")
                .long("tick-ms")
                .value_name("MILLIS")
                .help("Telemetry tick period in milliseconds")
                .takes_value(true)
                .default_value(DEFAULT_TICK_MS)
                .validator(|v| match v.parse::<u64>() {
                    Ok(ms) if ms > 0 => Ok(()),
                    Ok(_) => Err("Tick period must be positive".into()),
                    Err(_) => Err("Tick period must be a valid number".into()),
                }),
        )
        .arg(
            Arg::with_name("queue")
                .short("q")
                .long("queue")
                .value_name("NAME")
                .help("Transport queue name for telemetry frames")
                .takes_value(true)
                .default_value(DEFAULT_QUEUE),
        )
        .arg(
            Arg::with_name("collector-url")
                .short("c")
                .long("collector-url")
                .value_name("URL")
                .help("Recording collector base URL; omit to disable start/stop notifications")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("demo")
                .long("demo")
                .help("Feed a synthetic remote-control signal instead of waiting for one"),
        )
        .get_matches();

    // Validators guarantee these parses succeed.
    let max_steering_angle_deg: f32 = matches
        .value_of("max-steering-angle")
        .unwrap_or_default()
        .parse()?;
    let tick_ms: u64 = matches.value_of("tick-ms").unwrap_or(DEFAULT_TICK_MS).parse()?;
    let device_id = matches.value_of("device-id").unwrap_or(DEFAULT_DEVICE_ID);
    let queue = matches.value_of("queue").unwrap_or(DEFAULT_QUEUE);
    let collector_url = matches.value_of("collector-url").map(str::to_string);
    let demo = matches.is_present("demo");

    println!("{}", "🏎️  Telepilot Vehicle Runtime".bold());
    println!("{}", "=============================".dimmed());
    println!("  device:   {}", device_id.cyan());
    println!("  steering: {}°", max_steering_angle_deg.to_string().cyan());
    println!("  tick:     {}ms", tick_ms.to_string().cyan());
    match &collector_url {
        Some(url) => println!("  recorder: {}", url.cyan()),
        None => println!("  recorder: {}", "disabled".yellow()),
    }

    let bus = Arc::new(EventBus::new());
    let scheduler = MeterScheduler::new();
    scheduler.start();

    let cfg = VehicleConfig {
        device_id: device_id.to_string(),
        max_steering_angle_deg,
        tick: Duration::from_millis(tick_ms),
        collector_url,
    };

    let mut forwarder = TelemetryForwarder::new(
        queue,
        Arc::new(LogSink::default()),
        Arc::clone(&bus),
        &scheduler,
    );
    forwarder.start();

    let obu = Box::new(VirtualObu::new(ObuConfig::default()));
    let mut manager = match VehicleStateManager::new(cfg, Arc::clone(&bus), obu, &scheduler) {
        Ok(manager) => manager,
        Err(err) => {
            error!(%err, "failed to start vehicle state manager");
            return Err(err.into());
        }
    };
    manager.start();

    let demo_task = demo.then(|| tokio::spawn(demo_remote_control(Arc::clone(&bus))));

    info!("runtime started, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    println!("\n{}", "shutting down...".yellow());

    if let Some(task) = demo_task {
        task.abort();
    }
    manager.stop().await;
    forwarder.stop().await;
    scheduler.shutdown();

    let state = manager.state_meter().snapshot();
    let sends = forwarder.send_meter().snapshot();
    println!(
        "  state ticks: {} ({:.1}/s mean)",
        state.count.to_string().green(),
        state.rate_mean
    );
    println!(
        "  frames sent: {} ({:.1}/s mean)",
        sends.count.to_string().green(),
        sends.rate_mean
    );
    println!("{}", "🏁 Telepilot stopped".bold());

    Ok(())
}

/// Publish a jittered sinusoid steering sweep at 10 Hz, recording enabled,
/// so a local run exercises the full pipeline without a transmitter.
async fn demo_remote_control(bus: Arc<EventBus>) {
    let mut interval = tokio::time::interval(Duration::from_millis(100));
    let mut phase = 0.0f32;

    // Take the vehicle out of STOPPED first.
    interval.tick().await;
    bus.rc_state.publish(RemoteState {
        mode: DriveMode::Driving,
        steering: 0.0,
        throttle: 0.0,
        recording: false,
    });

    loop {
        interval.tick().await;
        phase += 0.1;
        let jitter: f32 = rand::thread_rng().gen_range(-0.05..0.05);
        bus.rc_state.publish(RemoteState {
            mode: DriveMode::Driving,
            steering: (phase.sin() * 0.8 + jitter).clamp(-1.0, 1.0),
            throttle: 0.4,
            recording: true,
        });
        bus.camera_frame.publish(vec![0u8; 64]);
    }
}
