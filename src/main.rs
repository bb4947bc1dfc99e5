// Sine-tracking runtime: drives one motor through a position/velocity
// reference at a fixed control rate and dumps the run history as JSON.
//
// Usage: robstride-can-runtime --interface can0 --motor-id 1 --seconds 10
// Ctrl-C stops the run; the motor is disabled on every exit path.

use std::error::Error;
use std::fs::File;
use std::path::PathBuf;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use robstride_can_runtime::bus::SocketcanBus;
use robstride_can_runtime::config::{
    DEFAULT_CAN_INTERFACE, DEFAULT_CONTROL_HZ, DEFAULT_KD, DEFAULT_KP, DEFAULT_SINE_AMPLITUDE,
    DEFAULT_SINE_FREQUENCY,
};
use robstride_can_runtime::motor::{MotorDriver, MotorRegistry, MotorType};
use robstride_can_runtime::runtime::{CancelToken, ControlLoop, LoopConfig};
use robstride_can_runtime::trajectory::{HoldTrajectory, SineTrajectory, Trajectory};

#[derive(Parser)]
#[command(about = "MIT-mode sine/hold tracking runtime for RobStride actuators")]
struct Args {
    #[arg(long, default_value = DEFAULT_CAN_INTERFACE)]
    interface: String,

    #[arg(long, default_value_t = 1)]
    motor_id: u8,

    /// Override the registry's type assignment for this motor id
    #[arg(long, value_enum)]
    motor_type: Option<MotorType>,

    /// Control frequency in Hz
    #[arg(long, default_value_t = DEFAULT_CONTROL_HZ)]
    hz: f32,

    /// Sine amplitude in rad
    #[arg(long, default_value_t = DEFAULT_SINE_AMPLITUDE)]
    amplitude: f32,

    /// Sine frequency in Hz
    #[arg(long, default_value_t = DEFAULT_SINE_FREQUENCY)]
    sine_hz: f32,

    #[arg(long, default_value_t = DEFAULT_KP)]
    kp: f32,

    #[arg(long, default_value_t = DEFAULT_KD)]
    kd: f32,

    /// Run duration in seconds; omit to run until Ctrl-C
    #[arg(long)]
    seconds: Option<f32>,

    /// Hold this fixed position (rad) instead of tracking the sine
    #[arg(long)]
    hold: Option<f32>,

    /// Write the sample history as JSON
    #[arg(long)]
    out: Option<PathBuf>,
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let args = Args::parse();

    let registry = match args.motor_type {
        Some(motor_type) => MotorRegistry::new(&[(args.motor_id, motor_type)])?,
        None => MotorRegistry::stock_biped(),
    };

    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || handler_token.cancel())?;

    let bus = SocketcanBus::open(&args.interface)?;
    let driver = MotorDriver::new(bus, args.motor_id, &registry)?;
    info!(
        motor_id = args.motor_id,
        profile = driver.profile().name,
        interface = %args.interface,
        "connected"
    );

    let cfg = LoopConfig {
        frequency_hz: args.hz,
        kp: args.kp,
        kd: args.kd,
        max_ticks: args.seconds.map(|s| (s * args.hz) as u64),
        ..LoopConfig::default()
    };

    match args.hold {
        Some(position) => run_loop(driver, HoldTrajectory { position }, cfg, &cancel, &args),
        None => run_loop(
            driver,
            SineTrajectory {
                amplitude: args.amplitude,
                frequency: args.sine_hz,
            },
            cfg,
            &cancel,
            &args,
        ),
    }
}

fn run_loop<T: Trajectory>(
    driver: MotorDriver<SocketcanBus>,
    trajectory: T,
    cfg: LoopConfig,
    cancel: &CancelToken,
    args: &Args,
) -> Result<(), Box<dyn Error>> {
    let mut control = ControlLoop::new(driver, trajectory, cfg);
    let outcome = control.run(cancel);
    let report = control.finish();

    info!(
        ticks = report.ticks,
        overruns = report.overruns,
        feedback_frames = report.feedback_frames,
        duration_secs = format_args!("{:.2}", report.duration_secs),
        "run complete"
    );

    if let Some(path) = &args.out {
        serde_json::to_writer_pretty(File::create(path)?, &report)?;
        info!("wrote {} samples to {}", report.samples.len(), path.display());
    }

    if let Err(e) = outcome {
        warn!("run ended with a fault: {e}");
        return Err(e.into());
    }
    Ok(())
}
