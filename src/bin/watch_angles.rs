// Live joint angle watch
//
// Puts the motors in Operation mode, enables them without any setpoint (they
// can be turned by hand), and live-prints position/velocity plus the min/max
// envelope seen so far. Useful for measuring joint travel before setting
// software limits. Motors are disabled on every exit path.
//
// Usage: cargo run --bin watch_angles -- --bus can0:19,18,16,17,20

use std::error::Error;
use std::io::{self, Write};
use std::thread;
use std::time::Duration;

use clap::Parser;
use crossterm::{cursor, execute};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use robstride_can_runtime::bus::SocketcanBus;
use robstride_can_runtime::config::STOCK_SEGMENTS;
use robstride_can_runtime::motor::{ParamChannel, RobstrideClient, RunMode};
use robstride_can_runtime::runtime::CancelToken;

#[derive(Parser)]
#[command(about = "Live joint angle display; rotate the motors by hand")]
struct Args {
    /// Segment spec `<interface>:<id,id,...>`, repeatable; defaults to the
    /// stock biped wiring
    #[arg(long = "bus", value_parser = parse_segment)]
    buses: Vec<(String, Vec<u8>)>,

    /// Poll interval in milliseconds
    #[arg(long, default_value_t = 50)]
    interval_ms: u64,
}

fn parse_segment(spec: &str) -> Result<(String, Vec<u8>), String> {
    let (interface, ids) = spec
        .split_once(':')
        .ok_or_else(|| format!("expected <interface>:<id,id,...>, got '{spec}'"))?;
    let ids = ids
        .split(',')
        .map(|s| s.trim().parse::<u8>().map_err(|e| format!("bad id '{s}': {e}")))
        .collect::<Result<Vec<u8>, String>>()?;
    if ids.is_empty() {
        return Err(format!("no motor ids in '{spec}'"));
    }
    Ok((interface.to_string(), ids))
}

struct MotorWatch {
    motor_id: u8,
    min: f32,
    max: f32,
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("warn".parse()?))
        .init();

    let args = Args::parse();
    let segments: Vec<(String, Vec<u8>)> = if args.buses.is_empty() {
        STOCK_SEGMENTS
            .iter()
            .map(|(iface, ids)| (iface.to_string(), ids.to_vec()))
            .collect()
    } else {
        args.buses
    };

    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || handler_token.cancel())?;

    let mut channels = Vec::with_capacity(segments.len());
    for (interface, ids) in &segments {
        let bus = SocketcanBus::open(interface)?;
        let mut channel = ParamChannel::new(RobstrideClient::new(bus));
        let watches: Vec<MotorWatch> = ids
            .iter()
            .map(|&motor_id| {
                // Operation mode reads the low-level encoder; enabled with no
                // setpoint, the joint turns freely by hand.
                if let Err(e) =
                    channel.write(motor_id, "run_mode", f32::from(RunMode::Operation as u8))
                {
                    warn!(motor_id, "{e}");
                }
                if let Err(e) = channel.transport_mut().enable(motor_id) {
                    warn!(motor_id, "enable failed: {e}");
                }
                MotorWatch {
                    motor_id,
                    min: f32::INFINITY,
                    max: f32::NEG_INFINITY,
                }
            })
            .collect();
        channels.push((channel, watches));
    }

    println!("Rotate the motors by hand. Press Ctrl-C to stop.");
    println!();

    let mut printed_lines: u16 = 0;
    while !cancel.is_cancelled() {
        let mut lines = Vec::new();
        for (channel, watches) in &mut channels {
            for watch in watches.iter_mut() {
                let Some(position) = channel.read(watch.motor_id, "mechpos") else {
                    continue;
                };
                let Some(velocity) = channel.read(watch.motor_id, "mechvel") else {
                    continue;
                };
                watch.min = watch.min.min(position);
                watch.max = watch.max.max(position);
                lines.push(format!(
                    "Motor {:3} | Pos: {position:7.3} rad | Vel: {velocity:7.3} rad/s | Min: {:7.3} | Max: {:7.3}",
                    watch.motor_id, watch.min, watch.max
                ));
            }
        }

        if printed_lines > 0 {
            execute!(io::stdout(), cursor::MoveUp(printed_lines))?;
        }
        for line in &lines {
            println!("{line}");
        }
        printed_lines = lines.len() as u16;

        thread::sleep(Duration::from_millis(args.interval_ms));
    }

    println!();
    println!("Final ranges:");
    for (_, watches) in &channels {
        for watch in watches {
            if watch.min.is_finite() {
                println!(
                    "Motor {:3}: min {:7.3} rad, max {:7.3} rad, travel {:7.3} rad",
                    watch.motor_id,
                    watch.min,
                    watch.max,
                    watch.max - watch.min
                );
            }
        }
    }

    // Disable everything before the sockets drop.
    for (channel, watches) in &mut channels {
        for watch in watches.iter() {
            if let Err(e) = channel.transport_mut().disable(watch.motor_id) {
                warn!(motor_id = watch.motor_id, "disable failed: {e}");
            }
        }
    }
    Ok(())
}
