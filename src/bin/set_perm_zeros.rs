// Permanent zero-offset calibration
//
// Writes the current physical joint positions into the controllers as the new
// zero, then persists that offset to flash. One-time setup: move every joint
// to its home pose first, and power cycle afterwards.
//
// Usage: cargo run --bin set_perm_zeros -- --bus can1:1,2,3,4,5 --bus can0:19,18,16,17,20

use std::error::Error;
use std::io::{self, Write};
use std::thread;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use robstride_can_runtime::bus::SocketcanBus;
use robstride_can_runtime::config::STOCK_SEGMENTS;
use robstride_can_runtime::motor::{ParamChannel, RobstrideClient};

/// Pause between commands so back-to-back exchanges on one segment don't
/// trample each other's responses
const INTER_COMMAND_PAUSE: Duration = Duration::from_millis(50);

#[derive(Parser)]
#[command(about = "Permanently store the current joint positions as zero")]
struct Args {
    /// Segment spec `<interface>:<id,id,...>`, repeatable; defaults to the
    /// stock biped wiring
    #[arg(long = "bus", value_parser = parse_segment)]
    buses: Vec<(String, Vec<u8>)>,

    /// Skip the interactive confirmation
    #[arg(long)]
    yes: bool,
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

fn confirm(prompt: &str) -> io::Result<bool> {
    print!("{prompt} Type 'yes' to continue: ");
    io::stdout().flush()?;
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case("yes"))
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
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

    println!("MOTOR PERMANENT ZERO OFFSET CALIBRATION");
    println!("This permanently writes the current joint positions as the new zero.");
    for (interface, ids) in &segments {
        println!("  {interface}: motors {ids:?}");
    }
    println!();
    println!("Move every joint to its desired home pose before continuing.");

    if !args.yes && !confirm("Is the robot in the desired zero pose?")? {
        println!("Aborted.");
        return Ok(());
    }

    // One channel per segment; each owns its socket for the whole procedure.
    let mut channels = Vec::with_capacity(segments.len());
    for (interface, ids) in &segments {
        let bus = SocketcanBus::open(interface)?;
        channels.push((ParamChannel::new(RobstrideClient::new(bus)), ids.clone()));
    }

    info!("sending zero_pos to all motors");
    for (channel, ids) in &mut channels {
        for &motor_id in ids.iter() {
            match channel.zero_position(motor_id) {
                Ok(()) => info!(motor_id, "zeroed"),
                Err(e) => warn!(motor_id, "{e}"),
            }
            thread::sleep(INTER_COMMAND_PAUSE);
        }
    }
    thread::sleep(Duration::from_millis(500));

    info!("saving configuration to permanent memory");
    for (channel, ids) in &mut channels {
        for &motor_id in ids.iter() {
            match channel.save_configuration(motor_id) {
                Ok(()) => info!(motor_id, "saved"),
                Err(e) => warn!(motor_id, "{e}"),
            }
            thread::sleep(INTER_COMMAND_PAUSE);
        }
    }

    // Best-effort disable before the sockets drop.
    for (channel, ids) in &mut channels {
        for &motor_id in ids.iter() {
            if let Err(e) = channel.transport_mut().disable(motor_id) {
                warn!(motor_id, "disable failed: {e}");
            }
        }
    }

    println!();
    println!("Done. Power cycle the robot for the new zeros to take effect.");
    Ok(())
}
