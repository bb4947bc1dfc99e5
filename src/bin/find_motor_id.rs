// Passive id scan: asks every candidate id for its bus voltage, a read-only
// request that cannot enable or move anything. A motor that answers exists.
//
// Usage: cargo run --bin find_motor_id -- --interface can0

use std::error::Error;
use std::io::{self, Write};
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use robstride_can_runtime::bus::SocketcanBus;
use robstride_can_runtime::config::DEFAULT_CAN_INTERFACE;
use robstride_can_runtime::motor::{ParamChannel, RobstrideClient};

#[derive(Parser)]
#[command(about = "Scan a CAN segment for responding RobStride motors (read-only)")]
struct Args {
    #[arg(long, default_value = DEFAULT_CAN_INTERFACE)]
    interface: String,

    /// First id to probe
    #[arg(long, default_value_t = 1)]
    from: u8,

    /// Last id to probe
    #[arg(long, default_value_t = 127)]
    to: u8,

    /// Per-id response timeout in milliseconds
    #[arg(long, default_value_t = 50)]
    timeout_ms: u64,
}

fn main() -> Result<(), Box<dyn Error>> {
    // scanning 127 absent ids produces a timeout each; keep those out of the
    // terminal unless RUST_LOG asks for them
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("error".parse()?))
        .init();

    let args = Args::parse();

    println!("Passive scan on {} (ids {}..={})", args.interface, args.from, args.to);
    println!("This will NOT enable or move any motor.");

    let bus = SocketcanBus::open(&args.interface)?;
    let client = RobstrideClient::with_timeout(bus, Duration::from_millis(args.timeout_ms));
    let mut channel = ParamChannel::with_retries(client, 1);

    let mut found = Vec::new();
    for motor_id in args.from..=args.to {
        print!("Scanning id {motor_id}...\r");
        io::stdout().flush()?;

        if let Some(vbus) = channel.read(motor_id, "vbus") {
            println!("Scanning id {motor_id} -> FOUND ({vbus:.2} V)");
            found.push(motor_id);
        }
    }

    println!();
    if found.is_empty() {
        println!("No motors found. Check power and CAN cabling.");
    } else {
        println!("Responding motor ids: {found:?}");
    }
    Ok(())
}
