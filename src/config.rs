// Defaults for the control loop, the param channel, and the stock robot wiring
use std::time::Duration;

// Control loop
pub const DEFAULT_CAN_INTERFACE: &str = "can0";
pub const DEFAULT_CONTROL_HZ: f32 = 1000.0;
pub const DEFAULT_KP: f32 = 20.0;
pub const DEFAULT_KD: f32 = 1.0;

// Sine reference trajectory
pub const DEFAULT_SINE_AMPLITUDE: f32 = 1.0;
pub const DEFAULT_SINE_FREQUENCY: f32 = 1.0;

// The controller's internal state machine needs time after an enable before it
// accepts control frames; disable gets a shorter settle before the socket is
// released.
pub const ENABLE_SETTLE: Duration = Duration::from_secs(1);
pub const DISABLE_SETTLE: Duration = Duration::from_millis(500);

// Loop rate reporting cadence
pub const RATE_REPORT_PERIOD: Duration = Duration::from_secs(1);

// Param RPC
pub const DEFAULT_PARAM_RETRIES: u32 = 3;
pub const DEFAULT_PARAM_TIMEOUT: Duration = Duration::from_millis(50);

// Stock bus wiring of the biped: interface -> motor ids on that segment.
// The calibration utilities iterate these when no --bus override is given.
pub const STOCK_SEGMENTS: &[(&str, &[u8])] =
    &[("can1", &[1, 2, 3, 4, 5]), ("can0", &[19, 18, 16, 17, 20])];
