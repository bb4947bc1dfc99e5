// Motor control module for RobStride joint actuators
//
// Provides:
// - Scaling range tables per motor type and the id registry
// - MIT-mode frame codec (unit scaling + frame build/parse)
// - Parameter RPC client and the retrying channel over it
// - Per-motor driver owning one bus handle

pub mod driver;
pub mod mit;
pub mod params;
pub mod profile;

pub use driver::{FeedbackSample, MotorDriver};
pub use mit::{ControlCommand, Feedback};
pub use params::{ParamChannel, ParamError, RobstrideClient, RunMode};
pub use profile::{ConfigError, MotorProfile, MotorRegistry, MotorType, Range};
