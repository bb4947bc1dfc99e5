// RobStride actuator control over socketcan
//
// The crate splits into a transport seam (bus), the motor protocol stack
// (motor), reference trajectories (trajectory), and the fixed-period control
// loop that ties them together (runtime). Binaries under src/bin are thin
// orchestration over these pieces.

pub mod bus;
pub mod config;
pub mod motor;
pub mod runtime;
pub mod trajectory;
