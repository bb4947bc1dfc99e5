// Reference trajectories, evaluated as pure functions of elapsed time.
//
// Position and velocity targets come from one phase evaluation: the velocity
// is the analytic time-derivative of the position, never an independently
// sampled signal, so the PD controller on the motor sees a consistent pair.

use std::f32::consts::TAU;

/// Position/velocity target pair for one instant
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Setpoint {
    /// rad
    pub position: f32,
    /// rad/s
    pub velocity: f32,
}

pub trait Trajectory {
    /// Target at `t` seconds since loop start
    fn sample(&self, t: f32) -> Setpoint;
}

/// `position = A·sin(2πft)`, velocity its derivative at the same phase
#[derive(Debug, Clone, Copy)]
pub struct SineTrajectory {
    /// rad
    pub amplitude: f32,
    /// Hz
    pub frequency: f32,
}

impl Trajectory for SineTrajectory {
    fn sample(&self, t: f32) -> Setpoint {
        let phase = TAU * self.frequency * t;
        Setpoint {
            position: self.amplitude * phase.sin(),
            velocity: self.amplitude * TAU * self.frequency * phase.cos(),
        }
    }
}

/// Constant position hold with zero feedforward velocity
#[derive(Debug, Clone, Copy)]
pub struct HoldTrajectory {
    /// rad
    pub position: f32,
}

impl Trajectory for HoldTrajectory {
    fn sample(&self, _t: f32) -> Setpoint {
        Setpoint {
            position: self.position,
            velocity: 0.0,
        }
    }
}
