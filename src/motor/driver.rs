// Per-motor driver
//
// Owns the bus handle for one segment and the latest feedback snapshot for
// one motor. Feedback is last-write-wins telemetry, not a queue: each poll
// drains whatever the kernel has buffered and keeps only the newest sample.

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::bus::{BusError, CanBus};

use super::mit::{ControlCommand, control_frame, disable_frame, enable_frame, parse_feedback};
use super::profile::{ConfigError, MotorProfile, MotorRegistry};

/// Frames consumed per poll; bounds the drain even against a babbling bus.
const DRAIN_LIMIT: usize = 256;

/// Most recent feedback snapshot. `observed_at` is `None` until the first
/// frame arrives.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeedbackSample {
    /// rad
    pub position: f32,
    /// rad/s
    pub velocity: f32,
    pub observed_at: Option<Instant>,
}

pub struct MotorDriver<B: CanBus> {
    bus: B,
    motor_id: u8,
    profile: &'static MotorProfile,
    feedback: FeedbackSample,
    enabled: bool,
}

impl<B: CanBus> MotorDriver<B> {
    /// Resolve the motor's profile through the registry and take ownership of
    /// the bus handle. Fails before any bus I/O when the id has no mapping.
    pub fn new(bus: B, motor_id: u8, registry: &MotorRegistry) -> Result<Self, ConfigError> {
        let profile = registry.lookup(motor_id)?;
        Ok(Self {
            bus,
            motor_id,
            profile,
            feedback: FeedbackSample::default(),
            enabled: false,
        })
    }

    pub fn motor_id(&self) -> u8 {
        self.motor_id
    }

    pub fn profile(&self) -> &'static MotorProfile {
        self.profile
    }

    pub fn enable(&mut self) -> Result<(), BusError> {
        info!(motor_id = self.motor_id, "enabling motor");
        self.bus.send(&enable_frame(self.motor_id))?;
        self.enabled = true;
        Ok(())
    }

    pub fn disable(&mut self) -> Result<(), BusError> {
        info!(motor_id = self.motor_id, "disabling motor");
        self.bus.send(&disable_frame(self.motor_id))?;
        self.enabled = false;
        Ok(())
    }

    pub fn send_control(&mut self, cmd: &ControlCommand) -> Result<(), BusError> {
        self.bus
            .send(&control_frame(self.motor_id, cmd, self.profile))
    }

    /// Drain all currently queued frames into the feedback snapshot. Never
    /// waits; receive errors are logged and end the drain, since feedback
    /// gaps are tolerated and the next tick polls again.
    pub fn poll_feedback(&mut self) -> usize {
        let mut consumed = 0;
        while consumed < DRAIN_LIMIT {
            match self.bus.receive(Duration::ZERO) {
                Ok(Some(frame)) => {
                    consumed += 1;
                    if let Some(fb) = parse_feedback(&frame, self.motor_id, self.profile) {
                        self.feedback = FeedbackSample {
                            position: fb.position,
                            velocity: fb.velocity,
                            observed_at: Some(Instant::now()),
                        };
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(motor_id = self.motor_id, "feedback poll error: {e}");
                    break;
                }
            }
        }
        consumed
    }

    pub fn feedback(&self) -> &FeedbackSample {
        &self.feedback
    }

    #[cfg(test)]
    pub(crate) fn bus(&self) -> &B {
        &self.bus
    }
}

impl<B: CanBus> Drop for MotorDriver<B> {
    fn drop(&mut self) {
        // Safety net for abnormal exits; the control loop disables explicitly
        // on its normal paths, after which this is a no-op.
        if self.enabled {
            if let Err(e) = self.disable() {
                warn!(motor_id = self.motor_id, "failed to disable on drop: {e}");
            }
        }
    }
}
