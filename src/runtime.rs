// Fixed-period control loop
//
// Lifecycle: Idle -> Enabling -> Running -> Disabling -> Stopped. The
// disable/settle sequence runs on every exit path, including cancellation and
// bus faults, and the bus handle is released when the loop is consumed.
//
// Cadence comes from absolute monotonic deadlines, not accumulated sleeps, so
// long runs do not drift. A tick that overruns its period is counted and the
// next deadline restarts from "now" (no catch-up burst of missed ticks).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};

use crate::bus::{BusError, CanBus};
use crate::config::{
    DEFAULT_CONTROL_HZ, DEFAULT_KD, DEFAULT_KP, DISABLE_SETTLE, ENABLE_SETTLE, RATE_REPORT_PERIOD,
};
use crate::motor::driver::MotorDriver;
use crate::motor::mit::ControlCommand;
use crate::trajectory::Trajectory;

/// Granularity at which interruptible sleeps re-check the cancel token
const CANCEL_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, thiserror::Error)]
pub enum LoopError {
    #[error("control frequency {0} Hz is not positive")]
    InvalidFrequency(f32),

    #[error("enable command failed: {0}")]
    Enable(#[source] BusError),

    #[error("control send failed at tick {tick}: {source}")]
    ControlSend {
        tick: u64,
        #[source]
        source: BusError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Enabling,
    Running,
    Disabling,
    Stopped,
}

/// Cooperative cancellation flag, observed between ticks and inside every
/// settle sleep. Clone it into a signal handler to wire up Ctrl-C.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Sleep up to `total`, waking early when the token fires
fn sleep_cancellable(cancel: &CancelToken, total: Duration) {
    let deadline = Instant::now() + total;
    while !cancel.is_cancelled() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        thread::sleep(remaining.min(CANCEL_POLL));
    }
}

#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub frequency_hz: f32,
    pub kp: f32,
    pub kd: f32,
    /// N·m added to every control frame
    pub feedforward_torque: f32,
    /// Stop after this many ticks; `None` runs until cancellation
    pub max_ticks: Option<u64>,
    pub enable_settle: Duration,
    pub disable_settle: Duration,
    pub report_period: Duration,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            frequency_hz: DEFAULT_CONTROL_HZ,
            kp: DEFAULT_KP,
            kd: DEFAULT_KD,
            feedforward_torque: 0.0,
            max_ticks: None,
            enable_settle: ENABLE_SETTLE,
            disable_settle: DISABLE_SETTLE,
            report_period: RATE_REPORT_PERIOD,
        }
    }
}

/// One row of the append-only run history
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SampleRecord {
    pub elapsed: f32,
    pub target_position: f32,
    pub target_velocity: f32,
    pub actual_position: f32,
    pub actual_velocity: f32,
}

/// Everything a run leaves behind once the bus is released
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub motor_id: u8,
    pub ticks: u64,
    pub overruns: u64,
    pub feedback_frames: u64,
    pub duration_secs: f32,
    pub samples: Vec<SampleRecord>,
}

pub struct ControlLoop<B: CanBus, T> {
    driver: MotorDriver<B>,
    trajectory: T,
    cfg: LoopConfig,
    state: LoopState,
    samples: Vec<SampleRecord>,
    ticks: u64,
    overruns: u64,
    feedback_frames: u64,
    run_duration: Duration,
}

impl<B: CanBus, T: Trajectory> ControlLoop<B, T> {
    pub fn new(driver: MotorDriver<B>, trajectory: T, cfg: LoopConfig) -> Self {
        Self {
            driver,
            trajectory,
            cfg,
            state: LoopState::Idle,
            samples: Vec::new(),
            ticks: 0,
            overruns: 0,
            feedback_frames: 0,
            run_duration: Duration::ZERO,
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Run until cancellation, tick limit exhaustion, or an unrecoverable
    /// bus fault. Whatever happens inside, the motor is disabled and given
    /// its settle time before this returns.
    pub fn run(&mut self, cancel: &CancelToken) -> Result<(), LoopError> {
        if !(self.cfg.frequency_hz > 0.0) {
            return Err(LoopError::InvalidFrequency(self.cfg.frequency_hz));
        }

        self.state = LoopState::Enabling;
        let result = match self.driver.enable().map_err(LoopError::Enable) {
            Ok(()) => {
                sleep_cancellable(cancel, self.cfg.enable_settle);
                self.state = LoopState::Running;
                self.run_ticks(cancel)
            }
            Err(e) => Err(e),
        };

        self.state = LoopState::Disabling;
        if let Err(e) = self.driver.disable() {
            warn!(motor_id = self.driver.motor_id(), "disable failed: {e}");
        }
        thread::sleep(self.cfg.disable_settle);
        self.state = LoopState::Stopped;

        info!(
            motor_id = self.driver.motor_id(),
            ticks = self.ticks,
            overruns = self.overruns,
            "control loop stopped"
        );
        result
    }

    fn run_ticks(&mut self, cancel: &CancelToken) -> Result<(), LoopError> {
        let period = Duration::from_secs_f32(1.0 / self.cfg.frequency_hz);
        let start = Instant::now();
        let mut deadline = start;
        let mut last_report = start;
        let mut report_ticks: u64 = 0;

        let outcome = loop {
            if cancel.is_cancelled() {
                info!("cancellation observed, leaving control loop");
                break Ok(());
            }
            if self.cfg.max_ticks.is_some_and(|max| self.ticks >= max) {
                break Ok(());
            }

            let tick_start = Instant::now();
            let elapsed = tick_start.duration_since(start).as_secs_f32();

            // 1. Drain feedback; never waits, stale data is fine for a tick.
            self.feedback_frames += self.driver.poll_feedback() as u64;

            // 2. One phase evaluation gives both targets.
            let setpoint = self.trajectory.sample(elapsed);

            // 3. One control frame with the configured gains.
            let cmd = ControlCommand {
                position: setpoint.position,
                velocity: setpoint.velocity,
                kp: self.cfg.kp,
                kd: self.cfg.kd,
                torque: self.cfg.feedforward_torque,
            };
            if let Err(source) = self.driver.send_control(&cmd) {
                break Err(LoopError::ControlSend {
                    tick: self.ticks,
                    source,
                });
            }

            // 4. Record.
            let fb = self.driver.feedback();
            self.samples.push(SampleRecord {
                elapsed,
                target_position: setpoint.position,
                target_velocity: setpoint.velocity,
                actual_position: fb.position,
                actual_velocity: fb.velocity,
            });

            self.ticks += 1;
            report_ticks += 1;

            // 5. Periodic rate report; overruns are degraded, not fatal, but
            //    they should be visible.
            let since_report = tick_start.duration_since(last_report);
            if since_report >= self.cfg.report_period {
                let rate = report_ticks as f32 / since_report.as_secs_f32();
                info!(
                    motor_id = self.driver.motor_id(),
                    rate_hz = format_args!("{rate:.0}"),
                    overruns = self.overruns,
                    target = format_args!("{:.3}", setpoint.position),
                    actual = format_args!("{:.3}", fb.position),
                    "control loop"
                );
                last_report = tick_start;
                report_ticks = 0;
            }

            // 6. Cadence: absolute deadline, no catch-up after an overrun.
            deadline += period;
            let now = Instant::now();
            if now < deadline {
                sleep_cancellable(cancel, deadline - now);
            } else {
                self.overruns += 1;
                deadline = now;
            }
        };

        self.run_duration = start.elapsed();
        outcome
    }

    /// Consume the loop, dropping the driver (and with it the bus handle),
    /// and hand back the run history.
    pub fn finish(self) -> RunReport {
        RunReport {
            motor_id: self.driver.motor_id(),
            ticks: self.ticks,
            overruns: self.overruns,
            feedback_frames: self.feedback_frames,
            duration_secs: self.run_duration.as_secs_f32(),
            samples: self.samples,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::CanFrame;
    use crate::bus::mock::MockBus;
    use crate::motor::mit::{MUX_CONTROL, MUX_DISABLE, MUX_ENABLE, scale_to_u16};
    use crate::motor::profile::MotorRegistry;
    use crate::trajectory::{Setpoint, SineTrajectory};

    fn fast_config(max_ticks: u64) -> LoopConfig {
        LoopConfig {
            frequency_hz: 1000.0,
            max_ticks: Some(max_ticks),
            enable_settle: Duration::ZERO,
            disable_settle: Duration::ZERO,
            ..LoopConfig::default()
        }
    }

    fn sine() -> SineTrajectory {
        SineTrajectory {
            amplitude: 1.0,
            frequency: 1.0,
        }
    }

    fn make_loop(bus: MockBus, max_ticks: u64) -> ControlLoop<MockBus, SineTrajectory> {
        let driver = MotorDriver::new(bus, 20, &MotorRegistry::stock_biped()).unwrap();
        ControlLoop::new(driver, sine(), fast_config(max_ticks))
    }

    #[test]
    fn lifecycle_sends_enable_ticks_then_one_disable() {
        let mut ctl = make_loop(MockBus::new(), 5);
        assert_eq!(ctl.state(), LoopState::Idle);

        ctl.run(&CancelToken::new()).unwrap();
        assert_eq!(ctl.state(), LoopState::Stopped);

        let bus = ctl.driver.bus();
        assert_eq!(bus.sent_with_mux(MUX_ENABLE), 1);
        assert_eq!(bus.sent_with_mux(MUX_CONTROL), 5);
        assert_eq!(bus.sent_with_mux(MUX_DISABLE), 1);

        // enable first, disable last
        assert_eq!((bus.sent.first().unwrap().id >> 24) as u8, MUX_ENABLE);
        assert_eq!((bus.sent.last().unwrap().id >> 24) as u8, MUX_DISABLE);

        let report = ctl.finish();
        assert_eq!(report.ticks, 5);
        assert_eq!(report.samples.len(), 5);
    }

    #[test]
    fn pre_cancelled_run_still_disables() {
        let cancel = CancelToken::new();
        cancel.cancel();

        let mut ctl = make_loop(MockBus::new(), 1000);
        ctl.run(&cancel).unwrap();

        let bus = ctl.driver.bus();
        assert_eq!(bus.sent_with_mux(MUX_CONTROL), 0);
        assert_eq!(bus.sent_with_mux(MUX_DISABLE), 1);
    }

    #[test]
    fn send_failure_mid_run_still_disables_exactly_once_and_releases() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let released = Arc::new(AtomicBool::new(false));
        let mut bus = MockBus::new();
        bus.released = Some(released.clone());
        // 0 = enable, 1..3 = control frames, 4th send fails
        bus.fail_send_at = Some(4);

        let mut ctl = make_loop(bus, 1000);
        let err = ctl.run(&CancelToken::new()).unwrap_err();
        assert!(matches!(err, LoopError::ControlSend { tick: 3, .. }));

        assert_eq!(ctl.driver.bus().sent_with_mux(MUX_DISABLE), 1);
        let report = ctl.finish();
        assert_eq!(report.ticks, 3);
        assert!(released.load(Ordering::SeqCst), "bus handle released after finish");
    }

    #[test]
    fn thousand_ticks_at_1khz_then_finish() {
        let mut ctl = make_loop(MockBus::new(), 1000);
        ctl.run(&CancelToken::new()).unwrap();

        let bus = ctl.driver.bus();
        assert_eq!(bus.sent_with_mux(MUX_CONTROL), 1000);
        assert_eq!(bus.sent_with_mux(MUX_DISABLE), 1);

        let report = ctl.finish();
        assert_eq!(report.ticks, 1000);
        // 1000 ticks at 1 kHz is about a second of wall clock
        assert!(report.duration_secs > 0.5 && report.duration_secs < 5.0);
    }

    #[test]
    fn feedback_lands_in_the_sample_history() {
        let mut data = Vec::with_capacity(8);
        data.extend_from_slice(&40000_u16.to_be_bytes());
        data.extend_from_slice(&30000_u16.to_be_bytes());
        data.extend_from_slice(&[0u8; 4]);

        let mut bus = MockBus::new();
        bus.queue(CanFrame::new(0x0200_1400, data));

        let mut ctl = make_loop(bus, 3);
        ctl.run(&CancelToken::new()).unwrap();

        let report = ctl.finish();
        assert_eq!(report.feedback_frames, 1);
        let raw = scale_to_u16(
            report.samples[0].actual_position,
            crate::motor::profile::PROFILE_O2.position,
        );
        assert!((39999..=40000).contains(&raw));
    }

    #[test]
    fn zero_frequency_is_rejected_before_any_bus_io() {
        let driver = MotorDriver::new(MockBus::new(), 20, &MotorRegistry::stock_biped()).unwrap();
        let cfg = LoopConfig {
            frequency_hz: 0.0,
            ..LoopConfig::default()
        };
        let mut ctl = ControlLoop::new(driver, sine(), cfg);
        assert!(matches!(
            ctl.run(&CancelToken::new()),
            Err(LoopError::InvalidFrequency(_))
        ));
        assert!(ctl.driver.bus().sent.is_empty());
    }

    /// Trajectory that burns more than one period per evaluation
    struct SlowTrajectory;

    impl Trajectory for SlowTrajectory {
        fn sample(&self, t: f32) -> Setpoint {
            thread::sleep(Duration::from_millis(3));
            Setpoint {
                position: t,
                velocity: 1.0,
            }
        }
    }

    #[test]
    fn overruns_are_counted_but_not_fatal() {
        let driver = MotorDriver::new(MockBus::new(), 20, &MotorRegistry::stock_biped()).unwrap();
        let mut ctl = ControlLoop::new(driver, SlowTrajectory, fast_config(10));
        ctl.run(&CancelToken::new()).unwrap();

        let report = ctl.finish();
        assert_eq!(report.ticks, 10, "overruns never drop ticks");
        assert!(report.overruns >= 9, "every 3ms tick overruns a 1ms period");
    }

    #[test]
    fn cancel_token_interrupts_settle_sleep() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let begin = Instant::now();
        sleep_cancellable(&cancel, Duration::from_secs(10));
        assert!(begin.elapsed() < Duration::from_secs(1));
    }
}
