// Parameter RPC over the shared bus
//
// Two layers: `RobstrideClient` speaks the vendor private read/write protocol
// (one request/response exchange per call, bounded timeout), and
// `ParamChannel` wraps any such transport with the flush-then-try-then-retry
// discipline. The flush matters: the protocol has no request ids, so a stale
// response left queued from an earlier exchange would be attributed to the
// current one.

use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::bus::{BusError, CanBus, CanFrame};
use crate::config::{DEFAULT_PARAM_RETRIES, DEFAULT_PARAM_TIMEOUT};

use super::mit::{HOST_ID, disable_frame, enable_frame, matches_motor};

pub const MUX_ZERO_POS: u8 = 0x06;
pub const MUX_READ_PARAM: u8 = 0x11;
pub const MUX_WRITE_PARAM: u8 = 0x12;
/// Persists the active configuration (including a fresh zero offset) to flash
pub const MUX_SAVE_CONFIG: u8 = 0x16;

/// Inbound frames drained per flush; bounds the drain even against a babbling
/// bus.
const FLUSH_LIMIT: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum ParamError {
    #[error("unknown parameter '{0}'")]
    UnknownParam(String),

    #[error("motor {motor_id}: no response to {what} within {timeout:?}")]
    Timeout {
        motor_id: u8,
        what: &'static str,
        timeout: Duration,
    },

    #[error("motor {motor_id}: malformed {what} response ({len} byte payload)")]
    MalformedResponse {
        motor_id: u8,
        what: &'static str,
        len: usize,
    },

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error("motor {motor_id}: could not complete {what} after {attempts} attempts")]
    RetriesExhausted {
        motor_id: u8,
        what: String,
        attempts: u32,
    },
}

/// Motor operating mode, written through the `run_mode` parameter
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// MIT-mode position/velocity/torque control
    Operation = 0,
    Position = 1,
    Speed = 2,
    Current = 3,
}

/// Wire width of one parameter's value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    F32,
    U8,
    I16,
}

#[derive(Debug, Clone, Copy)]
pub struct ParamDef {
    pub name: &'static str,
    pub index: u16,
    pub kind: ParamKind,
}

/// The named subset of the controller's parameter table this crate touches.
/// The full dictionary lives in the vendor manual; everything crosses the
/// channel as f32 regardless of wire width.
pub const PARAM_TABLE: &[ParamDef] = &[
    ParamDef { name: "run_mode", index: 0x7005, kind: ParamKind::U8 },
    ParamDef { name: "iq_ref", index: 0x7006, kind: ParamKind::F32 },
    ParamDef { name: "spd_ref", index: 0x700A, kind: ParamKind::F32 },
    ParamDef { name: "limit_torque", index: 0x700B, kind: ParamKind::F32 },
    ParamDef { name: "loc_ref", index: 0x7016, kind: ParamKind::F32 },
    ParamDef { name: "limit_spd", index: 0x7017, kind: ParamKind::F32 },
    ParamDef { name: "limit_cur", index: 0x7018, kind: ParamKind::F32 },
    ParamDef { name: "mechpos", index: 0x7019, kind: ParamKind::F32 },
    ParamDef { name: "mechvel", index: 0x701B, kind: ParamKind::F32 },
    ParamDef { name: "vbus", index: 0x701C, kind: ParamKind::F32 },
    ParamDef { name: "rotation", index: 0x701D, kind: ParamKind::I16 },
    ParamDef { name: "loc_kp", index: 0x701E, kind: ParamKind::F32 },
    ParamDef { name: "spd_kp", index: 0x701F, kind: ParamKind::F32 },
    ParamDef { name: "spd_ki", index: 0x7020, kind: ParamKind::F32 },
];

pub fn lookup_param(name: &str) -> Result<&'static ParamDef, ParamError> {
    PARAM_TABLE
        .iter()
        .find(|p| p.name == name)
        .ok_or_else(|| ParamError::UnknownParam(name.to_string()))
}

/// Single-shot request/response primitive the retrying channel is built on
pub trait ParamTransport {
    /// Discard everything currently queued inbound without waiting for more.
    /// Returns the number of frames dropped.
    fn flush(&mut self) -> Result<usize, ParamError>;

    fn read_once(&mut self, motor_id: u8, key: &str) -> Result<f32, ParamError>;

    fn write_once(&mut self, motor_id: u8, key: &str, value: f32) -> Result<(), ParamError>;
}

/// Vendor private-protocol client: param index in payload bytes 0-1
/// (little-endian), value in bytes 4-7, response matched by mux and motor
/// identity.
pub struct RobstrideClient<B> {
    bus: B,
    timeout: Duration,
}

impl<B: CanBus> RobstrideClient<B> {
    pub fn new(bus: B) -> Self {
        Self::with_timeout(bus, DEFAULT_PARAM_TIMEOUT)
    }

    pub fn with_timeout(bus: B, timeout: Duration) -> Self {
        Self { bus, timeout }
    }

    fn request_frame(mux: u8, motor_id: u8, data: [u8; 8]) -> CanFrame {
        let id = (u32::from(mux) << 24) | (u32::from(HOST_ID) << 8) | u32::from(motor_id);
        CanFrame::new(id, data.to_vec())
    }

    /// Send one request and wait for the matching response, skipping error
    /// frames and frames from other motors until the deadline.
    fn exchange(
        &mut self,
        motor_id: u8,
        what: &'static str,
        request: CanFrame,
        response_mux: u8,
    ) -> Result<CanFrame, ParamError> {
        self.bus.send(&request)?;

        let deadline = Instant::now() + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ParamError::Timeout {
                    motor_id,
                    what,
                    timeout: self.timeout,
                });
            }
            let Some(frame) = self.bus.receive(remaining)? else {
                return Err(ParamError::Timeout {
                    motor_id,
                    what,
                    timeout: self.timeout,
                });
            };
            if frame.is_error {
                continue;
            }
            if (frame.id >> 24) as u8 == response_mux && matches_motor(frame.id, motor_id) {
                return Ok(frame);
            }
            debug!(motor_id, what, id = format_args!("0x{:08X}", frame.id), "skipping unrelated frame");
        }
    }

    /// Measure the current mechanical angle and make it the session zero
    pub fn zero_position(&mut self, motor_id: u8) -> Result<(), ParamError> {
        let mut data = [0u8; 8];
        data[0] = 1;
        self.exchange(
            motor_id,
            "zero_pos",
            Self::request_frame(MUX_ZERO_POS, motor_id, data),
            MUX_ZERO_POS,
        )?;
        Ok(())
    }

    /// Persist the active configuration (zero offset included) to flash
    pub fn save_configuration(&mut self, motor_id: u8) -> Result<(), ParamError> {
        self.exchange(
            motor_id,
            "save_configuration",
            Self::request_frame(MUX_SAVE_CONFIG, motor_id, [0u8; 8]),
            MUX_SAVE_CONFIG,
        )?;
        Ok(())
    }

    /// MIT-mode enable, fire-and-forget
    pub fn enable(&mut self, motor_id: u8) -> Result<(), ParamError> {
        self.bus.send(&enable_frame(motor_id))?;
        Ok(())
    }

    /// MIT-mode disable, fire-and-forget
    pub fn disable(&mut self, motor_id: u8) -> Result<(), ParamError> {
        self.bus.send(&disable_frame(motor_id))?;
        Ok(())
    }
}

fn decode_value(
    frame: &CanFrame,
    def: &ParamDef,
    motor_id: u8,
) -> Result<f32, ParamError> {
    let bytes = frame
        .data
        .get(4..8)
        .ok_or(ParamError::MalformedResponse {
            motor_id,
            what: def.name,
            len: frame.data.len(),
        })?;
    let value = match def.kind {
        ParamKind::F32 => f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        ParamKind::U8 => f32::from(bytes[0]),
        ParamKind::I16 => f32::from(i16::from_le_bytes([bytes[0], bytes[1]])),
    };
    Ok(value)
}

fn encode_value(def: &ParamDef, value: f32) -> [u8; 4] {
    match def.kind {
        ParamKind::F32 => value.to_le_bytes(),
        ParamKind::U8 => [value as u8, 0, 0, 0],
        ParamKind::I16 => {
            let raw = (value as i16).to_le_bytes();
            [raw[0], raw[1], 0, 0]
        }
    }
}

impl<B: CanBus> ParamTransport for RobstrideClient<B> {
    fn flush(&mut self) -> Result<usize, ParamError> {
        let mut drained = 0;
        while drained < FLUSH_LIMIT {
            match self.bus.receive(Duration::ZERO)? {
                Some(_) => drained += 1,
                None => break,
            }
        }
        if drained > 0 {
            debug!(drained, "flushed stale frames before exchange");
        }
        Ok(drained)
    }

    fn read_once(&mut self, motor_id: u8, key: &str) -> Result<f32, ParamError> {
        let def = lookup_param(key)?;
        let mut data = [0u8; 8];
        data[0..2].copy_from_slice(&def.index.to_le_bytes());

        let response = self.exchange(
            motor_id,
            def.name,
            Self::request_frame(MUX_READ_PARAM, motor_id, data),
            MUX_READ_PARAM,
        )?;

        // The response echoes the index; a different one is a stale answer to
        // somebody else's question.
        match response.data.get(0..2) {
            Some(echo) if echo == def.index.to_le_bytes() => {}
            _ => {
                return Err(ParamError::MalformedResponse {
                    motor_id,
                    what: def.name,
                    len: response.data.len(),
                });
            }
        }
        decode_value(&response, def, motor_id)
    }

    fn write_once(&mut self, motor_id: u8, key: &str, value: f32) -> Result<(), ParamError> {
        let def = lookup_param(key)?;
        let mut data = [0u8; 8];
        data[0..2].copy_from_slice(&def.index.to_le_bytes());
        data[4..8].copy_from_slice(&encode_value(def, value));

        self.exchange(
            motor_id,
            def.name,
            Self::request_frame(MUX_WRITE_PARAM, motor_id, data),
            MUX_WRITE_PARAM,
        )?;
        Ok(())
    }
}

/// Retrying wrapper: flush stale inbound frames, try the exchange, repeat up
/// to the attempt limit. A calibration sweep over many motors survives one
/// absent or slow motor this way.
pub struct ParamChannel<T> {
    transport: T,
    retries: u32,
}

impl<T: ParamTransport> ParamChannel<T> {
    pub fn new(transport: T) -> Self {
        Self::with_retries(transport, DEFAULT_PARAM_RETRIES)
    }

    pub fn with_retries(transport: T, retries: u32) -> Self {
        Self {
            transport,
            retries: retries.max(1),
        }
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    fn attempt<R>(
        &mut self,
        motor_id: u8,
        what: &str,
        mut op: impl FnMut(&mut T) -> Result<R, ParamError>,
    ) -> Result<R, ParamError> {
        for attempt in 1..=self.retries {
            if let Err(e) = self.transport.flush() {
                warn!(motor_id, what, attempt, "flush failed: {e}");
                continue;
            }
            match op(&mut self.transport) {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(motor_id, what, attempt, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => warn!(motor_id, what, attempt, "attempt failed: {e}"),
            }
        }
        Err(ParamError::RetriesExhausted {
            motor_id,
            what: what.to_string(),
            attempts: self.retries,
        })
    }

    /// Read a parameter, or `None` once every attempt has failed. The misses
    /// are logged per attempt; the caller's sweep keeps going either way.
    pub fn read(&mut self, motor_id: u8, key: &str) -> Option<f32> {
        match self.attempt(motor_id, key, |t| t.read_once(motor_id, key)) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(motor_id, key, "{e}");
                None
            }
        }
    }

    /// Write a parameter through the flush/retry discipline. Never panics;
    /// exhausted retries come back as `RetriesExhausted`.
    pub fn write(&mut self, motor_id: u8, key: &str, value: f32) -> Result<(), ParamError> {
        self.attempt(motor_id, key, |t| t.write_once(motor_id, key, value))
    }
}

impl<B: CanBus> ParamChannel<RobstrideClient<B>> {
    pub fn zero_position(&mut self, motor_id: u8) -> Result<(), ParamError> {
        self.attempt(motor_id, "zero_pos", |t| t.zero_position(motor_id))
    }

    pub fn save_configuration(&mut self, motor_id: u8) -> Result<(), ParamError> {
        self.attempt(motor_id, "save_configuration", |t| {
            t.save_configuration(motor_id)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::mock::MockBus;
    use std::collections::VecDeque;

    /// Transport whose read/write outcomes are scripted up front
    #[derive(Default)]
    struct ScriptedTransport {
        read_results: VecDeque<Result<f32, ParamError>>,
        write_results: VecDeque<Result<(), ParamError>>,
        reads: u32,
        writes: u32,
        flushes: u32,
    }

    fn timeout_err() -> ParamError {
        ParamError::Timeout {
            motor_id: 7,
            what: "vbus",
            timeout: Duration::from_millis(50),
        }
    }

    impl ParamTransport for ScriptedTransport {
        fn flush(&mut self) -> Result<usize, ParamError> {
            self.flushes += 1;
            Ok(0)
        }

        fn read_once(&mut self, _motor_id: u8, _key: &str) -> Result<f32, ParamError> {
            self.reads += 1;
            self.read_results.pop_front().unwrap_or_else(|| Err(timeout_err()))
        }

        fn write_once(&mut self, _motor_id: u8, _key: &str, _value: f32) -> Result<(), ParamError> {
            self.writes += 1;
            self.write_results.pop_front().unwrap_or_else(|| Err(timeout_err()))
        }
    }

    #[test]
    fn read_succeeds_after_two_failures_with_three_retries() {
        let mut transport = ScriptedTransport::default();
        transport.read_results =
            VecDeque::from([Err(timeout_err()), Err(timeout_err()), Ok(24.1)]);

        let mut channel = ParamChannel::with_retries(transport, 3);
        assert_eq!(channel.read(7, "vbus"), Some(24.1));

        let transport = channel.transport_mut();
        assert_eq!(transport.reads, 3, "two failed attempts plus the success");
        assert_eq!(transport.flushes, 3, "every attempt flushes first");
    }

    #[test]
    fn read_returns_none_after_exhausting_retries() {
        let mut channel = ParamChannel::with_retries(ScriptedTransport::default(), 3);
        assert_eq!(channel.read(7, "vbus"), None);
        assert_eq!(channel.transport_mut().reads, 3);
    }

    #[test]
    fn write_reports_exhaustion_without_panicking() {
        let mut channel = ParamChannel::with_retries(ScriptedTransport::default(), 2);
        let err = channel.write(9, "limit_spd", 5.0).unwrap_err();
        assert!(matches!(
            err,
            ParamError::RetriesExhausted { motor_id: 9, attempts: 2, .. }
        ));
        assert_eq!(channel.transport_mut().writes, 2);
    }

    #[test]
    fn write_first_try_does_not_retry() {
        let mut transport = ScriptedTransport::default();
        transport.write_results = VecDeque::from([Ok(())]);
        let mut channel = ParamChannel::with_retries(transport, 3);
        channel.write(7, "run_mode", 0.0).unwrap();
        assert_eq!(channel.transport_mut().writes, 1);
    }

    fn read_response(motor_id: u8, index: u16, value: f32) -> CanFrame {
        let id = (u32::from(MUX_READ_PARAM) << 24)
            | (u32::from(motor_id) << 8)
            | u32::from(HOST_ID);
        let mut data = vec![0u8; 8];
        data[0..2].copy_from_slice(&index.to_le_bytes());
        data[4..8].copy_from_slice(&value.to_le_bytes());
        CanFrame { id, data, is_error: false }
    }

    #[test]
    fn client_read_round_trip_over_mock_bus() {
        let mut bus = MockBus::new();
        bus.queue(read_response(7, 0x701C, 23.9));

        let mut client = RobstrideClient::new(bus);
        let value = client.read_once(7, "vbus").unwrap();
        assert!((value - 23.9).abs() < 1e-6);

        // request went out with the index in bytes 0-1, little-endian
        let sent = &client.bus.sent[0];
        assert_eq!((sent.id >> 24) as u8, MUX_READ_PARAM);
        assert_eq!(sent.data[0..2], 0x701C_u16.to_le_bytes());
    }

    #[test]
    fn client_skips_stale_response_for_other_index() {
        let mut bus = MockBus::new();
        // stale response for mechpos, then nothing: the mismatched echo is an
        // error, not a wrong value
        bus.queue(read_response(7, 0x7019, 1.0));

        let mut client =
            RobstrideClient::with_timeout(bus, Duration::from_millis(5));
        assert!(matches!(
            client.read_once(7, "vbus"),
            Err(ParamError::MalformedResponse { .. })
        ));
    }

    #[test]
    fn client_ignores_frames_from_other_motors() {
        let mut bus = MockBus::new();
        bus.queue(read_response(9, 0x701C, 1.0));
        bus.queue(read_response(7, 0x701C, 48.0));

        let mut client = RobstrideClient::new(bus);
        let value = client.read_once(7, "vbus").unwrap();
        assert!((value - 48.0).abs() < 1e-6);
    }

    #[test]
    fn client_times_out_on_silence() {
        let bus = MockBus::new();
        let mut client =
            RobstrideClient::with_timeout(bus, Duration::from_millis(5));
        assert!(matches!(
            client.read_once(7, "vbus"),
            Err(ParamError::Timeout { motor_id: 7, .. })
        ));
    }

    #[test]
    fn flush_drains_everything_queued() {
        let mut bus = MockBus::new();
        for i in 0..5 {
            bus.queue(CanFrame::new(i, vec![]));
        }
        let mut client = RobstrideClient::new(bus);
        assert_eq!(client.flush().unwrap(), 5);
        assert_eq!(client.flush().unwrap(), 0);
    }

    #[test]
    fn unknown_param_is_rejected_before_any_bus_traffic() {
        let mut client = RobstrideClient::new(MockBus::new());
        assert!(matches!(
            client.read_once(7, "warp_drive"),
            Err(ParamError::UnknownParam(_))
        ));
        assert!(client.bus.sent.is_empty());
    }

    #[test]
    fn run_mode_writes_as_a_single_byte() {
        let def = lookup_param("run_mode").unwrap();
        let encoded = encode_value(def, f32::from(RunMode::Operation as u8));
        assert_eq!(encoded, [0, 0, 0, 0]);
        let encoded = encode_value(def, f32::from(RunMode::Speed as u8));
        assert_eq!(encoded, [2, 0, 0, 0]);
    }
}
