// MIT-mode wire codec for RobStride joint actuators
//
// Frame shapes (29-bit extended arbitration id, 8-byte payload):
//   enable   [0x03][host:16      ][motorId:8]   zero payload
//   disable  [0x04][host:16      ][motorId:8]   zero payload
//   control  [0x01][torque_u16:16][motorId:8]   payload >HHHH pos, vel, kp, kd
//
// All u16 fields are physical values scaled onto 0..=65535 against the
// motor's range table; payload fields are big-endian.

use crate::bus::CanFrame;

use super::profile::{MotorProfile, Range};

/// Identity this host claims in enable/disable/param frames
pub const HOST_ID: u8 = 0xFD;

pub const MUX_CONTROL: u8 = 0x01;
pub const MUX_ENABLE: u8 = 0x03;
pub const MUX_DISABLE: u8 = 0x04;

/// Clamp into the range, then map linearly onto 0..=65535.
///
/// The scaled float is truncated toward zero, not rounded: the controller
/// firmware inverts with the same truncation, and a rounded encoder would sit
/// half a quantization step off from every deployed unit.
pub fn scale_to_u16(value: f32, range: Range) -> u16 {
    let clamped = range.clamp(value);
    (65535.0 * (clamped - range.min) / range.width()) as u16
}

/// Inverse affine map of [`scale_to_u16`]. Lossy round trip: the result is
/// within one quantization step `width / 65535` of the encoded value.
pub fn unscale_u16(raw: u16, range: Range) -> f32 {
    f32::from(raw) / 65535.0 * range.width() + range.min
}

/// One MIT-mode setpoint in physical units. Values outside the motor's ranges
/// are clamped by the codec, not rejected.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlCommand {
    /// rad
    pub position: f32,
    /// rad/s
    pub velocity: f32,
    pub kp: f32,
    pub kd: f32,
    /// N·m feedforward
    pub torque: f32,
}

fn admin_frame(mux: u8, motor_id: u8) -> CanFrame {
    let id = (u32::from(mux) << 24) | (u32::from(HOST_ID) << 8) | u32::from(motor_id);
    CanFrame::new(id, vec![0u8; 8])
}

pub fn enable_frame(motor_id: u8) -> CanFrame {
    admin_frame(MUX_ENABLE, motor_id)
}

pub fn disable_frame(motor_id: u8) -> CanFrame {
    admin_frame(MUX_DISABLE, motor_id)
}

/// Build the control frame for one setpoint. Torque rides in the arbitration
/// id; the other four fields fill the payload in fixed order.
pub fn control_frame(motor_id: u8, cmd: &ControlCommand, profile: &MotorProfile) -> CanFrame {
    let pos = scale_to_u16(cmd.position, profile.position);
    let vel = scale_to_u16(cmd.velocity, profile.velocity);
    let kp = scale_to_u16(cmd.kp, profile.kp);
    let kd = scale_to_u16(cmd.kd, profile.kd);
    let torque = scale_to_u16(cmd.torque, profile.torque);

    let id =
        (u32::from(MUX_CONTROL) << 24) | (u32::from(torque) << 8) | u32::from(motor_id & 0xFF);

    let mut data = Vec::with_capacity(8);
    data.extend_from_slice(&pos.to_be_bytes());
    data.extend_from_slice(&vel.to_be_bytes());
    data.extend_from_slice(&kp.to_be_bytes());
    data.extend_from_slice(&kd.to_be_bytes());
    CanFrame::new(id, data)
}

/// Does this arbitration id carry `motor_id` as its sender?
///
/// Single-joint firmware reports the id in bits 8-15; the biped addressing
/// scheme puts it in the low byte. Both are in the field, so the primary
/// location is tried first and the low byte only when it did not match.
pub fn matches_motor(arbitration_id: u32, motor_id: u8) -> bool {
    if ((arbitration_id >> 8) & 0xFF) as u8 == motor_id {
        return true;
    }
    (arbitration_id & 0xFF) as u8 == motor_id
}

/// Position/velocity snapshot decoded from one feedback frame
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Feedback {
    /// rad
    pub position: f32,
    /// rad/s
    pub velocity: f32,
}

/// Decode a feedback frame from `motor_id`, or `None` when the frame is not
/// ours: hardware error frames, frames from other motors, and short payloads
/// are all dropped here. The bus interleaves telemetry with error frames and
/// the layers above tolerate gaps, so none of these are faults.
pub fn parse_feedback(frame: &CanFrame, motor_id: u8, profile: &MotorProfile) -> Option<Feedback> {
    if frame.is_error {
        return None;
    }
    if !matches_motor(frame.id, motor_id) {
        return None;
    }
    let pos = frame.data.get(0..2)?;
    let vel = frame.data.get(2..4)?;
    let pos_raw = u16::from_be_bytes([pos[0], pos[1]]);
    let vel_raw = u16::from_be_bytes([vel[0], vel[1]]);
    Some(Feedback {
        position: unscale_u16(pos_raw, profile.position),
        velocity: unscale_u16(vel_raw, profile.velocity),
    })
}
