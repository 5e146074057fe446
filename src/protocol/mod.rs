//! Chassis wire protocol
//!
//! Binary framing spoken over the serial link to the rover chassis.
//! Outbound frames carry commands (velocity, servo, status poll, halt);
//! inbound frames carry acknowledgements and telemetry. Every outbound
//! frame has a correlation id echoed back by the chassis ack so replies
//! can be matched to the command that caused them.

mod decode;
mod frame;
mod ring_buffer;

pub use decode::Decoder;
pub use frame::{checksum, TxFrame, MAX_FRAME_SIZE, MIN_FRAME_SIZE, MAX_WIRE_PAYLOAD};
pub use ring_buffer::ByteRing;

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU16, Ordering};

/// First sync byte of every frame
pub const SYNC_1: u8 = 0xA5;
/// Second sync byte of every frame
pub const SYNC_2: u8 = 0x5A;

/// Outbound frame kinds (controller to chassis)
pub const KIND_SET_VELOCITY: u8 = 0x10;
pub const KIND_SET_SERVO: u8 = 0x11;
pub const KIND_REQUEST_STATUS: u8 = 0x12;
pub const KIND_HALT: u8 = 0x13;

/// Inbound frame kinds (chassis to controller)
pub const KIND_ACK: u8 = 0x80;
pub const KIND_TELEMETRY: u8 = 0x81;

/// Payload length in bytes for each fixed-size frame kind
pub const VELOCITY_PAYLOAD_LEN: usize = 4;
pub const SERVO_PAYLOAD_LEN: usize = 2;
pub const ACK_PAYLOAD_LEN: usize = 1;
pub const TELEMETRY_PAYLOAD_LEN: usize = 14;

/// Highest addressable servo channel
pub const MAX_SERVO_CHANNEL: u8 = 15;
/// Highest accepted servo angle in degrees
pub const MAX_SERVO_ANGLE: u8 = 180;

/// Correlation id carried by every frame
pub type CorrId = u16;

static NEXT_CORR: AtomicU16 = AtomicU16::new(1);

/// Allocate the next correlation id, wrapping past the reserved 0
pub fn next_corr_id() -> CorrId {
    loop {
        let id = NEXT_CORR.fetch_add(1, Ordering::Relaxed);
        if id != 0 {
            return id;
        }
    }
}

/// Wire protocol revision negotiated via configuration
///
/// Only one revision exists today; the variant keeps configs explicit
/// about what the peer firmware speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolVersion {
    V1,
}

impl ProtocolVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolVersion::V1 => "v1",
        }
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scale a normalized value in [-1.0, 1.0] to wire milli-units
pub(crate) fn to_milli(v: f64) -> i16 {
    (v * 1000.0).round() as i16
}

/// Expand wire milli-units back to a normalized value
pub(crate) fn from_milli(v: i16) -> f64 {
    f64::from(v) / 1000.0
}

/// Kind of an outbound command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    SetVelocity,
    SetServo,
    RequestStatus,
    Halt,
}

impl CommandKind {
    /// Wire byte for this kind
    pub fn wire_kind(&self) -> u8 {
        match self {
            CommandKind::SetVelocity => KIND_SET_VELOCITY,
            CommandKind::SetServo => KIND_SET_SERVO,
            CommandKind::RequestStatus => KIND_REQUEST_STATUS,
            CommandKind::Halt => KIND_HALT,
        }
    }

    /// Motion commands require a session and are subject to arbitration
    pub fn is_motion(&self) -> bool {
        matches!(self, CommandKind::SetVelocity | CommandKind::SetServo)
    }

    /// Preempting commands jump the queue and interrupt in-flight waits
    pub fn is_preempt(&self) -> bool {
        matches!(self, CommandKind::Halt)
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CommandKind::SetVelocity => "set_velocity",
            CommandKind::SetServo => "set_servo",
            CommandKind::RequestStatus => "request_status",
            CommandKind::Halt => "halt",
        };
        f.write_str(name)
    }
}

/// Validated outbound command with its correlation id
///
/// Constructors range-check parameters and allocate the correlation id,
/// so a `Command` that exists is always encodable.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    SetVelocity {
        corr: CorrId,
        linear_mil: i16,
        angular_mil: i16,
    },
    SetServo {
        corr: CorrId,
        channel: u8,
        angle_deg: u8,
    },
    RequestStatus {
        corr: CorrId,
    },
    Halt {
        corr: CorrId,
    },
}

impl Command {
    /// Build a velocity command from normalized [-1.0, 1.0] inputs
    pub fn set_velocity(linear: f64, angular: f64) -> crate::Result<Self> {
        check_normalized("linear velocity", linear)?;
        check_normalized("angular velocity", angular)?;
        Ok(Command::SetVelocity {
            corr: next_corr_id(),
            linear_mil: to_milli(linear),
            angular_mil: to_milli(angular),
        })
    }

    /// Build a servo positioning command
    pub fn set_servo(channel: u8, angle_deg: u8) -> crate::Result<Self> {
        if channel > MAX_SERVO_CHANNEL {
            return Err(crate::Error::InvalidCommand(format!(
                "servo channel {} exceeds maximum {}",
                channel, MAX_SERVO_CHANNEL
            )));
        }
        if angle_deg > MAX_SERVO_ANGLE {
            return Err(crate::Error::InvalidCommand(format!(
                "servo angle {} exceeds maximum {} degrees",
                angle_deg, MAX_SERVO_ANGLE
            )));
        }
        Ok(Command::SetServo {
            corr: next_corr_id(),
            channel,
            angle_deg,
        })
    }

    /// Build a telemetry poll command
    pub fn request_status() -> Self {
        Command::RequestStatus {
            corr: next_corr_id(),
        }
    }

    /// Build an emergency stop command
    pub fn halt() -> Self {
        Command::Halt {
            corr: next_corr_id(),
        }
    }

    pub fn corr(&self) -> CorrId {
        match self {
            Command::SetVelocity { corr, .. }
            | Command::SetServo { corr, .. }
            | Command::RequestStatus { corr }
            | Command::Halt { corr } => *corr,
        }
    }

    pub fn kind(&self) -> CommandKind {
        match self {
            Command::SetVelocity { .. } => CommandKind::SetVelocity,
            Command::SetServo { .. } => CommandKind::SetServo,
            Command::RequestStatus { .. } => CommandKind::RequestStatus,
            Command::Halt { .. } => CommandKind::Halt,
        }
    }
}

fn check_normalized(what: &str, v: f64) -> crate::Result<()> {
    if !v.is_finite() || !(-1.0..=1.0).contains(&v) {
        return Err(crate::Error::InvalidCommand(format!(
            "{} {} outside [-1.0, 1.0]",
            what, v
        )));
    }
    Ok(())
}

/// Raw chassis feedback carried by a telemetry frame
///
/// Motor fields are wire milli-units; normalization to [-1.0, 1.0]
/// happens when the snapshot is published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TelemetryFrame {
    pub battery_mv: u16,
    pub battery_pct: u8,
    pub left_target: i16,
    pub left_actual: i16,
    pub right_target: i16,
    pub right_actual: i16,
    pub pan_deg: u8,
    pub tilt_deg: u8,
    pub fault_flags: u8,
}

impl TelemetryFrame {
    /// Serialize to the fixed wire payload
    pub fn to_payload(&self) -> [u8; TELEMETRY_PAYLOAD_LEN] {
        let mut p = [0u8; TELEMETRY_PAYLOAD_LEN];
        p[0..2].copy_from_slice(&self.battery_mv.to_le_bytes());
        p[2] = self.battery_pct;
        p[3..5].copy_from_slice(&self.left_target.to_le_bytes());
        p[5..7].copy_from_slice(&self.left_actual.to_le_bytes());
        p[7..9].copy_from_slice(&self.right_target.to_le_bytes());
        p[9..11].copy_from_slice(&self.right_actual.to_le_bytes());
        p[11] = self.pan_deg;
        p[12] = self.tilt_deg;
        p[13] = self.fault_flags;
        p
    }

    /// Parse from a wire payload, rejecting wrong sizes
    pub fn from_payload(p: &[u8]) -> Option<Self> {
        if p.len() != TELEMETRY_PAYLOAD_LEN {
            return None;
        }
        Some(Self {
            battery_mv: u16::from_le_bytes([p[0], p[1]]),
            battery_pct: p[2],
            left_target: i16::from_le_bytes([p[3], p[4]]),
            left_actual: i16::from_le_bytes([p[5], p[6]]),
            right_target: i16::from_le_bytes([p[7], p[8]]),
            right_actual: i16::from_le_bytes([p[9], p[10]]),
            pan_deg: p[11],
            tilt_deg: p[12],
            fault_flags: p[13],
        })
    }
}

/// A fully decoded frame from either direction
///
/// The decoder produces these; test harnesses also use them to play the
/// chassis side of the link.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    SetVelocity {
        corr: CorrId,
        linear: f64,
        angular: f64,
    },
    SetServo {
        corr: CorrId,
        channel: u8,
        angle_deg: u8,
    },
    RequestStatus {
        corr: CorrId,
    },
    Halt {
        corr: CorrId,
    },
    Ack {
        corr: CorrId,
        status: u8,
    },
    Telemetry {
        corr: CorrId,
        data: TelemetryFrame,
    },
}

impl Frame {
    #[allow(dead_code)] // Used by test harnesses
    pub fn corr(&self) -> CorrId {
        match self {
            Frame::SetVelocity { corr, .. }
            | Frame::SetServo { corr, .. }
            | Frame::RequestStatus { corr }
            | Frame::Halt { corr }
            | Frame::Ack { corr, .. }
            | Frame::Telemetry { corr, .. } => *corr,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corr_ids_are_distinct() {
        let a = next_corr_id();
        let b = next_corr_id();
        assert_ne!(a, b);
    }

    #[test]
    fn test_velocity_range_check() {
        assert!(Command::set_velocity(1.0, -1.0).is_ok());
        assert!(Command::set_velocity(0.0, 0.0).is_ok());
        assert!(Command::set_velocity(1.01, 0.0).is_err());
        assert!(Command::set_velocity(0.0, -1.5).is_err());
        assert!(Command::set_velocity(f64::NAN, 0.0).is_err());
        assert!(Command::set_velocity(f64::INFINITY, 0.0).is_err());
    }

    #[test]
    fn test_servo_range_check() {
        assert!(Command::set_servo(0, 0).is_ok());
        assert!(Command::set_servo(15, 180).is_ok());
        assert!(Command::set_servo(16, 90).is_err());
        assert!(Command::set_servo(0, 181).is_err());
    }

    #[test]
    fn test_milli_scaling() {
        assert_eq!(to_milli(1.0), 1000);
        assert_eq!(to_milli(-1.0), -1000);
        assert_eq!(to_milli(0.5), 500);
        assert_eq!(to_milli(-0.75), -750);
        assert_eq!(from_milli(500), 0.5);
        assert_eq!(from_milli(-250), -0.25);
    }

    #[test]
    fn test_telemetry_payload_roundtrip() {
        let t = TelemetryFrame {
            battery_mv: 11730,
            battery_pct: 87,
            left_target: 500,
            left_actual: 480,
            right_target: -500,
            right_actual: -490,
            pan_deg: 90,
            tilt_deg: 45,
            fault_flags: 0b0000_0010,
        };
        let p = t.to_payload();
        assert_eq!(TelemetryFrame::from_payload(&p), Some(t));
        assert_eq!(TelemetryFrame::from_payload(&p[..13]), None);
    }

    #[test]
    fn test_command_kind_classification() {
        assert!(CommandKind::SetVelocity.is_motion());
        assert!(CommandKind::SetServo.is_motion());
        assert!(!CommandKind::RequestStatus.is_motion());
        assert!(!CommandKind::Halt.is_motion());
        assert!(CommandKind::Halt.is_preempt());
        assert!(!CommandKind::SetVelocity.is_preempt());
    }
}
