//! Command and feedback frame codec
//!
//! Frames are plain byte arrays with little-endian fields at fixed offsets.
//!
//! Command (17 bytes):
//!
//! ```text
//! 0  1  | 2       | 3  4   | 5  6     | 7  8  9  10 | 11 12 | 13 14 | 15 16
//! header| mode:id | torque | velocity | position    | kp    | kd    | crc
//! ```
//!
//! Feedback (16 bytes):
//!
//! ```text
//! 0  1  | 2       | 3  4   | 5  6     | 7  8  9  10 | 11   | 12 13          | 14 15
//! header| mode:id | torque | velocity | position    | temp | err:3 force:12 | crc
//! ```
//!
//! Fixed-point scales: torque is q8 N·m, velocity and gains are q15 over
//! 25.6, position is q15 over one revolution of the motor shaft. Joint angles
//! pass through the gearbox ratio on the way in and out.

use std::f64::consts::TAU;

use super::crc::ChecksumVersion;

/// Motor shaft turns per joint output turn
pub const GEAR_RATIO: f64 = 6.33;

/// Size of a command frame in bytes
pub const COMMAND_LEN: usize = 17;
/// Size of a feedback frame in bytes
pub const FEEDBACK_LEN: usize = 16;

/// Command frame header; byte 1 keys the command checksum
pub const COMMAND_HEADER: [u8; 2] = [0xFE, 0xEE];
/// Feedback frame header
pub const FEEDBACK_HEADER: [u8; 2] = [0xFD, 0xEE];

/// mode:id value that switches a motor into its bootloader
pub const BOOT_MODE_ID: u8 = 0x7F;
/// mode:id value marking a frame that was never filled in
pub const UNPOPULATED_MODE_ID: u8 = 0xFF;
/// Highest addressable motor id (also the broadcast id)
pub const MAX_MOTOR_ID: u8 = 15;

const TORQUE_SCALE: f64 = 256.0;
const VELOCITY_SCALE: f64 = 32768.0 / 25.6;
const GAIN_SCALE: f64 = 32768.0 / 25.6;
const POSITION_SCALE: f64 = 32768.0 / TAU;
/// Motor-shaft radians beyond which the 32-bit position field would overflow
const POSITION_LIMIT: f64 = i32::MAX as f64 / POSITION_SCALE;

mod offset {
    pub const MODE_ID: usize = 2;
    pub const TORQUE: usize = 3;
    pub const VELOCITY: usize = 5;
    pub const POSITION: usize = 7;
    pub const KP: usize = 11;
    pub const KD: usize = 13;
    pub const COMMAND_CRC: usize = 15;

    pub const TEMPERATURE: usize = 11;
    pub const STATUS: usize = 12;
    pub const FEEDBACK_CRC: usize = 14;
}

/// Why a received frame cannot be trusted
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("checksum mismatch: expected {expected:04X}, frame carries {actual:04X}")]
    Checksum { expected: u16, actual: u16 },

    #[error("unexpected header {0:02X?}")]
    Header([u8; 2]),

    #[error("frame was never populated")]
    Unpopulated,

    #[error("reply came from motor {actual}, expected motor {expected}")]
    WrongMotor { expected: u8, actual: u8 },

    #[error("malformed provisioning reply {0:02X?}")]
    Provisioning([u8; 4]),
}

/// Command mode carried in the high nibble of the mode:id byte
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotorMode {
    /// Zero torque, zero gains; the motor coasts
    Brake = 0,
    /// Torque + velocity + position with the given gains
    Drive = 1,
}

impl MotorMode {
    fn from_nibble(nibble: u8) -> Option<Self> {
        match nibble {
            0 => Some(MotorMode::Brake),
            1 => Some(MotorMode::Drive),
            _ => None,
        }
    }
}

/// Fault reported by the motor in the 3-bit error field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MotorError {
    #[default]
    None,
    OverHeating,
    OverCurrent,
    OverVoltage,
    EncoderFailure,
    Reserved(u8),
}

impl MotorError {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x7 {
            0 => MotorError::None,
            1 => MotorError::OverHeating,
            2 => MotorError::OverCurrent,
            3 => MotorError::OverVoltage,
            4 => MotorError::EncoderFailure,
            other => MotorError::Reserved(other),
        }
    }

    pub fn bits(self) -> u8 {
        match self {
            MotorError::None => 0,
            MotorError::OverHeating => 1,
            MotorError::OverCurrent => 2,
            MotorError::OverVoltage => 3,
            MotorError::EncoderFailure => 4,
            MotorError::Reserved(b) => b & 0x7,
        }
    }

    #[inline]
    pub fn is_fault(self) -> bool {
        self != MotorError::None
    }
}

#[inline]
fn read_i16(bytes: &[u8], at: usize) -> i16 {
    i16::from_le_bytes([bytes[at], bytes[at + 1]])
}

#[inline]
fn read_i32(bytes: &[u8], at: usize) -> i32 {
    i32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

#[inline]
fn read_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

/// A motor command
///
/// Holds the raw frame bytes; setters quantize physical values straight into
/// their fields. The checksum is filled in by [`CommandFrame::encode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandFrame {
    bytes: [u8; COMMAND_LEN],
}

impl Default for CommandFrame {
    fn default() -> Self {
        let mut bytes = [0u8; COMMAND_LEN];
        bytes[..2].copy_from_slice(&COMMAND_HEADER);
        Self { bytes }
    }
}

impl CommandFrame {
    /// A zeroed command for `motor_id` in the given mode
    pub fn new(motor_id: u8, mode: MotorMode) -> Self {
        let mut frame = Self::default();
        frame.set_motor_id(motor_id);
        frame.set_mode(mode);
        frame
    }

    /// The brake command: zero gains, zero torque, zero position
    pub fn brake(motor_id: u8) -> Self {
        Self::new(motor_id, MotorMode::Brake)
    }

    /// Command that drops every motor on the bus into its bootloader
    pub fn boot() -> Self {
        let mut frame = Self::default();
        frame.bytes[offset::MODE_ID] = BOOT_MODE_ID;
        frame
    }

    pub fn mode(&self) -> Option<MotorMode> {
        MotorMode::from_nibble(self.bytes[offset::MODE_ID] >> 4)
    }

    pub fn set_mode(&mut self, mode: MotorMode) {
        let b = &mut self.bytes[offset::MODE_ID];
        *b = (*b & 0x0F) | ((mode as u8) << 4);
    }

    #[inline]
    pub fn is_boot(&self) -> bool {
        self.bytes[offset::MODE_ID] == BOOT_MODE_ID
    }

    #[inline]
    pub fn motor_id(&self) -> u8 {
        self.bytes[offset::MODE_ID] & 0x0F
    }

    pub fn set_motor_id(&mut self, motor_id: u8) {
        let b = &mut self.bytes[offset::MODE_ID];
        *b = (*b & 0xF0) | (motor_id & 0x0F);
    }

    /// Feed-forward torque in N·m
    pub fn set_torque(&mut self, torque: f64) {
        let raw = (torque * TORQUE_SCALE) as i16;
        self.write(offset::TORQUE, &raw.to_le_bytes());
    }

    pub fn torque(&self) -> f64 {
        read_i16(&self.bytes, offset::TORQUE) as f64 / TORQUE_SCALE
    }

    /// Target velocity in rad/s; only carried in drive mode
    ///
    /// Set the mode first: in brake mode the field is forced to zero.
    pub fn set_velocity(&mut self, velocity: f64) {
        let raw = if self.mode() == Some(MotorMode::Drive) {
            (velocity * VELOCITY_SCALE) as i16
        } else {
            0
        };
        self.write(offset::VELOCITY, &raw.to_le_bytes());
    }

    pub fn velocity(&self) -> f64 {
        read_i16(&self.bytes, offset::VELOCITY) as f64 / VELOCITY_SCALE
    }

    /// Target position of the motor shaft in radians
    ///
    /// Values whose magnitude does not fit the 32-bit field leave the field
    /// untouched instead of wrapping around.
    pub fn set_shaft_position(&mut self, radians: f64) {
        if radians.abs() >= POSITION_LIMIT || radians.is_nan() {
            return;
        }
        let raw = (radians * POSITION_SCALE) as i32;
        self.write(offset::POSITION, &raw.to_le_bytes());
    }

    pub fn shaft_position(&self) -> f64 {
        read_i32(&self.bytes, offset::POSITION) as f64 / POSITION_SCALE
    }

    /// Target joint output angle in radians (scaled through the gearbox)
    pub fn set_position_radians(&mut self, radians: f64) {
        self.set_shaft_position(radians * GEAR_RATIO);
    }

    pub fn position_radians(&self) -> f64 {
        self.shaft_position() / GEAR_RATIO
    }

    /// Target joint output angle in degrees
    pub fn set_position_degrees(&mut self, degrees: f64) {
        self.set_position_radians(degrees.to_radians());
    }

    pub fn position_degrees(&self) -> f64 {
        self.position_radians().to_degrees()
    }

    /// Position stiffness gain
    pub fn set_kp(&mut self, kp: f64) {
        let raw = (kp * GAIN_SCALE) as i16;
        self.write(offset::KP, &raw.to_le_bytes());
    }

    pub fn kp(&self) -> f64 {
        read_i16(&self.bytes, offset::KP) as f64 / GAIN_SCALE
    }

    /// Velocity damping gain
    pub fn set_kd(&mut self, kd: f64) {
        let raw = (kd * GAIN_SCALE) as i16;
        self.write(offset::KD, &raw.to_le_bytes());
    }

    pub fn kd(&self) -> f64 {
        read_i16(&self.bytes, offset::KD) as f64 / GAIN_SCALE
    }

    /// Bytes covered by the checksum (mode:id through kd)
    pub fn payload(&self) -> &[u8] {
        &self.bytes[offset::MODE_ID..offset::COMMAND_CRC]
    }

    /// Serialize with the checksum for the given protocol version
    pub fn encode(&self, version: ChecksumVersion) -> [u8; COMMAND_LEN] {
        let mut out = self.bytes;
        let crc = version.command_checksum(COMMAND_HEADER, self.payload());
        out[offset::COMMAND_CRC..].copy_from_slice(&crc.to_le_bytes());
        out
    }

    /// Parse a command frame, verifying header and checksum
    ///
    /// Used by the motor simulator; the host never receives commands.
    pub fn decode(
        bytes: &[u8; COMMAND_LEN],
        version: ChecksumVersion,
    ) -> Result<Self, FrameError> {
        let header = [bytes[0], bytes[1]];
        if header != COMMAND_HEADER {
            return Err(FrameError::Header(header));
        }
        let frame = Self::decode_unchecked(bytes);
        let expected = version.command_checksum(COMMAND_HEADER, frame.payload());
        let actual = read_u16(bytes, offset::COMMAND_CRC);
        if expected != actual {
            return Err(FrameError::Checksum { expected, actual });
        }
        Ok(frame)
    }

    /// Take the field bytes as-is, ignoring header and checksum
    pub fn decode_unchecked(bytes: &[u8; COMMAND_LEN]) -> Self {
        let mut frame = Self::default();
        frame.bytes[offset::MODE_ID..offset::COMMAND_CRC]
            .copy_from_slice(&bytes[offset::MODE_ID..offset::COMMAND_CRC]);
        frame
    }

    fn write(&mut self, at: usize, data: &[u8]) {
        self.bytes[at..at + data.len()].copy_from_slice(data);
    }
}

/// Decoded motor feedback
///
/// Only ever produced from a frame whose checksum verified; a frame that
/// fails verification yields a [`FrameError`] and no fields at all.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Feedback {
    pub motor_id: u8,
    /// Raw mode nibble echoed by the motor
    pub mode: u8,
    /// Output torque in N·m
    pub torque: f64,
    /// Shaft velocity in rad/s
    pub velocity: f64,
    /// Shaft position in radians (before the gearbox)
    pub shaft_position: f64,
    /// Winding temperature in °C
    pub temperature: i8,
    pub error: MotorError,
    /// Foot contact sensor, 0..=4095
    pub foot_force: u16,
}

impl Feedback {
    /// Joint output angle in degrees
    pub fn angle_degrees(&self) -> f64 {
        (self.shaft_position / GEAR_RATIO).to_degrees()
    }

    /// Parse and verify a feedback frame
    pub fn decode(
        bytes: &[u8; FEEDBACK_LEN],
        version: ChecksumVersion,
    ) -> Result<Self, FrameError> {
        let expected = version.feedback_checksum(&bytes[..offset::FEEDBACK_CRC]);
        let actual = read_u16(bytes, offset::FEEDBACK_CRC);
        if expected != actual {
            return Err(FrameError::Checksum { expected, actual });
        }
        let header = [bytes[0], bytes[1]];
        if header != FEEDBACK_HEADER {
            return Err(FrameError::Header(header));
        }
        let mode_id = bytes[offset::MODE_ID];
        if mode_id == UNPOPULATED_MODE_ID {
            return Err(FrameError::Unpopulated);
        }
        let status = read_u16(bytes, offset::STATUS);
        Ok(Self {
            motor_id: mode_id & 0x0F,
            mode: mode_id >> 4,
            torque: read_i16(bytes, offset::TORQUE) as f64 / TORQUE_SCALE,
            velocity: read_i16(bytes, offset::VELOCITY) as f64 / VELOCITY_SCALE,
            shaft_position: read_i32(bytes, offset::POSITION) as f64 / POSITION_SCALE,
            temperature: bytes[offset::TEMPERATURE] as i8,
            error: MotorError::from_bits((status & 0x7) as u8),
            foot_force: (status >> 3) & 0x0FFF,
        })
    }

    /// Serialize as a motor would send it
    pub fn encode(&self, version: ChecksumVersion) -> [u8; FEEDBACK_LEN] {
        let mut out = [0u8; FEEDBACK_LEN];
        out[..2].copy_from_slice(&FEEDBACK_HEADER);
        out[offset::MODE_ID] = (self.mode << 4) | (self.motor_id & 0x0F);
        let torque = (self.torque * TORQUE_SCALE) as i16;
        out[offset::TORQUE..offset::TORQUE + 2].copy_from_slice(&torque.to_le_bytes());
        let velocity = (self.velocity * VELOCITY_SCALE) as i16;
        out[offset::VELOCITY..offset::VELOCITY + 2].copy_from_slice(&velocity.to_le_bytes());
        let position = (self.shaft_position * POSITION_SCALE) as i32;
        out[offset::POSITION..offset::POSITION + 4].copy_from_slice(&position.to_le_bytes());
        out[offset::TEMPERATURE] = self.temperature as u8;
        let status = (self.error.bits() as u16) | ((self.foot_force.min(0x0FFF)) << 3);
        out[offset::STATUS..offset::STATUS + 2].copy_from_slice(&status.to_le_bytes());
        let crc = version.feedback_checksum(&out[..offset::FEEDBACK_CRC]);
        out[offset::FEEDBACK_CRC..].copy_from_slice(&crc.to_le_bytes());
        out
    }
}
