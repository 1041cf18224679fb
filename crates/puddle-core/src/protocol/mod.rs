//! Motor wire protocol
//!
//! Fixed-size binary frames exchanged with the leg actuators, their
//! checksums, and the bootloader provisioning frames.

pub mod crc;
pub mod frames;
pub mod provision;

pub use crc::{crc_ccitt, ChecksumVersion};
pub use frames::{
    CommandFrame, Feedback, FrameError, MotorError, MotorMode, BOOT_MODE_ID, COMMAND_HEADER,
    COMMAND_LEN, FEEDBACK_HEADER, FEEDBACK_LEN, GEAR_RATIO, MAX_MOTOR_ID,
};
pub use provision::{ChangeIdRequest, BROADCAST_ID, CHANGE_ID_LEN};
