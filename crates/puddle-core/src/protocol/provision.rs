//! Motor id provisioning
//!
//! A motor leaves the factory answering to some id; before it can share a bus
//! it must be given a unique one. Provisioning is a two-step exchange: a boot
//! command drops every motor on the bus into its bootloader, then a 4-byte
//! change-id frame renames one motor (or all of them, via the broadcast id).
//! The bootloader answers with a 4-byte frame of the same shape.

use super::frames::MAX_MOTOR_ID;
use super::FrameError;
use crate::{Error, Result};

/// Length of a change-id request and its reply
pub const CHANGE_ID_LEN: usize = 4;

/// Addresses every motor on a bus
pub const BROADCAST_ID: u8 = MAX_MOTOR_ID;

const CHANGE_ID_START: u8 = 0xFB;
const CHANGE_ID_COUNT: u8 = 1;
const CHANGE_ID_END: u8 = 0xBB;

/// Request to rename motor `old_id` to `new_id`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeIdRequest {
    pub old_id: u8,
    pub new_id: u8,
}

impl ChangeIdRequest {
    /// Validate both ids; `old_id` may be [`BROADCAST_ID`]
    pub fn new(old_id: u8, new_id: u8) -> Result<Self> {
        if old_id > MAX_MOTOR_ID {
            return Err(Error::Config(format!("motor id {} out of range 0-15", old_id)));
        }
        if new_id >= BROADCAST_ID {
            return Err(Error::Config(format!(
                "target id {} out of range 0-14 (15 is broadcast)",
                new_id
            )));
        }
        Ok(Self { old_id, new_id })
    }

    pub fn is_broadcast(&self) -> bool {
        self.old_id == BROADCAST_ID
    }

    pub fn encode(&self) -> [u8; CHANGE_ID_LEN] {
        [
            CHANGE_ID_START,
            CHANGE_ID_COUNT,
            ((self.new_id & 0x0F) << 4) | (self.old_id & 0x0F),
            CHANGE_ID_END,
        ]
    }

    /// Parse a request as the bootloader sees it
    pub fn decode(bytes: &[u8; CHANGE_ID_LEN]) -> std::result::Result<Self, FrameError> {
        if bytes[0] != CHANGE_ID_START || bytes[3] != CHANGE_ID_END {
            return Err(FrameError::Provisioning(*bytes));
        }
        Ok(Self {
            old_id: bytes[2] & 0x0F,
            new_id: bytes[2] >> 4,
        })
    }
}

/// Check that a bootloader reply is framed like a change-id frame
pub fn check_reply(reply: &[u8; CHANGE_ID_LEN]) -> std::result::Result<(), FrameError> {
    ChangeIdRequest::decode(reply).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_id_encoding() {
        let req = ChangeIdRequest::new(0, 1).unwrap();
        assert_eq!(req.encode(), [0xFB, 0x01, 0x10, 0xBB]);

        let req = ChangeIdRequest::new(BROADCAST_ID, 3).unwrap();
        assert!(req.is_broadcast());
        assert_eq!(req.encode(), [0xFB, 0x01, 0x3F, 0xBB]);
        assert_eq!(ChangeIdRequest::decode(&req.encode()), Ok(req));
    }

    #[test]
    fn test_change_id_rejects_bad_ids() {
        assert!(ChangeIdRequest::new(16, 1).is_err());
        assert!(ChangeIdRequest::new(0, BROADCAST_ID).is_err());
    }

    #[test]
    fn test_reply_framing() {
        assert!(check_reply(&[0xFB, 0x01, 0x21, 0xBB]).is_ok());
        assert_eq!(
            check_reply(&[0x00, 0x01, 0x21, 0xBB]),
            Err(FrameError::Provisioning([0x00, 0x01, 0x21, 0xBB]))
        );
    }
}
