//! CRC-16 checksums for motor frames
//!
//! Both directions use the reflected CCITT polynomial (0x8408, i.e. 0x1021
//! bit-reversed) with a zero initial register. Feedback frames are checked
//! over their whole data segment with no extra key. Command frames are keyed
//! by the second header byte, and the two protocol revisions differ only in
//! how that key enters the register:
//!
//! - version 1 runs both header bytes through the register before the payload
//! - version 2 loads the key byte directly as the initial register value

use serde::{Deserialize, Serialize};

use crate::Error;

const POLY: u16 = 0x8408;

const fn build_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u16;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 { (crc >> 1) ^ POLY } else { crc >> 1 };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static TABLE: [u16; 256] = build_table();

/// Run `data` through the CRC register starting from `seed`
pub fn crc_ccitt(seed: u16, data: &[u8]) -> u16 {
    data.iter().fold(seed, |crc, &b| {
        (crc >> 8) ^ TABLE[((crc ^ b as u16) & 0xFF) as usize]
    })
}

/// Protocol revision, selecting how command checksums are keyed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ChecksumVersion {
    #[default]
    V1,
    V2,
}

impl ChecksumVersion {
    /// Checksum of a command payload (mode:id through Kd)
    ///
    /// `header` is the frame's fixed two-byte header; its second byte is the key.
    pub fn command_checksum(self, header: [u8; 2], payload: &[u8]) -> u16 {
        match self {
            ChecksumVersion::V1 => crc_ccitt(crc_ccitt(0, &header), payload),
            ChecksumVersion::V2 => crc_ccitt(header[1] as u16, payload),
        }
    }

    /// Checksum of a feedback data segment (header through status bits)
    pub fn feedback_checksum(self, segment: &[u8]) -> u16 {
        crc_ccitt(0, segment)
    }

    pub fn number(self) -> u8 {
        match self {
            ChecksumVersion::V1 => 1,
            ChecksumVersion::V2 => 2,
        }
    }
}

impl TryFrom<u8> for ChecksumVersion {
    type Error = Error;

    fn try_from(version: u8) -> Result<Self, Self::Error> {
        match version {
            1 => Ok(ChecksumVersion::V1),
            2 => Ok(ChecksumVersion::V2),
            v => Err(Error::Config(format!(
                "unsupported motor protocol version {} (expected 1 or 2)",
                v
            ))),
        }
    }
}

impl From<ChecksumVersion> for u8 {
    fn from(version: ChecksumVersion) -> Self {
        version.number()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kermit_check_value() {
        // CRC-16/KERMIT reference vector
        assert_eq!(crc_ccitt(0, b"123456789"), 0x2189);
    }

    #[test]
    fn test_empty_is_seed() {
        assert_eq!(crc_ccitt(0, b""), 0);
        assert_eq!(crc_ccitt(0xBEEF, b""), 0xBEEF);
    }

    #[test]
    fn test_incremental_matches_whole() {
        let whole = crc_ccitt(0, b"hello world");
        let split = crc_ccitt(crc_ccitt(0, b"hello"), b" world");
        assert_eq!(whole, split);
    }

    #[test]
    fn test_versions_key_differently() {
        let payload = [0x13, 0x00, 0x01, 0x00, 0x00, 0x10, 0x20, 0x30, 0x00, 0x00, 0x05, 0x00, 0x01];
        let header = [0xFE, 0xEE];
        let v1 = ChecksumVersion::V1.command_checksum(header, &payload);
        let v2 = ChecksumVersion::V2.command_checksum(header, &payload);
        assert_ne!(v1, v2);

        // Version 1 equals a plain CRC over header + payload.
        let mut full = header.to_vec();
        full.extend_from_slice(&payload);
        assert_eq!(v1, crc_ccitt(0, &full));
    }

    #[test]
    fn test_version_numbers() {
        assert_eq!(ChecksumVersion::try_from(1).unwrap(), ChecksumVersion::V1);
        assert_eq!(ChecksumVersion::try_from(2).unwrap(), ChecksumVersion::V2);
        assert!(ChecksumVersion::try_from(0).is_err());
        assert!(ChecksumVersion::try_from(3).is_err());
        assert_eq!(u8::from(ChecksumVersion::V2), 2);
    }
}
