//! 128-bit GUID, grounded on the teacher's `gpt::Guid` (RFC4122 mixed-endian
//! layout). Extended with `Eq`/`Hash`/`FromStr` since the `Ldm` registry
//! keys `DiskGroup` by GUID and LDM encodes GUIDs two different ways
//! (var-string ASCII hex on revision-3 disk records, raw bytes elsewhere).

use std::fmt;
use std::str::FromStr;

use crate::error::LdmError;

// https://www.ietf.org/rfc/rfc4122.txt
// 4.1.2.  Layout and Byte Order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Guid {
    time_low: u32,
    time_mid: u16,
    time_high_and_version: u16,
    clock_seq_high_and_reserved: u8,
    clock_seq_low: u8,
    node_identifier: [u8; 6],
}

impl Guid {
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        // The first three dash-delimited fields are little-endian; the last two are not.
        let time_low = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let time_mid = u16::from_le_bytes([bytes[4], bytes[5]]);
        let time_high_and_version = u16::from_le_bytes([bytes[6], bytes[7]]);
        let clock_seq_high_and_reserved = bytes[8];
        let clock_seq_low = bytes[9];
        let node_identifier = [
            bytes[10], bytes[11], bytes[12], bytes[13], bytes[14], bytes[15],
        ];

        Self {
            time_low,
            time_mid,
            time_high_and_version,
            clock_seq_high_and_reserved,
            clock_seq_low,
            node_identifier,
        }
    }

    pub fn to_bytes(self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[0..4].copy_from_slice(&self.time_low.to_le_bytes());
        out[4..6].copy_from_slice(&self.time_mid.to_le_bytes());
        out[6..8].copy_from_slice(&self.time_high_and_version.to_le_bytes());
        out[8] = self.clock_seq_high_and_reserved;
        out[9] = self.clock_seq_low;
        out[10..16].copy_from_slice(&self.node_identifier);
        out
    }

    /// Parses the ASCII hex form used by LDM's var-string-encoded GUID
    /// fields (revision-3 disk records, PRIVHEAD's GUID fields).
    pub fn parse_hex(s: &str) -> Result<Self, LdmError> {
        Self::from_str(s)
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let clock_seq =
            u16::from_be_bytes([self.clock_seq_high_and_reserved, self.clock_seq_low]);

        let mut tmp = [0u8; 8];
        tmp[2..].copy_from_slice(&self.node_identifier);
        let node = u64::from_be_bytes(tmp);

        write!(
            f,
            "{:08X}-{:04X}-{:04X}-{:04X}-{:012X}",
            self.time_low, self.time_mid, self.time_high_and_version, clock_seq, node
        )
    }
}

impl FromStr for Guid {
    type Err = LdmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex: String = s.chars().filter(|c| *c != '-').collect();
        let bytes = hex_to_bytes(&hex)
            .ok_or_else(|| LdmError::Invalid(format!("malformed GUID string {s:?}")))?;
        if bytes.len() != 16 {
            return Err(LdmError::Invalid(format!("GUID string {s:?} is not 16 bytes")));
        }
        // The hyphenated string is big-endian field-by-field; convert back
        // to the RFC4122 mixed-endian struct layout by round-tripping
        // through the display fields.
        let time_low = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let time_mid = u16::from_be_bytes([bytes[4], bytes[5]]);
        let time_high_and_version = u16::from_be_bytes([bytes[6], bytes[7]]);
        let clock_seq_high_and_reserved = bytes[8];
        let clock_seq_low = bytes[9];
        let node_identifier = [bytes[10], bytes[11], bytes[12], bytes[13], bytes[14], bytes[15]];
        Ok(Self {
            time_low,
            time_mid,
            time_high_and_version,
            clock_seq_high_and_reserved,
            clock_seq_low,
            node_identifier,
        })
    }
}

fn hex_to_bytes(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
        .collect()
}
