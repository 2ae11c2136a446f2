//! Capability negotiation, carried in the connection-manager private data.

use bitflags::bitflags;

use crate::error::{Error, Result};

pub const CAPABILITY_VERSION: u32 = 1;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CapFlags: u32 {
        /// Pin all guest RAM once at connect instead of chunk-on-demand.
        const PIN_ALL = 0x01;
        /// Out-of-band liveness writes to a pre-registered slot.
        const KEEPALIVE = 0x02;
    }
}

/// Fixed-layout record exchanged inside connect/accept private data, all
/// fields big-endian: version, flags, then the sender's keepalive slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapabilityRecord {
    pub version: u32,
    pub flags: CapFlags,
    pub keepalive_rkey: u32,
    pub keepalive_addr: u64,
}

impl CapabilityRecord {
    pub const SIZE: usize = 20;

    pub fn new(flags: CapFlags, keepalive_rkey: u32, keepalive_addr: u64) -> Self {
        CapabilityRecord {
            version: CAPABILITY_VERSION,
            flags,
            keepalive_rkey,
            keepalive_addr,
        }
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..4].copy_from_slice(&self.version.to_be_bytes());
        out[4..8].copy_from_slice(&self.flags.bits().to_be_bytes());
        out[8..12].copy_from_slice(&self.keepalive_rkey.to_be_bytes());
        out[12..20].copy_from_slice(&self.keepalive_addr.to_be_bytes());
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(Error::BadCapabilityRecord);
        }
        let version = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        if version != CAPABILITY_VERSION {
            return Err(Error::BadCapabilityRecord);
        }
        let raw_flags = u32::from_be_bytes(buf[4..8].try_into().unwrap());
        let flags = CapFlags::from_bits(raw_flags).ok_or(Error::BadCapabilityRecord)?;
        Ok(CapabilityRecord {
            version,
            flags,
            keepalive_rkey: u32::from_be_bytes(buf[8..12].try_into().unwrap()),
            keepalive_addr: u64::from_be_bytes(buf[12..20].try_into().unwrap()),
        })
    }
}

/// Responder side of negotiation: grant what was asked for and we know.
pub fn negotiate(requested: CapFlags, known: CapFlags) -> CapFlags {
    requested & known
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_round_trip() {
        let rec = CapabilityRecord::new(
            CapFlags::PIN_ALL | CapFlags::KEEPALIVE,
            0xdead_beef,
            0x1234_5678_9abc_def0,
        );
        let decoded = CapabilityRecord::decode(&rec.encode()).unwrap();
        assert_eq!(decoded, rec);
    }

    #[test]
    fn rejects_wrong_version_and_short_buffers() {
        let mut bytes = CapabilityRecord::new(CapFlags::KEEPALIVE, 0, 0).encode();
        assert!(CapabilityRecord::decode(&bytes[..10]).is_err());
        bytes[0..4].copy_from_slice(&99u32.to_be_bytes());
        assert!(CapabilityRecord::decode(&bytes).is_err());
    }

    #[test]
    fn negotiation_intersects() {
        let requested = CapFlags::PIN_ALL | CapFlags::KEEPALIVE;
        assert_eq!(negotiate(requested, CapFlags::KEEPALIVE), CapFlags::KEEPALIVE);
        assert_eq!(negotiate(CapFlags::empty(), requested), CapFlags::empty());
    }
}
