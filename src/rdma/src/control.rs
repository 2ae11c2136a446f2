//! Out-of-band control protocol carried over IB SEND/RECV.
//!
//! Every message is a 16-byte header followed by `len` payload bytes, all
//! integers big-endian. `repeat` batches identical records in one message.
//! Decoders bound `len` by the control buffer and `repeat` by the batch cap
//! before anything else looks at the payload.

use crate::error::{Error, Result};

pub const CONTROL_BUFFER_SIZE: usize = 512 << 10;
pub const CONTROL_MAX_PAYLOAD: usize = CONTROL_BUFFER_SIZE - ControlHeader::SIZE;
pub const MAX_CONTROL_RECORDS: u32 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ControlType {
    None = 0,
    Error = 1,
    Ready = 2,
    QemuFile = 3,
    RamBlocksRequest = 4,
    RamBlocksResult = 5,
    Compress = 6,
    RegisterRequest = 7,
    RegisterResult = 8,
    RegisterFinished = 9,
    UnregisterRequest = 10,
    UnregisterFinished = 11,
}

impl ControlType {
    pub fn from_raw(raw: u32) -> Result<Self> {
        Ok(match raw {
            0 => ControlType::None,
            1 => ControlType::Error,
            2 => ControlType::Ready,
            3 => ControlType::QemuFile,
            4 => ControlType::RamBlocksRequest,
            5 => ControlType::RamBlocksResult,
            6 => ControlType::Compress,
            7 => ControlType::RegisterRequest,
            8 => ControlType::RegisterResult,
            9 => ControlType::RegisterFinished,
            10 => ControlType::UnregisterRequest,
            11 => ControlType::UnregisterFinished,
            _ => return Err(Error::Malformed),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlHeader {
    pub len: u32,
    pub kind: ControlType,
    pub repeat: u32,
}

impl ControlHeader {
    pub const SIZE: usize = 16;

    pub fn new(kind: ControlType, len: usize, repeat: u32) -> Self {
        ControlHeader {
            len: len as u32,
            kind,
            repeat,
        }
    }

    pub fn encode_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.len.to_be_bytes());
        out.extend_from_slice(&(self.kind as u32).to_be_bytes());
        out.extend_from_slice(&self.repeat.to_be_bytes());
        out.extend_from_slice(&0u32.to_be_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(Error::Malformed);
        }
        let len = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        let kind = ControlType::from_raw(u32::from_be_bytes(buf[4..8].try_into().unwrap()))?;
        let repeat = u32::from_be_bytes(buf[8..12].try_into().unwrap());
        if len as usize > CONTROL_MAX_PAYLOAD {
            return Err(Error::ControlOverflow(len as usize));
        }
        if repeat > MAX_CONTROL_RECORDS {
            return Err(Error::RepeatOverflow(repeat));
        }
        Ok(ControlHeader { len, kind, repeat })
    }
}

/// Chunk (or raw-address) registration request. RAM-proper blocks key by
/// chunk index; auxiliary blocks key by guest-space address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterRecord {
    pub key: u64,
    pub block_index: u32,
    pub len: u32,
}

impl RegisterRecord {
    pub const SIZE: usize = 16;

    pub fn encode_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.key.to_be_bytes());
        out.extend_from_slice(&self.block_index.to_be_bytes());
        out.extend_from_slice(&self.len.to_be_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(Error::Malformed);
        }
        Ok(RegisterRecord {
            key: u64::from_be_bytes(buf[0..8].try_into().unwrap()),
            block_index: u32::from_be_bytes(buf[8..12].try_into().unwrap()),
            len: u32::from_be_bytes(buf[12..16].try_into().unwrap()),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterResult {
    pub rkey: u32,
    pub host_addr: u64,
}

impl RegisterResult {
    pub const SIZE: usize = 16;

    pub fn encode_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.rkey.to_be_bytes());
        out.extend_from_slice(&0u32.to_be_bytes());
        out.extend_from_slice(&self.host_addr.to_be_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(Error::Malformed);
        }
        Ok(RegisterResult {
            rkey: u32::from_be_bytes(buf[0..4].try_into().unwrap()),
            host_addr: u64::from_be_bytes(buf[8..16].try_into().unwrap()),
        })
    }
}

/// Run-value fill request replacing an RDMA WRITE of uniform bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressRecord {
    pub value: u32,
    pub block_index: u32,
    pub offset: u64,
    pub len: u64,
}

impl CompressRecord {
    pub const SIZE: usize = 24;

    pub fn encode_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.value.to_be_bytes());
        out.extend_from_slice(&self.block_index.to_be_bytes());
        out.extend_from_slice(&self.offset.to_be_bytes());
        out.extend_from_slice(&self.len.to_be_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(Error::Malformed);
        }
        Ok(CompressRecord {
            value: u32::from_be_bytes(buf[0..4].try_into().unwrap()),
            block_index: u32::from_be_bytes(buf[4..8].try_into().unwrap()),
            offset: u64::from_be_bytes(buf[8..16].try_into().unwrap()),
            len: u64::from_be_bytes(buf[16..24].try_into().unwrap()),
        })
    }
}

/// Decode `repeat` records of fixed `size` from a payload.
pub fn decode_batch<T>(
    payload: &[u8],
    repeat: u32,
    size: usize,
    decode: impl Fn(&[u8]) -> Result<T>,
) -> Result<Vec<T>> {
    let repeat = repeat as usize;
    if payload.len() < repeat * size {
        return Err(Error::Malformed);
    }
    (0..repeat)
        .map(|i| decode(&payload[i * size..(i + 1) * size]))
        .collect()
}
