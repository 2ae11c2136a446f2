//! Work-request identifiers.
//!
//! Every posted work request carries a 64-bit id that comes back in its
//! completion. The id is a packed triple so the completion handler can
//! recover which bitmap bits to clear without side tables:
//! bits 0-15 the request kind, bits 16-29 the block index, bits 30-63 the
//! chunk index. The layout is a contract between poster and poller; keep
//! all shifting here.

use crate::error::{Error, Result};

const KIND_BITS: u32 = 16;
const BLOCK_BITS: u32 = 14;
const BLOCK_SHIFT: u32 = KIND_BITS;
const CHUNK_SHIFT: u32 = KIND_BITS + BLOCK_BITS;

const KIND_MASK: u64 = (1 << KIND_BITS) - 1;
const BLOCK_MASK: u64 = (1 << BLOCK_BITS) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum WrKind {
    None = 0,
    RemoteWrite = 1,
    LocalCopy = 2,
    SendControl = 3,
    RecvControl = 4,
    Keepalive = 5,
}

impl WrKind {
    fn from_raw(raw: u16) -> Option<Self> {
        Some(match raw {
            0 => WrKind::None,
            1 => WrKind::RemoteWrite,
            2 => WrKind::LocalCopy,
            3 => WrKind::SendControl,
            4 => WrKind::RecvControl,
            5 => WrKind::Keepalive,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WrId {
    pub kind: WrKind,
    pub block: u16,
    pub chunk: u64,
}

impl WrId {
    pub fn new(kind: WrKind, block: u16, chunk: u64) -> Self {
        debug_assert!(u64::from(block) <= BLOCK_MASK);
        debug_assert!(chunk < (1 << (64 - CHUNK_SHIFT)));
        WrId { kind, block, chunk }
    }

    pub fn control(kind: WrKind, slot: usize) -> Self {
        WrId::new(kind, slot as u16, 0)
    }

    pub fn encode(self) -> u64 {
        (self.chunk << CHUNK_SHIFT)
            | ((u64::from(self.block) & BLOCK_MASK) << BLOCK_SHIFT)
            | (u64::from(self.kind as u16) & KIND_MASK)
    }

    pub fn decode(raw: u64) -> Result<Self> {
        let kind =
            WrKind::from_raw((raw & KIND_MASK) as u16).ok_or(Error::UnknownWrId(raw))?;
        Ok(WrId {
            kind,
            block: ((raw >> BLOCK_SHIFT) & BLOCK_MASK) as u16,
            chunk: raw >> CHUNK_SHIFT,
        })
    }
}
