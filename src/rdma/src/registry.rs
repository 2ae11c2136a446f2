//! Guest RAM block bookkeeping and chunk-granularity pinning state.

use rustc_hash::FxHashMap;

use crate::error::{Error, Result};
use crate::verbs::{MemoryRegion, MrHandle};

/// Plain word bitmap. Completion processing is single-threaded on the
/// transfer worker, so read-modify-write is enough.
#[derive(Clone, Debug)]
pub struct Bitmap {
    words: Vec<u64>,
    nbits: usize,
}

impl Bitmap {
    pub fn new(nbits: usize) -> Self {
        Bitmap {
            words: vec![0; nbits.div_ceil(64)],
            nbits,
        }
    }

    pub fn set(&mut self, bit: usize) {
        assert!(bit < self.nbits);
        self.words[bit / 64] |= 1 << (bit % 64);
    }

    pub fn clear(&mut self, bit: usize) {
        assert!(bit < self.nbits);
        self.words[bit / 64] &= !(1 << (bit % 64));
    }

    pub fn test(&self, bit: usize) -> bool {
        assert!(bit < self.nbits);
        self.words[bit / 64] & (1 << (bit % 64)) != 0
    }

    pub fn count_set(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }
}

/// One local RAM block and everything the transfer engine tracks about it.
///
/// The four parallel per-chunk arrays hold pinning handles for the remote
/// queue pair and for the two local-copy queue pairs, plus the peer's rkey
/// per chunk. `transit` marks chunks with an outstanding RDMA WRITE,
/// `unregister` marks chunks queued for speculative unpinning. A WRITE may
/// cover several consecutive chunks; `transit_span`, indexed by the first
/// chunk, records how many so the completion clears every bit it set.
pub struct RamBlock {
    pub host_addr: u64,
    pub offset: u64,
    pub len: u64,
    pub index: u16,
    pub is_ram_block: bool,
    pub nb_chunks: u64,

    pub pmr: Vec<Option<MemoryRegion>>,
    pub mr: Option<MemoryRegion>,
    pub pmr_src: Vec<Option<MemoryRegion>>,
    pub mr_src: Option<MemoryRegion>,
    pub pmr_dest: Vec<Option<MemoryRegion>>,
    pub mr_dest: Option<MemoryRegion>,

    pub remote_keys: Vec<u32>,
    pub remote_host_addr: u64,
    pub remote_rkey: u32,

    pub transit: Bitmap,
    pub transit_span: Vec<u64>,
    pub unregister: Bitmap,
}

impl RamBlock {
    fn new(
        host_addr: u64,
        offset: u64,
        len: u64,
        index: u16,
        is_ram_block: bool,
        chunk_size: u64,
    ) -> Self {
        let nb_chunks = len.div_ceil(chunk_size).max(1);
        RamBlock {
            host_addr,
            offset,
            len,
            index,
            is_ram_block,
            nb_chunks,
            pmr: vec![None; nb_chunks as usize],
            mr: None,
            pmr_src: vec![None; nb_chunks as usize],
            mr_src: None,
            pmr_dest: vec![None; nb_chunks as usize],
            mr_dest: None,
            remote_keys: vec![0; nb_chunks as usize],
            remote_host_addr: 0,
            remote_rkey: 0,
            transit: Bitmap::new(nb_chunks as usize),
            transit_span: vec![0; nb_chunks as usize],
            unregister: Bitmap::new(nb_chunks as usize),
        }
    }

    /// Drop every remote-path pin entry sharing `handle` and invalidate the
    /// matching remote keys. One registration may cover a multi-chunk span,
    /// so all of its entries go together.
    pub fn forget_pin(&mut self, handle: MrHandle) {
        for i in 0..self.pmr.len() {
            if self.pmr[i].map(|mr| mr.handle) == Some(handle) {
                self.pmr[i] = None;
                self.remote_keys[i] = 0;
            }
        }
    }

    /// Same for the local-copy pin arrays.
    pub fn forget_copy_pin(&mut self, handle: MrHandle) {
        for slot in self.pmr_src.iter_mut().chain(self.pmr_dest.iter_mut()) {
            if slot.map(|mr| mr.handle) == Some(handle) {
                *slot = None;
            }
        }
    }

    pub fn contains(&self, offset: u64, len: u64) -> bool {
        offset >= self.offset && offset + len <= self.offset + self.len
    }

    /// Host address backing a guest-space address inside this block.
    pub fn host(&self, vm_addr: u64) -> u64 {
        self.host_addr + (vm_addr - self.offset)
    }
}

/// Wire record describing one block on the peer: where it lives in the
/// peer's address space and, in pin-all mode, the rkey covering it whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteBlock {
    pub remote_host_addr: u64,
    pub offset: u64,
    pub len: u64,
    pub rkey: u32,
}

impl RemoteBlock {
    pub const SIZE: usize = 32;

    pub fn encode_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.remote_host_addr.to_be_bytes());
        out.extend_from_slice(&self.offset.to_be_bytes());
        out.extend_from_slice(&self.len.to_be_bytes());
        out.extend_from_slice(&self.rkey.to_be_bytes());
        out.extend_from_slice(&0u32.to_be_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(Error::Malformed);
        }
        Ok(RemoteBlock {
            remote_host_addr: u64::from_be_bytes(buf[0..8].try_into().unwrap()),
            offset: u64::from_be_bytes(buf[8..16].try_into().unwrap()),
            len: u64::from_be_bytes(buf[16..24].try_into().unwrap()),
            rkey: u32::from_be_bytes(buf[24..28].try_into().unwrap()),
        })
    }
}

/// All local blocks, addressable both by index and by guest-space offset.
/// The map and the array always reflect the same set.
pub struct BlockRegistry {
    blocks: Vec<RamBlock>,
    by_offset: FxHashMap<u64, usize>,
    chunk_size: u64,
}

impl BlockRegistry {
    pub fn new(chunk_size: u64) -> Self {
        assert!(chunk_size.is_power_of_two());
        BlockRegistry {
            blocks: Vec::new(),
            by_offset: FxHashMap::default(),
            chunk_size,
        }
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Register a block. The first block added is the guest's RAM proper;
    /// anything added later is an auxiliary region and is keyed by address
    /// rather than chunk index in control messages.
    pub fn add(&mut self, host_addr: u64, offset: u64, len: u64) -> u16 {
        let index = self.blocks.len() as u16;
        let is_ram_block = self.blocks.is_empty();
        self.blocks.push(RamBlock::new(
            host_addr,
            offset,
            len,
            index,
            is_ram_block,
            self.chunk_size,
        ));
        self.by_offset.insert(offset, index as usize);
        index
    }

    pub fn delete(&mut self, offset: u64) -> Result<()> {
        let pos = *self
            .by_offset
            .get(&offset)
            .ok_or(Error::UnknownBlock(offset))?;
        self.by_offset.remove(&offset);
        self.blocks.remove(pos);
        // surviving blocks keep contiguous indices
        for (i, block) in self.blocks.iter_mut().enumerate().skip(pos) {
            block.index = i as u16;
            *self.by_offset.get_mut(&block.offset).unwrap() = i;
        }
        Ok(())
    }

    /// Locate `(block index, chunk index)` for a range inside the block
    /// registered at `block_offset`.
    pub fn search(&self, block_offset: u64, offset: u64, len: u64) -> Result<(u16, u64)> {
        let pos = *self
            .by_offset
            .get(&block_offset)
            .ok_or(Error::UnknownBlock(block_offset))?;
        let block = &self.blocks[pos];
        if !block.contains(offset, len.max(1)) {
            return Err(Error::OutOfBlock { offset, len });
        }
        Ok((block.index, (offset - block.offset) / self.chunk_size))
    }

    pub fn get(&self, index: u16) -> Result<&RamBlock> {
        self.blocks
            .get(index as usize)
            .ok_or(Error::BadBlockIndex(index))
    }

    pub fn get_mut(&mut self, index: u16) -> Result<&mut RamBlock> {
        self.blocks
            .get_mut(index as usize)
            .ok_or(Error::BadBlockIndex(index))
    }

    pub fn by_offset(&self, offset: u64) -> Option<&RamBlock> {
        self.by_offset.get(&offset).map(|&i| &self.blocks[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &RamBlock> {
        self.blocks.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut RamBlock> {
        self.blocks.iter_mut()
    }

    /// Guest-space chunk boundaries, the end clamped to the block.
    pub fn chunk_range(&self, block: &RamBlock, chunk: u64) -> (u64, u64) {
        let start = block.offset + chunk * self.chunk_size;
        let end = (start + self.chunk_size).min(block.offset + block.len);
        (start, end)
    }
}
