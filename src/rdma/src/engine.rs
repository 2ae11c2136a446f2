//! The hot path: merging dirty ranges into chunk-bounded RDMA WRITEs,
//! registering chunks on demand, and reaping completions.
//!
//! Three independent cursors accumulate contiguous ranges: one for writes
//! to the peer and a source/destination pair for local-to-local copies
//! (consistent in-memory snapshots without pausing the stream). A range is
//! folded into a cursor only while it stays inside the cursor's chunk and
//! under the merge cap; anything else flushes the cursor as one WRITE.

use std::os::fd::BorrowedFd;

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::trace;

use crate::caps::CapFlags;
use crate::conn::RdmaConnection;
use crate::control::{CompressRecord, ControlType, RegisterRecord, RegisterResult};
use crate::error::{Error, Result};
use crate::exchange::{ControlBuffers, DATA_SLOT, READY_SLOT};
use crate::keepalive::{Keepalive, KeepaliveConfig, KeepaliveHandle};
use crate::registry::BlockRegistry;
use crate::verbs::{
    AccessFlags, PostError, WaitStrategy, WcStatus, WorkCompletion, WriteRequest,
};
use crate::wrid::{WrId, WrKind};
use crate::{CHUNK_SIZE, MERGE_MAX};
use vmshim::RamBlockDesc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Source,
    Dest,
}

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub chunk_size: u64,
    pub merge_max: u64,
    /// Speculatively unpin chunks after their write completes
    /// (chunk-on-demand mode only).
    pub unregister_enabled: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            chunk_size: CHUNK_SIZE,
            merge_max: MERGE_MAX,
            unregister_enabled: false,
        }
    }
}

/// Pending contiguous range, guest-space addressing. Empty iff `len == 0`.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ChunkCursor {
    pub addr: u64,
    pub len: u64,
    pub block: u16,
    pub chunk: u64,
    pub chunk_end: u64,
    pub nb_chunks: u64,
}

/// Fixed-size queue of chunks waiting for speculative unpin.
pub(crate) struct UnregisterRing {
    entries: std::collections::VecDeque<(u16, u64)>,
    capacity: usize,
}

impl UnregisterRing {
    fn new(capacity: usize) -> Self {
        UnregisterRing {
            entries: std::collections::VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, entry: (u16, u64)) -> bool {
        if self.entries.len() == self.capacity {
            return false;
        }
        self.entries.push_back(entry);
        true
    }

    fn pop(&mut self) -> Option<(u16, u64)> {
        self.entries.pop_front()
    }
}

pub(crate) enum WaitTarget {
    AnyWrite,
    Send,
    Recv(u16),
}

impl WaitTarget {
    fn matches(&self, wrid: WrId) -> bool {
        match self {
            WaitTarget::AnyWrite => {
                matches!(wrid.kind, WrKind::RemoteWrite | WrKind::LocalCopy)
            }
            WaitTarget::Send => wrid.kind == WrKind::SendControl,
            WaitTarget::Recv(slot) => wrid.kind == WrKind::RecvControl && wrid.block == *slot,
        }
    }
}

pub struct RdmaEngine {
    pub(crate) conn: RdmaConnection,
    pub(crate) registry: BlockRegistry,
    pub(crate) cfg: EngineConfig,
    pub(crate) role: Role,

    pub(crate) ctrl: ControlBuffers,
    pub(crate) control_ready_expected: bool,

    remote: ChunkCursor,
    copy_src: ChunkCursor,
    copy_dst: ChunkCursor,

    pub(crate) nb_sent: u32,
    unreg: UnregisterRing,
}

fn range_is_zero(host: u64, len: u64) -> bool {
    // host is a live guest mapping handed to us by the hypervisor
    let bytes = unsafe { std::slice::from_raw_parts(host as *const u8, len as usize) };
    bytes.iter().all(|&b| b == 0)
}

impl RdmaEngine {
    pub fn new(conn: RdmaConnection, role: Role, cfg: EngineConfig) -> Result<Self> {
        let ctrl = ControlBuffers::new(&conn)?;
        let send_max = conn.send_max as usize;
        let mut engine = RdmaEngine {
            conn,
            registry: BlockRegistry::new(cfg.chunk_size),
            cfg,
            role,
            ctrl,
            // the responder opens with READY; the initiator must wait for it
            control_ready_expected: role == Role::Source,
            remote: ChunkCursor::default(),
            copy_src: ChunkCursor::default(),
            copy_dst: ChunkCursor::default(),
            nb_sent: 0,
            unreg: UnregisterRing::new(send_max),
        };
        engine.post_recv_control(READY_SLOT)?;
        Ok(engine)
    }

    pub fn registry(&self) -> &BlockRegistry {
        &self.registry
    }

    pub fn caps(&self) -> CapFlags {
        self.conn.caps
    }

    pub fn nb_sent(&self) -> u32 {
        self.nb_sent
    }

    /// Shared fatal-error sentinel; the keepalive watcher sets it, every
    /// transfer entry point checks it.
    pub fn error_state(&self) -> crate::error::ErrorState {
        self.conn.err.clone()
    }

    /// Register the hypervisor's RAM blocks. In pin-all mode every block is
    /// pinned whole, up front, for all three queue-pair uses.
    pub fn init_ram_blocks(&mut self, blocks: &[RamBlockDesc]) -> Result<()> {
        for desc in blocks {
            let index = self.registry.add(desc.host_addr, desc.offset, desc.len);
            if self.conn.pin_all() {
                let access = match self.role {
                    Role::Source => AccessFlags::empty(),
                    Role::Dest => AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_WRITE,
                };
                let mut verbs = self.conn.verbs.lock().unwrap();
                let mr = verbs.register(desc.host_addr, desc.len, access)?;
                let mr_src = verbs.register(desc.host_addr, desc.len, AccessFlags::empty())?;
                let mr_dest = verbs.register(
                    desc.host_addr,
                    desc.len,
                    AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_WRITE,
                )?;
                drop(verbs);
                let block = self.registry.get_mut(index)?;
                block.mr = Some(mr);
                block.mr_src = Some(mr_src);
                block.mr_dest = Some(mr_dest);
            }
        }
        Ok(())
    }

    pub fn start_keepalive(&self, cfg: KeepaliveConfig) -> Result<Option<KeepaliveHandle>> {
        let Some(slot) = self.conn.keepalive_slot.clone() else {
            return Ok(None);
        };
        let ka = Keepalive::new(
            self.conn.verbs.clone(),
            self.conn.err.clone(),
            slot,
            self.conn.peer_keepalive_rkey,
            self.conn.peer_keepalive_addr,
            cfg,
        );
        ka.spawn().map(Some)
    }

    /// Queue one dirty range for transfer to the peer. `offset` is relative
    /// to the block registered at `block_offset`.
    pub fn save_page(&mut self, block_offset: u64, offset: u64, len: u64) -> Result<()> {
        self.conn.err.check()?;
        let addr = block_offset + offset;
        let (block_idx, _chunk) = self.registry.search(block_offset, addr, len)?;

        if self.mergeable(&self.remote, block_idx, addr, len) {
            self.remote.len += len;
            return Ok(());
        }

        self.flush_remote()?;
        self.remote = self.start_range(block_idx, addr, len)?;
        Ok(())
    }

    /// Queue one local-to-local copy. Both the source and the destination
    /// range must extend their cursors for the ranges to merge.
    pub fn copy_page(
        &mut self,
        src_block_offset: u64,
        src_offset: u64,
        dst_block_offset: u64,
        dst_offset: u64,
        len: u64,
    ) -> Result<()> {
        self.conn.err.check()?;
        let src_addr = src_block_offset + src_offset;
        let dst_addr = dst_block_offset + dst_offset;
        let (src_idx, _) = self.registry.search(src_block_offset, src_addr, len)?;
        let (dst_idx, _) = self.registry.search(dst_block_offset, dst_addr, len)?;

        if self.mergeable(&self.copy_src, src_idx, src_addr, len)
            && self.mergeable(&self.copy_dst, dst_idx, dst_addr, len)
        {
            self.copy_src.len += len;
            self.copy_dst.len += len;
            return Ok(());
        }

        self.flush_copy()?;
        self.copy_src = self.start_range(src_idx, src_addr, len)?;
        self.copy_dst = self.start_range(dst_idx, dst_addr, len)?;
        Ok(())
    }

    /// Flush both pending cursors, then wait out every outstanding WRITE.
    /// Required before any control-level synchronization point.
    pub fn drain_writes(&mut self) -> Result<()> {
        self.flush_remote()?;
        self.flush_copy()?;
        while self.nb_sent > 0 {
            self.block_for_wrid(WaitTarget::AnyWrite)?;
        }
        Ok(())
    }

    /// End-of-iteration sync with the peer.
    pub fn finish_iteration(&mut self) -> Result<()> {
        self.drain_writes()?;
        self.process_unregister_queue()?;
        self.exchange_send(ControlType::RegisterFinished, &[], 1, None)?;
        Ok(())
    }

    pub fn shutdown(&mut self) -> Result<()> {
        self.drain_writes()?;
        self.conn.verbs.lock().unwrap().disconnect()
    }

    fn mergeable(&self, cursor: &ChunkCursor, block: u16, addr: u64, len: u64) -> bool {
        cursor.len > 0
            && cursor.block == block
            && addr == cursor.addr + cursor.len
            && addr + len <= cursor.chunk_end
            && cursor.len + len <= self.cfg.merge_max
    }

    fn start_range(&self, block_idx: u16, addr: u64, len: u64) -> Result<ChunkCursor> {
        let block = self.registry.get(block_idx)?;
        let cs = self.cfg.chunk_size;
        let first = (addr - block.offset) / cs;
        let last = (addr - block.offset + len - 1) / cs;
        let (_, chunk_end) = self.registry.chunk_range(block, first);
        Ok(ChunkCursor {
            addr,
            len,
            block: block_idx,
            chunk: first,
            chunk_end,
            nb_chunks: last - first + 1,
        })
    }

    pub(crate) fn flush_remote(&mut self) -> Result<()> {
        if self.remote.len == 0 {
            return Ok(());
        }
        self.conn.err.check()?;
        self.process_unregister_queue()?;

        let cursor = self.remote;
        self.wait_span_clear(cursor.block, cursor.chunk, cursor.nb_chunks)?;

        if !self.conn.pin_all()
            && !self.span_registered(cursor.block, cursor.chunk, cursor.nb_chunks)?
        {
            // never pinned: a uniform range is cheaper as a fill command
            let block = self.registry.get(cursor.block)?;
            let host = block.host(cursor.addr);
            if block.is_ram_block && range_is_zero(host, cursor.len) {
                trace!(
                    addr = cursor.addr,
                    len = cursor.len,
                    "eliding write of all-zero range"
                );
                let rec = CompressRecord {
                    value: 0,
                    block_index: u32::from(cursor.block),
                    offset: cursor.addr,
                    len: cursor.len,
                };
                let mut payload = Vec::with_capacity(CompressRecord::SIZE);
                rec.encode_to(&mut payload);
                self.exchange_send(ControlType::Compress, &payload, 1, None)?;
                self.remote = ChunkCursor::default();
                return Ok(());
            }
            self.register_chunk_remote(&cursor)?;
        }

        let block = self.registry.get(cursor.block)?;
        let (lkey, rkey) = if self.conn.pin_all() {
            let mr = block
                .mr
                .ok_or_else(|| Error::Verbs("block not pinned".to_string()))?;
            (mr.lkey, block.remote_rkey)
        } else {
            let mr = block.pmr[cursor.chunk as usize]
                .ok_or_else(|| Error::Verbs("chunk not pinned".to_string()))?;
            (mr.lkey, block.remote_keys[cursor.chunk as usize])
        };

        let wr = WriteRequest {
            wr_id: WrId::new(WrKind::RemoteWrite, cursor.block, cursor.chunk).encode(),
            local_addr: block.host(cursor.addr),
            len: cursor.len as u32,
            lkey,
            remote_addr: block.remote_host_addr + (cursor.addr - block.offset),
            rkey,
            signaled: true,
        };
        self.post_write_retry(wr)?;

        self.mark_span_in_transit(cursor.block, cursor.chunk, cursor.nb_chunks)?;
        self.nb_sent += 1;
        self.remote = ChunkCursor::default();
        Ok(())
    }

    pub(crate) fn flush_copy(&mut self) -> Result<()> {
        if self.copy_src.len == 0 {
            return Ok(());
        }
        self.conn.err.check()?;
        self.process_unregister_queue()?;

        let src = self.copy_src;
        let dst = self.copy_dst;
        self.wait_span_clear(dst.block, dst.chunk, dst.nb_chunks)?;

        let src_lkey = self.ensure_copy_pin(src.block, &src, CopyEnd::Source)?;
        let dst_rkey = self.ensure_copy_pin(dst.block, &dst, CopyEnd::Dest)?;

        let src_block = self.registry.get(src.block)?;
        let local_addr = src_block.host(src.addr);
        let dst_block = self.registry.get(dst.block)?;
        let remote_addr = dst_block.host(dst.addr);

        let wr = WriteRequest {
            wr_id: WrId::new(WrKind::LocalCopy, dst.block, dst.chunk).encode(),
            local_addr,
            len: src.len as u32,
            lkey: src_lkey,
            remote_addr,
            rkey: dst_rkey,
            signaled: true,
        };
        self.post_write_retry(wr)?;

        self.mark_span_in_transit(dst.block, dst.chunk, dst.nb_chunks)?;
        self.nb_sent += 1;
        self.copy_src = ChunkCursor::default();
        self.copy_dst = ChunkCursor::default();
        Ok(())
    }

    /// Wait until no WRITE is outstanding on any chunk of the span; at most
    /// one may be in flight per chunk.
    fn wait_span_clear(&mut self, block_idx: u16, first: u64, nb_chunks: u64) -> Result<()> {
        loop {
            let busy = {
                let block = self.registry.get(block_idx)?;
                (first..first + nb_chunks).any(|c| block.transit.test(c as usize))
            };
            if !busy {
                return Ok(());
            }
            self.block_for_wrid(WaitTarget::AnyWrite)?;
        }
    }

    fn mark_span_in_transit(&mut self, block_idx: u16, first: u64, nb_chunks: u64) -> Result<()> {
        let block = self.registry.get_mut(block_idx)?;
        for c in first..first + nb_chunks {
            block.transit.set(c as usize);
        }
        block.transit_span[first as usize] = nb_chunks;
        Ok(())
    }

    fn clear_transit_span(&mut self, block_idx: u16, first: u64) -> Result<()> {
        let block = self.registry.get_mut(block_idx)?;
        let span = block.transit_span[first as usize].max(1);
        for c in first..first + span {
            block.transit.clear(c as usize);
        }
        block.transit_span[first as usize] = 0;
        Ok(())
    }

    /// True when one single registration covers the whole span with a live
    /// remote key. Partial or mixed pinnings cannot back one WRITE.
    fn span_registered(&self, block_idx: u16, first: u64, nb_chunks: u64) -> Result<bool> {
        let block = self.registry.get(block_idx)?;
        let first = first as usize;
        let Some(mr0) = block.pmr[first] else {
            return Ok(false);
        };
        let key0 = block.remote_keys[first];
        if key0 == 0 {
            return Ok(false);
        }
        Ok((first..first + nb_chunks as usize).all(|c| {
            block.pmr[c].map(|mr| mr.handle) == Some(mr0.handle) && block.remote_keys[c] == key0
        }))
    }

    /// Pin the cursor's chunk span for the remote queue pair, exchanging a
    /// registration request with the peer. The local pin happens while the
    /// request is in flight. Every chunk of the span shares the one
    /// registration, so per-chunk state stays truthful for spanning writes.
    fn register_chunk_remote(&mut self, cursor: &ChunkCursor) -> Result<()> {
        let first = cursor.chunk as usize;
        let nb = cursor.nb_chunks as usize;
        let (key, host_start, reg_len) = {
            let block = self.registry.get(cursor.block)?;
            let last = cursor.chunk + cursor.nb_chunks - 1;
            let (start_vm, _) = self.registry.chunk_range(block, cursor.chunk);
            let (_, end_vm) = self.registry.chunk_range(block, last);
            let key = if block.is_ram_block {
                cursor.chunk
            } else {
                cursor.addr
            };
            (key, block.host(start_vm), end_vm - start_vm)
        };

        // a fresh span registration replaces any pin partially covering it
        let stale: Vec<_> = {
            let block = self.registry.get(cursor.block)?;
            let mut handles = Vec::new();
            for c in first..first + nb {
                if let Some(mr) = block.pmr[c] {
                    if !handles.contains(&mr.handle) {
                        handles.push(mr.handle);
                    }
                }
            }
            handles
        };
        for handle in stale {
            self.registry.get_mut(cursor.block)?.forget_pin(handle);
            self.conn.verbs.lock().unwrap().deregister(handle)?;
        }

        let record = RegisterRecord {
            key,
            block_index: u32::from(cursor.block),
            len: reg_len as u32,
        };
        let mut payload = Vec::with_capacity(RegisterRecord::SIZE);
        record.encode_to(&mut payload);

        self.ready_gate()?;
        self.post_recv_control(DATA_SLOT)?;
        self.post_recv_control(READY_SLOT)?;
        self.post_send_control(ControlType::RegisterRequest, &payload, 1)?;
        self.control_ready_expected = true;

        // pin our side while the peer registers its own
        let mr = self.conn.verbs.lock().unwrap().register(
            host_start,
            reg_len,
            AccessFlags::empty(),
        )?;
        {
            let block = self.registry.get_mut(cursor.block)?;
            for c in first..first + nb {
                block.pmr[c] = Some(mr);
            }
        }

        let (_hdr, data) = self.wait_recv_control(DATA_SLOT, Some(ControlType::RegisterResult))?;
        let result = RegisterResult::decode(&data)?;
        let block = self.registry.get_mut(cursor.block)?;
        for c in first..first + nb {
            block.remote_keys[c] = result.rkey;
        }
        block.remote_host_addr = result.host_addr;
        Ok(())
    }

    fn ensure_copy_pin(&mut self, block_idx: u16, cursor: &ChunkCursor, end: CopyEnd) -> Result<u32> {
        let access = match end {
            CopyEnd::Source => AccessFlags::empty(),
            CopyEnd::Dest => AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_WRITE,
        };

        if self.conn.pin_all() {
            let block = self.registry.get(block_idx)?;
            let mr = match end {
                CopyEnd::Source => block.mr_src,
                CopyEnd::Dest => block.mr_dest,
            }
            .ok_or_else(|| Error::Verbs("block not pinned for copy".to_string()))?;
            return Ok(match end {
                CopyEnd::Source => mr.lkey,
                CopyEnd::Dest => mr.rkey,
            });
        }

        let first = cursor.chunk as usize;
        let nb = cursor.nb_chunks as usize;

        // reuse only when one registration already covers the whole span
        let reuse = {
            let block = self.registry.get(block_idx)?;
            let pins = match end {
                CopyEnd::Source => &block.pmr_src,
                CopyEnd::Dest => &block.pmr_dest,
            };
            pins[first].filter(|mr0| {
                (first..first + nb).all(|c| pins[c].map(|mr| mr.handle) == Some(mr0.handle))
            })
        };
        let mr = match reuse {
            Some(mr) => mr,
            None => {
                // drop partial overlaps, then pin the span fresh
                let stale: Vec<_> = {
                    let block = self.registry.get(block_idx)?;
                    let pins = match end {
                        CopyEnd::Source => &block.pmr_src,
                        CopyEnd::Dest => &block.pmr_dest,
                    };
                    let mut handles = Vec::new();
                    for c in first..first + nb {
                        if let Some(mr) = pins[c] {
                            if !handles.contains(&mr.handle) {
                                handles.push(mr.handle);
                            }
                        }
                    }
                    handles
                };
                for handle in stale {
                    self.registry.get_mut(block_idx)?.forget_copy_pin(handle);
                    self.conn.verbs.lock().unwrap().deregister(handle)?;
                }

                let (host_start, reg_len) = {
                    let block = self.registry.get(block_idx)?;
                    let last = cursor.chunk + cursor.nb_chunks - 1;
                    let (start_vm, _) = self.registry.chunk_range(block, cursor.chunk);
                    let (_, end_vm) = self.registry.chunk_range(block, last);
                    (block.host(start_vm), end_vm - start_vm)
                };
                let mr = self
                    .conn
                    .verbs
                    .lock()
                    .unwrap()
                    .register(host_start, reg_len, access)?;
                let block = self.registry.get_mut(block_idx)?;
                let pins = match end {
                    CopyEnd::Source => &mut block.pmr_src,
                    CopyEnd::Dest => &mut block.pmr_dest,
                };
                for c in first..first + nb {
                    pins[c] = Some(mr);
                }
                mr
            }
        };
        Ok(match end {
            CopyEnd::Source => mr.lkey,
            CopyEnd::Dest => mr.rkey,
        })
    }

    fn post_write_retry(&mut self, wr: WriteRequest) -> Result<()> {
        loop {
            let outcome = self.conn.verbs.lock().unwrap().post_write(&wr);
            match outcome {
                Ok(()) => return Ok(()),
                Err(PostError::QueueFull) => {
                    // reap a completion to make room, then try again
                    self.block_for_wrid(WaitTarget::AnyWrite)?;
                }
                Err(PostError::Other(msg)) => {
                    let err = Error::Verbs(msg);
                    self.conn.err.set(&err);
                    return Err(err);
                }
            }
        }
    }

    /// Queue a chunk for speculative unpin after its write completed.
    fn enqueue_unregister(&mut self, block_idx: u16, chunk: u64) -> Result<()> {
        let block = self.registry.get_mut(block_idx)?;
        if block.pmr[chunk as usize].is_none() || block.unregister.test(chunk as usize) {
            return Ok(());
        }
        if self.unreg.push((block_idx, chunk)) {
            self.registry
                .get_mut(block_idx)?
                .unregister
                .set(chunk as usize);
        }
        Ok(())
    }

    /// Opportunistic drain of the unpin queue. A registration may cover a
    /// multi-chunk span; it is dropped whole, and skipped while any of its
    /// chunks still has a write in flight (the completion re-queues it).
    pub(crate) fn process_unregister_queue(&mut self) -> Result<()> {
        while let Some((block_idx, chunk)) = self.unreg.pop() {
            let handle = {
                let block = self.registry.get_mut(block_idx)?;
                block.unregister.clear(chunk as usize);
                let Some(mr) = block.pmr[chunk as usize] else {
                    continue;
                };
                let busy = (0..block.nb_chunks).any(|c| {
                    block.pmr[c as usize].map(|m| m.handle) == Some(mr.handle)
                        && block.transit.test(c as usize)
                });
                if busy {
                    continue;
                }
                block.forget_pin(mr.handle);
                mr.handle
            };
            self.conn.verbs.lock().unwrap().deregister(handle)?;

            let key = {
                let block = self.registry.get(block_idx)?;
                if block.is_ram_block {
                    chunk
                } else {
                    let (start_vm, _) = self.registry.chunk_range(block, chunk);
                    start_vm
                }
            };
            let record = RegisterRecord {
                key,
                block_index: u32::from(block_idx),
                len: 0,
            };
            let mut payload = Vec::with_capacity(RegisterRecord::SIZE);
            record.encode_to(&mut payload);
            self.exchange_send(
                ControlType::UnregisterRequest,
                &payload,
                1,
                Some(ControlType::UnregisterFinished),
            )?;
        }
        Ok(())
    }

    /// Handle one completion: clear transit bits, account in-flight writes,
    /// consume READY notifications. Non-success status is fatal.
    pub(crate) fn process_completion(&mut self, wc: WorkCompletion) -> Result<WrId> {
        if let WcStatus::Failure(code) = wc.status {
            let err = Error::Completion(code);
            self.conn.err.set(&err);
            return Err(err);
        }

        let wrid = WrId::decode(wc.wr_id)?;
        match wrid.kind {
            WrKind::RemoteWrite => {
                self.nb_sent = self.nb_sent.saturating_sub(1);
                self.clear_transit_span(wrid.block, wrid.chunk)?;
                if self.cfg.unregister_enabled && !self.conn.pin_all() {
                    self.enqueue_unregister(wrid.block, wrid.chunk)?;
                }
            }
            WrKind::LocalCopy => {
                self.nb_sent = self.nb_sent.saturating_sub(1);
                self.clear_transit_span(wrid.block, wrid.chunk)?;
            }
            WrKind::RecvControl => {
                if self.control_ready_expected {
                    self.control_ready_expected = false;
                }
            }
            WrKind::SendControl | WrKind::Keepalive | WrKind::None => {}
        }
        Ok(wrid)
    }

    /// Drain completions until one matching `target` shows up, parking on
    /// the completion channel when the queue runs dry.
    pub(crate) fn block_for_wrid(&mut self, target: WaitTarget) -> Result<()> {
        loop {
            loop {
                let wc = self.conn.verbs.lock().unwrap().poll_cq()?;
                let Some(wc) = wc else { break };
                let wrid = self.process_completion(wc)?;
                if target.matches(wrid) {
                    return Ok(());
                }
            }
            self.wait_activity()?;
        }
    }

    fn wait_activity(&mut self) -> Result<()> {
        match self.conn.wait {
            WaitStrategy::Block => self.conn.verbs.lock().unwrap().wait_comp_channel(),
            WaitStrategy::PollFd => {
                let fd = self
                    .conn
                    .comp_fd
                    .ok_or_else(|| Error::Verbs("no completion channel fd".to_string()))?;
                // park on the fd without the verbs lock so the keepalive
                // timers can keep posting
                let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
                let mut fds = [PollFd::new(borrowed, PollFlags::POLLIN)];
                poll(&mut fds, PollTimeout::NONE).map_err(|e| Error::Verbs(e.to_string()))?;
                self.conn.verbs.lock().unwrap().ack_comp_channel()
            }
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum CopyEnd {
    Source,
    Dest,
}
