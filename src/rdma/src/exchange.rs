//! Runtime half of the control protocol: registered buffers, the READY
//! gating discipline, and the responder-side command handlers.
//!
//! Discipline: nothing is ever sent without a RECV posted on the peer. A
//! reader announces readiness with READY; a sender with
//! `control_ready_expected` set waits for that READY before posting, posts
//! an extra RECV if it expects a response, then sends and optionally blocks
//! on the response.

use std::ptr;

use tracing::{debug, warn};

use crate::control::{
    decode_batch, CompressRecord, ControlHeader, ControlType, RegisterRecord, RegisterResult,
    CONTROL_BUFFER_SIZE, CONTROL_MAX_PAYLOAD,
};
use crate::conn::RdmaConnection;
use crate::engine::{RdmaEngine, WaitTarget};
use crate::error::{Error, Result};
use crate::registry::RemoteBlock;
use crate::verbs::{AccessFlags, MemoryRegion};
use crate::wrid::{WrId, WrKind};

pub(crate) const READY_SLOT: usize = 0;
pub(crate) const DATA_SLOT: usize = 1;

/// One pinned control buffer.
pub(crate) struct CtrlBuf {
    mem: Box<[u8]>,
    pub(crate) mr: MemoryRegion,
}

impl CtrlBuf {
    fn new(conn: &RdmaConnection, access: AccessFlags) -> Result<Self> {
        let mem = vec![0u8; CONTROL_BUFFER_SIZE].into_boxed_slice();
        let mr = conn.verbs.lock().unwrap().register(
            mem.as_ptr() as u64,
            CONTROL_BUFFER_SIZE as u64,
            access,
        )?;
        Ok(CtrlBuf { mem, mr })
    }

    pub(crate) fn addr(&self) -> u64 {
        self.mem.as_ptr() as u64
    }

    fn bytes(&self) -> &[u8] {
        &self.mem
    }

    fn fill(&mut self, header: &ControlHeader, payload: &[u8]) -> usize {
        let mut buf = Vec::with_capacity(ControlHeader::SIZE + payload.len());
        header.encode_to(&mut buf);
        buf.extend_from_slice(payload);
        self.mem[..buf.len()].copy_from_slice(&buf);
        buf.len()
    }
}

pub(crate) struct ControlBuffers {
    send: CtrlBuf,
    recv: [CtrlBuf; 2],
}

impl ControlBuffers {
    pub(crate) fn new(conn: &RdmaConnection) -> Result<Self> {
        Ok(ControlBuffers {
            send: CtrlBuf::new(conn, AccessFlags::empty())?,
            recv: [
                CtrlBuf::new(conn, AccessFlags::LOCAL_WRITE)?,
                CtrlBuf::new(conn, AccessFlags::LOCAL_WRITE)?,
            ],
        })
    }
}

/// What the serving side surfaces to its caller between commands.
#[derive(Debug, PartialEq, Eq)]
pub enum PeerEvent {
    /// Opaque byte-stream payload (checkpoint / migration stream data).
    FileData(Vec<u8>),
    /// The peer finished a transfer iteration.
    IterationDone,
}

impl RdmaEngine {
    pub(crate) fn post_recv_control(&mut self, slot: usize) -> Result<()> {
        let buf = &self.ctrl.recv[slot];
        self.conn.verbs.lock().unwrap().post_recv(
            WrId::control(WrKind::RecvControl, slot).encode(),
            buf.addr(),
            CONTROL_BUFFER_SIZE as u32,
            buf.mr.lkey,
        )
    }

    /// Post one control message and wait for its send completion; the
    /// single send buffer is reusable as soon as this returns.
    pub(crate) fn post_send_control(
        &mut self,
        kind: ControlType,
        payload: &[u8],
        repeat: u32,
    ) -> Result<()> {
        self.conn.err.check()?;
        if payload.len() > CONTROL_MAX_PAYLOAD {
            return Err(Error::ControlOverflow(payload.len()));
        }
        let header = ControlHeader::new(kind, payload.len(), repeat);
        let len = self.ctrl.send.fill(&header, payload);
        let (addr, lkey) = (self.ctrl.send.addr(), self.ctrl.send.mr.lkey);
        self.conn.verbs.lock().unwrap().post_send(
            WrId::control(WrKind::SendControl, 0).encode(),
            addr,
            len as u32,
            lkey,
        )?;
        self.block_for_wrid(WaitTarget::Send)
    }

    /// Block until a message lands in `slot`, validate it and copy it out.
    pub(crate) fn wait_recv_control(
        &mut self,
        slot: usize,
        expected: Option<ControlType>,
    ) -> Result<(ControlHeader, Vec<u8>)> {
        self.block_for_wrid(WaitTarget::Recv(slot as u16))?;

        let bytes = self.ctrl.recv[slot].bytes();
        let header = ControlHeader::decode(bytes)?;
        let payload =
            bytes[ControlHeader::SIZE..ControlHeader::SIZE + header.len as usize].to_vec();

        if header.kind == ControlType::Error {
            let err = Error::PeerAbort;
            self.conn.err.set(&err);
            return Err(err);
        }
        if let Some(expected) = expected {
            if header.kind != expected {
                return Err(Error::UnexpectedMessage {
                    expected,
                    got: header.kind,
                });
            }
        }
        Ok((header, payload))
    }

    /// Consume the peer's READY if one is owed to us.
    pub(crate) fn ready_gate(&mut self) -> Result<()> {
        if !self.control_ready_expected {
            return Ok(());
        }
        self.wait_recv_control(READY_SLOT, Some(ControlType::Ready))?;
        Ok(())
    }

    /// Request/response primitive for the initiating side.
    pub(crate) fn exchange_send(
        &mut self,
        kind: ControlType,
        payload: &[u8],
        repeat: u32,
        expect: Option<ControlType>,
    ) -> Result<Option<(ControlHeader, Vec<u8>)>> {
        self.ready_gate()?;
        if expect.is_some() {
            self.post_recv_control(DATA_SLOT)?;
        }
        self.post_recv_control(READY_SLOT)?;
        self.post_send_control(kind, payload, repeat)?;
        self.control_ready_expected = true;

        match expect {
            Some(expected) => Ok(Some(self.wait_recv_control(DATA_SLOT, Some(expected))?)),
            None => Ok(None),
        }
    }

    /// Receive primitive for the serving side: announce readiness, take
    /// delivery, replace the consumed RECV.
    pub(crate) fn exchange_recv(
        &mut self,
        expected: Option<ControlType>,
    ) -> Result<(ControlHeader, Vec<u8>)> {
        self.post_send_control(ControlType::Ready, &[], 1)?;
        let message = self.wait_recv_control(READY_SLOT, expected)?;
        self.post_recv_control(READY_SLOT)?;
        Ok(message)
    }

    /// Source side, once per connection: pull the peer's block table and
    /// fold its addresses (and pin-all rkeys) into the local registry.
    pub fn fetch_remote_blocks(&mut self) -> Result<()> {
        let (header, payload) = self
            .exchange_send(
                ControlType::RamBlocksRequest,
                &[],
                1,
                Some(ControlType::RamBlocksResult),
            )?
            .expect("response was requested");

        let remote = decode_batch(
            &payload,
            header.repeat,
            RemoteBlock::SIZE,
            RemoteBlock::decode,
        )?;
        if remote.len() != self.registry.len() {
            return Err(Error::BlockTableMismatch {
                expected: self.registry.len(),
                got: remote.len(),
            });
        }
        for rb in &remote {
            let Some(index) = self.registry.by_offset(rb.offset).map(|b| b.index) else {
                return Err(Error::UnknownBlock(rb.offset));
            };
            let block = self.registry.get_mut(index)?;
            if block.len != rb.len {
                warn!(
                    offset = rb.offset,
                    local = block.len,
                    remote = rb.len,
                    "peer block length differs"
                );
                return Err(Error::BlockTableMismatch {
                    expected: self.registry.len(),
                    got: remote.len(),
                });
            }
            block.remote_host_addr = rb.remote_host_addr;
            block.remote_rkey = rb.rkey;
        }
        debug!(blocks = remote.len(), "remote block table installed");
        Ok(())
    }

    /// Serving side: handle peer commands until there is something for the
    /// caller (stream data or an iteration boundary).
    pub fn next_event(&mut self) -> Result<PeerEvent> {
        loop {
            let (header, payload) = self.exchange_recv(None)?;
            match header.kind {
                ControlType::QemuFile => return Ok(PeerEvent::FileData(payload)),
                ControlType::RegisterFinished => return Ok(PeerEvent::IterationDone),
                ControlType::RamBlocksRequest => self.reply_block_table()?,
                ControlType::RegisterRequest => {
                    self.handle_register_batch(&payload, header.repeat)?
                }
                ControlType::UnregisterRequest => {
                    self.handle_unregister_batch(&payload, header.repeat)?
                }
                ControlType::Compress => self.handle_compress_batch(&payload, header.repeat)?,
                other => {
                    return Err(Error::UnexpectedMessage {
                        expected: ControlType::QemuFile,
                        got: other,
                    })
                }
            }
        }
    }

    fn reply_block_table(&mut self) -> Result<()> {
        let pin_all = self.conn.pin_all();
        let mut payload = Vec::with_capacity(self.registry.len() * RemoteBlock::SIZE);
        let mut count = 0u32;
        for block in self.registry.iter() {
            RemoteBlock {
                remote_host_addr: block.host_addr,
                offset: block.offset,
                len: block.len,
                rkey: if pin_all {
                    block.mr.map(|mr| mr.rkey).unwrap_or(0)
                } else {
                    0
                },
            }
            .encode_to(&mut payload);
            count += 1;
        }
        self.post_send_control(ControlType::RamBlocksResult, &payload, count)
    }

    fn handle_register_batch(&mut self, payload: &[u8], repeat: u32) -> Result<()> {
        let records = decode_batch(payload, repeat, RegisterRecord::SIZE, RegisterRecord::decode)?;
        let mut reply = Vec::with_capacity(records.len() * RegisterResult::SIZE);
        for record in &records {
            let (chunk, host_start, reg_len, host_base) = self.locate_chunk(record)?;
            let block_idx = record.block_index as u16;
            // the registration may span several chunks; every one of them
            // carries the entry, and any pin it partially overlaps goes
            let span = {
                let block = self.registry.get(block_idx)?;
                let nb = reg_len.div_ceil(self.registry.chunk_size()).max(1);
                chunk..(chunk + nb).min(block.nb_chunks)
            };
            let stale: Vec<_> = {
                let block = self.registry.get(block_idx)?;
                let mut handles = Vec::new();
                for c in span.clone() {
                    if let Some(mr) = block.pmr[c as usize] {
                        if !handles.contains(&mr.handle) {
                            handles.push(mr.handle);
                        }
                    }
                }
                handles
            };
            for handle in stale {
                self.registry.get_mut(block_idx)?.forget_pin(handle);
                self.conn.verbs.lock().unwrap().deregister(handle)?;
            }

            let mr = self.conn.verbs.lock().unwrap().register(
                host_start,
                reg_len,
                AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_WRITE,
            )?;
            let block = self.registry.get_mut(block_idx)?;
            for c in span {
                block.pmr[c as usize] = Some(mr);
            }
            RegisterResult {
                rkey: mr.rkey,
                host_addr: host_base,
            }
            .encode_to(&mut reply);
        }
        self.post_send_control(ControlType::RegisterResult, &reply, records.len() as u32)
    }

    fn handle_unregister_batch(&mut self, payload: &[u8], repeat: u32) -> Result<()> {
        let records = decode_batch(payload, repeat, RegisterRecord::SIZE, RegisterRecord::decode)?;
        for record in &records {
            let (chunk, _, _, _) = self.locate_chunk(record)?;
            // drop the whole registration the chunk belongs to
            let handle = {
                let block = self.registry.get_mut(record.block_index as u16)?;
                match block.pmr[chunk as usize] {
                    Some(mr) => {
                        block.forget_pin(mr.handle);
                        Some(mr.handle)
                    }
                    None => None,
                }
            };
            if let Some(handle) = handle {
                self.conn.verbs.lock().unwrap().deregister(handle)?;
            }
        }
        self.post_send_control(ControlType::UnregisterFinished, &[], 1)
    }

    fn handle_compress_batch(&mut self, payload: &[u8], repeat: u32) -> Result<()> {
        let records = decode_batch(payload, repeat, CompressRecord::SIZE, CompressRecord::decode)?;
        for record in &records {
            let block = self.registry.get(record.block_index as u16)?;
            if !block.contains(record.offset, record.len) {
                return Err(Error::OutOfBlock {
                    offset: record.offset,
                    len: record.len,
                });
            }
            let host = block.host(record.offset);
            // fill the guest range directly; this replaces an RDMA WRITE
            unsafe {
                ptr::write_bytes(host as *mut u8, record.value as u8, record.len as usize);
            }
        }
        Ok(())
    }

    /// Resolve a control record to `(chunk, host start, span length, block
    /// base)`. RAM-proper blocks key by chunk index, auxiliary blocks by
    /// guest-space address.
    fn locate_chunk(&self, record: &RegisterRecord) -> Result<(u64, u64, u64, u64)> {
        let block = self.registry.get(record.block_index as u16)?;
        let chunk = if block.is_ram_block {
            record.key
        } else {
            if record.key < block.offset || record.key >= block.offset + block.len {
                return Err(Error::OutOfBlock {
                    offset: record.key,
                    len: u64::from(record.len),
                });
            }
            (record.key - block.offset) / self.registry.chunk_size()
        };
        if chunk >= block.nb_chunks {
            return Err(Error::OutOfBlock {
                offset: record.key,
                len: u64::from(record.len),
            });
        }
        let (start_vm, chunk_end) = self.registry.chunk_range(block, chunk);
        let span = if record.len == 0 {
            chunk_end - start_vm
        } else {
            u64::from(record.len).min(block.offset + block.len - start_vm)
        };
        Ok((chunk, block.host(start_vm), span, block.host_addr))
    }
}
