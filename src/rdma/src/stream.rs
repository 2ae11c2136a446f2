//! Byte stream over the control channel.
//!
//! Checkpoint and migration-stream bytes ride in opaque `QemuFile` control
//! messages, so callers that speak `io::Read`/`io::Write` (the checkpoint
//! loops, the hypervisor's state serializer) can run unchanged over RDMA.
//! Every entry point drains outstanding one-sided writes first: stream
//! traffic is a synchronization point for the page path.

use std::io::{self, Read, Write};

use crate::control::{ControlType, CONTROL_MAX_PAYLOAD};
use crate::engine::RdmaEngine;
use crate::error::Error;
use crate::exchange::PeerEvent;

pub struct RdmaStream {
    engine: RdmaEngine,
    pending: Vec<u8>,
    pos: usize,
}

fn to_io(err: Error) -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, err)
}

impl RdmaStream {
    pub fn new(engine: RdmaEngine) -> Self {
        RdmaStream {
            engine,
            pending: Vec::new(),
            pos: 0,
        }
    }

    pub fn engine_mut(&mut self) -> &mut RdmaEngine {
        &mut self.engine
    }

    pub fn into_engine(self) -> RdmaEngine {
        self.engine
    }
}

impl Write for RdmaStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.engine.drain_writes().map_err(to_io)?;
        for piece in buf.chunks(CONTROL_MAX_PAYLOAD) {
            self.engine
                .exchange_send(ControlType::QemuFile, piece, 1, None)
                .map_err(to_io)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.engine.drain_writes().map_err(to_io)
    }
}

impl Read for RdmaStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos == self.pending.len() {
            self.engine.drain_writes().map_err(to_io)?;
            loop {
                match self.engine.next_event().map_err(to_io)? {
                    PeerEvent::FileData(data) => {
                        if data.is_empty() {
                            continue;
                        }
                        self.pending = data;
                        self.pos = 0;
                        break;
                    }
                    // iteration boundaries are page-path bookkeeping, not
                    // stream payload
                    PeerEvent::IterationDone => continue,
                }
            }
        }

        let n = (self.pending.len() - self.pos).min(buf.len());
        buf[..n].copy_from_slice(&self.pending[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}
