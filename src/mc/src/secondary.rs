//! The standby-side receiver: reassemble, acknowledge, apply.

use std::io::{Read, Write};
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use slabring::{SlabRing, StagingFile};
use tracing::{debug, error, info};
use vmshim::VmHandle;

use crate::config::McConfig;
use crate::proto::{self, Sentinel};
use crate::Result;

const XFER_BUF_SIZE: usize = 64 << 10;

pub struct McReceiver<S: Read + Write> {
    vm: VmHandle,
    stream: S,
    staging: StagingFile,
    applied: Arc<AtomicU64>,
}

impl<S: Read + Write> McReceiver<S> {
    pub fn new(vm: VmHandle, stream: S, cfg: &McConfig) -> Self {
        McReceiver {
            vm,
            stream,
            staging: StagingFile::new(SlabRing::new(cfg.slab_size, cfg.max_strikes())),
            applied: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Counter of checkpoints applied so far, readable from other threads.
    pub fn applied_counter(&self) -> Arc<AtomicU64> {
        self.applied.clone()
    }

    /// Receive and apply checkpoints until the primary stops. Protocol
    /// violations and failed applies exit the process: continuing would
    /// silently diverge from the primary. A plain stream error (the link
    /// died) is returned to the caller instead.
    pub fn run(mut self) -> Result<()> {
        proto::write_sentinel(&mut self.stream, Sentinel::Ack)?;
        self.stream.flush()?;
        info!("standby ready, waiting for checkpoints");

        let mut buf = vec![0u8; XFER_BUF_SIZE];
        loop {
            self.staging.ring_mut().reset_for_checkpoint();

            let word = proto::read_u32(&mut self.stream)?;
            match Sentinel::from_wire(word) {
                Ok(Sentinel::Commit) => {}
                Ok(Sentinel::Cancel) => {
                    info!("primary requested an orderly stop");
                    return Ok(());
                }
                _ => {
                    error!(word, "unexpected control word from the primary, exiting");
                    process::exit(1);
                }
            }

            let size = proto::read_u32(&mut self.stream)? as usize;
            if size == 0 {
                error!("zero-length checkpoint from the primary, exiting");
                process::exit(1);
            }

            let mut remaining = size;
            while remaining > 0 {
                let n = remaining.min(buf.len());
                self.stream.read_exact(&mut buf[..n])?;
                self.staging.ring_mut().put(&buf[..n]);
                remaining -= n;
            }
            debug!(size, "checkpoint received");

            proto::write_sentinel(&mut self.stream, Sentinel::Ack)?;
            self.stream.flush()?;

            self.staging.ring_mut().rewind();
            let mut vm = self.vm.lock().unwrap();
            if let Err(e) = vm.load_state(&mut self.staging) {
                error!(error = %e, "checkpoint apply failed, exiting");
                process::exit(1);
            }
            self.applied.fetch_add(1, Ordering::SeqCst);
        }
    }
}
