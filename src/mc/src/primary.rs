//! The per-tick checkpoint state machine on the primary.

use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};
use netplug::TrafficBuffer;
use slabring::{SlabRing, StagingFile};
use tracing::{debug, error, info, warn};
use vmshim::VmHandle;

use crate::config::McConfig;
use crate::proto::{self, Sentinel};
use crate::{Error, Result};

const XFER_BUF_SIZE: usize = 64 << 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McState {
    Running,
    Completed,
    Error,
}

#[derive(Debug, Clone, Default)]
pub struct McStats {
    pub checkpoints: u64,
    pub bytes_streamed: u64,
    pub last_checkpoint_bytes: u64,
    pub last_downtime_ms: u64,
    pub total_downtime_ms: u64,
}

enum Tick {
    Continue,
    Stop,
}

/// Drives the checkpoint cycle against a paused-resumed guest. The VM
/// mutex doubles as the hypervisor's I/O-thread lock and is held only
/// across pause, state save and resume.
pub struct McLoop<S: Read + Write + Send + 'static> {
    vm: VmHandle,
    stream: S,
    staging: StagingFile,
    buffer: Option<TrafficBuffer>,
    cfg: McConfig,
    state: Arc<Mutex<McState>>,
    stats: Arc<Mutex<McStats>>,
    stop_rx: Receiver<()>,
    stop_tx: Sender<()>,
    xfer_buf: Vec<u8>,
}

pub struct McHandle {
    thread: JoinHandle<()>,
    stop_tx: Sender<()>,
    state: Arc<Mutex<McState>>,
    stats: Arc<Mutex<McStats>>,
}

impl McHandle {
    /// Request an orderly stop after the in-flight checkpoint.
    pub fn cancel(&self) {
        let _ = self.stop_tx.try_send(());
    }

    pub fn state(&self) -> McState {
        *self.state.lock().unwrap()
    }

    pub fn stats(&self) -> McStats {
        self.stats.lock().unwrap().clone()
    }

    pub fn join(self) -> (McState, McStats) {
        let _ = self.thread.join();
        let state = *self.state.lock().unwrap();
        let stats = self.stats.lock().unwrap().clone();
        (state, stats)
    }
}

impl<S: Read + Write + Send + 'static> McLoop<S> {
    /// `buffer` is `None` when output buffering could not be enabled; the
    /// loop then runs without the network-consistency guarantee.
    pub fn new(vm: VmHandle, stream: S, buffer: Option<TrafficBuffer>, cfg: McConfig) -> Self {
        if buffer.is_none() {
            warn!("network buffering is OFF; released output may outrun replicated state");
        }
        let ring = SlabRing::new(cfg.slab_size, cfg.max_strikes());
        let (stop_tx, stop_rx) = bounded(1);
        McLoop {
            vm,
            stream,
            staging: StagingFile::new(ring),
            buffer,
            cfg,
            state: Arc::new(Mutex::new(McState::Running)),
            stats: Arc::new(Mutex::new(McStats::default())),
            stop_rx,
            stop_tx,
            xfer_buf: vec![0u8; XFER_BUF_SIZE],
        }
    }

    pub fn spawn(self) -> McHandle {
        let state = self.state.clone();
        let stats = self.stats.clone();
        let stop_tx = self.stop_tx.clone();
        let thread = thread::Builder::new()
            .name("mc worker".to_string())
            .spawn(move || self.run())
            .expect("failed to spawn thread");
        McHandle {
            thread,
            stop_tx,
            state,
            stats,
        }
    }

    fn run(mut self) {
        // the standby opens the conversation with one ACK
        match proto::read_sentinel(&mut self.stream) {
            Ok(Sentinel::Ack) => {}
            Ok(other) => {
                error!(?other, "bad handshake from the standby");
                return self.finish(McState::Error);
            }
            Err(e) => {
                error!(error = %e, "handshake with the standby failed");
                return self.finish(McState::Error);
            }
        }
        info!(freq_ms = self.cfg.freq_ms, "micro-checkpointing started");

        let period = Duration::from_millis(self.cfg.freq_ms);
        loop {
            match self.stop_rx.try_recv() {
                Ok(()) => return self.finish(McState::Completed),
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => return self.finish(McState::Completed),
            }

            match self.checkpoint() {
                Ok(Tick::Continue) => thread::sleep(period),
                Ok(Tick::Stop) => return self.finish(McState::Completed),
                Err(e) => {
                    error!(error = %e, "checkpoint failed, replication stops");
                    return self.finish(McState::Error);
                }
            }
        }
    }

    fn checkpoint(&mut self) -> Result<Tick> {
        self.staging.ring_mut().reset_for_checkpoint();

        let downtime_ms;
        {
            let mut vm = self.vm.lock().unwrap();
            vm.stop()?;
            let paused_at = vm.clock_ms();

            // cut the barrier for everything the guest emits once resumed;
            // this checkpoint's own output was barriered on the previous tick
            if let Some(buffer) = &mut self.buffer {
                buffer.insert_barrier();
            }

            vm.save_state_begin(&mut self.staging)?;
            vm.save_state_complete(&mut self.staging)?;

            vm.start()?;
            downtime_ms = vm.clock_ms().saturating_sub(paused_at);
        }
        if let Some(kind) = self.staging.last_error() {
            return Err(Error::Io(std::io::Error::from(kind)));
        }

        let size = self.staging.ring().total_bytes();
        debug!(size, downtime_ms, "checkpoint staged");

        proto::write_sentinel(&mut self.stream, Sentinel::Commit)?;
        proto::write_u32(&mut self.stream, size as u32)?;
        self.staging.ring_mut().rewind();
        loop {
            let n = self.staging.ring_mut().get(&mut self.xfer_buf);
            if n == 0 {
                break;
            }
            self.stream.write_all(&self.xfer_buf[..n])?;
        }
        self.stream.flush()?;

        match proto::read_sentinel(&mut self.stream)? {
            Sentinel::Ack => {}
            Sentinel::Cancel => {
                info!("standby requested an orderly stop");
                return Ok(Tick::Stop);
            }
            other => {
                return Err(Error::UnexpectedSentinel {
                    expected: Sentinel::Ack,
                    got: other,
                })
            }
        }

        // the standby holds this checkpoint; its covered output may leave
        if let Some(buffer) = &mut self.buffer {
            buffer.release_one();
        }

        let mut stats = self.stats.lock().unwrap();
        stats.checkpoints += 1;
        stats.bytes_streamed += size as u64;
        stats.last_checkpoint_bytes = size as u64;
        stats.last_downtime_ms = downtime_ms;
        stats.total_downtime_ms += downtime_ms;
        Ok(Tick::Continue)
    }

    fn finish(&mut self, state: McState) {
        if let Some(buffer) = &mut self.buffer {
            buffer.disable();
        }
        *self.state.lock().unwrap() = state;
        info!(?state, "micro-checkpointing finished");
    }
}
