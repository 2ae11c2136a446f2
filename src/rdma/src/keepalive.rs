//! Liveness independent of application traffic.
//!
//! Each side owns an 8-byte slot the peer writes an incrementing counter
//! into with one-sided RDMA WRITEs. A sender timer bumps and posts; a
//! watcher timer compares successive reads of the local slot. Application
//! quiescence is normal, so the watcher only trips after a run of misses,
//! with looser tolerance before the first increment is ever observed
//! (connection still warming up) and a one-second grace after a first miss.

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, tick, Sender};
use tracing::{debug, error, warn};

use crate::error::{Error, ErrorState, Result};
use crate::verbs::{AccessFlags, PostError, SharedVerbs, WriteRequest};
use crate::wrid::{WrId, WrKind};

pub const KEEPALIVE_INTERVAL: Duration = Duration::from_millis(300);
const FIRST_MISS_GRACE: Duration = Duration::from_secs(1);
const MISS_LIMIT: u32 = 10;
const STARTUP_MISS_LIMIT: u32 = 100;

/// DMA target for the peer's liveness counter. Volatile reads only; the
/// device writes behind the compiler's back.
pub struct KeepaliveSlot(UnsafeCell<u64>);

unsafe impl Send for KeepaliveSlot {}
unsafe impl Sync for KeepaliveSlot {}

impl KeepaliveSlot {
    pub const SIZE: u64 = 8;

    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> Arc<Self> {
        Arc::new(KeepaliveSlot(UnsafeCell::new(0)))
    }

    pub fn read(&self) -> u64 {
        unsafe { ptr::read_volatile(self.0.get()) }
    }

    pub fn write(&self, value: u64) {
        unsafe { ptr::write_volatile(self.0.get(), value) }
    }

    pub fn addr(&self) -> u64 {
        self.0.get() as u64
    }
}

#[derive(Clone, Debug)]
pub struct KeepaliveConfig {
    pub interval: Duration,
    pub miss_limit: u32,
    pub startup_miss_limit: u32,
    pub first_miss_grace: Duration,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        KeepaliveConfig {
            interval: KEEPALIVE_INTERVAL,
            miss_limit: MISS_LIMIT,
            startup_miss_limit: STARTUP_MISS_LIMIT,
            first_miss_grace: FIRST_MISS_GRACE,
        }
    }
}

pub struct Keepalive {
    verbs: SharedVerbs,
    err: ErrorState,
    /// Peer writes here; the watcher reads it.
    local_slot: Arc<KeepaliveSlot>,
    peer_rkey: u32,
    peer_addr: u64,
    cfg: KeepaliveConfig,
}

pub struct KeepaliveHandle {
    stop_tx: Sender<()>,
    threads: Vec<JoinHandle<()>>,
}

impl KeepaliveHandle {
    pub fn stop(mut self) {
        drop(self.stop_tx);
        for t in self.threads.drain(..) {
            let _ = t.join();
        }
    }
}

impl Keepalive {
    pub fn new(
        verbs: SharedVerbs,
        err: ErrorState,
        local_slot: Arc<KeepaliveSlot>,
        peer_rkey: u32,
        peer_addr: u64,
        cfg: KeepaliveConfig,
    ) -> Self {
        Keepalive {
            verbs,
            err,
            local_slot,
            peer_rkey,
            peer_addr,
            cfg,
        }
    }

    /// Start the sender and watcher timers on their own threads. Both stop
    /// when the handle is dropped or a fatal miss run trips the watcher.
    pub fn spawn(self) -> Result<KeepaliveHandle> {
        let (stop_tx, stop_rx) = bounded::<()>(0);

        // counter source the device reads from when posting
        let source = KeepaliveSlot::new();
        let source_mr = self
            .verbs
            .lock()
            .unwrap()
            .register(source.addr(), KeepaliveSlot::SIZE, AccessFlags::empty())?;

        let sender = {
            let verbs = self.verbs.clone();
            let err = self.err.clone();
            let cfg = self.cfg.clone();
            let stop = stop_rx.clone();
            let peer_rkey = self.peer_rkey;
            let peer_addr = self.peer_addr;
            thread::Builder::new()
                .name("rdma keepalive tx".to_string())
                .spawn(move || {
                    let ticker = tick(cfg.interval);
                    let mut counter: u64 = 0;
                    loop {
                        crossbeam_channel::select! {
                            recv(stop) -> _ => return,
                            recv(ticker) -> _ => {}
                        }
                        if err.is_set() {
                            return;
                        }

                        counter += 1;
                        source.write(counter);
                        let wr = WriteRequest {
                            wr_id: WrId::new(WrKind::Keepalive, 0, 0).encode(),
                            local_addr: source.addr(),
                            len: KeepaliveSlot::SIZE as u32,
                            lkey: source_mr.lkey,
                            remote_addr: peer_addr,
                            rkey: peer_rkey,
                            signaled: true,
                        };
                        match verbs.lock().unwrap().post_write(&wr) {
                            Ok(()) => {}
                            Err(PostError::QueueFull) => {
                                // back off one interval; the counter value
                                // goes out on the next tick instead
                                debug!("keepalive send queue full, backing off");
                                counter -= 1;
                            }
                            Err(PostError::Other(e)) => {
                                warn!(error = %e, "keepalive post failed");
                                err.set(&Error::Verbs(e));
                                return;
                            }
                        }
                    }
                })
                .expect("failed to spawn thread")
        };

        let watcher = {
            let verbs = self.verbs.clone();
            let err = self.err.clone();
            let cfg = self.cfg.clone();
            let slot = self.local_slot.clone();
            thread::Builder::new()
                .name("rdma keepalive watch".to_string())
                .spawn(move || {
                    let ticker = tick(cfg.interval);
                    let mut last: u64 = slot.read();
                    let mut misses: u32 = 0;
                    let mut started = false;
                    loop {
                        crossbeam_channel::select! {
                            recv(stop_rx) -> _ => return,
                            recv(ticker) -> _ => {}
                        }
                        if err.is_set() {
                            return;
                        }

                        let current = slot.read();
                        if current != last {
                            last = current;
                            misses = 0;
                            started = true;
                            continue;
                        }

                        misses += 1;
                        if misses == 1 {
                            // one quiet interval could be scheduling jitter
                            thread::sleep(cfg.first_miss_grace);
                            continue;
                        }

                        let limit = if started {
                            cfg.miss_limit
                        } else {
                            cfg.startup_miss_limit
                        };
                        if misses > limit {
                            error!(misses, started, "keepalive expired, failing the connection");
                            err.set(&Error::NetworkUnreachable);
                            if let Err(e) = verbs.lock().unwrap().qp_to_error() {
                                warn!(error = %e, "failed to move qp to error");
                            }
                            return;
                        }
                    }
                })
                .expect("failed to spawn thread")
        };

        Ok(KeepaliveHandle {
            stop_tx,
            threads: vec![sender, watcher],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FabricProbe, MockFabric, MockVerbs};
    use crate::verbs::VerbsBackend;

    fn fast_cfg() -> KeepaliveConfig {
        KeepaliveConfig {
            interval: Duration::from_millis(2),
            miss_limit: 5,
            startup_miss_limit: 50,
            first_miss_grace: Duration::from_millis(4),
        }
    }

    /// One side's verbs plus a registered slot on the peer to write into.
    /// The returned peer backend is a keep-alive guard for the fabric.
    fn rig() -> (SharedVerbs, Arc<KeepaliveSlot>, u32, FabricProbe, MockVerbs) {
        let (a, mut b) = MockFabric::pair();
        let probe = a.probe();
        let peer_slot = KeepaliveSlot::new();
        let mr = b
            .register(
                peer_slot.addr(),
                KeepaliveSlot::SIZE,
                AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_WRITE,
            )
            .unwrap();
        let verbs: SharedVerbs = Arc::new(std::sync::Mutex::new(
            Box::new(a) as Box<dyn VerbsBackend>
        ));
        (verbs, peer_slot, mr.rkey, probe, b)
    }

    #[test]
    fn counter_flows_to_peer_slot() {
        let (verbs, peer_slot, peer_rkey, _probe, _peer) = rig();
        let err = ErrorState::default();

        let ka = Keepalive::new(
            verbs,
            err.clone(),
            KeepaliveSlot::new(),
            peer_rkey,
            peer_slot.addr(),
            fast_cfg(),
        );
        let handle = ka.spawn().unwrap();

        thread::sleep(Duration::from_millis(30));
        assert!(peer_slot.read() > 0, "peer slot never written");
        handle.stop();
    }

    #[test]
    fn quiet_peer_trips_watcher_after_startup() {
        let (verbs, peer_slot, peer_rkey, probe, _peer) = rig();
        let err = ErrorState::default();
        let slot = KeepaliveSlot::new();

        let handle = Keepalive::new(
            verbs,
            err.clone(),
            slot.clone(),
            peer_rkey,
            peer_slot.addr(),
            fast_cfg(),
        )
        .spawn()
        .unwrap();

        // simulate a live peer for a while, then silence
        for i in 1..=5u64 {
            slot.write(i);
            thread::sleep(Duration::from_millis(4));
        }
        // silence long enough to burn the grace window and the 5-miss limit
        thread::sleep(Duration::from_millis(150));
        assert!(matches!(err.check(), Err(Error::NetworkUnreachable)));
        assert!(probe.qp_in_error(0), "queue pair not forced to error");
        handle.stop();
    }

    #[test]
    fn brief_outage_within_window_is_tolerated() {
        let (verbs, peer_slot, peer_rkey, _probe, _peer) = rig();
        let err = ErrorState::default();
        let slot = KeepaliveSlot::new();

        let handle = Keepalive::new(
            verbs,
            err.clone(),
            slot.clone(),
            peer_rkey,
            peer_slot.addr(),
            fast_cfg(),
        )
        .spawn()
        .unwrap();

        // establish liveness
        for i in 1..=3u64 {
            slot.write(i);
            thread::sleep(Duration::from_millis(4));
        }
        // short gap, then recover before the limit
        thread::sleep(Duration::from_millis(8));
        for i in 10..=20u64 {
            slot.write(i);
            thread::sleep(Duration::from_millis(4));
        }
        assert!(err.check().is_ok(), "watcher tripped during a brief outage");
        handle.stop();
    }
}
