//! Connection establishment: route selection, queue-pair bring-up and
//! capability negotiation over the connection-manager private data.

use std::os::fd::RawFd;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::caps::{negotiate, CapFlags, CapabilityRecord};
use crate::error::{Error, ErrorState, Result};
use crate::keepalive::KeepaliveSlot;
use crate::verbs::{
    AccessFlags, LinkLayer, MemoryRegion, QpCaps, RouteCandidate, SharedVerbs, VerbsBackend,
    WaitStrategy,
};
use crate::SEND_MAX;

/// One reliable-connected endpoint with its negotiated capabilities and,
/// when granted, the keepalive slots of both sides.
pub struct RdmaConnection {
    pub(crate) verbs: SharedVerbs,
    pub(crate) caps: CapFlags,
    pub(crate) wait: WaitStrategy,
    pub(crate) comp_fd: Option<RawFd>,
    pub(crate) err: ErrorState,
    pub(crate) send_max: u32,

    /// Our slot: the peer's liveness counter lands here.
    pub(crate) keepalive_slot: Option<Arc<KeepaliveSlot>>,
    pub(crate) keepalive_mr: Option<MemoryRegion>,
    /// Where we write our liveness counter on the peer.
    pub(crate) peer_keepalive_rkey: u32,
    pub(crate) peer_keepalive_addr: u64,
}

fn order_candidates(candidates: Vec<RouteCandidate>) -> Vec<RouteCandidate> {
    // Prefer IPv4. On a pure RoCE fabric only IPv6 resolution is safe, so
    // restrict to it there.
    let pure_roce = !candidates.is_empty()
        && candidates.iter().all(|c| c.link == LinkLayer::Ethernet);
    if pure_roce {
        candidates.into_iter().filter(|c| c.addr.is_ipv6()).collect()
    } else {
        let (v4, v6): (Vec<_>, Vec<_>) =
            candidates.into_iter().partition(|c| c.addr.is_ipv4());
        v4.into_iter().chain(v6).collect()
    }
}

fn setup_queues(verbs: &mut dyn VerbsBackend, send_max: u32) -> Result<()> {
    verbs.alloc_pd()?;
    verbs.create_cq(3 * send_max)?;
    verbs.create_qp(QpCaps {
        max_send_wr: send_max,
        max_recv_wr: 3,
        max_send_sge: 1,
        max_recv_sge: 1,
    })
}

fn make_keepalive_slot(
    verbs: &mut dyn VerbsBackend,
    wanted: CapFlags,
) -> Result<(Option<Arc<KeepaliveSlot>>, Option<MemoryRegion>, u32, u64)> {
    if !wanted.contains(CapFlags::KEEPALIVE) {
        return Ok((None, None, 0, 0));
    }
    let slot = KeepaliveSlot::new();
    let mr = verbs.register(
        slot.addr(),
        KeepaliveSlot::SIZE,
        AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_WRITE,
    )?;
    let rkey = mr.rkey;
    let addr = slot.addr();
    Ok((Some(slot), Some(mr), rkey, addr))
}

impl RdmaConnection {
    /// Initiator side: resolve, bring up PD/CQ/QP, connect with our
    /// capability record and intersect the grant the responder returns.
    pub fn connect(
        mut backend: Box<dyn VerbsBackend>,
        host: &str,
        port: u16,
        requested: CapFlags,
        wait: WaitStrategy,
    ) -> Result<Self> {
        let candidates = order_candidates(backend.resolve(host, port)?);
        if candidates.is_empty() {
            return Err(Error::Resolve {
                host: host.to_string(),
                port,
            });
        }

        let mut bound = false;
        for candidate in &candidates {
            match backend.bind_route(candidate) {
                Ok(()) => {
                    debug!(addr = %candidate.addr, "route resolved");
                    bound = true;
                    break;
                }
                Err(e) => {
                    warn!(addr = %candidate.addr, error = %e, "route attempt failed")
                }
            }
        }
        if !bound {
            return Err(Error::NoRoute);
        }

        setup_queues(&mut *backend, SEND_MAX)?;

        let (slot, mr, rkey, addr) = make_keepalive_slot(&mut *backend, requested)?;
        let record = CapabilityRecord::new(requested, rkey, addr);
        let reply = backend.connect(&record.encode())?;
        let peer = CapabilityRecord::decode(&reply)?;

        // The responder already intersected with what it knows.
        let caps = requested & peer.flags;
        debug!(?caps, "capabilities negotiated");

        let comp_fd = backend.comp_channel_fd();
        Ok(RdmaConnection {
            verbs: Arc::new(Mutex::new(backend)),
            caps,
            wait,
            comp_fd,
            err: ErrorState::default(),
            send_max: SEND_MAX,
            keepalive_slot: slot,
            keepalive_mr: mr,
            peer_keepalive_rkey: peer.keepalive_rkey,
            peer_keepalive_addr: peer.keepalive_addr,
        })
    }

    /// Responder side: grant the intersection of what the initiator asked
    /// for with `known`, and hand back our keepalive slot.
    pub fn accept(
        mut backend: Box<dyn VerbsBackend>,
        bind: &str,
        port: u16,
        known: CapFlags,
        wait: WaitStrategy,
    ) -> Result<Self> {
        backend.listen(bind, port)?;
        let request = backend.await_connect()?;
        let peer = CapabilityRecord::decode(&request)?;
        let caps = negotiate(peer.flags, known);
        debug!(?caps, "capabilities negotiated");

        setup_queues(&mut *backend, SEND_MAX)?;

        let (slot, mr, rkey, addr) = make_keepalive_slot(&mut *backend, caps)?;
        let reply = CapabilityRecord::new(caps, rkey, addr);
        backend.accept(&reply.encode())?;

        let comp_fd = backend.comp_channel_fd();
        Ok(RdmaConnection {
            verbs: Arc::new(Mutex::new(backend)),
            caps,
            wait,
            comp_fd,
            err: ErrorState::default(),
            send_max: SEND_MAX,
            keepalive_slot: slot,
            keepalive_mr: mr,
            peer_keepalive_rkey: peer.keepalive_rkey,
            peer_keepalive_addr: peer.keepalive_addr,
        })
    }

    pub fn caps(&self) -> CapFlags {
        self.caps
    }

    pub fn pin_all(&self) -> bool {
        self.caps.contains(CapFlags::PIN_ALL)
    }

    pub fn error_state(&self) -> ErrorState {
        self.err.clone()
    }
}
