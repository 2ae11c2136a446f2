//! In-process fabric double: two connected `VerbsBackend`s that move real
//! bytes between real buffers, so the engine and protocol paths run
//! end-to-end in tests without hardware.

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use crate::caps::CapFlags;
use crate::conn::RdmaConnection;
use crate::engine::{EngineConfig, RdmaEngine, Role};
use crate::error::{Error, Result};
use crate::verbs::{
    AccessFlags, LinkLayer, MemoryRegion, MrHandle, PostError, QpCaps, RouteCandidate,
    VerbsBackend, WaitStrategy, WcStatus, WorkCompletion,
};
use vmshim::RamBlockDesc;

#[derive(Default)]
struct SideState {
    pending_recvs: VecDeque<(u64, u64, u32)>,
    inbox: VecDeque<Vec<u8>>,
    cq: VecDeque<WorkCompletion>,
    registrations: HashMap<MrHandle, (u64, u64)>,
    rkeys: Vec<u32>,
    closed: bool,
    qp_error: bool,
    writes_posted: u64,
    fail_writes_queue_full: u32,
    cq_depth: Option<u32>,
    qp_caps: Option<QpCaps>,
}

#[derive(Default)]
struct FabricState {
    sides: [SideState; 2],
    next_handle: MrHandle,
    next_key: u32,
    connect_req: Option<Vec<u8>>,
    connect_resp: Option<Vec<u8>>,
}

#[derive(Default)]
pub(crate) struct MockFabric {
    state: Mutex<FabricState>,
    cond: Condvar,
}

impl MockFabric {
    pub(crate) fn pair() -> (MockVerbs, MockVerbs) {
        let fabric = Arc::new(MockFabric::default());
        (
            MockVerbs {
                fabric: fabric.clone(),
                side: 0,
            },
            MockVerbs { fabric, side: 1 },
        )
    }
}

/// Inspection handle that stays usable after the backends are boxed away.
#[derive(Clone)]
pub(crate) struct FabricProbe {
    fabric: Arc<MockFabric>,
}

impl FabricProbe {
    pub(crate) fn writes_posted(&self, side: usize) -> u64 {
        self.fabric.state.lock().unwrap().sides[side].writes_posted
    }

    pub(crate) fn fail_next_writes(&self, side: usize, count: u32) {
        self.fabric.state.lock().unwrap().sides[side].fail_writes_queue_full = count;
    }

    pub(crate) fn qp_in_error(&self, side: usize) -> bool {
        self.fabric.state.lock().unwrap().sides[side].qp_error
    }

    pub(crate) fn cq_depth(&self, side: usize) -> Option<u32> {
        self.fabric.state.lock().unwrap().sides[side].cq_depth
    }

    pub(crate) fn qp_caps(&self, side: usize) -> Option<QpCaps> {
        self.fabric.state.lock().unwrap().sides[side].qp_caps
    }
}

pub(crate) struct MockVerbs {
    fabric: Arc<MockFabric>,
    side: usize,
}

impl MockVerbs {
    fn peer(side: usize) -> usize {
        1 - side
    }

    pub(crate) fn probe(&self) -> FabricProbe {
        FabricProbe {
            fabric: self.fabric.clone(),
        }
    }

    fn deliver_locked(state: &mut FabricState, side: usize, message: Vec<u8>) {
        let sidestate = &mut state.sides[side];
        if let Some((wr_id, addr, len)) = sidestate.pending_recvs.pop_front() {
            let n = message.len().min(len as usize);
            unsafe {
                std::ptr::copy_nonoverlapping(message.as_ptr(), addr as *mut u8, n);
            }
            sidestate.cq.push_back(WorkCompletion {
                wr_id,
                status: WcStatus::Success,
                byte_len: n as u32,
            });
        } else {
            sidestate.inbox.push_back(message);
        }
    }
}

impl VerbsBackend for MockVerbs {
    fn resolve(&mut self, _host: &str, _port: u16) -> Result<Vec<RouteCandidate>> {
        Ok(vec![RouteCandidate {
            addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            link: LinkLayer::Infiniband,
        }])
    }

    fn bind_route(&mut self, _candidate: &RouteCandidate) -> Result<()> {
        Ok(())
    }

    fn alloc_pd(&mut self) -> Result<()> {
        Ok(())
    }

    fn create_cq(&mut self, depth: u32) -> Result<()> {
        self.fabric.state.lock().unwrap().sides[self.side].cq_depth = Some(depth);
        Ok(())
    }

    fn create_qp(&mut self, caps: QpCaps) -> Result<()> {
        self.fabric.state.lock().unwrap().sides[self.side].qp_caps = Some(caps);
        Ok(())
    }

    fn connect(&mut self, private: &[u8]) -> Result<Vec<u8>> {
        let mut state = self.fabric.state.lock().unwrap();
        state.connect_req = Some(private.to_vec());
        self.fabric.cond.notify_all();
        loop {
            if let Some(resp) = state.connect_resp.take() {
                return Ok(resp);
            }
            state = self.fabric.cond.wait(state).unwrap();
        }
    }

    fn listen(&mut self, _bind: &str, _port: u16) -> Result<()> {
        Ok(())
    }

    fn await_connect(&mut self) -> Result<Vec<u8>> {
        let mut state = self.fabric.state.lock().unwrap();
        loop {
            if let Some(req) = state.connect_req.take() {
                return Ok(req);
            }
            state = self.fabric.cond.wait(state).unwrap();
        }
    }

    fn accept(&mut self, private: &[u8]) -> Result<()> {
        let mut state = self.fabric.state.lock().unwrap();
        state.connect_resp = Some(private.to_vec());
        self.fabric.cond.notify_all();
        Ok(())
    }

    fn register(&mut self, addr: u64, len: u64, _access: AccessFlags) -> Result<MemoryRegion> {
        let mut state = self.fabric.state.lock().unwrap();
        state.next_handle += 1;
        state.next_key += 1;
        let (handle, key) = (state.next_handle, state.next_key);
        let side = &mut state.sides[self.side];
        side.registrations.insert(handle, (addr, len));
        side.rkeys.push(key);
        Ok(MemoryRegion {
            handle,
            lkey: key,
            rkey: key,
        })
    }

    fn deregister(&mut self, handle: MrHandle) -> Result<()> {
        let mut state = self.fabric.state.lock().unwrap();
        state.sides[self.side]
            .registrations
            .remove(&handle)
            .map(|_| ())
            .ok_or_else(|| Error::Verbs("unknown mr handle".to_string()))
    }

    fn post_recv(&mut self, wr_id: u64, addr: u64, len: u32, _lkey: u32) -> Result<()> {
        let mut state = self.fabric.state.lock().unwrap();
        state.sides[self.side]
            .pending_recvs
            .push_back((wr_id, addr, len));
        if let Some(message) = state.sides[self.side].inbox.pop_front() {
            MockVerbs::deliver_locked(&mut state, self.side, message);
        }
        self.fabric.cond.notify_all();
        Ok(())
    }

    fn post_send(&mut self, wr_id: u64, addr: u64, len: u32, _lkey: u32) -> Result<()> {
        let message =
            unsafe { std::slice::from_raw_parts(addr as *const u8, len as usize) }.to_vec();
        let mut state = self.fabric.state.lock().unwrap();
        let peer = MockVerbs::peer(self.side);
        if state.sides[peer].closed {
            return Err(Error::Verbs("peer disconnected".to_string()));
        }
        MockVerbs::deliver_locked(&mut state, peer, message);
        state.sides[self.side].cq.push_back(WorkCompletion {
            wr_id,
            status: WcStatus::Success,
            byte_len: len,
        });
        self.fabric.cond.notify_all();
        Ok(())
    }

    fn post_write(&mut self, wr: &crate::verbs::WriteRequest) -> std::result::Result<(), PostError> {
        let mut state = self.fabric.state.lock().unwrap();
        if state.sides[self.side].fail_writes_queue_full > 0 {
            state.sides[self.side].fail_writes_queue_full -= 1;
            return Err(PostError::QueueFull);
        }
        if state.sides[self.side].qp_error {
            return Err(PostError::Other("qp in error state".to_string()));
        }
        let known_key = state
            .sides
            .iter()
            .any(|side| side.rkeys.contains(&wr.rkey));
        if !known_key {
            return Err(PostError::Other(format!("bad rkey {:#x}", wr.rkey)));
        }
        unsafe {
            std::ptr::copy_nonoverlapping(
                wr.local_addr as *const u8,
                wr.remote_addr as *mut u8,
                wr.len as usize,
            );
        }
        let side = &mut state.sides[self.side];
        side.writes_posted += 1;
        if wr.signaled {
            side.cq.push_back(WorkCompletion {
                wr_id: wr.wr_id,
                status: WcStatus::Success,
                byte_len: wr.len,
            });
        }
        self.fabric.cond.notify_all();
        Ok(())
    }

    fn poll_cq(&mut self) -> Result<Option<WorkCompletion>> {
        Ok(self.fabric.state.lock().unwrap().sides[self.side]
            .cq
            .pop_front())
    }

    fn wait_comp_channel(&mut self) -> Result<()> {
        let mut state = self.fabric.state.lock().unwrap();
        loop {
            if !state.sides[self.side].cq.is_empty() {
                return Ok(());
            }
            let peer = MockVerbs::peer(self.side);
            if state.sides[peer].closed || state.sides[self.side].closed {
                return Err(Error::Verbs("peer disconnected".to_string()));
            }
            state = self.fabric.cond.wait(state).unwrap();
        }
    }

    fn ack_comp_channel(&mut self) -> Result<()> {
        Ok(())
    }

    fn comp_channel_fd(&self) -> Option<std::os::fd::RawFd> {
        None
    }

    fn qp_to_error(&mut self) -> Result<()> {
        self.fabric.state.lock().unwrap().sides[self.side].qp_error = true;
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        let mut state = self.fabric.state.lock().unwrap();
        state.sides[self.side].closed = true;
        self.fabric.cond.notify_all();
        Ok(())
    }
}

impl Drop for MockVerbs {
    fn drop(&mut self) {
        let _ = self.disconnect();
    }
}

/// Heap buffer standing in for a guest mapping.
pub(crate) struct GuestRam {
    mem: Vec<u8>,
}

impl GuestRam {
    pub(crate) fn desc(&self, offset: u64) -> RamBlockDesc {
        RamBlockDesc {
            host_addr: self.mem.as_ptr() as u64,
            offset,
            len: self.mem.len() as u64,
        }
    }

    pub(crate) fn fill_pattern(&mut self) {
        for (i, b) in self.mem.iter_mut().enumerate() {
            *b = (i % 251) as u8 + 1;
        }
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        &self.mem
    }
}

pub(crate) fn guest_ram(len: usize) -> GuestRam {
    GuestRam { mem: vec![0; len] }
}

/// Bring up a negotiated source/dest engine pair over a mock fabric.
pub(crate) fn connected_engines(caps: CapFlags, cfg: EngineConfig) -> (RdmaEngine, RdmaEngine) {
    let (src, dst, _) = connected_engines_probed(caps, cfg);
    (src, dst)
}

pub(crate) fn connected_engines_probed(
    caps: CapFlags,
    cfg: EngineConfig,
) -> (RdmaEngine, RdmaEngine, FabricProbe) {
    let (a, b) = MockFabric::pair();
    let probe = a.probe();
    let known = caps;
    let acceptor = thread::spawn(move || {
        RdmaConnection::accept(Box::new(b), "0.0.0.0", 4444, known, WaitStrategy::Block).unwrap()
    });
    let src_conn =
        RdmaConnection::connect(Box::new(a), "standby", 4444, caps, WaitStrategy::Block).unwrap();
    let dst_conn = acceptor.join().unwrap();

    let src = RdmaEngine::new(src_conn, Role::Source, cfg.clone()).unwrap();
    let dst = RdmaEngine::new(dst_conn, Role::Dest, cfg).unwrap();
    (src, dst, probe)
}
