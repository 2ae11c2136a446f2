//! Seam to the host RDMA stack (connection manager + verbs).
//!
//! Everything that talks to real hardware sits behind [`VerbsBackend`] so
//! the connection logic, registration discipline and completion handling
//! stay testable. The backend is deliberately dumb: it resolves, creates
//! resources with the exact sizes it is told, posts what it is given and
//! reports completions; all policy lives in the callers.

use std::net::IpAddr;
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex};

use bitflags::bitflags;

use crate::error::Result;

/// Link layer reported for a resolved route. RoCE fabrics report Ethernet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkLayer {
    Ethernet,
    Infiniband,
}

#[derive(Debug, Clone)]
pub struct RouteCandidate {
    pub addr: IpAddr,
    pub link: LinkLayer,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessFlags: u32 {
        const LOCAL_WRITE = 1 << 0;
        const REMOTE_WRITE = 1 << 1;
        const REMOTE_READ = 1 << 2;
    }
}

pub type MrHandle = u64;

/// A pinned memory range. `lkey` authorizes local access by the device,
/// `rkey` is what the peer presents in one-sided operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub handle: MrHandle,
    pub lkey: u32,
    pub rkey: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct QpCaps {
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
    pub max_send_sge: u32,
    pub max_recv_sge: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct WriteRequest {
    pub wr_id: u64,
    pub local_addr: u64,
    pub len: u32,
    pub lkey: u32,
    pub remote_addr: u64,
    pub rkey: u32,
    pub signaled: bool,
}

/// Post failure split out so callers can do the bounded wait-and-retry on a
/// full send queue without string matching.
#[derive(thiserror::Error, Debug, Clone)]
pub enum PostError {
    #[error("send queue is full")]
    QueueFull,
    #[error("verbs post failure: {0}")]
    Other(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcStatus {
    Success,
    Failure(u32),
}

#[derive(Debug, Clone, Copy)]
pub struct WorkCompletion {
    pub wr_id: u64,
    pub status: WcStatus,
    pub byte_len: u32,
}

/// How a caller parks while waiting for completion-channel activity.
///
/// `Block` hands the wait to the backend (single-threaded users).
/// `PollFd` polls the completion-channel fd without holding the backend
/// lock, so the keepalive timers can post while the worker waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStrategy {
    Block,
    PollFd,
}

pub trait VerbsBackend: Send {
    fn resolve(&mut self, host: &str, port: u16) -> Result<Vec<RouteCandidate>>;
    fn bind_route(&mut self, candidate: &RouteCandidate) -> Result<()>;

    fn alloc_pd(&mut self) -> Result<()>;
    fn create_cq(&mut self, depth: u32) -> Result<()>;
    fn create_qp(&mut self, caps: QpCaps) -> Result<()>;

    /// Initiator handshake; returns the responder's private data.
    fn connect(&mut self, private: &[u8]) -> Result<Vec<u8>>;

    fn listen(&mut self, bind: &str, port: u16) -> Result<()>;
    /// Responder: block for an incoming request, returning its private data.
    fn await_connect(&mut self) -> Result<Vec<u8>>;
    /// Responder: complete the handshake, sending our private data back.
    fn accept(&mut self, private: &[u8]) -> Result<()>;

    fn register(&mut self, addr: u64, len: u64, access: AccessFlags) -> Result<MemoryRegion>;
    fn deregister(&mut self, handle: MrHandle) -> Result<()>;

    fn post_recv(&mut self, wr_id: u64, addr: u64, len: u32, lkey: u32) -> Result<()>;
    fn post_send(&mut self, wr_id: u64, addr: u64, len: u32, lkey: u32) -> Result<()>;
    fn post_write(&mut self, wr: &WriteRequest) -> std::result::Result<(), PostError>;

    fn poll_cq(&mut self) -> Result<Option<WorkCompletion>>;
    /// Blocking wait on the completion channel, event acknowledged.
    fn wait_comp_channel(&mut self) -> Result<()>;
    /// Non-blocking acknowledge after the channel fd polled readable.
    fn ack_comp_channel(&mut self) -> Result<()>;
    fn comp_channel_fd(&self) -> Option<RawFd>;

    /// Force the queue pair into the error state (liveness expiry).
    fn qp_to_error(&mut self) -> Result<()>;
    fn disconnect(&mut self) -> Result<()>;
}

pub type SharedVerbs = Arc<Mutex<Box<dyn VerbsBackend>>>;
