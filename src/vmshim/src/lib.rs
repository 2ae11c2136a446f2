//! Hypervisor-facing seam consumed by the checkpoint and transport crates.
//!
//! The hypervisor owns the guest lifecycle behind a big I/O mutex; callers
//! hold `VmHandle`'s mutex across stop/save/resume so that holding the lock
//! *is* holding the I/O thread.

use std::io::{Read, Write};
use std::sync::{Arc, Mutex};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("cannot stop the guest")]
    Stop,
    #[error("cannot resume the guest")]
    Start,
    #[error("guest state stream error: {0}")]
    StateStream(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A guest NIC as enumerated by the hypervisor. `peer_name` is the host-side
/// peer device (the tap end of a veth/tap pair), absent for NICs without one.
#[derive(Clone, Debug)]
pub struct NicInfo {
    pub name: String,
    pub peer_name: Option<String>,
}

/// One guest RAM block: host mapping address, guest-space offset, length.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RamBlockDesc {
    pub host_addr: u64,
    pub offset: u64,
    pub len: u64,
}

/// Control surface the hypervisor exposes to the replication core.
///
/// `save_state_*` serialize the complete machine state into the writer;
/// `load_state` replays such a stream on the standby side.
pub trait GuestControl: Send {
    fn stop(&mut self) -> Result<()>;
    fn start(&mut self) -> Result<()>;

    fn save_state_begin(&mut self, w: &mut dyn Write) -> Result<()>;
    fn save_state_complete(&mut self, w: &mut dyn Write) -> Result<()>;
    fn load_state(&mut self, r: &mut dyn Read) -> Result<()>;

    fn nics(&self) -> Vec<NicInfo>;
    fn ram_blocks(&self) -> Vec<RamBlockDesc>;

    /// Monotonic milliseconds, used for downtime accounting.
    fn clock_ms(&self) -> u64;
}

pub type VmHandle = Arc<Mutex<dyn GuestControl>>;
