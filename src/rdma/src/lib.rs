//! Zero-copy page transfer engine for live VM replication.
//!
//! A reliable-connected queue pair streams guest RAM to the standby with
//! one-sided RDMA WRITEs, registration either up-front (`pin_all`) or per
//! 1 MiB chunk on first touch. An out-of-band SEND/RECV control channel
//! carries registration traffic, block tables, fill commands and the
//! checkpoint byte stream; a keepalive counter gives liveness independent
//! of all of it.

pub mod caps;
pub mod conn;
pub mod control;
pub mod engine;
pub mod error;
pub mod exchange;
pub mod keepalive;
pub mod registry;
pub mod stream;
pub mod verbs;
pub mod wrid;

#[cfg(test)]
pub(crate) mod testutil;

pub use caps::{CapFlags, CapabilityRecord};
pub use conn::RdmaConnection;
pub use engine::{EngineConfig, RdmaEngine, Role};
pub use error::{Error, ErrorState, Result};
pub use exchange::PeerEvent;
pub use keepalive::{Keepalive, KeepaliveConfig, KeepaliveHandle, KeepaliveSlot};
pub use stream::RdmaStream;
pub use verbs::{VerbsBackend, WaitStrategy};

/// Unit of dynamic pinning and transit tracking.
pub const CHUNK_SIZE: u64 = 1 << 20;
/// Largest contiguous range folded into a single WRITE.
pub const MERGE_MAX: u64 = 2 << 20;
/// Send-queue depth: one slot per page of a maximally merged range.
pub const SEND_MAX: u32 = (MERGE_MAX / 4096) as u32;
