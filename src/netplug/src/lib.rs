//! Guest network output buffering between checkpoint commits.
//!
//! Packets the guest emits after a checkpoint is taken must stay invisible
//! until that checkpoint is acknowledged by the standby. The kernel's plug
//! qdisc does the holding; this crate picks the device, owns the qdisc's
//! lifecycle, and sequences the barrier/release calls.
//!
//! Failure policy: a broken setup refuses to enable, but a runtime failure
//! downgrades buffering to off with a warning and lets checkpointing carry
//! on without the output-consistency guarantee.

use std::io;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use vmshim::NicInfo;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("no guest NIC has a peer device with prefix {0:?}")]
    NoPeerDevice(String),
    #[error("traffic shaper operation failed: {0}")]
    Shaper(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Kernel traffic-shaping facility, single NIC. `create_plug` installs a
/// plug qdisc at the root of `dev` with the given byte limit; the barrier
/// calls map 1:1 onto the qdisc's buffer/release-one/release-indefinite
/// commands.
pub trait ShaperBackend: Send {
    fn create_plug(&mut self, dev: &str, limit_bytes: u32) -> io::Result<()>;
    fn insert_barrier(&mut self, dev: &str) -> io::Result<()>;
    fn release_one(&mut self, dev: &str) -> io::Result<()>;
    fn release_indefinite(&mut self, dev: &str) -> io::Result<()>;
    fn destroy(&mut self, dev: &str) -> io::Result<()>;
    fn buffer_usage(&mut self, dev: &str) -> io::Result<u64>;
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Host peer-device prefix identifying the guest NIC to shape.
    pub peer_prefix: String,
    /// Prefix substituted to derive the intermediate buffer device.
    pub device_prefix: String,
    /// Qdisc byte limit.
    pub limit_bytes: u32,
}

impl Default for BufferConfig {
    fn default() -> Self {
        BufferConfig {
            peer_prefix: "tap".to_string(),
            device_prefix: "ifb".to_string(),
            limit_bytes: 125_000_000,
        }
    }
}

/// Owns one plug qdisc on one buffer device.
pub struct TrafficBuffer {
    backend: Box<dyn ShaperBackend>,
    dev: String,
    enabled: bool,
}

impl std::fmt::Debug for TrafficBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrafficBuffer")
            .field("dev", &self.dev)
            .field("enabled", &self.enabled)
            .finish()
    }
}

impl TrafficBuffer {
    /// Scan `nics` for the first with a peer device matching the configured
    /// prefix, derive the buffer device name, install the plug qdisc and
    /// leave it in the pass-through (released) state.
    pub fn enable(
        nics: &[NicInfo],
        mut backend: Box<dyn ShaperBackend>,
        cfg: &BufferConfig,
    ) -> Result<Self> {
        let peer = nics
            .iter()
            .filter_map(|nic| nic.peer_name.as_deref())
            .find(|peer| peer.starts_with(cfg.peer_prefix.as_str()))
            .ok_or_else(|| Error::NoPeerDevice(cfg.peer_prefix.clone()))?;

        let dev = format!("{}{}", cfg.device_prefix, &peer[cfg.peer_prefix.len()..]);
        debug!(%peer, %dev, "installing plug qdisc");

        backend.create_plug(&dev, cfg.limit_bytes).map_err(Error::Shaper)?;
        // pass traffic through until the first barrier is cut
        if let Err(e) = backend.release_indefinite(&dev) {
            let _ = backend.destroy(&dev);
            return Err(Error::Shaper(e));
        }

        Ok(TrafficBuffer {
            backend,
            dev,
            enabled: true,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn device(&self) -> &str {
        &self.dev
    }

    /// Cut a barrier: packets enqueued after this point are held until the
    /// barrier is released.
    pub fn insert_barrier(&mut self) {
        self.runtime_op("insert barrier", |b, dev| b.insert_barrier(dev));
    }

    /// Release packets up to the oldest barrier, making exactly one
    /// checkpoint interval's output externally visible.
    pub fn release_one(&mut self) {
        self.runtime_op("release one", |b, dev| b.release_one(dev));
    }

    /// Drain everything held, without tearing the qdisc down.
    pub fn release_indefinite(&mut self) {
        self.runtime_op("release indefinite", |b, dev| b.release_indefinite(dev));
    }

    /// Bytes currently held behind barriers, 0 when buffering is off.
    pub fn usage(&mut self) -> u64 {
        if !self.enabled {
            return 0;
        }
        match self.backend.buffer_usage(&self.dev) {
            Ok(n) => n,
            Err(e) => {
                self.downgrade("buffer usage", &e);
                0
            }
        }
    }

    /// Drain and tear down. Safe to call twice.
    pub fn disable(&mut self) {
        if !self.enabled {
            return;
        }
        self.enabled = false;
        if let Err(e) = self.backend.release_indefinite(&self.dev) {
            warn!(dev = %self.dev, error = %e, "failed to drain plug qdisc on disable");
        }
        if let Err(e) = self.backend.destroy(&self.dev) {
            warn!(dev = %self.dev, error = %e, "failed to remove plug qdisc");
        }
    }

    fn runtime_op(
        &mut self,
        what: &str,
        op: impl FnOnce(&mut dyn ShaperBackend, &str) -> io::Result<()>,
    ) {
        if !self.enabled {
            return;
        }
        if let Err(e) = op(&mut *self.backend, &self.dev) {
            self.downgrade(what, &e);
        }
    }

    fn downgrade(&mut self, what: &str, e: &io::Error) {
        warn!(
            dev = %self.dev,
            error = %e,
            "{what} failed; network buffering is now OFF and released \
             output is no longer covered by replicated state"
        );
        self.enabled = false;
        let _ = self.backend.release_indefinite(&self.dev);
        let _ = self.backend.destroy(&self.dev);
    }
}

impl Drop for TrafficBuffer {
    fn drop(&mut self) {
        self.disable();
    }
}
