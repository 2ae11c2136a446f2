//! Elastic staging buffer for one checkpoint's serialized state.
//!
//! The buffer is a chain of fixed-size slabs. Appends grow the chain one
//! slab at a time; a strike counter shrinks it back after a sustained run of
//! ticks that never touched the tail, so a single large checkpoint does not
//! pin memory forever and an idle guest does not thrash the allocator.

use std::io::{self, Read, Write};

use tracing::debug;

/// Slab capacity. Checkpoints are typically much smaller; large ones chain.
pub const SLAB_SIZE: usize = 5 << 20;

struct Slab {
    buf: Box<[u8]>,
    /// Bytes filled by the writer.
    size: usize,
    /// Bytes consumed by the reader.
    read: usize,
}

impl Slab {
    fn new(capacity: usize) -> Self {
        Slab {
            buf: vec![0u8; capacity].into_boxed_slice(),
            size: 0,
            read: 0,
        }
    }
}

/// Owning arena of slabs with a single cursor shared by reads and writes.
///
/// Slab 0 is the head; it exists for the lifetime of the ring and is never
/// freed by the shrink policy.
pub struct SlabRing {
    slabs: Vec<Slab>,
    current: usize,
    slab_total: usize,
    slab_size: usize,
    strikes: u32,
    max_strikes: u32,
}

impl SlabRing {
    pub fn new(slab_size: usize, max_strikes: u32) -> Self {
        assert!(slab_size > 0);
        SlabRing {
            slabs: vec![Slab::new(slab_size)],
            current: 0,
            slab_total: 0,
            slab_size,
            strikes: 0,
            max_strikes,
        }
    }

    pub fn nb_slabs(&self) -> usize {
        self.slabs.len()
    }

    /// Total valid bytes across the ring.
    pub fn total_bytes(&self) -> usize {
        self.slab_total
    }

    pub fn strikes(&self) -> u32 {
        self.strikes
    }

    /// Append `bytes` across the chain, allocating tail slabs as needed.
    /// Never short-writes; returns `bytes.len()`.
    pub fn put(&mut self, bytes: &[u8]) -> usize {
        let mut src = bytes;
        while !src.is_empty() {
            if self.slabs[self.current].size == self.slab_size {
                if self.current + 1 == self.slabs.len() {
                    self.slabs.push(Slab::new(self.slab_size));
                }
                self.current += 1;
            }
            let slab = &mut self.slabs[self.current];
            let n = (self.slab_size - slab.size).min(src.len());
            slab.buf[slab.size..slab.size + n].copy_from_slice(&src[..n]);
            slab.size += n;
            self.slab_total += n;
            src = &src[n..];
        }
        bytes.len()
    }

    /// Read up to `out.len()` bytes from the current cursor, continuing
    /// across slab boundaries. Returns the count actually produced; stops
    /// early only at the end of the ring.
    pub fn get(&mut self, out: &mut [u8]) -> usize {
        let mut filled = 0;
        while filled < out.len() {
            let slab = &mut self.slabs[self.current];
            let avail = slab.size - slab.read;
            if avail == 0 {
                if self.current + 1 == self.slabs.len() {
                    break;
                }
                self.current += 1;
                continue;
            }
            let n = avail.min(out.len() - filled);
            out[filled..filled + n].copy_from_slice(&slab.buf[slab.read..slab.read + n]);
            slab.read += n;
            filled += n;
        }
        filled
    }

    /// Move the cursor back to the head without discarding staged bytes, so
    /// a freshly filled ring can be read from the start.
    pub fn rewind(&mut self) {
        self.current = 0;
        for slab in &mut self.slabs {
            slab.read = 0;
        }
    }

    /// Tick-start reset: apply the elastic shrink policy, then logically
    /// empty every slab and park the cursor at the head. Allocations are
    /// retained unless the policy frees tail slabs.
    pub fn reset_for_checkpoint(&mut self) {
        let nb = self.slabs.len();
        if nb >= 2 && self.slab_total <= (nb - 1) * self.slab_size {
            // the tail slab went unused this tick
            self.strikes += 1;
            if self.strikes >= self.max_strikes {
                let nb_free = ((nb - 1) / 2).max(1);
                self.slabs.truncate(nb - nb_free);
                debug!(
                    freed = nb_free,
                    remaining = self.slabs.len(),
                    "shrunk staging ring"
                );
                self.strikes = 0;
            }
        } else {
            self.strikes = 0;
        }

        self.current = 0;
        for slab in &mut self.slabs {
            slab.size = 0;
            slab.read = 0;
        }
        self.slab_total = 0;
    }
}

/// Byte-stream adapter over [`SlabRing`] for the hypervisor's save/load
/// calls. Mirrors the stream-file contract: writes are buffered appends,
/// reads consume, and a sticky error (set by the owner when the peer or the
/// hypervisor fails mid-stream) poisons subsequent use.
pub struct StagingFile {
    ring: SlabRing,
    error: Option<io::ErrorKind>,
}

impl StagingFile {
    pub fn new(ring: SlabRing) -> Self {
        StagingFile { ring, error: None }
    }

    pub fn ring(&self) -> &SlabRing {
        &self.ring
    }

    pub fn ring_mut(&mut self) -> &mut SlabRing {
        &mut self.ring
    }

    pub fn set_error(&mut self, kind: io::ErrorKind) {
        if self.error.is_none() {
            self.error = Some(kind);
        }
    }

    pub fn last_error(&self) -> Option<io::ErrorKind> {
        self.error
    }

    fn check(&self) -> io::Result<()> {
        match self.error {
            Some(kind) => Err(io::Error::from(kind)),
            None => Ok(()),
        }
    }
}

impl Write for StagingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.check()?;
        Ok(self.ring.put(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.check()
    }
}

impl Read for StagingFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.check()?;
        Ok(self.ring.get(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn round_trip_single_slab() {
        let mut ring = SlabRing::new(SLAB_SIZE, 100);
        let data = pattern(4096);
        assert_eq!(ring.put(&data), 4096);
        assert_eq!(ring.total_bytes(), 4096);

        ring.rewind();
        let mut out = vec![0u8; 4096];
        assert_eq!(ring.get(&mut out), 4096);
        assert_eq!(out, data);
    }

    #[test]
    fn round_trip_spans_slabs() {
        // 10 MiB forces at least two 5 MiB slabs
        let mut ring = SlabRing::new(SLAB_SIZE, 100);
        let data = pattern(10 << 20);
        ring.put(&data);
        assert!(ring.nb_slabs() >= 2);

        ring.rewind();
        let mut out = vec![0u8; 10 << 20];
        assert_eq!(ring.get(&mut out), 10 << 20);
        assert_eq!(out, data);
    }

    #[test]
    fn get_is_bounded_by_contents() {
        let mut ring = SlabRing::new(64, 100);
        ring.put(&[7u8; 10]);
        ring.rewind();
        let mut out = [0u8; 32];
        assert_eq!(ring.get(&mut out), 10);
        assert_eq!(ring.get(&mut out), 0);
    }

    #[test]
    fn reset_restores_invariants() {
        let mut ring = SlabRing::new(64, 100);
        ring.put(&pattern(200));
        ring.reset_for_checkpoint();
        assert_eq!(ring.total_bytes(), 0);
        assert!(ring.nb_slabs() >= 1);

        // staged bytes from the previous tick are gone
        let mut out = [0u8; 16];
        assert_eq!(ring.get(&mut out), 0);

        // and the ring is immediately reusable
        ring.put(&[1, 2, 3]);
        ring.rewind();
        assert_eq!(ring.get(&mut out), 3);
        assert_eq!(&out[..3], &[1, 2, 3]);
    }

    #[test]
    fn shrinks_after_max_strikes() {
        let mut ring = SlabRing::new(64, 100);
        // grow to 5 slabs
        ring.put(&pattern(64 * 4 + 1));
        assert_eq!(ring.nb_slabs(), 5);

        // the growth tick itself used the tail, so it counts no strike
        ring.reset_for_checkpoint();

        // 100 idle ticks with nothing staged in the tail
        for _ in 0..99 {
            ring.put(&[0u8; 8]);
            ring.reset_for_checkpoint();
        }
        assert_eq!(ring.strikes(), 99);
        assert_eq!(ring.nb_slabs(), 5);

        ring.put(&[0u8; 8]);
        ring.reset_for_checkpoint();
        // (5 - 1) / 2 = 2 slabs freed
        assert_eq!(ring.nb_slabs(), 3);
        assert_eq!(ring.strikes(), 0);
    }

    #[test]
    fn full_tick_resets_strikes() {
        let mut ring = SlabRing::new(64, 10);
        ring.put(&pattern(64 * 2 + 1));
        assert_eq!(ring.nb_slabs(), 3);
        ring.reset_for_checkpoint();

        for _ in 0..5 {
            ring.put(&[0u8; 8]);
            ring.reset_for_checkpoint();
        }
        assert_eq!(ring.strikes(), 5);

        // fill every slab; next reset must not count a strike
        ring.reset_for_checkpoint();
        ring.put(&pattern(64 * 3));
        ring.reset_for_checkpoint();
        assert_eq!(ring.strikes(), 0);
        assert_eq!(ring.nb_slabs(), 3);
    }

    #[test]
    fn head_survives_shrink() {
        let mut ring = SlabRing::new(64, 1);
        ring.put(&pattern(64 * 7 + 1));
        assert_eq!(ring.nb_slabs(), 8);

        // every reset now shrinks; the head must always survive
        for _ in 0..10 {
            ring.reset_for_checkpoint();
            assert!(ring.nb_slabs() >= 1);
        }
        assert_eq!(ring.nb_slabs(), 1);
    }

    #[test]
    fn staging_file_round_trip_and_sticky_error() {
        let mut file = StagingFile::new(SlabRing::new(64, 100));
        let data = pattern(100);
        file.write_all(&data).unwrap();
        file.ring_mut().rewind();

        let mut out = vec![0u8; 100];
        file.read_exact(&mut out).unwrap();
        assert_eq!(out, data);

        file.set_error(io::ErrorKind::ConnectionReset);
        assert!(file.write(&[0]).is_err());
        assert!(file.read(&mut out).is_err());
        assert_eq!(file.last_error(), Some(io::ErrorKind::ConnectionReset));
    }
}
