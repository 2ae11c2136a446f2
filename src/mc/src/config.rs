use netplug::BufferConfig;
use serde::{Deserialize, Serialize};
use slabring::SLAB_SIZE;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct McConfig {
    /// Checkpoint period in milliseconds.
    pub freq_ms: u64,
    /// Window after which a persistently oversized staging ring shrinks.
    pub max_strikes_delay_secs: u64,
    /// Staging slab capacity in bytes.
    pub slab_size: usize,
    /// Network-output buffering.
    pub buffer: BufferConfig,
}

impl Default for McConfig {
    fn default() -> Self {
        McConfig {
            freq_ms: 100,
            max_strikes_delay_secs: 10,
            slab_size: SLAB_SIZE,
            buffer: BufferConfig::default(),
        }
    }
}

impl McConfig {
    /// Ticks the shrink window spans at the configured cadence.
    pub fn max_strikes(&self) -> u32 {
        (self.max_strikes_delay_secs * 1000 / self.freq_ms.max(1)) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_shrink_window_is_a_hundred_ticks() {
        let cfg = McConfig::default();
        assert_eq!(cfg.freq_ms, 100);
        assert_eq!(cfg.max_strikes(), 100);
    }

    #[test]
    fn strikes_scale_with_cadence() {
        let cfg = McConfig {
            freq_ms: 50,
            ..McConfig::default()
        };
        assert_eq!(cfg.max_strikes(), 200);
    }
}
