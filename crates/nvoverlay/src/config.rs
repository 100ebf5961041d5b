//! Typed configuration knobs consumed by the engine.
//!
//! File parsing belongs to the host; these structs derive serde so any
//! format can feed them. [`NvOverlayConfig::validate`] rejects geometry
//! the hardware model cannot express, naming the offending key and value.

use serde::{Deserialize, Serialize};

use crate::addr::{LINE_SIZE, MAX_CORES};
use crate::error::{NvError, Result};

/// Size and associativity of one private cache level.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheGeometry {
    /// Capacity in bytes; a multiple of the line size and of `ways`.
    pub size: u64,
    /// Associativity.
    pub ways: u32,
}

impl CacheGeometry {
    /// Number of sets this geometry resolves to.
    pub fn sets(&self) -> u64 {
        self.size / LINE_SIZE / self.ways as u64
    }

    fn validate(&self, size_key: &'static str, ways_key: &'static str) -> Result<()> {
        if self.ways == 0 {
            return Err(NvError::Config {
                key: ways_key,
                value: self.ways as u64,
                reason: "must be at least 1",
            });
        }
        if self.size == 0 || self.size % LINE_SIZE != 0 {
            return Err(NvError::Config {
                key: size_key,
                value: self.size,
                reason: "must be a non-zero multiple of the 64-byte line size",
            });
        }
        if (self.size / LINE_SIZE) % self.ways as u64 != 0 {
            return Err(NvError::Config {
                key: size_key,
                value: self.size,
                reason: "line count must be a multiple of the way count",
            });
        }
        if !self.sets().is_power_of_two() {
            return Err(NvError::Config {
                key: size_key,
                value: self.size,
                reason: "set count must be a power of two",
            });
        }
        Ok(())
    }
}

/// Write-combining buffer geometry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OmcBufConfig {
    /// Number of sets; a power of two.
    pub sets: u32,
    /// Number of ways; a power of two.
    pub ways: u32,
}

/// NVM timing parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NvmConfig {
    /// Read latency in cycles.
    pub rlat: u64,
    /// Write latency in cycles.
    pub wlat: u64,
    /// Bank count; a power of two.
    pub banks: u32,
}

/// All knobs the engine consumes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NvOverlayConfig {
    /// Number of simulated cores (1..=64).
    pub cores: u32,
    /// L1 tag-array geometry.
    pub l1: CacheGeometry,
    /// L2 tag-array geometry.
    pub l2: CacheGeometry,
    /// Write-combining buffer geometry.
    pub omcbuf: OmcBufConfig,
    /// NVM timing.
    pub nvm: NvmConfig,
    /// Stores per core before its epoch auto-advances.
    pub epoch_size: u64,
    /// Epoch delta between tag walks per core.
    pub tag_walk_freq: u64,
}

impl Default for NvOverlayConfig {
    fn default() -> Self {
        NvOverlayConfig {
            cores: 4,
            l1: CacheGeometry { size: 32 * 1024, ways: 8 },
            l2: CacheGeometry { size: 256 * 1024, ways: 8 },
            omcbuf: OmcBufConfig { sets: 64, ways: 4 },
            nvm: NvmConfig { rlat: 100, wlat: 300, banks: 16 },
            epoch_size: 4096,
            tag_walk_freq: 4,
        }
    }
}

impl NvOverlayConfig {
    /// Check every knob, reporting the first violation.
    pub fn validate(&self) -> Result<()> {
        if self.cores == 0 || self.cores > MAX_CORES {
            return Err(NvError::Config {
                key: "cpu.cores",
                value: self.cores as u64,
                reason: "must be between 1 and 64",
            });
        }
        self.l1.validate("cpu.l1.size", "cpu.l1.ways")?;
        self.l2.validate("cpu.l2.size", "cpu.l2.ways")?;
        if self.omcbuf.sets == 0 || !self.omcbuf.sets.is_power_of_two() {
            return Err(NvError::Config {
                key: "omcbuf.sets",
                value: self.omcbuf.sets as u64,
                reason: "must be a power of two",
            });
        }
        if self.omcbuf.ways == 0 || !self.omcbuf.ways.is_power_of_two() {
            return Err(NvError::Config {
                key: "omcbuf.ways",
                value: self.omcbuf.ways as u64,
                reason: "must be a power of two",
            });
        }
        if self.nvm.banks == 0 || !self.nvm.banks.is_power_of_two() {
            return Err(NvError::Config {
                key: "nvm.banks",
                value: self.nvm.banks as u64,
                reason: "must be a power of two",
            });
        }
        if self.epoch_size == 0 {
            return Err(NvError::Config {
                key: "nvoverlay.epoch_size",
                value: 0,
                reason: "must be at least 1",
            });
        }
        if self.tag_walk_freq == 0 {
            return Err(NvError::Config {
                key: "nvoverlay.tag_walk_freq",
                value: 0,
                reason: "must be at least 1",
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        NvOverlayConfig::default().validate().expect("defaults are sane");
    }

    #[test]
    fn test_sets_derivation() {
        let g = CacheGeometry { size: 32 * 1024, ways: 8 };
        assert_eq!(g.sets(), 64);
    }

    #[test]
    fn test_rejects_non_power_of_two_banks() {
        let mut cfg = NvOverlayConfig::default();
        cfg.nvm.banks = 3;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("nvm.banks = 3"));
    }

    #[test]
    fn test_rejects_unaligned_l1_size() {
        let mut cfg = NvOverlayConfig::default();
        cfg.l1.size = 100;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("cpu.l1.size"));
    }

    #[test]
    fn test_rejects_size_not_multiple_of_ways() {
        let mut cfg = NvOverlayConfig::default();
        cfg.l1 = CacheGeometry { size: 64 * 3, ways: 2 };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("multiple of the way count"));
    }

    #[test]
    fn test_rejects_zero_epoch_size() {
        let mut cfg = NvOverlayConfig::default();
        cfg.epoch_size = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_too_many_cores() {
        let mut cfg = NvOverlayConfig::default();
        cfg.cores = 65;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_serde_round_trip() {
        let cfg = NvOverlayConfig::default();
        let json = serde_json::to_string(&cfg).expect("serialize");
        let back: NvOverlayConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, cfg);
    }
}
