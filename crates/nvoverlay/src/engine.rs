//! Event dispatch, epoch control, and stable-epoch merging.
//!
//! [`NvOverlay`] owns every sub-component and drives them synchronously:
//! all side effects of one event (version-table transition, write-combining
//! insert, buffer eviction, overlay insert, NVM write) commit before the
//! next event begins. `core_id` is a logical index; the engine is
//! single-threaded by contract.
//!
//! Epoch control, per core: every store spends one unit of the epoch store
//! budget, and an exhausted budget advances the epoch. When a core's epoch
//! has run `tag_walk_freq` ahead of its last walk, the engine scans that
//! core's L2 tags and flushes every version strictly older than the
//! current epoch. Walk targets feed the stable-epoch computation, and the
//! overlay merges each newly stable epoch into the mapping table exactly
//! once.

use tracing::{debug, info};

use crate::bitmap::Bitmap64;
use crate::config::NvOverlayConfig;
use crate::cpu::Cpu;
use crate::error::Result;
use crate::nvm::Nvm;
use crate::omcbuf::OmcBuffer;
use crate::omt::Omt;
use crate::overlay::Overlay;
use crate::stats::{EpochStats, SimStats};
use crate::vtable::{CacheLevel, CoherenceSink, EvictKind, TagOp, VersionTable};

/// Routes version-table side effects into the downstream components.
struct Downstream<'a> {
    cpu: &'a mut Cpu,
    omcbuf: &'a mut OmcBuffer,
    overlay: &'a mut Overlay,
    nvm: &'a mut Nvm,
    coherence_writebacks: &'a mut u64,
    llc_evictions: &'a mut u64,
}

impl CoherenceSink for Downstream<'_> {
    fn evict(&mut self, line_addr: u64, _core: u32, version: u64, cycle: u64, kind: EvictKind) {
        *self.coherence_writebacks += 1;
        if kind == EvictKind::OmcAndLlc {
            *self.llc_evictions += 1;
        }
        if let Some(evicted) = self.omcbuf.insert(line_addr, version) {
            self.overlay.insert(evicted.line_addr, evicted.epoch);
            self.nvm.write(evicted.line_addr, cycle);
        }
    }

    fn core_recv(&mut self, core: u32, version: u64) {
        self.cpu.core_recv(core, version);
    }

    fn tag_op(&mut self, op: TagOp, level: CacheLevel, core: u32, line_addr: u64, sharers: Bitmap64) {
        self.cpu.tag_op(op, level, core, line_addr, sharers);
    }
}

/// Builds a [`Downstream`] sink over the engine's split fields.
macro_rules! sink {
    ($engine:expr) => {{
        let NvOverlay {
            ref mut cpu,
            ref mut omcbuf,
            ref mut overlay,
            ref mut nvm,
            ref mut coherence_writeback_count,
            ref mut llc_evict_count,
            ..
        } = *$engine;
        Downstream {
            cpu,
            omcbuf,
            overlay,
            nvm,
            coherence_writebacks: coherence_writeback_count,
            llc_evictions: llc_evict_count,
        }
    }};
}

/// The simulator: versioning engine plus all downstream components.
pub struct NvOverlay {
    config: NvOverlayConfig,
    epoch_size: u64,
    tag_walk_freq: u64,
    vtable: VersionTable,
    cpu: Cpu,
    omcbuf: OmcBuffer,
    overlay: Overlay,
    omt: Omt,
    nvm: Nvm,
    /// Last tag-walk target per core.
    stable_epochs: Vec<u64>,
    last_stable_epoch: u64,
    coherence_writeback_count: u64,
    llc_evict_count: u64,
    last_cycle: u64,
}

impl NvOverlay {
    /// Build an engine from validated configuration.
    pub fn new(config: NvOverlayConfig) -> Result<Self> {
        config.validate()?;
        info!(
            cores = config.cores,
            l1_sets = config.l1.sets(),
            l1_ways = config.l1.ways,
            l2_sets = config.l2.sets(),
            l2_ways = config.l2.ways,
            omcbuf_sets = config.omcbuf.sets,
            omcbuf_ways = config.omcbuf.ways,
            nvm_banks = config.nvm.banks,
            epoch_size = config.epoch_size,
            tag_walk_freq = config.tag_walk_freq,
            "building simulator"
        );
        Ok(NvOverlay {
            epoch_size: config.epoch_size,
            tag_walk_freq: config.tag_walk_freq,
            vtable: VersionTable::new(),
            cpu: Cpu::new(config.cores, &config.l1, &config.l2),
            omcbuf: OmcBuffer::new(config.omcbuf.sets, config.omcbuf.ways),
            overlay: Overlay::new(),
            omt: Omt::new(),
            nvm: Nvm::new(config.nvm.banks, config.nvm.rlat, config.nvm.wlat),
            stable_epochs: vec![0; config.cores as usize],
            last_stable_epoch: 0,
            coherence_writeback_count: 0,
            llc_evict_count: 0,
            last_cycle: 0,
            config,
        })
    }

    #[inline]
    fn begin_event(&mut self, cycle: u64) {
        debug_assert!(
            cycle >= self.last_cycle,
            "event cycles must be non-decreasing ({} after {})",
            cycle,
            self.last_cycle
        );
        self.last_cycle = cycle;
    }

    /// L1 load by `core`.
    pub fn load(&mut self, core: u32, line_addr: u64, cycle: u64) {
        self.begin_event(cycle);
        self.cpu.core_mut(core).load_count += 1;
        let mut sink = sink!(self);
        self.vtable.load(line_addr, core, cycle, &mut sink);
    }

    /// L1 store by `core`.
    pub fn store(&mut self, core: u32, line_addr: u64, cycle: u64) {
        self.begin_event(cycle);
        let epoch = self.cpu.core(core).epoch;
        self.cpu.core_mut(core).store_count += 1;
        {
            let mut sink = sink!(self);
            self.vtable.store(line_addr, core, epoch, cycle, &mut sink);
        }

        // Walk check precedes the store accounting: a store that exhausts
        // the budget advances the epoch, and the walk fires on the next
        // store into the new epoch.
        let state = self.cpu.core(core);
        debug_assert!(state.epoch >= state.last_walk_epoch);
        if state.epoch - state.last_walk_epoch >= self.tag_walk_freq {
            let target = state.epoch;
            self.run_tag_walk(core, target, cycle);
        }

        let state = self.cpu.core_mut(core);
        state.epoch_store_count += 1;
        state.total_store_count += 1;
        if state.epoch_store_count >= self.epoch_size {
            self.cpu.advance_epoch(core);
            debug!(core, epoch = self.cpu.core(core).epoch, "epoch advanced");
        }
    }

    /// `core` evicts a line from its L1.
    pub fn l1_evict(&mut self, core: u32, line_addr: u64, cycle: u64) {
        self.begin_event(cycle);
        self.cpu.core_mut(core).l1_evict_count += 1;
        let mut sink = sink!(self);
        self.vtable.l1_evict(line_addr, core, cycle, &mut sink);
    }

    /// `core` evicts a line from its inclusive L2.
    pub fn l2_evict(&mut self, core: u32, line_addr: u64, cycle: u64) {
        self.begin_event(cycle);
        self.cpu.core_mut(core).l2_evict_count += 1;
        let mut sink = sink!(self);
        self.vtable.l2_evict(line_addr, core, cycle, &mut sink);
    }

    /// The inclusive LLC evicts a line; every upper copy is invalidated.
    pub fn l3_evict(&mut self, core: u32, line_addr: u64, cycle: u64) {
        self.begin_event(cycle);
        self.cpu.core_mut(core).l3_evict_count += 1;
        let mut sink = sink!(self);
        self.vtable.l3_evict(line_addr, cycle, &mut sink);
    }

    /// Scan `core`'s L2 tags and flush versions older than `target_epoch`,
    /// then advance the stable epoch as far as every core's walks allow.
    fn run_tag_walk(&mut self, core: u32, target_epoch: u64, cycle: u64) {
        debug!(core, target_epoch, "tag walk");
        let lines = self.cpu.tags(CacheLevel::L2).occupied(core);
        let mut writebacks = 0;
        for line_addr in lines {
            let mut sink = sink!(self);
            writebacks += self
                .vtable
                .walk_line(line_addr, core, target_epoch, cycle, &mut sink);
        }
        let state = self.cpu.core_mut(core);
        state.tag_walk_evict_count += writebacks;
        state.last_walk_epoch = target_epoch;
        self.stable_epochs[core as usize] = target_epoch;

        // A version the walk just flushed can still sit write-combined in
        // the OMC buffer under its old epoch, so the merge window stops
        // one epoch short of the minimum walk target.
        let min_stable = self.stable_epochs.iter().copied().min().unwrap_or(0);
        let stable_bound = min_stable.saturating_sub(1);
        if stable_bound > self.last_stable_epoch {
            // Epochs about to merge must not have lines still sitting
            // write-combined; force them down first.
            for evicted in self.omcbuf.drain_below(stable_bound) {
                self.overlay.insert(evicted.line_addr, evicted.epoch);
                self.nvm.write(evicted.line_addr, cycle);
            }
            for epoch in self.last_stable_epoch..stable_bound {
                self.overlay.epoch_merge(epoch, &mut self.omt);
            }
            self.last_stable_epoch = stable_bound;
            debug!(last_stable_epoch = stable_bound, "stable epoch advanced");
        }
    }

    /// The configuration the engine was built from.
    pub fn config(&self) -> &NvOverlayConfig {
        &self.config
    }

    /// The version table.
    pub fn vtable(&self) -> &VersionTable {
        &self.vtable
    }

    /// The cores and tag mirrors.
    pub fn cpu(&self) -> &Cpu {
        &self.cpu
    }

    /// The write-combining buffer.
    pub fn omcbuf(&self) -> &OmcBuffer {
        &self.omcbuf
    }

    /// The overlay store.
    pub fn overlay(&self) -> &Overlay {
        &self.overlay
    }

    /// The overlay mapping table.
    pub fn omt(&self) -> &Omt {
        &self.omt
    }

    /// The NVM timing model.
    pub fn nvm(&self) -> &Nvm {
        &self.nvm
    }

    /// Largest epoch below which every store has merged into the mapping
    /// table.
    pub fn last_stable_epoch(&self) -> u64 {
        self.last_stable_epoch
    }

    /// Snapshot every counter in the simulator.
    pub fn stats(&self) -> SimStats {
        SimStats {
            cores: self.cpu.core_stats(),
            epochs: EpochStats {
                total_advances: self.cpu.total_advance_count(),
                coherence_advances: self.cpu.coherence_advance_count(),
                skipped_epochs: self.cpu.skip_epoch_count(),
                last_stable_epoch: self.last_stable_epoch,
            },
            coherence_writebacks: self.coherence_writeback_count,
            llc_evictions: self.llc_evict_count,
            omcbuf: self.omcbuf.stats(),
            overlay: self.overlay.stats(),
            omt: self.omt.stats(),
            nvm: self.nvm.stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheGeometry, NvmConfig, OmcBufConfig};

    /// One core, tiny caches, two stores per epoch, walk every epoch,
    /// single-entry write-combining buffer: the geometry the end-to-end
    /// scenarios are written against.
    fn tiny_config(cores: u32) -> NvOverlayConfig {
        NvOverlayConfig {
            cores,
            l1: CacheGeometry { size: 8 * 64, ways: 2 },
            l2: CacheGeometry { size: 32 * 64, ways: 2 },
            omcbuf: OmcBufConfig { sets: 1, ways: 1 },
            nvm: NvmConfig { rlat: 0, wlat: 10, banks: 1 },
            epoch_size: 2,
            tag_walk_freq: 1,
        }
    }

    #[test]
    fn test_rejects_invalid_config() {
        let mut cfg = tiny_config(1);
        cfg.nvm.banks = 3;
        assert!(NvOverlay::new(cfg).is_err());
    }

    #[test]
    fn test_event_counters_per_core() {
        let mut sim = NvOverlay::new(tiny_config(2)).unwrap();
        sim.load(0, 0x1000, 0);
        sim.store(1, 0x2000, 1);
        sim.store(1, 0x2040, 2);
        let stats = sim.stats();
        assert_eq!(stats.cores[0].loads, 1);
        assert_eq!(stats.cores[1].stores, 2);
        assert_eq!(stats.cores[0].stores, 0);
    }

    #[test]
    fn test_store_budget_advances_epoch() {
        let mut sim = NvOverlay::new(tiny_config(1)).unwrap();
        sim.store(0, 0x1000, 0);
        assert_eq!(sim.cpu().core(0).epoch, 0);
        sim.store(0, 0x1000, 1);
        assert_eq!(sim.cpu().core(0).epoch, 1);
        assert_eq!(sim.cpu().core(0).epoch_store_count, 0);
    }

    #[test]
    fn test_walk_fires_on_store_after_advance() {
        let mut sim = NvOverlay::new(tiny_config(1)).unwrap();
        sim.store(0, 0x1000, 0);
        sim.store(0, 0x1000, 1);
        // Budget exhausted, epoch 1; the walk has not run yet.
        assert_eq!(sim.cpu().core(0).last_walk_epoch, 0);
        assert!(sim.omcbuf().is_empty());
        sim.store(0, 0x1040, 2);
        // First store in epoch 1 walks at target 1 and flushes line 0x1000.
        assert_eq!(sim.cpu().core(0).last_walk_epoch, 1);
        assert!(sim.omcbuf().contains(0x1000, 0));
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_unknown_core_panics() {
        let mut sim = NvOverlay::new(tiny_config(1)).unwrap();
        sim.load(3, 0x1000, 0);
    }

    #[test]
    #[should_panic(expected = "not cache-line aligned")]
    fn test_unaligned_address_panics() {
        let mut sim = NvOverlay::new(tiny_config(1)).unwrap();
        sim.store(0, 0x1010, 0);
    }
}
