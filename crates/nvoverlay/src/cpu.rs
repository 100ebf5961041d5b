//! Simulated cores and inclusive tag-array mirrors.
//!
//! Each core carries its logical epoch and store budget. Per level (L1,
//! L2) a set-associative tag array mirrors which lines each core caches,
//! exactly tracking the version table's sharer sets through [`TagOp`]
//! callbacks. The mirror exists so tag walks can enumerate a core's L2
//! contents without scanning the whole version table.
//!
//! Tag corruption — inserting a duplicate, removing a missing tag, or
//! finding no free way — means the event stream violated the inclusive
//! hierarchy contract and panics.

use crate::addr::LINE_BITS;
use crate::bitmap::Bitmap64;
use crate::config::CacheGeometry;
use crate::stats::CoreStats;
use crate::vtable::{CacheLevel, TagOp};

/// One simulated core's epoch and event accounting.
#[derive(Clone, Debug, Default)]
pub struct CoreState {
    /// Current logical epoch.
    pub epoch: u64,
    /// Stores since the last epoch advance.
    pub epoch_store_count: u64,
    /// Stores over the whole run.
    pub total_store_count: u64,
    /// Epoch of the last tag walk on this core.
    pub last_walk_epoch: u64,
    /// Writebacks emitted by this core's tag walks.
    pub tag_walk_evict_count: u64,
    /// Load events dispatched on this core.
    pub load_count: u64,
    /// Store events dispatched on this core.
    pub store_count: u64,
    /// L1 eviction events dispatched on this core.
    pub l1_evict_count: u64,
    /// L2 eviction events dispatched on this core.
    pub l2_evict_count: u64,
    /// L3 eviction events dispatched on this core.
    pub l3_evict_count: u64,
}

impl CoreState {
    fn stats(&self) -> CoreStats {
        CoreStats {
            loads: self.load_count,
            stores: self.store_count,
            l1_evicts: self.l1_evict_count,
            l2_evicts: self.l2_evict_count,
            l3_evicts: self.l3_evict_count,
            epoch: self.epoch,
            epoch_store_count: self.epoch_store_count,
            total_store_count: self.total_store_count,
            last_walk_epoch: self.last_walk_epoch,
            tag_walk_evict_count: self.tag_walk_evict_count,
        }
    }
}

/// Per-level, per-core set-associative mirror of cached line addresses.
pub struct TagArray {
    sets: usize,
    ways: usize,
    set_mask: u64,
    /// `cores * sets * ways` slots, indexed core-major.
    slots: Vec<Option<u64>>,
}

impl TagArray {
    fn new(cores: u32, geometry: &CacheGeometry) -> Self {
        let sets = geometry.sets() as usize;
        let ways = geometry.ways as usize;
        debug_assert!(sets.is_power_of_two());
        TagArray {
            sets,
            ways,
            set_mask: (sets as u64) - 1,
            slots: vec![None; cores as usize * sets * ways],
        }
    }

    #[inline]
    fn set_range(&self, core: u32, addr: u64) -> std::ops::Range<usize> {
        let set = ((addr >> LINE_BITS) & self.set_mask) as usize;
        let base = core as usize * self.sets * self.ways + set * self.ways;
        base..base + self.ways
    }

    fn insert(&mut self, core: u32, addr: u64) {
        let range = self.set_range(core, addr);
        let ways = &mut self.slots[range];
        if ways.iter().any(|slot| *slot == Some(addr)) {
            panic!("tag {addr:#x} already present (core {core}) - duplicate fill");
        }
        match ways.iter_mut().find(|slot| slot.is_none()) {
            Some(slot) => *slot = Some(addr),
            None => panic!("no free way for tag {addr:#x} (core {core}) - missing eviction?"),
        }
    }

    fn remove(&mut self, core: u32, addr: u64) {
        let range = self.set_range(core, addr);
        match self.slots[range].iter_mut().find(|slot| **slot == Some(addr)) {
            Some(slot) => *slot = None,
            None => panic!("tag {addr:#x} not present (core {core}) - eviction of untracked line"),
        }
    }

    /// Returns true if `core` holds a tag for `addr`.
    pub fn contains(&self, core: u32, addr: u64) -> bool {
        let range = self.set_range(core, addr);
        self.slots[range].iter().any(|slot| *slot == Some(addr))
    }

    /// Line addresses currently tagged for `core`, in slot order.
    pub fn occupied(&self, core: u32) -> Vec<u64> {
        let base = core as usize * self.sets * self.ways;
        self.slots[base..base + self.sets * self.ways]
            .iter()
            .flatten()
            .copied()
            .collect()
    }

    /// Number of tags held by `core`.
    pub fn occupancy(&self, core: u32) -> usize {
        let base = core as usize * self.sets * self.ways;
        self.slots[base..base + self.sets * self.ways]
            .iter()
            .filter(|slot| slot.is_some())
            .count()
    }
}

/// All simulated cores plus their L1/L2 tag mirrors.
pub struct Cpu {
    cores: Vec<CoreState>,
    l1_tags: TagArray,
    l2_tags: TagArray,
    total_advance_count: u64,
    coherence_advance_count: u64,
    skip_epoch_count: u64,
}

impl Cpu {
    /// Build `core_count` cores with the given cache geometries.
    pub fn new(core_count: u32, l1: &CacheGeometry, l2: &CacheGeometry) -> Self {
        Cpu {
            cores: vec![CoreState::default(); core_count as usize],
            l1_tags: TagArray::new(core_count, l1),
            l2_tags: TagArray::new(core_count, l2),
            total_advance_count: 0,
            coherence_advance_count: 0,
            skip_epoch_count: 0,
        }
    }

    /// Number of simulated cores.
    pub fn core_count(&self) -> u32 {
        self.cores.len() as u32
    }

    /// A core's state.
    ///
    /// # Panics
    ///
    /// Panics if `core` is out of range; events naming unknown cores are
    /// garbage input.
    #[track_caller]
    pub fn core(&self, core: u32) -> &CoreState {
        self.cores
            .get(core as usize)
            .unwrap_or_else(|| panic!("core id {core} out of range ({} cores)", self.cores.len()))
    }

    /// Mutable access to a core's state.
    #[track_caller]
    pub fn core_mut(&mut self, core: u32) -> &mut CoreState {
        let count = self.cores.len();
        self.cores
            .get_mut(core as usize)
            .unwrap_or_else(|| panic!("core id {core} out of range ({count} cores)"))
    }

    /// The tag mirror for `level`.
    pub fn tags(&self, level: CacheLevel) -> &TagArray {
        match level {
            CacheLevel::L1 => &self.l1_tags,
            CacheLevel::L2 => &self.l2_tags,
        }
    }

    fn tags_mut(&mut self, level: CacheLevel) -> &mut TagArray {
        match level {
            CacheLevel::L1 => &mut self.l1_tags,
            CacheLevel::L2 => &mut self.l2_tags,
        }
    }

    /// Apply a sharer-set mirror operation.
    ///
    /// `sharers` is the membership *before* the mutation: `Set` and
    /// `Clear` drop a tag for every member, then `Set` fills one for
    /// `core`.
    pub fn tag_op(&mut self, op: TagOp, level: CacheLevel, core: u32, addr: u64, sharers: Bitmap64) {
        let tags = self.tags_mut(level);
        match op {
            TagOp::Add => tags.insert(core, addr),
            TagOp::Remove => tags.remove(core, addr),
            TagOp::Set | TagOp::Clear => {
                for member in sharers.iter() {
                    tags.remove(member, addr);
                }
                if op == TagOp::Set {
                    tags.insert(core, addr);
                }
            }
        }
    }

    /// `core` received `version` over coherence: its epoch jumps forward
    /// to at least that version and its store budget restarts.
    pub fn core_recv(&mut self, core: u32, version: u64) {
        let count = self.cores.len();
        let state = self
            .cores
            .get_mut(core as usize)
            .unwrap_or_else(|| panic!("core id {core} out of range ({count} cores)"));
        if version > state.epoch {
            if version != state.epoch + 1 {
                self.skip_epoch_count += 1;
            }
            state.epoch = version;
            state.epoch_store_count = 0;
            self.coherence_advance_count += 1;
            self.total_advance_count += 1;
        }
    }

    /// Advance `core` to its next epoch after exhausting the store budget.
    pub fn advance_epoch(&mut self, core: u32) {
        let count = self.cores.len();
        let state = self
            .cores
            .get_mut(core as usize)
            .unwrap_or_else(|| panic!("core id {core} out of range ({count} cores)"));
        state.epoch += 1;
        state.epoch_store_count = 0;
        self.total_advance_count += 1;
    }

    /// Smallest epoch across cores.
    pub fn min_epoch(&self) -> u64 {
        self.cores.iter().map(|core| core.epoch).min().unwrap_or(0)
    }

    /// Epoch advances of any kind.
    pub fn total_advance_count(&self) -> u64 {
        self.total_advance_count
    }

    /// Advances caused by coherence transfers.
    pub fn coherence_advance_count(&self) -> u64 {
        self.coherence_advance_count
    }

    /// Coherence advances that jumped more than one epoch.
    pub fn skip_epoch_count(&self) -> u64 {
        self.skip_epoch_count
    }

    /// Per-core counter snapshots.
    pub fn core_stats(&self) -> Vec<CoreStats> {
        self.cores.iter().map(CoreState::stats).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::LINE_SIZE;

    /// The smallest geometry usable for tests: `sets * ways * 64` bytes.
    fn geometry(sets: u64, ways: u32) -> CacheGeometry {
        CacheGeometry { size: sets * ways as u64 * LINE_SIZE, ways }
    }

    fn small_cpu() -> Cpu {
        // 4 sets x 2 ways at both levels, 2 cores.
        let g = geometry(4, 2);
        Cpu::new(2, &g, &g)
    }

    #[test]
    fn test_tag_insert_remove() {
        let mut cpu = small_cpu();
        cpu.tag_op(TagOp::Add, CacheLevel::L1, 0, 0x1000, Bitmap64::new());
        assert!(cpu.tags(CacheLevel::L1).contains(0, 0x1000));
        assert!(!cpu.tags(CacheLevel::L1).contains(1, 0x1000));
        cpu.tag_op(TagOp::Remove, CacheLevel::L1, 0, 0x1000, Bitmap64::singleton(0));
        assert!(!cpu.tags(CacheLevel::L1).contains(0, 0x1000));
    }

    #[test]
    #[should_panic(expected = "duplicate fill")]
    fn test_duplicate_tag_panics() {
        let mut cpu = small_cpu();
        cpu.tag_op(TagOp::Add, CacheLevel::L1, 0, 0x1000, Bitmap64::new());
        cpu.tag_op(TagOp::Add, CacheLevel::L1, 0, 0x1000, Bitmap64::singleton(0));
    }

    #[test]
    #[should_panic(expected = "not present")]
    fn test_remove_missing_tag_panics() {
        let mut cpu = small_cpu();
        cpu.tag_op(TagOp::Remove, CacheLevel::L2, 0, 0x1000, Bitmap64::new());
    }

    #[test]
    #[should_panic(expected = "no free way")]
    fn test_overfull_set_panics() {
        let mut cpu = small_cpu();
        // Three lines mapping to set 0 of a 2-way array.
        cpu.tag_op(TagOp::Add, CacheLevel::L1, 0, 0x1000, Bitmap64::new());
        cpu.tag_op(TagOp::Add, CacheLevel::L1, 0, 0x2000, Bitmap64::new());
        cpu.tag_op(TagOp::Add, CacheLevel::L1, 0, 0x3000, Bitmap64::new());
    }

    #[test]
    fn test_set_drops_all_prior_sharers() {
        let mut cpu = small_cpu();
        let mut sharers = Bitmap64::new();
        cpu.tag_op(TagOp::Add, CacheLevel::L2, 0, 0x1000, sharers);
        sharers.add(0);
        cpu.tag_op(TagOp::Add, CacheLevel::L2, 1, 0x1000, sharers);
        sharers.add(1);
        cpu.tag_op(TagOp::Set, CacheLevel::L2, 1, 0x1000, sharers);
        assert!(!cpu.tags(CacheLevel::L2).contains(0, 0x1000));
        assert!(cpu.tags(CacheLevel::L2).contains(1, 0x1000));
        assert_eq!(cpu.tags(CacheLevel::L2).occupancy(1), 1);
    }

    #[test]
    fn test_clear_empties_sharers() {
        let mut cpu = small_cpu();
        let mut sharers = Bitmap64::new();
        cpu.tag_op(TagOp::Add, CacheLevel::L1, 0, 0x1040, sharers);
        sharers.add(0);
        cpu.tag_op(TagOp::Add, CacheLevel::L1, 1, 0x1040, sharers);
        sharers.add(1);
        cpu.tag_op(TagOp::Clear, CacheLevel::L1, 0, 0x1040, sharers);
        assert_eq!(cpu.tags(CacheLevel::L1).occupancy(0), 0);
        assert_eq!(cpu.tags(CacheLevel::L1).occupancy(1), 0);
    }

    #[test]
    fn test_core_recv_advances_and_counts_skips() {
        let mut cpu = small_cpu();
        cpu.core_recv(0, 1);
        assert_eq!(cpu.core(0).epoch, 1);
        assert_eq!(cpu.skip_epoch_count(), 0);
        cpu.core_recv(0, 5);
        assert_eq!(cpu.core(0).epoch, 5);
        assert_eq!(cpu.skip_epoch_count(), 1);
        assert_eq!(cpu.coherence_advance_count(), 2);
        // Stale versions never roll a core back.
        cpu.core_recv(0, 3);
        assert_eq!(cpu.core(0).epoch, 5);
        assert_eq!(cpu.coherence_advance_count(), 2);
    }

    #[test]
    fn test_core_recv_resets_store_budget() {
        let mut cpu = small_cpu();
        cpu.core_mut(0).epoch_store_count = 7;
        cpu.core_recv(0, 2);
        assert_eq!(cpu.core(0).epoch_store_count, 0);
    }

    #[test]
    fn test_min_epoch() {
        let mut cpu = small_cpu();
        cpu.advance_epoch(0);
        cpu.advance_epoch(0);
        cpu.advance_epoch(1);
        assert_eq!(cpu.min_epoch(), 1);
        assert_eq!(cpu.total_advance_count(), 3);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_unknown_core_panics() {
        let cpu = small_cpu();
        let _ = cpu.core(9);
    }
}
