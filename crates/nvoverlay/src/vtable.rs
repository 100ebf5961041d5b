//! Per-line coherence and version state machine.
//!
//! The version table tracks, for every cache line the simulator has seen,
//! which cache level owns the authoritative dirty copy, the epoch of each
//! level's version, and which cores cache the line at L1 and L2. Event
//! handlers mutate this state and report side effects through a
//! [`CoherenceSink`]: dirty writebacks bound for the write-combining
//! buffer, version transfers that piggyback epoch advances onto coherence,
//! and tag-array mirror operations.
//!
//! The invariants the handlers preserve:
//!
//! - owner `L1`: `l1_state == M`, exactly one L1 and one L2 sharer, both
//!   the owning core, `l2_state != I`;
//! - owner `L2`: `l2_state == M`, exactly one L2 sharer, at most one L1
//!   sharer on the same core in `S`;
//! - owner `Other` (LLC + DRAM): level states and versions are unused;
//!   any sharers hold clean copies of `other_ver`;
//! - whenever both levels are dirty, `l2_ver < l1_ver` (the lower level
//!   holds the older version).

use std::collections::HashMap;

use crate::addr::assert_line_aligned;
use crate::bitmap::Bitmap64;

/// Which cache holds the authoritative dirty version of a line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Owner {
    /// A single core's L1 holds the newest dirty version.
    L1,
    /// A single core's L2 holds the newest dirty version.
    L2,
    /// LLC + DRAM: the line is clean everywhere above.
    Other,
}

/// Reduced MESI state of one cache level's copy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LineState {
    /// Invalid.
    I,
    /// Shared (clean).
    S,
    /// Modified (dirty).
    M,
}

/// Private cache levels mirrored by tag arrays.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheLevel {
    /// Per-core L1.
    L1,
    /// Per-core L2.
    L2,
}

/// How far a dirty writeback propagates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EvictKind {
    /// Into the write-combining buffer only; the line stays in the LLC.
    OmcOnly,
    /// Into the write-combining buffer, also leaving the LLC.
    OmcAndLlc,
}

/// Tag-array mirror operation accompanying a sharer-set mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TagOp {
    /// One core gains the line.
    Add,
    /// One core drops the line.
    Remove,
    /// Every prior sharer drops the line, then one core gains it.
    Set,
    /// Every prior sharer drops the line.
    Clear,
}

/// Downstream effects of a version-table transition.
///
/// The orchestrator implements this over the write-combining buffer, the
/// epoch controller, and the tag arrays; tests implement it with a
/// recorder. Callbacks fire *before* the sharer sets mutate, so `sharers`
/// is the pre-mutation membership (`Set`/`Clear` walk it to drop tags).
pub trait CoherenceSink {
    /// A dirty version leaves a private cache.
    fn evict(&mut self, line_addr: u64, core: u32, version: u64, cycle: u64, kind: EvictKind);
    /// `core` received `version` over coherence or from the LLC.
    fn core_recv(&mut self, core: u32, version: u64);
    /// Mirror a sharer-set mutation into the tag arrays.
    fn tag_op(&mut self, op: TagOp, level: CacheLevel, core: u32, line_addr: u64, sharers: Bitmap64);
}

/// Version state of one cache line.
pub struct VersionRecord {
    addr: u64,
    owner: Owner,
    l1_state: LineState,
    l2_state: LineState,
    l1_ver: u64,
    l2_ver: u64,
    other_ver: u64,
    l1_sharers: Bitmap64,
    l2_sharers: Bitmap64,
}

impl VersionRecord {
    fn new(addr: u64) -> Self {
        VersionRecord {
            addr,
            owner: Owner::Other,
            l1_state: LineState::I,
            l2_state: LineState::I,
            l1_ver: 0,
            l2_ver: 0,
            other_ver: 0,
            l1_sharers: Bitmap64::new(),
            l2_sharers: Bitmap64::new(),
        }
    }

    /// The line address this record tracks.
    pub fn addr(&self) -> u64 {
        self.addr
    }

    /// Current owner.
    pub fn owner(&self) -> Owner {
        self.owner
    }

    /// State of the given level's copy (meaningful while that level owns
    /// or shares under a cache owner).
    pub fn state(&self, level: CacheLevel) -> LineState {
        match level {
            CacheLevel::L1 => self.l1_state,
            CacheLevel::L2 => self.l2_state,
        }
    }

    /// Epoch of the given level's version.
    pub fn version(&self, level: CacheLevel) -> u64 {
        match level {
            CacheLevel::L1 => self.l1_ver,
            CacheLevel::L2 => self.l2_ver,
        }
    }

    /// Epoch of the LLC + DRAM version.
    pub fn other_version(&self) -> u64 {
        self.other_ver
    }

    /// Cores caching the line at the given level.
    pub fn sharers(&self, level: CacheLevel) -> Bitmap64 {
        match level {
            CacheLevel::L1 => self.l1_sharers,
            CacheLevel::L2 => self.l2_sharers,
        }
    }

    fn sharers_mut(&mut self, level: CacheLevel) -> &mut Bitmap64 {
        match level {
            CacheLevel::L1 => &mut self.l1_sharers,
            CacheLevel::L2 => &mut self.l2_sharers,
        }
    }
}

/// The single core a sharer set must hold when its level owns the line.
#[track_caller]
fn sole(sharers: Bitmap64, addr: u64) -> u32 {
    sharers
        .sole_member()
        .unwrap_or_else(|| panic!("line {addr:#x}: owning level must have exactly one sharer"))
}

fn add_sharer<S: CoherenceSink>(rec: &mut VersionRecord, level: CacheLevel, core: u32, sink: &mut S) {
    sink.tag_op(TagOp::Add, level, core, rec.addr, rec.sharers(level));
    rec.sharers_mut(level).add(core);
}

fn remove_sharer<S: CoherenceSink>(rec: &mut VersionRecord, level: CacheLevel, core: u32, sink: &mut S) {
    sink.tag_op(TagOp::Remove, level, core, rec.addr, rec.sharers(level));
    rec.sharers_mut(level).remove(core);
}

fn set_sole_sharer<S: CoherenceSink>(rec: &mut VersionRecord, level: CacheLevel, core: u32, sink: &mut S) {
    sink.tag_op(TagOp::Set, level, core, rec.addr, rec.sharers(level));
    *rec.sharers_mut(level) = Bitmap64::singleton(core);
}

fn clear_sharers<S: CoherenceSink>(rec: &mut VersionRecord, level: CacheLevel, sink: &mut S) {
    sink.tag_op(TagOp::Clear, level, 0, rec.addr, rec.sharers(level));
    rec.sharers_mut(level).clear();
}

/// The version table: line address to [`VersionRecord`].
pub struct VersionTable {
    records: HashMap<u64, VersionRecord>,
}

impl Default for VersionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl VersionTable {
    /// Create an empty table.
    pub fn new() -> Self {
        VersionTable { records: HashMap::new() }
    }

    /// Look up the record for `addr`, creating a clean one on first touch.
    fn entry(&mut self, addr: u64) -> &mut VersionRecord {
        assert_line_aligned(addr);
        self.records.entry(addr).or_insert_with(|| VersionRecord::new(addr))
    }

    /// Record for `addr`, if the line has been seen.
    pub fn record(&self, addr: u64) -> Option<&VersionRecord> {
        self.records.get(&addr)
    }

    /// All tracked records, in no particular order.
    pub fn records(&self) -> impl Iterator<Item = &VersionRecord> {
        self.records.values()
    }

    /// Number of tracked lines.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if no line has been touched yet.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// L1 load by `core`.
    pub fn load<S: CoherenceSink>(&mut self, addr: u64, core: u32, cycle: u64, sink: &mut S) {
        let rec = self.entry(addr);
        // Case 1: L1 hit, nothing changes.
        if rec.l1_sharers.contains(core) {
            return;
        }
        // Case 2: L1 miss, L2 hit; the line climbs into L1.
        if rec.l2_sharers.contains(core) {
            debug_assert!(matches!(rec.owner, Owner::L2 | Owner::Other));
            if rec.owner == Owner::L2 {
                // A read miss can only come from an invalid L1 copy.
                debug_assert_eq!(rec.l1_state, LineState::I);
                debug_assert_ne!(rec.l2_state, LineState::I);
            }
            add_sharer(rec, CacheLevel::L1, core, sink);
            rec.l1_state = LineState::S;
            rec.l1_ver = rec.l2_ver;
            return;
        }
        // Case 3: miss in both levels. A cache owner elsewhere is downgraded
        // to LLC + DRAM first, writing dirty versions back.
        match rec.owner {
            Owner::Other => {}
            Owner::L1 => {
                let owner_core = sole(rec.l1_sharers, addr);
                debug_assert_eq!(sole(rec.l2_sharers, addr), owner_core);
                debug_assert_eq!(rec.l1_state, LineState::M);
                if rec.l2_state == LineState::M && rec.l2_ver != rec.l1_ver {
                    debug_assert!(rec.l2_ver < rec.l1_ver);
                    sink.evict(addr, owner_core, rec.l2_ver, cycle, EvictKind::OmcOnly);
                }
                sink.evict(addr, owner_core, rec.l1_ver, cycle, EvictKind::OmcAndLlc);
                rec.other_ver = rec.l1_ver;
                rec.owner = Owner::Other;
            }
            Owner::L2 => {
                let owner_core = sole(rec.l2_sharers, addr);
                debug_assert_eq!(rec.l2_state, LineState::M);
                debug_assert!(rec.l1_sharers.popcount() <= 1);
                if let Some(l1_core) = rec.l1_sharers.sole_member() {
                    debug_assert_eq!(l1_core, owner_core);
                    debug_assert_eq!(rec.l1_state, LineState::S);
                }
                sink.evict(addr, owner_core, rec.l2_ver, cycle, EvictKind::OmcAndLlc);
                rec.other_ver = rec.l2_ver;
                rec.owner = Owner::Other;
            }
        }
        // Clean fill of the requesting core's L1 and L2.
        rec.l1_ver = rec.other_ver;
        rec.l2_ver = rec.other_ver;
        rec.l1_state = LineState::S;
        rec.l2_state = LineState::S;
        add_sharer(rec, CacheLevel::L1, core, sink);
        add_sharer(rec, CacheLevel::L2, core, sink);
        sink.core_recv(core, rec.other_ver);
    }

    /// L1 store by `core` in `epoch`.
    pub fn store<S: CoherenceSink>(
        &mut self,
        addr: u64,
        core: u32,
        epoch: u64,
        cycle: u64,
        sink: &mut S,
    ) {
        let rec = self.entry(addr);
        if rec.owner == Owner::L1 && rec.l1_sharers.contains(core) {
            // Case 1: this core already owns the dirty L1 copy.
            debug_assert_eq!(sole(rec.l2_sharers, addr), core);
            debug_assert_eq!(rec.l1_state, LineState::M);
            debug_assert_ne!(rec.l2_state, LineState::I);
            if rec.l1_ver == epoch {
                return; // store hit in the current epoch
            }
            if rec.l2_state == LineState::M && rec.l2_ver != rec.l1_ver {
                debug_assert!(rec.l2_ver < rec.l1_ver);
                sink.evict(addr, core, rec.l2_ver, cycle, EvictKind::OmcOnly);
            }
            // Demote the old L1 version into L2 and open the new epoch in L1.
            rec.l2_state = LineState::M;
            rec.l2_ver = rec.l1_ver;
            rec.l1_ver = epoch;
        } else if rec.owner == Owner::L2 && rec.l2_sharers.contains(core) {
            // Case 2: this core owns the dirty L2 copy. L1 can write over it
            // without a writeback: any later store-evict would meet the same
            // version already sitting dirty in L2.
            debug_assert_eq!(rec.l2_state, LineState::M);
            debug_assert!(rec.l1_sharers.popcount() <= 1);
            if let Some(l1_core) = rec.l1_sharers.sole_member() {
                debug_assert_eq!(l1_core, core);
                debug_assert_eq!(rec.l1_state, LineState::S);
            }
            rec.owner = Owner::L1;
            rec.l1_state = LineState::M;
            rec.l1_ver = epoch;
            set_sole_sharer(rec, CacheLevel::L1, core, sink);
        } else if rec.owner == Owner::Other {
            // Case 3: clean everywhere; fetch exclusive and dirty L1. The
            // store is tagged with the epoch the receive advances the core
            // to, never with a stale one.
            let recv = rec.other_ver;
            rec.owner = Owner::L1;
            rec.l1_state = LineState::M;
            rec.l1_ver = epoch.max(recv);
            rec.l2_state = LineState::S;
            rec.l2_ver = recv;
            set_sole_sharer(rec, CacheLevel::L1, core, sink);
            set_sole_sharer(rec, CacheLevel::L2, core, sink);
            sink.core_recv(core, recv);
        } else if rec.owner == Owner::L1 {
            // Case 4: another core's L1 owns the line; transfer ownership.
            let prev_owner = sole(rec.l1_sharers, addr);
            debug_assert_ne!(prev_owner, core);
            debug_assert_eq!(sole(rec.l2_sharers, addr), prev_owner);
            debug_assert_eq!(rec.l1_state, LineState::M);
            debug_assert_ne!(rec.l2_state, LineState::I);
            if rec.l2_state == LineState::M && rec.l2_ver != rec.l1_ver {
                debug_assert!(rec.l2_ver < rec.l1_ver);
                sink.evict(addr, prev_owner, rec.l2_ver, cycle, EvictKind::OmcOnly);
            }
            // The transferred version stays dirty in the new core's L2,
            // below the new version the receive advances this core to.
            let recv = rec.l1_ver;
            rec.l2_ver = recv;
            rec.l2_state = LineState::M;
            rec.l1_state = LineState::M;
            rec.l1_ver = epoch.max(recv);
            set_sole_sharer(rec, CacheLevel::L1, core, sink);
            set_sole_sharer(rec, CacheLevel::L2, core, sink);
            sink.core_recv(core, recv);
        } else {
            // Case 5: another core's L2 owns the line; it migrates dirty
            // into this core without a writeback.
            debug_assert_eq!(rec.owner, Owner::L2);
            debug_assert!(!rec.l2_sharers.contains(core));
            debug_assert_eq!(rec.l2_state, LineState::M);
            debug_assert!(rec.l1_sharers.popcount() <= 1);
            let recv = rec.l2_ver;
            rec.owner = Owner::L1;
            rec.l1_state = LineState::M;
            rec.l1_ver = epoch.max(recv);
            set_sole_sharer(rec, CacheLevel::L1, core, sink);
            set_sole_sharer(rec, CacheLevel::L2, core, sink);
            sink.core_recv(core, recv);
        }
    }

    /// `core` evicts the line from its L1.
    pub fn l1_evict<S: CoherenceSink>(&mut self, addr: u64, core: u32, cycle: u64, sink: &mut S) {
        let rec = self.entry(addr);
        debug_assert!(rec.l1_sharers.contains(core) && rec.l2_sharers.contains(core));
        match rec.owner {
            Owner::L1 => {
                // Dirty eviction: ownership falls to this core's L2.
                debug_assert_eq!(sole(rec.l1_sharers, addr), core);
                debug_assert_eq!(rec.l1_state, LineState::M);
                if rec.l2_state == LineState::M && rec.l2_ver != rec.l1_ver {
                    debug_assert!(rec.l2_ver < rec.l1_ver);
                    sink.evict(addr, core, rec.l2_ver, cycle, EvictKind::OmcOnly);
                }
                rec.owner = Owner::L2;
                rec.l1_state = LineState::I;
                rec.l2_state = LineState::M;
                rec.l2_ver = rec.l1_ver;
                remove_sharer(rec, CacheLevel::L1, core, sink);
            }
            Owner::L2 => {
                debug_assert_eq!(sole(rec.l2_sharers, addr), core);
                debug_assert_eq!(rec.l1_state, LineState::S);
                rec.l1_state = LineState::I;
                remove_sharer(rec, CacheLevel::L1, core, sink);
            }
            Owner::Other => {
                remove_sharer(rec, CacheLevel::L1, core, sink);
            }
        }
    }

    /// `core` evicts the line from its inclusive L2 (implies L1 eviction).
    pub fn l2_evict<S: CoherenceSink>(&mut self, addr: u64, core: u32, cycle: u64, sink: &mut S) {
        let rec = self.entry(addr);
        debug_assert!(rec.l2_sharers.contains(core));
        match rec.owner {
            Owner::L1 => {
                debug_assert_eq!(sole(rec.l1_sharers, addr), core);
                debug_assert_eq!(rec.l1_state, LineState::M);
                if rec.l2_state == LineState::M && rec.l2_ver != rec.l1_ver {
                    debug_assert!(rec.l2_ver < rec.l1_ver);
                    sink.evict(addr, core, rec.l2_ver, cycle, EvictKind::OmcOnly);
                }
                sink.evict(addr, core, rec.l1_ver, cycle, EvictKind::OmcAndLlc);
                rec.owner = Owner::Other;
                rec.other_ver = rec.l1_ver;
                remove_sharer(rec, CacheLevel::L1, core, sink);
                remove_sharer(rec, CacheLevel::L2, core, sink);
            }
            Owner::L2 => {
                debug_assert_eq!(sole(rec.l2_sharers, addr), core);
                debug_assert_eq!(rec.l2_state, LineState::M);
                let l1_present = rec.l1_sharers.contains(core);
                sink.evict(addr, core, rec.l2_ver, cycle, EvictKind::OmcAndLlc);
                rec.owner = Owner::Other;
                rec.other_ver = rec.l2_ver;
                if l1_present {
                    remove_sharer(rec, CacheLevel::L1, core, sink);
                }
                remove_sharer(rec, CacheLevel::L2, core, sink);
            }
            Owner::Other => {
                if rec.l1_sharers.contains(core) {
                    remove_sharer(rec, CacheLevel::L1, core, sink);
                }
                remove_sharer(rec, CacheLevel::L2, core, sink);
            }
        }
    }

    /// The inclusive LLC invalidates the line everywhere.
    pub fn l3_evict<S: CoherenceSink>(&mut self, addr: u64, cycle: u64, sink: &mut S) {
        let deferred = {
            let rec = self.entry(addr);
            match rec.owner {
                Owner::Other => {
                    // Every upper-level copy is clean; drop them all.
                    clear_sharers(rec, CacheLevel::L1, sink);
                    clear_sharers(rec, CacheLevel::L2, sink);
                    None
                }
                Owner::L1 | Owner::L2 => {
                    // Exactly one core holds the dirty line; its L2 eviction
                    // path writes it back and clears both levels.
                    let owner_core = sole(rec.l2_sharers, addr);
                    debug_assert!(rec.l1_sharers.popcount() <= 1);
                    if let Some(l1_core) = rec.l1_sharers.sole_member() {
                        debug_assert_eq!(l1_core, owner_core);
                    }
                    Some(owner_core)
                }
            }
        };
        if let Some(owner_core) = deferred {
            self.l2_evict(addr, owner_core, cycle, sink);
        }
    }

    /// Flush versions of this line strictly older than `target_epoch` out
    /// of `core`'s caches. Called by the tag walk for every line in the
    /// core's L2 tag array; never changes sharer membership.
    ///
    /// Returns the number of writebacks emitted.
    pub fn walk_line<S: CoherenceSink>(
        &mut self,
        addr: u64,
        core: u32,
        target_epoch: u64,
        cycle: u64,
        sink: &mut S,
    ) -> u64 {
        let rec = self
            .records
            .get_mut(&addr)
            .unwrap_or_else(|| panic!("tag array holds untracked line {addr:#x}"));
        let mut writebacks = 0;
        match rec.owner {
            Owner::L1 => {
                debug_assert_eq!(sole(rec.l1_sharers, addr), core);
                debug_assert_eq!(rec.l1_state, LineState::M);
                if rec.l1_ver < target_epoch {
                    // Both dirty versions leave; ownership falls to the LLC.
                    rec.owner = Owner::Other;
                    rec.other_ver = rec.l1_ver;
                    rec.l1_state = LineState::S;
                    sink.evict(addr, core, rec.l1_ver, cycle, EvictKind::OmcAndLlc);
                    writebacks += 1;
                    if rec.l2_state == LineState::M && rec.l2_ver != rec.l1_ver {
                        rec.l2_state = LineState::S;
                        sink.evict(addr, core, rec.l2_ver, cycle, EvictKind::OmcAndLlc);
                        writebacks += 1;
                    }
                } else if rec.l2_ver < target_epoch && rec.l2_state == LineState::M {
                    // Only the stale L2 version leaves; L1 keeps ownership.
                    debug_assert!(rec.l2_ver < rec.l1_ver);
                    rec.l2_state = LineState::S;
                    sink.evict(addr, core, rec.l2_ver, cycle, EvictKind::OmcOnly);
                    writebacks += 1;
                }
            }
            Owner::L2 => {
                debug_assert_eq!(sole(rec.l2_sharers, addr), core);
                debug_assert_eq!(rec.l2_state, LineState::M);
                debug_assert_ne!(rec.l1_state, LineState::M);
                if rec.l2_ver < target_epoch {
                    rec.owner = Owner::Other;
                    rec.other_ver = rec.l2_ver;
                    rec.l2_state = LineState::S;
                    sink.evict(addr, core, rec.l2_ver, cycle, EvictKind::OmcAndLlc);
                    writebacks += 1;
                }
            }
            Owner::Other => {}
        }
        writebacks
    }
}
