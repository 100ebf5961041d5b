//! Statistics snapshots.
//!
//! The simulator is observational: on termination (or at any point in
//! between) the host reads a [`SimStats`] snapshot aggregating every
//! component's counters. All snapshot types serialize with serde so hosts
//! can dump them in whatever format they log.

use serde::{Deserialize, Serialize};

/// Per-core event and epoch counters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreStats {
    /// Load events dispatched on this core.
    pub loads: u64,
    /// Store events dispatched on this core.
    pub stores: u64,
    /// L1 eviction events dispatched on this core.
    pub l1_evicts: u64,
    /// L2 eviction events dispatched on this core.
    pub l2_evicts: u64,
    /// L3 eviction events dispatched on this core.
    pub l3_evicts: u64,
    /// The core's current epoch.
    pub epoch: u64,
    /// Stores since the last epoch advance.
    pub epoch_store_count: u64,
    /// Stores over the whole run.
    pub total_store_count: u64,
    /// Epoch of the core's last tag walk.
    pub last_walk_epoch: u64,
    /// Writebacks emitted by this core's tag walks.
    pub tag_walk_evict_count: u64,
}

/// Epoch-advance accounting across all cores.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochStats {
    /// Epoch advances of any kind.
    pub total_advances: u64,
    /// Advances caused by receiving a newer version over coherence.
    pub coherence_advances: u64,
    /// Coherence advances that jumped more than one epoch.
    pub skipped_epochs: u64,
    /// Largest epoch below which every store is merged into the mapping table.
    pub last_stable_epoch: u64,
}

/// Write-combining buffer counters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OmcBufStats {
    /// Insert operations.
    pub accesses: u64,
    /// Inserts absorbed by an existing `(tag, epoch)` entry.
    pub hits: u64,
    /// Inserts that filled or displaced a way.
    pub misses: u64,
    /// Displacements pushed down into the overlay.
    pub evictions: u64,
    /// Entries force-flushed ahead of a stable-epoch merge.
    pub drains: u64,
}

/// Overlay store counters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlayStats {
    /// Epochs currently holding at least one page.
    pub active_epochs: u64,
    /// Epochs ever created.
    pub epochs_created: u64,
    /// Epochs reclaimed after their last page was unlinked.
    pub epochs_gced: u64,
    /// Aggregate size of live overlay pages in bytes.
    pub size_bytes: u64,
}

/// Overlay mapping table counters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OmtStats {
    /// Modeled durable writes charged to merges.
    pub writes: u64,
    /// Index pages allocated.
    pub index_pages: u64,
    /// Modeled byte size of the index.
    pub index_bytes: u64,
}

/// NVM timing counters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NvmStats {
    /// Reads scheduled.
    pub reads: u64,
    /// Reads that found their bank idle.
    pub uncontended_reads: u64,
    /// Writes scheduled.
    pub writes: u64,
    /// Writes that found their bank idle.
    pub uncontended_writes: u64,
    /// Cycle at which every bank has drained.
    pub sync_cycle: u64,
    /// Earliest bank busy-until cycle.
    pub min_cycle: u64,
}

/// Full simulator snapshot.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimStats {
    /// Per-core counters, indexed by core id.
    pub cores: Vec<CoreStats>,
    /// Epoch-advance accounting.
    pub epochs: EpochStats,
    /// Lines the coherence engine pushed into the write-combining buffer.
    pub coherence_writebacks: u64,
    /// Writebacks that also left the simulated LLC.
    pub llc_evictions: u64,
    /// Write-combining buffer counters.
    pub omcbuf: OmcBufStats,
    /// Overlay store counters.
    pub overlay: OverlayStats,
    /// Mapping table counters.
    pub omt: OmtStats,
    /// NVM timing counters.
    pub nvm: NvmStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_serialize_round_trip() {
        let mut stats = SimStats::default();
        stats.cores.push(CoreStats { loads: 3, stores: 7, ..Default::default() });
        stats.epochs.last_stable_epoch = 2;
        let json = serde_json::to_string(&stats).expect("serialize");
        let back: SimStats = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, stats);
    }
}
