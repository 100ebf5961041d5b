//! Per-epoch overlay storage with size-class accounting.
//!
//! Every writeback that leaves the write-combining buffer lands in the
//! overlay epoch it was tagged with, as one presence bit in a per-page
//! 64-line bitmap. A page's modeled byte size is the smallest class from
//! {256, 512, 1024, 2048, 4096} that holds its line count at 128 bytes per
//! line, so the size only steps when the population crosses 4, 8, 16 or 32
//! lines.
//!
//! When an epoch becomes stable it merges: every present line is pointed
//! at this epoch in the mapping table, unlinking whatever epoch owned the
//! line before. Page reference counts track how many mapping-table leaves
//! will resolve into the page; a page whose count reaches zero is
//! reclaimed, and an epoch whose last page is reclaimed is dropped.

use std::collections::HashMap;

use tracing::debug;

use crate::addr::{self, assert_line_aligned, assert_page_aligned};
use crate::bitmap::Bitmap64;
use crate::omt::Omt;
use crate::radix::{LevelSpec, RadixMap};
use crate::stats::OverlayStats;

/// Page-number index shape for the per-epoch page map.
const EPOCH_LEVELS: [LevelSpec; 4] = [
    LevelSpec { start_bit: 39, bits: 9 },
    LevelSpec { start_bit: 30, bits: 9 },
    LevelSpec { start_bit: 21, bits: 9 },
    LevelSpec { start_bit: 12, bits: 9 },
];

/// Modeled byte size of an overlay page holding `line_count` lines.
pub fn page_size_class(line_count: u32) -> u64 {
    debug_assert!(line_count <= addr::LINES_PER_PAGE);
    match line_count {
        0..=3 => 256,
        4..=7 => 512,
        8..=15 => 1024,
        16..=31 => 2048,
        _ => 4096,
    }
}

/// One 4 KiB page's worth of overlay state within a single epoch.
pub struct OverlayPage {
    bitmap: Bitmap64,
    ref_count: u32,
}

impl OverlayPage {
    fn new() -> Self {
        OverlayPage { bitmap: Bitmap64::new(), ref_count: 0 }
    }

    /// Presence bitmap over the page's 64 line slots.
    pub fn bitmap(&self) -> Bitmap64 {
        self.bitmap
    }

    /// Number of mapping-table leaves that resolve into this page.
    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }
}

/// All overlay pages written during one epoch.
pub struct OverlayEpoch {
    epoch: u64,
    pages: RadixMap<OverlayPage>,
    page_count: u64,
    size: u64,
    merged: bool,
}

impl OverlayEpoch {
    fn new(epoch: u64) -> Self {
        OverlayEpoch {
            epoch,
            pages: RadixMap::new(&EPOCH_LEVELS),
            page_count: 0,
            size: 0,
            merged: false,
        }
    }

    /// Record `line_addr` as written in this epoch.
    ///
    /// Returns the bytes the page grew by (zero unless the new population
    /// crossed a size-class boundary). Re-writing an already present line
    /// changes nothing, including the reference count.
    fn insert(&mut self, line_addr: u64) -> u64 {
        let page_addr = addr::page_of(line_addr);
        let slot = self.pages.insert(page_addr);
        if slot.is_none() {
            *slot = Some(OverlayPage::new());
            self.page_count += 1;
        }
        let page = slot.as_mut().expect("page just materialized");
        let offset = addr::line_offset(line_addr);
        if page.bitmap.contains(offset) {
            return 0;
        }
        let before = page.bitmap.popcount();
        page.bitmap.add(offset);
        page.ref_count += 1;
        let grown = match before {
            0 => 256,
            3 => 256,
            7 => 512,
            15 => 1024,
            31 => 2048,
            _ => 0,
        };
        self.size += grown;
        grown
    }

    /// The epoch number this container belongs to.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Pages currently live in this epoch.
    pub fn page_count(&self) -> u64 {
        self.page_count
    }

    /// Modeled byte size of this epoch's live pages.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Whether the epoch has merged into the mapping table.
    pub fn is_merged(&self) -> bool {
        self.merged
    }

    /// Look up the page at `page_addr`.
    pub fn page(&self, page_addr: u64) -> Option<&OverlayPage> {
        assert_page_aligned(page_addr);
        self.pages.find(page_addr)
    }

    /// Total lines present across all pages.
    pub fn line_count(&self) -> u64 {
        let mut count = 0u64;
        self.pages.traverse(|_, page| count += page.bitmap.popcount() as u64);
        count
    }

    /// Visit every live page as `(page_addr, page)`, in address order.
    pub fn for_each_page<F: FnMut(u64, &OverlayPage)>(&self, mut cb: F) {
        self.pages.traverse(|page_addr, page| cb(page_addr, page));
    }

    /// Every present line address, in address order.
    fn lines(&self) -> Vec<u64> {
        let mut lines = Vec::new();
        self.pages.traverse(|page_addr, page| {
            for offset in page.bitmap.iter() {
                lines.push(addr::line_in_page(page_addr, offset));
            }
        });
        lines
    }
}

/// The overlay store: epoch number to [`OverlayEpoch`].
pub struct Overlay {
    epochs: HashMap<u64, OverlayEpoch>,
    size: u64,
    epoch_count: u64,
    epoch_init_count: u64,
    epoch_gc_count: u64,
}

impl Default for Overlay {
    fn default() -> Self {
        Self::new()
    }
}

impl Overlay {
    /// Create an empty overlay.
    pub fn new() -> Self {
        Overlay {
            epochs: HashMap::new(),
            size: 0,
            epoch_count: 0,
            epoch_init_count: 0,
            epoch_gc_count: 0,
        }
    }

    /// Record a writeback of `line_addr` tagged with `epoch`.
    ///
    /// # Panics
    ///
    /// Panics if the target epoch has already merged: a merged epoch is
    /// immutable, and a late writeback into it means version history has
    /// been lost upstream.
    pub fn insert(&mut self, line_addr: u64, epoch: u64) {
        assert_line_aligned(line_addr);
        let entry = self.epochs.entry(epoch).or_insert_with(|| {
            self.epoch_init_count += 1;
            self.epoch_count += 1;
            OverlayEpoch::new(epoch)
        });
        if entry.merged {
            panic!("overlay epoch {epoch} has merged; writeback of {line_addr:#x} is lost history");
        }
        self.size += entry.insert(line_addr);
    }

    /// Merge `epoch` into the mapping table when it becomes stable.
    ///
    /// Every present line is pointed at this epoch in `omt`; lines that
    /// displace an older owner unlink one reference from the older epoch's
    /// page, garbage-collecting pages and epochs whose counts drain.
    ///
    /// Merging an epoch with no recorded writebacks is a no-op so callers
    /// can sweep epoch ranges; merging the same epoch twice panics.
    pub fn epoch_merge(&mut self, epoch: u64, omt: &mut Omt) {
        let Some(entry) = self.epochs.get_mut(&epoch) else {
            return;
        };
        if entry.merged {
            panic!("overlay epoch {epoch} merged twice");
        }
        entry.merged = true;
        let lines = entry.lines();
        debug!(epoch, lines = lines.len(), "merging overlay epoch");
        for line_addr in lines {
            if let Some(prior) = omt.merge_line(epoch, line_addr) {
                self.unlink_line(prior, addr::page_of(line_addr));
            }
        }
    }

    /// Drop one mapping-table reference into `epoch`'s page at `page_addr`.
    fn unlink_line(&mut self, epoch: u64, page_addr: u64) {
        assert_page_aligned(page_addr);
        let entry = self
            .epochs
            .get_mut(&epoch)
            .unwrap_or_else(|| panic!("unlink into missing overlay epoch {epoch}"));
        let page = entry
            .pages
            .find_mut(page_addr)
            .unwrap_or_else(|| panic!("unlink of missing overlay page {page_addr:#x} @ {epoch}"));
        assert!(page.ref_count > 0, "overlay page {page_addr:#x} @ {epoch} over-unlinked");
        page.ref_count -= 1;
        if page.ref_count > 0 {
            return;
        }
        // Page drained: reclaim it and, if it was the last, the epoch.
        let line_count = page.bitmap.popcount();
        let page_size = page_size_class(line_count);
        entry.pages.remove(page_addr);
        entry.page_count -= 1;
        entry.size -= page_size;
        self.size -= page_size;
        if entry.page_count == 0 {
            debug_assert_eq!(entry.size, 0);
            self.epochs.remove(&epoch);
            self.epoch_count -= 1;
            self.epoch_gc_count += 1;
            debug!(epoch, "overlay epoch reclaimed");
        }
    }

    /// Look up an epoch's container.
    pub fn epoch(&self, epoch: u64) -> Option<&OverlayEpoch> {
        self.epochs.get(&epoch)
    }

    /// All live epoch containers, in no particular order.
    pub fn epochs(&self) -> impl Iterator<Item = &OverlayEpoch> {
        self.epochs.values()
    }

    /// Aggregate size of live pages in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Number of epochs currently holding pages.
    pub fn epoch_count(&self) -> u64 {
        self.epoch_count
    }

    /// Sum of page reference counts across all epochs.
    pub fn total_ref_count(&self) -> u64 {
        let mut total = 0u64;
        for entry in self.epochs.values() {
            entry.pages.traverse(|_, page| total += page.ref_count as u64);
        }
        total
    }

    /// Counter snapshot.
    pub fn stats(&self) -> OverlayStats {
        OverlayStats {
            active_epochs: self.epoch_count,
            epochs_created: self.epoch_init_count,
            epochs_gced: self.epoch_gc_count,
            size_bytes: self.size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_class_boundaries() {
        assert_eq!(page_size_class(0), 256);
        assert_eq!(page_size_class(3), 256);
        assert_eq!(page_size_class(4), 512);
        assert_eq!(page_size_class(8), 1024);
        assert_eq!(page_size_class(16), 2048);
        assert_eq!(page_size_class(31), 2048);
        assert_eq!(page_size_class(32), 4096);
        assert_eq!(page_size_class(64), 4096);
    }

    #[test]
    fn test_first_line_costs_base_class() {
        let mut overlay = Overlay::new();
        overlay.insert(0x1000, 0);
        assert_eq!(overlay.size(), 256);
        let entry = overlay.epoch(0).expect("epoch exists");
        assert_eq!(entry.page_count(), 1);
        assert_eq!(entry.line_count(), 1);
    }

    #[test]
    fn test_fourth_line_grows_page_by_256() {
        let mut overlay = Overlay::new();
        for i in 0..3u64 {
            overlay.insert(0x1000 + i * 64, 0);
        }
        assert_eq!(overlay.size(), 256);
        overlay.insert(0x10C0, 0);
        assert_eq!(overlay.size(), 512);
    }

    #[test]
    fn test_rewrite_changes_nothing() {
        let mut overlay = Overlay::new();
        overlay.insert(0x1000, 0);
        overlay.insert(0x1000, 0);
        assert_eq!(overlay.size(), 256);
        let page = overlay.epoch(0).unwrap().page(0x1000).unwrap();
        assert_eq!(page.ref_count(), 1);
        assert_eq!(page.bitmap().popcount(), 1);
    }

    #[test]
    fn test_merge_populates_mapping_table() {
        let mut overlay = Overlay::new();
        let mut omt = Omt::new();
        overlay.insert(0x1000, 0);
        overlay.insert(0x2040, 0);
        overlay.epoch_merge(0, &mut omt);
        assert!(overlay.epoch(0).unwrap().is_merged());
        assert_eq!(omt.find(0x1000), Some(0));
        assert_eq!(omt.find(0x2040), Some(0));
        assert_eq!(omt.mapped_lines(), 2);
        assert_eq!(overlay.total_ref_count(), 2);
    }

    #[test]
    fn test_merge_of_absent_epoch_is_noop() {
        let mut overlay = Overlay::new();
        let mut omt = Omt::new();
        overlay.epoch_merge(17, &mut omt);
        assert_eq!(omt.mapped_lines(), 0);
    }

    #[test]
    #[should_panic(expected = "merged twice")]
    fn test_double_merge_panics() {
        let mut overlay = Overlay::new();
        let mut omt = Omt::new();
        overlay.insert(0x1000, 0);
        overlay.epoch_merge(0, &mut omt);
        overlay.epoch_merge(0, &mut omt);
    }

    #[test]
    #[should_panic(expected = "has merged")]
    fn test_insert_after_merge_panics() {
        let mut overlay = Overlay::new();
        let mut omt = Omt::new();
        overlay.insert(0x1000, 0);
        overlay.epoch_merge(0, &mut omt);
        overlay.insert(0x1040, 0);
    }

    #[test]
    fn test_newer_merge_unlinks_and_collects_older_epoch() {
        let mut overlay = Overlay::new();
        let mut omt = Omt::new();
        overlay.insert(0x1000, 0);
        overlay.epoch_merge(0, &mut omt);
        assert_eq!(overlay.epoch_count(), 1);

        // The same line written again in epoch 1 displaces epoch 0's claim.
        overlay.insert(0x1000, 1);
        overlay.epoch_merge(1, &mut omt);
        assert_eq!(omt.find(0x1000), Some(1));
        // Epoch 0's only page drained, so the whole epoch is gone.
        assert!(overlay.epoch(0).is_none());
        assert_eq!(overlay.epoch_count(), 1);
        assert_eq!(overlay.stats().epochs_gced, 1);
        assert_eq!(overlay.size(), 256);
        assert_eq!(overlay.total_ref_count(), 1);
    }

    #[test]
    fn test_partial_unlink_keeps_page() {
        let mut overlay = Overlay::new();
        let mut omt = Omt::new();
        overlay.insert(0x1000, 0);
        overlay.insert(0x1040, 0);
        overlay.epoch_merge(0, &mut omt);

        overlay.insert(0x1000, 1);
        overlay.epoch_merge(1, &mut omt);
        let page = overlay.epoch(0).unwrap().page(0x1000).unwrap();
        assert_eq!(page.ref_count(), 1);
        // The page keeps its size class until fully drained.
        assert_eq!(overlay.epoch(0).unwrap().size(), 256);
    }
}
