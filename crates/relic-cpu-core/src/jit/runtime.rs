//! Page-version tracking for self-modifying-code invalidation.

use std::collections::HashMap;

const PAGE_SHIFT: u32 = 12;

/// Per-physical-page version counters.
///
/// Pages containing compiled code are registered; a guest write to a tracked
/// page bumps its version, and every block that recorded the old version is
/// stale before the write is observable by a fetch. A global epoch covers
/// whole-world invalidations (`flush_mmu`, SMM transitions).
#[derive(Default)]
pub struct PageVersionTracker {
    versions: HashMap<u64, u64>,
    epoch: u64,
}

impl PageVersionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page_of(paddr: u64) -> u64 {
        paddr >> PAGE_SHIFT
    }

    /// Marks a page as containing code and returns its current version.
    pub fn track(&mut self, page: u64) -> u64 {
        *self.versions.entry(page).or_insert(1)
    }

    pub fn is_tracked(&self, page: u64) -> bool {
        self.versions.contains_key(&page)
    }

    pub fn version(&self, page: u64) -> u64 {
        self.versions.get(&page).copied().unwrap_or(0)
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Guest write notification. Returns the page key when the write hit a
    /// tracked code page (the caller must invalidate before the next fetch).
    pub fn note_write(&mut self, paddr: u64, len: u32) -> Option<u64> {
        let first = Self::page_of(paddr);
        let last = Self::page_of(paddr + u64::from(len.max(1)) - 1);
        let mut hit = None;
        for page in first..=last {
            if let Some(v) = self.versions.get_mut(&page) {
                *v += 1;
                hit = Some(page);
            }
        }
        hit
    }

    /// Whole-world invalidation.
    pub fn bump_epoch(&mut self) {
        self.epoch += 1;
        self.versions.clear();
    }

    /// True when every recorded `(page, version)` pair still matches.
    pub fn block_is_current(&self, recorded_epoch: u64, pairs: &[(u64, u64)]) -> bool {
        recorded_epoch == self.epoch
            && pairs
                .iter()
                .all(|(page, version)| self.version(*page) == *version)
    }
}
