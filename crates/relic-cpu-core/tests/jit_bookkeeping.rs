use relic_cpu_core::jit::cache::{CodeCache, CompiledBlockHandle, CompiledBlockMeta};
use relic_cpu_core::jit::profile::HotnessProfile;
use relic_cpu_core::jit::runtime::PageVersionTracker;

fn handle(entry: u64) -> CompiledBlockHandle {
    CompiledBlockHandle {
        entry_rip: entry,
        table_index: entry as u32,
        meta: CompiledBlockMeta {
            code_paddr: entry,
            byte_len: 1,
            page_versions: vec![(entry >> 12, 1)],
            instruction_count: 1,
            inhibit_interrupts_after_block: false,
        },
    }
}

#[test]
fn code_cache_get_cloned_updates_recency() {
    let mut cache = CodeCache::new(3, 0);
    assert!(cache.insert(handle(0)).is_empty());
    assert!(cache.insert(handle(1)).is_empty());
    assert!(cache.insert(handle(2)).is_empty());

    // Touch the LRU entry to make it MRU; the next insert should evict `1`,
    // not `0`.
    assert!(cache.get_cloned(0).is_some());

    let evicted = cache.insert(handle(3));
    assert_eq!(evicted, vec![1]);
    assert!(cache.contains(0));
    assert!(!cache.contains(1));
    assert!(cache.contains(2));
    assert!(cache.contains(3));
}

#[test]
fn code_cache_invalidate_page_drops_guarded_blocks() {
    let mut cache = CodeCache::new(8, 0);
    cache.insert(handle(0x1000));
    cache.insert(handle(0x1800));
    cache.insert(handle(0x3000));

    // 0x1000 and 0x1800 share page 1.
    assert_eq!(cache.invalidate_page(1), 2);
    assert!(!cache.contains(0x1000));
    assert!(!cache.contains(0x1800));
    assert!(cache.contains(0x3000));
}

#[test]
fn code_cache_clear_bumps_epoch() {
    let mut cache = CodeCache::new(2, 7);
    cache.insert(handle(0));
    assert_eq!(cache.epoch(), 7);
    cache.clear();
    assert_eq!(cache.epoch(), 8);
    assert!(cache.is_empty());
}

#[test]
fn page_version_tracker_detects_code_page_writes() {
    let mut tracker = PageVersionTracker::new();
    let page = PageVersionTracker::page_of(0x1234);
    let v = tracker.track(page);
    assert_eq!(v, 1);

    // A write elsewhere does not touch the guard.
    assert_eq!(tracker.note_write(0x5000, 4), None);
    assert!(tracker.block_is_current(tracker.epoch(), &[(page, v)]));

    // A write into the tracked page invalidates before the next fetch.
    assert_eq!(tracker.note_write(0x1FF0, 4), Some(page));
    assert!(!tracker.block_is_current(tracker.epoch(), &[(page, v)]));
}

#[test]
fn page_version_tracker_straddling_write_hits_both_pages() {
    let mut tracker = PageVersionTracker::new();
    let v1 = tracker.track(1);
    let v2 = tracker.track(2);

    // A 4-byte write across the 1→2 page boundary bumps both.
    tracker.note_write(0x1FFE, 4);
    assert!(!tracker.block_is_current(tracker.epoch(), &[(1, v1)]));
    assert!(!tracker.block_is_current(tracker.epoch(), &[(2, v2)]));
}

#[test]
fn epoch_bump_invalidates_everything() {
    let mut tracker = PageVersionTracker::new();
    let v = tracker.track(9);
    let epoch = tracker.epoch();
    tracker.bump_epoch();
    assert!(!tracker.block_is_current(epoch, &[(9, v)]));
    assert!(!tracker.is_tracked(9));
}

#[test]
fn hotness_profile_promotes_at_threshold_once() {
    let mut profile = HotnessProfile::new(3, 16);
    assert!(!profile.bump(0x7C00));
    assert!(!profile.bump(0x7C00));
    assert!(profile.bump(0x7C00), "third execution crosses the threshold");
    assert!(!profile.bump(0x7C00), "promotion reported exactly once");

    profile.reset(0x7C00);
    assert!(!profile.bump(0x7C00));
}

#[test]
fn hotness_profile_respects_capacity() {
    let mut profile = HotnessProfile::new(2, 4);
    for entry in 0..4u64 {
        profile.bump(entry);
    }
    assert_eq!(profile.len(), 4);
    // A fifth entry forces decay; single-count entries vanish.
    profile.bump(100);
    assert!(profile.len() <= 4);
}
