//! Compiled-block cache keyed by entry physical address, LRU-bounded.

use std::collections::HashMap;

/// `(page, version)` guard recorded at compile time; the block is stale as
/// soon as any listed page's version moves.
pub type PageVersion = (u64, u64);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompiledBlockMeta {
    /// Physical address of the first code byte.
    pub code_paddr: u64,
    pub byte_len: u32,
    pub page_versions: Vec<PageVersion>,
    pub instruction_count: u32,
    /// Ends in MOV SS/STI: the dispatcher must run one more instruction
    /// before sampling interrupts.
    pub inhibit_interrupts_after_block: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledBlockHandle {
    /// Guest EIP of the entry (diagnostics; the key is physical).
    pub entry_rip: u64,
    /// Index into the backend's block table.
    pub table_index: u32,
    pub meta: CompiledBlockMeta,
}

struct Entry {
    handle: CompiledBlockHandle,
    stamp: u64,
}

/// LRU map from entry physical address (plus mode bits folded in by the
/// caller) to compiled blocks.
pub struct CodeCache {
    entries: HashMap<u64, Entry>,
    capacity: usize,
    clock: u64,
    /// Bumped by whole-cache flushes; stale handles compare against it.
    epoch: u64,
}

impl CodeCache {
    pub fn new(capacity: usize, epoch: u64) -> Self {
        assert!(capacity > 0);
        Self {
            entries: HashMap::with_capacity(capacity),
            capacity,
            clock: 0,
            epoch,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn contains(&self, key: u64) -> bool {
        self.entries.contains_key(&key)
    }

    /// Fetches a block and marks it most recently used.
    pub fn get_cloned(&mut self, key: u64) -> Option<CompiledBlockHandle> {
        self.clock += 1;
        let stamp = self.clock;
        let entry = self.entries.get_mut(&key)?;
        entry.stamp = stamp;
        Some(entry.handle.clone())
    }

    /// Inserts a block, evicting least-recently-used entries past capacity.
    /// Returns the evicted keys so the backend can release their storage.
    pub fn insert(&mut self, handle: CompiledBlockHandle) -> Vec<u64> {
        self.clock += 1;
        let key = handle.meta.code_paddr;
        self.entries.insert(
            key,
            Entry {
                handle,
                stamp: self.clock,
            },
        );
        let mut evicted = Vec::new();
        while self.entries.len() > self.capacity {
            let lru = self
                .entries
                .iter()
                .min_by_key(|(_, e)| e.stamp)
                .map(|(k, _)| *k)
                .expect("non-empty cache");
            self.entries.remove(&lru);
            evicted.push(lru);
        }
        evicted
    }

    pub fn remove(&mut self, key: u64) -> Option<CompiledBlockHandle> {
        self.entries.remove(&key).map(|e| e.handle)
    }

    /// Drops every block touching `page`. Returns how many went away.
    pub fn invalidate_page(&mut self, page: u64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| {
            !e.handle
                .meta
                .page_versions
                .iter()
                .any(|(p, _)| *p == page)
        });
        before - self.entries.len()
    }

    /// Whole-cache flush; bumps the epoch so outstanding handles can tell.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.epoch += 1;
    }
}
