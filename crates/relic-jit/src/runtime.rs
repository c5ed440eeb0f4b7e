//! Block cache runtime: promotion, validation, and cached-fetch execution.

use relic_cpu_core::interp::{step, StepOutcome};
use relic_cpu_core::jit::cache::{CodeCache, CompiledBlockHandle, CompiledBlockMeta};
use relic_cpu_core::jit::profile::HotnessProfile;
use relic_cpu_core::jit::runtime::PageVersionTracker;
use relic_cpu_core::state::seg;
use relic_cpu_core::{CpuBus, CpuState, Exception};

use crate::arena::CodeArena;
use crate::compiler::{scan_block, Terminator};

#[derive(Debug, Clone, Copy)]
pub struct JitConfig {
    pub hot_threshold: u32,
    pub profile_capacity: usize,
    pub cache_blocks: usize,
    pub arena_bytes: usize,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            hot_threshold: 16,
            profile_capacity: 4096,
            cache_blocks: 2048,
            arena_bytes: 2 * 1024 * 1024,
        }
    }
}

/// How a cached-block run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    /// Block completed; EIP points at the successor instruction.
    Completed,
    /// The block's own code was overwritten mid-run; the caller resumes in
    /// the interpreter at the current EIP.
    SelfModified,
    Halted,
    /// A fault was delivered (or needs delivering) by the caller.
    Fault(Exception),
}

/// Serves instruction fetches from a validated snapshot while everything
/// else reaches the real bus. Writes that land inside the snapshot range
/// set `dirty` so the runtime can abandon the block before the next fetch
/// would observe stale bytes.
pub struct CachedCodeBus<'a, B> {
    pub inner: &'a mut B,
    code: &'a [u8],
    base_lin: u32,
    dirty: bool,
}

impl<'a, B: CpuBus> CachedCodeBus<'a, B> {
    pub fn new(inner: &'a mut B, code: &'a [u8], base_lin: u32) -> Self {
        Self {
            inner,
            code,
            base_lin,
            dirty: false,
        }
    }

    fn covers(&self, addr: u32) -> bool {
        addr.wrapping_sub(self.base_lin) < self.code.len() as u32
    }

    pub fn dirty(&self) -> bool {
        self.dirty
    }
}

impl<B: CpuBus> CpuBus for CachedCodeBus<'_, B> {
    fn read_u8(&mut self, addr: u32) -> Result<u8, Exception> {
        self.inner.read_u8(addr)
    }

    fn write_u8(&mut self, addr: u32, value: u8) -> Result<(), Exception> {
        if self.covers(addr) {
            self.dirty = true;
        }
        self.inner.write_u8(addr, value)
    }

    fn fetch_u8(&mut self, addr: u32) -> Result<u8, Exception> {
        if !self.dirty && self.covers(addr) {
            return Ok(self.code[addr.wrapping_sub(self.base_lin) as usize]);
        }
        self.inner.fetch_u8(addr)
    }

    fn io_read(&mut self, port: u16, size: u8) -> u32 {
        self.inner.io_read(port, size)
    }

    fn io_write(&mut self, port: u16, size: u8, value: u32) {
        self.inner.io_write(port, size, value)
    }

    fn sync(&mut self, state: &CpuState) {
        self.inner.sync(state)
    }

    fn invlpg(&mut self, addr: u32) {
        self.inner.invlpg(addr)
    }

    fn flush_tlb(&mut self) {
        self.inner.flush_tlb()
    }

    fn smm_changed(&mut self, in_smm: bool) {
        self.inner.smm_changed(in_smm)
    }
}

pub struct JitRuntime {
    cache: CodeCache,
    tracker: PageVersionTracker,
    profile: HotnessProfile,
    arena: CodeArena,
    config: JitConfig,
}

impl JitRuntime {
    pub fn new(config: JitConfig) -> Self {
        Self {
            cache: CodeCache::new(config.cache_blocks, 0),
            tracker: PageVersionTracker::new(),
            profile: HotnessProfile::new(config.hot_threshold, config.profile_capacity),
            arena: CodeArena::new(config.arena_bytes),
            config,
        }
    }

    pub fn tracker(&self) -> &PageVersionTracker {
        &self.tracker
    }

    pub fn cached_blocks(&self) -> usize {
        self.cache.len()
    }

    /// Guest write notification from the bus layer; invalidates guarded
    /// blocks before the write can be fetched.
    pub fn note_write(&mut self, paddr: u64, len: u32) {
        if let Some(page) = self.tracker.note_write(paddr, len) {
            let dropped = self.cache.invalidate_page(page);
            if dropped > 0 {
                log::trace!("code page {page:#x} written; dropped {dropped} blocks");
            }
        }
    }

    /// Whole-world invalidation (`flush_mmu`, SMM entry/exit, mapping-stack
    /// rewrites over code).
    pub fn flush_all(&mut self) {
        self.cache.clear();
        self.tracker.bump_epoch();
        self.profile.clear();
        self.arena.clear();
    }

    /// Cache key: entry physical address with the decode-mode bit folded
    /// into the (otherwise unused) top bit, so a real-mode block and a
    /// 32-bit block at the same address never collide.
    fn cache_key(entry_paddr: u64, code32: bool) -> u64 {
        entry_paddr | (u64::from(code32) << 63)
    }

    fn compile<F: FnMut(u32) -> Option<u8>>(
        &mut self,
        entry_paddr: u64,
        entry_lin: u32,
        code32: bool,
        mut fetch: F,
    ) -> Option<CompiledBlockHandle> {
        let scan = scan_block(&mut fetch, entry_lin, code32);
        if scan.byte_len == 0 || scan.terminator == Terminator::FetchFailed {
            return None;
        }
        let mut image = Vec::with_capacity(scan.byte_len as usize);
        for off in 0..scan.byte_len {
            image.push(fetch(entry_lin.wrapping_add(off))?);
        }

        let offset = match self.arena.store(&image) {
            Ok(offset) => offset,
            Err(err) => {
                // Degrade gracefully: evict the world and retry once.
                log::debug!("code arena full ({err}); evicting all blocks");
                self.flush_all();
                self.arena.store(&image).ok()?
            }
        };

        let first_page = PageVersionTracker::page_of(entry_paddr);
        let last_page = PageVersionTracker::page_of(entry_paddr + u64::from(scan.byte_len) - 1);
        let mut page_versions = Vec::new();
        for page in first_page..=last_page {
            let version = self.tracker.track(page);
            page_versions.push((page, version));
        }

        let handle = CompiledBlockHandle {
            entry_rip: u64::from(entry_lin),
            table_index: offset,
            meta: CompiledBlockMeta {
                code_paddr: Self::cache_key(entry_paddr, code32),
                byte_len: scan.byte_len,
                page_versions,
                instruction_count: scan.instruction_count,
                inhibit_interrupts_after_block: scan.ends_with_inhibit,
            },
        };
        self.cache.insert(handle.clone());
        Some(handle)
    }

    /// Looks up (or, past the hotness threshold, compiles) a block for the
    /// entry point. `fetch` resolves already-translated code bytes.
    pub fn lookup_or_compile<F: FnMut(u32) -> Option<u8>>(
        &mut self,
        entry_paddr: u64,
        entry_lin: u32,
        code32: bool,
        fetch: F,
    ) -> Option<CompiledBlockHandle> {
        let key = Self::cache_key(entry_paddr, code32);
        if let Some(handle) = self.cache.get_cloned(key) {
            if self
                .tracker
                .block_is_current(self.cache_epoch_of(&handle), &handle.meta.page_versions)
            {
                return Some(handle);
            }
            self.cache.remove(key);
        }
        if !self.profile.bump(key) {
            return None;
        }
        self.profile.reset(key);
        self.compile(entry_paddr, entry_lin, code32, fetch)
    }

    fn cache_epoch_of(&self, _handle: &CompiledBlockHandle) -> u64 {
        // Handles never outlive an epoch bump because `flush_all` clears the
        // cache; the tracker's current epoch is therefore always right.
        self.tracker.epoch()
    }

    /// Executes a validated block with cached fetches. The interpreter
    /// still performs every architectural check; only the fetch path is
    /// shortened.
    pub fn run_block<B: CpuBus>(
        &mut self,
        state: &mut CpuState,
        bus: &mut B,
        handle: &CompiledBlockHandle,
    ) -> RunExit {
        let code = self
            .arena
            .get(handle.table_index, handle.meta.byte_len)
            .to_vec();
        let base_lin = handle.entry_rip as u32;
        let mut cached = CachedCodeBus::new(bus, &code, base_lin);

        for _ in 0..handle.meta.instruction_count {
            match step(state, &mut cached) {
                Ok(StepOutcome::Halted) => return RunExit::Halted,
                Ok(StepOutcome::Normal) => {}
                Err(exc) => return RunExit::Fault(exc),
            }
            if cached.dirty() {
                return RunExit::SelfModified;
            }
            let lin = state.segs[seg::CS].base.wrapping_add(state.eip);
            if lin.wrapping_sub(base_lin) >= handle.meta.byte_len {
                // Left the block early (branch taken, REP yield).
                return RunExit::Completed;
            }
        }
        RunExit::Completed
    }
}
