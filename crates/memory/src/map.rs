use std::cell::RefCell;
use std::rc::Rc;

use bitflags::bitflags;

use crate::guest::GuestMemory;

pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;
pub const PAGE_MASK: u64 = PAGE_SIZE - 1;

// The guest physical address space is 32-bit; the LUT covers all of it.
const ADDR_BITS: u32 = 32;
const NUM_PAGES: usize = 1 << (ADDR_BITS - PAGE_SHIFT);

bitflags! {
    /// Per-page access routing flags.
    ///
    /// `INTERNAL` routes to DRAM, `EXTANY` to the external mapping stack
    /// (ROM or MMIO), `DISABLED` to open bus. Read and write sides are
    /// independent, which is what makes write-through shadow setups (read
    /// ROM, write DRAM) expressible.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MemAccess: u8 {
        const READ_INTERNAL  = 1 << 0;
        const READ_EXTANY    = 1 << 1;
        const READ_DISABLED  = 1 << 2;
        const WRITE_INTERNAL = 1 << 3;
        const WRITE_EXTANY   = 1 << 4;
        const WRITE_DISABLED = 1 << 5;
    }
}

impl MemAccess {
    pub const RAM: MemAccess = MemAccess::READ_INTERNAL.union(MemAccess::WRITE_INTERNAL);
    pub const EXTERNAL: MemAccess = MemAccess::READ_EXTANY.union(MemAccess::WRITE_EXTANY);
    pub const DISABLED: MemAccess = MemAccess::READ_DISABLED.union(MemAccess::WRITE_DISABLED);
}

/// Memory-mapped I/O region handler. `size` is 1, 2 or 4; accesses are
/// aligned to `size` or they arrive decomposed into bytes.
pub trait MmioHandler {
    fn mmio_read(&mut self, addr: u64, size: u8) -> u32;
    fn mmio_write(&mut self, addr: u64, size: u8, value: u32);
}

/// What services a mapping's extent.
pub enum Backing {
    /// Internal DRAM at `ram_offset + (addr - base)`.
    Internal { ram_offset: u64 },
    /// Read-only bytes; writes are swallowed.
    Rom(Rc<RefCell<Vec<u8>>>),
    /// Dispatch to a device model.
    Mmio(Rc<RefCell<dyn MmioHandler>>),
}

impl Backing {
    fn is_internal(&self) -> bool {
        matches!(self, Backing::Internal { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MappingId(usize);

struct Mapping {
    base: u64,
    size: u64,
    backing: Backing,
    enabled: bool,
    dead: bool,
}

impl Mapping {
    fn covers(&self, addr: u64) -> bool {
        self.enabled && !self.dead && addr >= self.base && addr < self.base + self.size
    }
}

/// A physical range whose derived state (TLB entries, JIT guards) must be
/// dropped. Produced by every LUT rewrite and drained by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapChange {
    pub base: u64,
    pub size: u64,
}

#[derive(Clone, Copy)]
enum Route {
    Open,
    /// Absolute offset of the page start inside guest RAM.
    Ram(u64),
    /// Index into the mapping stack.
    Ext(u32),
}

/// The layered physical memory map.
pub struct MemoryMap {
    ram: Box<dyn GuestMemory>,
    mappings: Vec<Mapping>,
    read_lut: Vec<Route>,
    write_lut: Vec<Route>,
    access: Vec<MemAccess>,
    a20_enabled: bool,
    changes: Vec<MapChange>,
}

impl MemoryMap {
    /// Builds a map over `ram` with a base internal mapping covering all of
    /// it. Pages beyond RAM default to the external mapping stack.
    pub fn new(ram: Box<dyn GuestMemory>) -> Self {
        let ram_size = ram.size();
        let mut map = Self {
            ram,
            mappings: Vec::new(),
            read_lut: vec![Route::Open; NUM_PAGES],
            write_lut: vec![Route::Open; NUM_PAGES],
            access: vec![MemAccess::EXTERNAL; NUM_PAGES],
            a20_enabled: false,
            changes: Vec::new(),
        };
        let ram_pages = (ram_size >> PAGE_SHIFT) as usize;
        for page in 0..ram_pages.min(NUM_PAGES) {
            map.access[page] = MemAccess::RAM;
        }
        map.add_internal(0, ram_size, 0);
        map
    }

    pub fn ram(&self) -> &dyn GuestMemory {
        &*self.ram
    }

    pub fn ram_mut(&mut self) -> &mut dyn GuestMemory {
        &mut *self.ram
    }

    // ------------------------------------------------------------------
    // Mapping stack
    // ------------------------------------------------------------------

    fn push_mapping(&mut self, mapping: Mapping) -> MappingId {
        let base = mapping.base;
        let size = mapping.size;
        self.mappings.push(mapping);
        let id = MappingId(self.mappings.len() - 1);
        self.recalc(base, size);
        id
    }

    pub fn add_internal(&mut self, base: u64, size: u64, ram_offset: u64) -> MappingId {
        self.push_mapping(Mapping {
            base,
            size,
            backing: Backing::Internal { ram_offset },
            enabled: true,
            dead: false,
        })
    }

    pub fn add_rom(&mut self, base: u64, data: Rc<RefCell<Vec<u8>>>) -> MappingId {
        let size = data.borrow().len() as u64;
        self.push_mapping(Mapping {
            base,
            size,
            backing: Backing::Rom(data),
            enabled: true,
            dead: false,
        })
    }

    pub fn add_mmio(
        &mut self,
        base: u64,
        size: u64,
        handler: Rc<RefCell<dyn MmioHandler>>,
    ) -> MappingId {
        self.push_mapping(Mapping {
            base,
            size,
            backing: Backing::Mmio(handler),
            enabled: true,
            dead: false,
        })
    }

    pub fn set_enabled(&mut self, id: MappingId, enabled: bool) {
        let m = &mut self.mappings[id.0];
        if m.enabled == enabled {
            return;
        }
        m.enabled = enabled;
        let (base, size) = (m.base, m.size);
        self.recalc(base, size);
    }

    pub fn set_addr(&mut self, id: MappingId, new_base: u64) {
        let m = &mut self.mappings[id.0];
        let (old_base, size) = (m.base, m.size);
        if old_base == new_base {
            return;
        }
        m.base = new_base;
        self.recalc(old_base, size);
        self.recalc(new_base, size);
    }

    /// Destroys a mapping. Double removal is a bug in the caller, not a
    /// runtime condition.
    pub fn remove(&mut self, id: MappingId) {
        let m = &mut self.mappings[id.0];
        if m.dead {
            log::error!(
                "memory mapping {:?} removed twice (base {:#x}, size {:#x})",
                id,
                m.base,
                m.size
            );
            panic!("double free of memory mapping");
        }
        m.dead = true;
        m.enabled = false;
        let (base, size) = (m.base, m.size);
        self.recalc(base, size);
    }

    /// Sets the access-mode flag set for every page in `[base, base+size)`.
    pub fn set_access(&mut self, base: u64, size: u64, access: MemAccess) {
        let first = (base >> PAGE_SHIFT) as usize;
        let last = ((base + size - 1) >> PAGE_SHIFT) as usize;
        for page in first..=last.min(NUM_PAGES - 1) {
            self.access[page] = access;
        }
        self.recalc(base, size);
    }

    pub fn access_at(&self, addr: u64) -> MemAccess {
        self.access[(addr >> PAGE_SHIFT) as usize & (NUM_PAGES - 1)]
    }

    /// Re-derives the LUT for every page covered by `[base, base+size)` by
    /// walking the mapping stack top-down, and records the range for
    /// downstream invalidation (TLB, JIT guards).
    pub fn recalc(&mut self, base: u64, size: u64) {
        if size == 0 {
            return;
        }
        let first = (base >> PAGE_SHIFT) as usize;
        let last = ((base + size - 1) >> PAGE_SHIFT) as usize;
        for page in first..=last.min(NUM_PAGES - 1) {
            self.recalc_page(page);
        }
        self.changes.push(MapChange { base, size });
    }

    fn top_mapping(&self, addr: u64, internal: bool) -> Option<u32> {
        self.mappings
            .iter()
            .enumerate()
            .rev()
            .find(|(_, m)| m.covers(addr) && m.backing.is_internal() == internal)
            .map(|(idx, _)| idx as u32)
    }

    fn route_for(&self, page_base: u64, internal: bool, disabled: bool) -> Route {
        if disabled {
            return Route::Open;
        }
        match self.top_mapping(page_base, internal) {
            Some(idx) if internal => {
                let m = &self.mappings[idx as usize];
                let Backing::Internal { ram_offset } = &m.backing else {
                    unreachable!()
                };
                Route::Ram(*ram_offset + (page_base - m.base))
            }
            Some(idx) => Route::Ext(idx),
            None => Route::Open,
        }
    }

    fn recalc_page(&mut self, page: usize) {
        let page_base = (page as u64) << PAGE_SHIFT;
        let access = self.access[page];

        self.read_lut[page] = self.route_for(
            page_base,
            access.contains(MemAccess::READ_INTERNAL),
            access.contains(MemAccess::READ_DISABLED),
        );
        self.write_lut[page] = self.route_for(
            page_base,
            access.contains(MemAccess::WRITE_INTERNAL),
            access.contains(MemAccess::WRITE_DISABLED),
        );
    }

    /// Drains the accumulated invalidation ranges.
    pub fn take_changes(&mut self) -> Vec<MapChange> {
        std::mem::take(&mut self.changes)
    }

    // ------------------------------------------------------------------
    // A20
    // ------------------------------------------------------------------

    pub fn set_a20_enabled(&mut self, enabled: bool) {
        if self.a20_enabled != enabled {
            self.a20_enabled = enabled;
            // Every linear alias above 1M changes meaning.
            self.changes.push(MapChange {
                base: 0x10_0000,
                size: (1u64 << ADDR_BITS) - 0x10_0000,
            });
        }
    }

    pub fn a20_enabled(&self) -> bool {
        self.a20_enabled
    }

    #[inline]
    fn mask(&self, addr: u64) -> u64 {
        let addr = addr & ((1u64 << ADDR_BITS) - 1);
        if self.a20_enabled {
            addr
        } else {
            addr & !(1 << 20)
        }
    }

    // ------------------------------------------------------------------
    // Access
    // ------------------------------------------------------------------

    pub fn read_u8(&mut self, addr: u64) -> u8 {
        let addr = self.mask(addr);
        match self.read_lut[(addr >> PAGE_SHIFT) as usize] {
            Route::Open => 0xFF,
            Route::Ram(page_off) => {
                let mut b = [0u8; 1];
                let _ = self.ram.read_into(page_off + (addr & PAGE_MASK), &mut b);
                b[0]
            }
            Route::Ext(idx) => self.ext_read(idx, addr, 1) as u8,
        }
    }

    pub fn write_u8(&mut self, addr: u64, value: u8) {
        let addr = self.mask(addr);
        match self.write_lut[(addr >> PAGE_SHIFT) as usize] {
            Route::Open => {}
            Route::Ram(page_off) => {
                let _ = self.ram.write_from(page_off + (addr & PAGE_MASK), &[value]);
            }
            Route::Ext(idx) => self.ext_write(idx, addr, 1, value as u32),
        }
    }

    pub fn read_u16(&mut self, addr: u64) -> u16 {
        if addr & PAGE_MASK <= PAGE_SIZE - 2 {
            let masked = self.mask(addr);
            match self.read_lut[(masked >> PAGE_SHIFT) as usize] {
                Route::Ram(page_off) => {
                    let mut b = [0u8; 2];
                    let _ = self.ram.read_into(page_off + (masked & PAGE_MASK), &mut b);
                    return u16::from_le_bytes(b);
                }
                Route::Ext(idx) if masked & 1 == 0 => {
                    return self.ext_read(idx, masked, 2) as u16;
                }
                _ => {}
            }
        }
        u16::from_le_bytes([self.read_u8(addr), self.read_u8(addr.wrapping_add(1))])
    }

    pub fn write_u16(&mut self, addr: u64, value: u16) {
        if addr & PAGE_MASK <= PAGE_SIZE - 2 {
            let masked = self.mask(addr);
            match self.write_lut[(masked >> PAGE_SHIFT) as usize] {
                Route::Ram(page_off) => {
                    let _ = self
                        .ram
                        .write_from(page_off + (masked & PAGE_MASK), &value.to_le_bytes());
                    return;
                }
                Route::Ext(idx) if masked & 1 == 0 => {
                    self.ext_write(idx, masked, 2, value as u32);
                    return;
                }
                _ => {}
            }
        }
        let [lo, hi] = value.to_le_bytes();
        self.write_u8(addr, lo);
        self.write_u8(addr.wrapping_add(1), hi);
    }

    pub fn read_u32(&mut self, addr: u64) -> u32 {
        if addr & PAGE_MASK <= PAGE_SIZE - 4 {
            let masked = self.mask(addr);
            match self.read_lut[(masked >> PAGE_SHIFT) as usize] {
                Route::Ram(page_off) => {
                    let mut b = [0u8; 4];
                    let _ = self.ram.read_into(page_off + (masked & PAGE_MASK), &mut b);
                    return u32::from_le_bytes(b);
                }
                Route::Ext(idx) if masked & 3 == 0 => {
                    return self.ext_read(idx, masked, 4);
                }
                _ => {}
            }
        }
        u32::from(self.read_u16(addr)) | (u32::from(self.read_u16(addr.wrapping_add(2))) << 16)
    }

    pub fn write_u32(&mut self, addr: u64, value: u32) {
        if addr & PAGE_MASK <= PAGE_SIZE - 4 {
            let masked = self.mask(addr);
            match self.write_lut[(masked >> PAGE_SHIFT) as usize] {
                Route::Ram(page_off) => {
                    let _ = self
                        .ram
                        .write_from(page_off + (masked & PAGE_MASK), &value.to_le_bytes());
                    return;
                }
                Route::Ext(idx) if masked & 3 == 0 => {
                    self.ext_write(idx, masked, 4, value);
                    return;
                }
                _ => {}
            }
        }
        self.write_u16(addr, value as u16);
        self.write_u16(addr.wrapping_add(2), (value >> 16) as u16);
    }

    pub fn read_u64(&mut self, addr: u64) -> u64 {
        u64::from(self.read_u32(addr)) | (u64::from(self.read_u32(addr.wrapping_add(4))) << 32)
    }

    pub fn write_u64(&mut self, addr: u64, value: u64) {
        self.write_u32(addr, value as u32);
        self.write_u32(addr.wrapping_add(4), (value >> 32) as u32);
    }

    pub fn read_physical(&mut self, addr: u64, dst: &mut [u8]) {
        for (i, b) in dst.iter_mut().enumerate() {
            *b = self.read_u8(addr + i as u64);
        }
    }

    pub fn write_physical(&mut self, addr: u64, src: &[u8]) {
        for (i, b) in src.iter().enumerate() {
            self.write_u8(addr + i as u64, *b);
        }
    }

    fn ext_read(&mut self, idx: u32, addr: u64, size: u8) -> u32 {
        let m = &self.mappings[idx as usize];
        match &m.backing {
            Backing::Internal { .. } => unreachable!("internal mapping routed as external"),
            Backing::Rom(data) => {
                let data = data.borrow();
                let off = (addr - m.base) as usize;
                let mut value = 0u32;
                for i in 0..size as usize {
                    let byte = data.get(off + i).copied().unwrap_or(0xFF);
                    value |= u32::from(byte) << (8 * i);
                }
                value
            }
            Backing::Mmio(handler) => {
                let handler = handler.clone();
                let mut handler = handler.borrow_mut();
                handler.mmio_read(addr, size)
            }
        }
    }

    fn ext_write(&mut self, idx: u32, addr: u64, size: u8, value: u32) {
        let m = &self.mappings[idx as usize];
        match &m.backing {
            Backing::Internal { .. } => unreachable!("internal mapping routed as external"),
            Backing::Rom(_) => {
                log::trace!("write to ROM at {addr:#x} ignored");
            }
            Backing::Mmio(handler) => {
                let handler = handler.clone();
                let mut handler = handler.borrow_mut();
                handler.mmio_write(addr, size, value);
            }
        }
    }
}
