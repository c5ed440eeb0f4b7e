//! `PcCpuBus`: the CPU core's linear-address view of the platform.
//!
//! Paging (when enabled) translates through the MMU against platform
//! memory; port I/O routes to the platform bus and immediately applies any
//! chipset side effects so a shadow toggle is visible to the very next
//! memory access. Multi-byte writes translate every covered page before
//! committing a byte, so a page fault never leaves a partial store.

use memory::MemoryMap;
use relic_cpu_core::state::CR0_WP;
use relic_cpu_core::{CpuBus, CpuState, Exception};
use relic_mmu::{Access, Mmu, PagingConfig, PhysMem};

use crate::platform::PcPlatform;

struct PteView<'a>(&'a mut MemoryMap);

impl PhysMem for PteView<'_> {
    fn read_pte(&mut self, paddr: u64) -> u32 {
        self.0.read_u32(paddr)
    }

    fn write_pte(&mut self, paddr: u64, value: u32) {
        self.0.write_u32(paddr, value);
    }
}

pub struct PcCpuBus {
    pub platform: PcPlatform,
    mmu: Mmu,
    paging_on: bool,
    paging_cfg: PagingConfig,
    user: bool,
    last_cr3: u32,
    write_log: Vec<(u64, u32)>,
    derived_flush: bool,
}

impl PcCpuBus {
    pub fn new(platform: PcPlatform) -> Self {
        Self {
            platform,
            mmu: Mmu::new(),
            paging_on: false,
            paging_cfg: PagingConfig::default(),
            user: false,
            last_cr3: 0,
            write_log: Vec::new(),
            derived_flush: false,
        }
    }

    fn sync_a20(&mut self) {
        if self.platform.a20.enabled() != self.platform.memory.a20_enabled() {
            let enabled = self.platform.a20.enabled();
            self.platform.memory.set_a20_enabled(enabled);
            self.derived_flush = true;
            self.mmu.flush_all();
        }
    }

    fn translate(&mut self, linear: u32, access: Access) -> Result<u64, Exception> {
        self.sync_a20();
        if !self.paging_on {
            return Ok(u64::from(linear));
        }
        let mut view = PteView(&mut self.platform.memory);
        self.mmu
            .translate(&mut view, self.paging_cfg, linear, access, self.user)
            .map_err(|pf| Exception::PageFault {
                addr: pf.addr,
                error_code: pf.error_code,
            })
    }

    /// Physical addresses written since the last drain; feeds block-cache
    /// invalidation.
    pub fn take_write_log(&mut self) -> Vec<(u64, u32)> {
        std::mem::take(&mut self.write_log)
    }

    /// True once after shadow/SMRAM/A20/paging structure changed.
    pub fn take_derived_flush(&mut self) -> bool {
        let flush = self.derived_flush || self.platform.take_structure_dirty();
        self.derived_flush = false;
        flush
    }

    /// Resolves the physical address of the current code pointer without
    /// disturbing A/D bits more than a fetch would.
    pub fn code_paddr(&mut self, state: &CpuState) -> Option<u64> {
        let lin = state.segs[relic_cpu_core::state::seg::CS]
            .base
            .wrapping_add(state.eip);
        self.translate(lin, Access::Execute).ok()
    }

    fn write_span(&mut self, addr: u32, bytes: &[u8]) -> Result<(), Exception> {
        // Translate every covered page with write intent first.
        let mut phys = [0u64; 8];
        debug_assert!(bytes.len() <= 8);
        for (n, _) in bytes.iter().enumerate() {
            phys[n] = self.translate(addr.wrapping_add(n as u32), Access::Write)?;
        }
        for (n, byte) in bytes.iter().enumerate() {
            self.platform.memory.write_u8(phys[n], *byte);
            self.write_log.push((phys[n], 1));
        }
        Ok(())
    }
}

impl CpuBus for PcCpuBus {
    fn read_u8(&mut self, addr: u32) -> Result<u8, Exception> {
        let phys = self.translate(addr, Access::Read)?;
        Ok(self.platform.memory.read_u8(phys))
    }

    fn read_u16(&mut self, addr: u32) -> Result<u16, Exception> {
        if addr & 0xFFF <= 0xFFE {
            let phys = self.translate(addr, Access::Read)?;
            return Ok(self.platform.memory.read_u16(phys));
        }
        Ok(u16::from_le_bytes([
            self.read_u8(addr)?,
            self.read_u8(addr.wrapping_add(1))?,
        ]))
    }

    fn read_u32(&mut self, addr: u32) -> Result<u32, Exception> {
        if addr & 0xFFF <= 0xFFC {
            let phys = self.translate(addr, Access::Read)?;
            return Ok(self.platform.memory.read_u32(phys));
        }
        Ok(u32::from(self.read_u16(addr)?)
            | (u32::from(self.read_u16(addr.wrapping_add(2))?) << 16))
    }

    fn write_u8(&mut self, addr: u32, value: u8) -> Result<(), Exception> {
        let phys = self.translate(addr, Access::Write)?;
        self.platform.memory.write_u8(phys, value);
        self.write_log.push((phys, 1));
        Ok(())
    }

    fn write_u16(&mut self, addr: u32, value: u16) -> Result<(), Exception> {
        if addr & 0xFFF <= 0xFFE {
            let phys = self.translate(addr, Access::Write)?;
            self.platform.memory.write_u16(phys, value);
            self.write_log.push((phys, 2));
            return Ok(());
        }
        self.write_span(addr, &value.to_le_bytes())
    }

    fn write_u32(&mut self, addr: u32, value: u32) -> Result<(), Exception> {
        if addr & 0xFFF <= 0xFFC {
            let phys = self.translate(addr, Access::Write)?;
            self.platform.memory.write_u32(phys, value);
            self.write_log.push((phys, 4));
            return Ok(());
        }
        self.write_span(addr, &value.to_le_bytes())
    }

    fn write_u64(&mut self, addr: u32, value: u64) -> Result<(), Exception> {
        if addr & 0xFFF <= 0xFF8 {
            let phys = self.translate(addr, Access::Write)?;
            self.platform.memory.write_u64(phys, value);
            self.write_log.push((phys, 8));
            return Ok(());
        }
        self.write_span(addr, &value.to_le_bytes())
    }

    fn fetch_u8(&mut self, addr: u32) -> Result<u8, Exception> {
        let phys = self.translate(addr, Access::Execute)?;
        Ok(self.platform.memory.read_u8(phys))
    }

    fn io_read(&mut self, port: u16, size: u8) -> u32 {
        self.platform.io.read(port, size)
    }

    fn io_write(&mut self, port: u16, size: u8, value: u32) {
        self.platform.io.write(port, size, value);
        self.platform.apply_chipset_updates();
        if self.platform.take_structure_dirty() {
            self.mmu.flush_all();
            self.derived_flush = true;
        }
    }

    fn sync(&mut self, state: &CpuState) {
        let paging_on = state.paging_enabled();
        let cfg = PagingConfig {
            cr3: u64::from(state.cr3),
            write_protect: state.cr0 & CR0_WP != 0,
            pse: state.cr4 & relic_cpu_core::state::CR4_PSE != 0,
        };
        if paging_on != self.paging_on || state.cr3 != self.last_cr3 {
            self.mmu.flush_all();
        }
        self.paging_on = paging_on;
        self.paging_cfg = cfg;
        self.last_cr3 = state.cr3;
        self.user = state.cpl() == 3;
    }

    fn invlpg(&mut self, addr: u32) {
        self.mmu.invlpg(addr);
    }

    fn flush_tlb(&mut self) {
        self.mmu.flush_all();
        self.derived_flush = true;
    }

    fn smm_changed(&mut self, in_smm: bool) {
        let platform = &mut self.platform;
        if in_smm {
            platform.smram.enter_smm(&mut platform.memory);
        } else {
            platform.smram.exit_smm(&mut platform.memory);
        }
        let _ = platform.take_structure_dirty();
        self.mmu.flush_all();
        self.derived_flush = true;
    }
}
