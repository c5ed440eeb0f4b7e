//! SCAMP-class index/data chipset.
//!
//! The register file sits behind the classic 0x22 (index) / 0x23 (data)
//! pair. Configuration writes are ignored until the unlock byte is written
//! to the lock register. Shadow-RAM control covers C0000–FFFFF in eight
//! 32 KiB granules with a shared read/write source select; one register
//! gates the SMRAM overlay. The chipset never touches the memory map
//! directly: it emits [`MemUpdate`] commands the platform applies, so the
//! register file stays a pure state machine.

use memory::shadow::ShadowSource;
use relic_platform::io::PortIoDevice;

pub const CHIPSET_INDEX_PORT: u16 = 0x22;
pub const CHIPSET_DATA_PORT: u16 = 0x23;

/// Lock register index and its unlock value.
pub const REG_LOCK: u8 = 0x03;
pub const UNLOCK_VALUE: u8 = 0xC5;

/// Shadow granule enable bits, one per 32 KiB slice from C0000.
pub const REG_SHADOW_ENABLE: u8 = 0x13;
/// Bit 0: reads from DRAM; bit 1: writes to DRAM.
pub const REG_SHADOW_SOURCE: u8 = 0x14;
/// Bit 7: external cache enable.
pub const REG_CACHE: u8 = 0x18;
/// Bit 0: SMRAM readable/writable in SMM; bit 1: SMRAM open in normal mode
/// (for SMM handler installation).
pub const REG_SMRAM: u8 = 0x19;

const SHADOW_GRANULE: u64 = 0x8000;
const SHADOW_GRANULES: u64 = 8;

/// Memory-map reconfiguration requested by a chipset register write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemUpdate {
    Shadow {
        base: u64,
        size: u64,
        read: ShadowSource,
        write: ShadowSource,
    },
    Smram {
        /// Which CPU state's flags change.
        smm: bool,
        /// Overlay mapped as RAM in that state.
        open: bool,
    },
}

pub struct ScampChipset {
    index: u8,
    regs: [u8; 256],
    cfg_locked: bool,
    cyrix_guard: bool,
    updates: Vec<MemUpdate>,
}

impl Default for ScampChipset {
    fn default() -> Self {
        Self::new()
    }
}

impl ScampChipset {
    pub fn new() -> Self {
        let mut dev = Self {
            index: 0,
            regs: [0; 256],
            cfg_locked: true,
            cyrix_guard: false,
            updates: Vec::new(),
        };
        dev.shadow_recalc();
        dev
    }

    /// Guards indexes 0x20 and 0xC0+ against reads when a Cyrix CPU owns
    /// them for its own configuration registers.
    pub fn set_cyrix_guard(&mut self, guard: bool) {
        self.cyrix_guard = guard;
    }

    pub fn reset(&mut self) {
        let cyrix_guard = self.cyrix_guard;
        *self = Self::new();
        self.cyrix_guard = cyrix_guard;
    }

    pub fn cache_enabled(&self) -> bool {
        self.regs[REG_CACHE as usize] & 0x80 != 0
    }

    pub fn reg(&self, idx: u8) -> u8 {
        self.regs[idx as usize]
    }

    /// Drains pending memory-map reconfiguration commands.
    pub fn take_updates(&mut self) -> Vec<MemUpdate> {
        std::mem::take(&mut self.updates)
    }

    fn shadow_recalc(&mut self) {
        let enables = self.regs[REG_SHADOW_ENABLE as usize];
        let source = self.regs[REG_SHADOW_SOURCE as usize];
        let read = if source & 0x01 != 0 {
            ShadowSource::Internal
        } else {
            ShadowSource::External
        };
        let write = if source & 0x02 != 0 {
            ShadowSource::Internal
        } else {
            ShadowSource::External
        };
        for i in 0..SHADOW_GRANULES {
            let base = 0xC0000 + i * SHADOW_GRANULE;
            let (read, write) = if enables & (1 << i) != 0 {
                (read, write)
            } else {
                (ShadowSource::External, ShadowSource::External)
            };
            self.updates.push(MemUpdate::Shadow {
                base,
                size: SHADOW_GRANULE,
                read,
                write,
            });
        }
    }

    fn smram_recalc(&mut self) {
        let ctl = self.regs[REG_SMRAM as usize];
        self.updates.push(MemUpdate::Smram {
            smm: true,
            open: ctl & 0x01 != 0,
        });
        self.updates.push(MemUpdate::Smram {
            smm: false,
            open: ctl & 0x02 != 0,
        });
    }

    fn write_indexed(&mut self, value: u8) {
        if self.index != REG_LOCK {
            log::trace!("chipset reg[{:02x}] = {:02x}", self.index, value);
        }
        self.regs[self.index as usize] = value;

        // BUG-COMPAT: the original tests the unlock byte with a logical
        // `&&` where a bitwise compare against 0xC5 was clearly meant, so
        // any non-zero value unlocks the register file. Kept verbatim;
        // period BIOSes only ever write 0xC5 here.
        self.cfg_locked = !(self.regs[REG_LOCK as usize] != 0 && UNLOCK_VALUE != 0);

        if self.cfg_locked {
            return;
        }
        match self.index {
            REG_SHADOW_ENABLE | REG_SHADOW_SOURCE => self.shadow_recalc(),
            REG_SMRAM => self.smram_recalc(),
            _ => {}
        }
    }
}

impl PortIoDevice for ScampChipset {
    fn read(&mut self, port: u16, _size: u8) -> u32 {
        let value = match port {
            CHIPSET_DATA_PORT => {
                if self.cyrix_guard && (self.index >= 0xC0 || self.index == 0x20) {
                    0xFF
                } else {
                    self.regs[self.index as usize]
                }
            }
            _ => 0xFF,
        };
        value.into()
    }

    fn write(&mut self, port: u16, _size: u8, value: u32) {
        let value = value as u8;
        match port {
            CHIPSET_INDEX_PORT => self.index = value,
            CHIPSET_DATA_PORT => self.write_indexed(value),
            _ => {}
        }
    }
}
