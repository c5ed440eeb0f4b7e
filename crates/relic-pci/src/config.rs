use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PciCommand: u16 {
        const IO_ENABLE     = 1 << 0;
        const MEM_ENABLE    = 1 << 1;
        const BUS_MASTER    = 1 << 2;
        const SPECIAL       = 1 << 3;
        const PARITY_ERR    = 1 << 6;
        const SERR          = 1 << 8;
        const INTX_DISABLE  = 1 << 10;
    }
}

/// Declared decode behavior of one BAR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PciBarDefinition {
    /// I/O space BAR; `size` must be a power of two.
    Io { size: u32 },
    /// 32-bit memory BAR; `size` must be a power of two.
    Memory { size: u32, prefetchable: bool },
}

impl PciBarDefinition {
    fn size(&self) -> u32 {
        match *self {
            PciBarDefinition::Io { size } => size,
            PciBarDefinition::Memory { size, .. } => size,
        }
    }

    fn flag_bits(&self) -> u32 {
        match *self {
            PciBarDefinition::Io { .. } => 0x1,
            PciBarDefinition::Memory { prefetchable, .. } => {
                if prefetchable {
                    0x8
                } else {
                    0x0
                }
            }
        }
    }
}

pub const CFG_VENDOR_ID: u8 = 0x00;
pub const CFG_COMMAND: u8 = 0x04;
pub const CFG_STATUS: u8 = 0x06;
pub const CFG_REVISION: u8 = 0x08;
pub const CFG_CLASS: u8 = 0x09;
pub const CFG_HEADER_TYPE: u8 = 0x0E;
pub const CFG_BAR0: u8 = 0x10;
pub const CFG_INTERRUPT_LINE: u8 = 0x3C;
pub const CFG_INTERRUPT_PIN: u8 = 0x3D;

/// 256-byte type-0 configuration window with per-bit write masks.
///
/// Writable bits take guest writes, write-1-to-clear bits clear, everything
/// else keeps its reset value — which is exactly the config round-trip
/// contract: writable bits read back the written value, reserved bits read
/// zero, read-only bits read their initial value.
pub struct PciConfigSpace {
    regs: [u8; 256],
    reset_image: [u8; 256],
    write_mask: [u8; 256],
    w1c_mask: [u8; 256],
    bars: [Option<PciBarDefinition>; 6],
}

impl PciConfigSpace {
    pub fn new(vendor_id: u16, device_id: u16) -> Self {
        let mut cfg = Self {
            regs: [0; 256],
            reset_image: [0; 256],
            write_mask: [0; 256],
            w1c_mask: [0; 256],
            bars: [None; 6],
        };
        cfg.set_u16(CFG_VENDOR_ID, vendor_id);
        cfg.set_u16(CFG_VENDOR_ID + 2, device_id);

        // Command: I/O, memory, bus-master, SERR, parity, INTx-disable
        // writable.
        cfg.write_mask[CFG_COMMAND as usize] = 0x47;
        cfg.write_mask[CFG_COMMAND as usize + 1] = 0x05;
        // Status: error bits are write-1-to-clear.
        cfg.w1c_mask[CFG_STATUS as usize + 1] = 0xF9;
        // Interrupt line is firmware/guest scratch.
        cfg.write_mask[CFG_INTERRUPT_LINE as usize] = 0xFF;
        // Cache line size / latency timer.
        cfg.write_mask[0x0C] = 0xFF;
        cfg.write_mask[0x0D] = 0xFF;

        cfg.reset_image = cfg.regs;
        cfg
    }

    pub fn set_class(&mut self, class: u8, subclass: u8, prog_if: u8) {
        self.regs[CFG_REVISION as usize + 1] = prog_if;
        self.regs[CFG_CLASS as usize + 1] = subclass;
        self.regs[CFG_CLASS as usize + 2] = class;
        self.reset_image = self.regs;
    }

    pub fn set_revision(&mut self, rev: u8) {
        self.regs[CFG_REVISION as usize] = rev;
        self.reset_image = self.regs;
    }

    pub fn set_interrupt_pin(&mut self, pin: u8) {
        self.regs[CFG_INTERRUPT_PIN as usize] = pin;
        self.reset_image = self.regs;
    }

    /// Seeds a read-only byte (subsystem IDs, chipset-specific registers).
    pub fn set_read_only(&mut self, offset: u8, value: u8) {
        self.regs[offset as usize] = value;
        self.reset_image = self.regs;
    }

    /// Makes `offset` guest-writable under `mask` with the given reset value.
    pub fn set_writable(&mut self, offset: u8, mask: u8, value: u8) {
        self.write_mask[offset as usize] = mask;
        self.regs[offset as usize] = value;
        self.reset_image = self.regs;
    }

    pub fn set_bar_definition(&mut self, index: usize, def: PciBarDefinition) {
        assert!(index < 6);
        assert!(def.size().is_power_of_two() && def.size() >= 4);
        self.bars[index] = Some(def);
        let offset = CFG_BAR0 as usize + index * 4;
        let bits = def.flag_bits();
        self.regs[offset] = bits as u8;
        self.reset_image = self.regs;
        // The address bits above the size mask are writable.
        let mask = !(def.size() - 1);
        for i in 0..4 {
            self.write_mask[offset + i] = (mask >> (8 * i)) as u8;
        }
    }

    pub fn bar_definition(&self, index: usize) -> Option<PciBarDefinition> {
        self.bars[index]
    }

    /// Programmed base address of a BAR, without the flag bits.
    pub fn bar_base(&self, index: usize) -> Option<u32> {
        let def = self.bars[index]?;
        let offset = CFG_BAR0 as usize + index * 4;
        let raw = u32::from_le_bytes(self.regs[offset..offset + 4].try_into().unwrap());
        Some(match def {
            PciBarDefinition::Io { .. } => raw & 0xFFFF_FFFC,
            PciBarDefinition::Memory { .. } => raw & 0xFFFF_FFF0,
        })
    }

    pub fn set_bar_base(&mut self, index: usize, base: u32) {
        let Some(def) = self.bars[index] else { return };
        let offset = CFG_BAR0 as usize + index * 4;
        let value = (base & !(def.size() - 1)) | def.flag_bits();
        self.regs[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub fn command(&self) -> PciCommand {
        PciCommand::from_bits_truncate(u16::from_le_bytes([
            self.regs[CFG_COMMAND as usize],
            self.regs[CFG_COMMAND as usize + 1],
        ]))
    }

    pub fn set_command(&mut self, command: PciCommand) {
        let bits = command.bits().to_le_bytes();
        self.regs[CFG_COMMAND as usize] = bits[0];
        self.regs[CFG_COMMAND as usize + 1] = bits[1];
    }

    fn set_u16(&mut self, offset: u8, value: u16) {
        self.regs[offset as usize..offset as usize + 2].copy_from_slice(&value.to_le_bytes());
    }

    pub fn read(&self, offset: u8, size: u8) -> u32 {
        let mut value = 0u32;
        for i in 0..size as usize {
            let idx = (offset as usize + i) & 0xFF;
            value |= u32::from(self.regs[idx]) << (8 * i);
        }
        value
    }

    pub fn write(&mut self, offset: u8, size: u8, value: u32) {
        for i in 0..size as usize {
            let idx = (offset as usize + i) & 0xFF;
            let byte = (value >> (8 * i)) as u8;

            // BAR writes need size-probe semantics: the unwritable low bits
            // read back as the encoded flag bits, so the plain mask logic
            // below already produces the size mask on an all-ones probe.
            let mask = self.write_mask[idx];
            let w1c = self.w1c_mask[idx];
            let old = self.regs[idx];
            self.regs[idx] = (old & !mask) | (byte & mask);
            self.regs[idx] &= !(byte & w1c);
        }
    }

    /// Restores every register to its reset value.
    pub fn reset(&mut self) {
        self.regs = self.reset_image;
    }

    pub fn vendor_id(&self) -> u16 {
        u16::from_le_bytes([self.regs[0], self.regs[1]])
    }

    pub fn device_id(&self) -> u16 {
        u16::from_le_bytes([self.regs[2], self.regs[3]])
    }
}

/// One PCI function. The default config dispatch suits register-file devices;
/// functions with side effects on config access override `config_write`.
pub trait PciDevice {
    fn config(&self) -> &PciConfigSpace;
    fn config_mut(&mut self) -> &mut PciConfigSpace;

    fn config_read(&mut self, offset: u8, size: u8) -> u32 {
        self.config().read(offset, size)
    }

    fn config_write(&mut self, offset: u8, size: u8, value: u32) {
        self.config_mut().write(offset, size, value);
    }

    fn reset(&mut self) {
        self.config_mut().reset();
    }
}
