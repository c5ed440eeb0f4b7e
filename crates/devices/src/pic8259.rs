//! Cascaded 8259A interrupt controller pair.
//!
//! Covers the ICW1–ICW4 initialization sequence, OCW2 EOI/rotate commands,
//! OCW3 register selection and special mask mode, per-line edge/level
//! triggering through the ELCR pair at 0x4D0/0x4D1, automatic EOI, and
//! spurious IRQ7/IRQ15 on an INTA with nothing pending.

use relic_platform::io::PortIoDevice;

use crate::irq::InterruptController;

pub const MASTER_CMD: u16 = 0x20;
pub const MASTER_DATA: u16 = 0x21;
pub const SLAVE_CMD: u16 = 0xA0;
pub const SLAVE_DATA: u16 = 0xA1;
pub const ELCR_MASTER: u16 = 0x4D0;
pub const ELCR_SLAVE: u16 = 0x4D1;

/// The cascade input on the master.
const CASCADE_LINE: u8 = 2;

#[derive(Default)]
struct Pic {
    irr: u8,
    imr: u8,
    isr: u8,
    // Line levels as last driven, for edge detection.
    last_irr: u8,
    vector_base: u8,
    elcr: u8,
    elcr_mask: u8,
    priority_add: u8,
    icw_step: u8,
    expects_icw4: bool,
    auto_eoi: bool,
    rotate_on_auto_eoi: bool,
    special_mask: bool,
    read_isr: bool,
    poll: bool,
}

impl Pic {
    fn new(elcr_mask: u8) -> Self {
        Self {
            elcr_mask,
            ..Default::default()
        }
    }

    fn init_reset(&mut self) {
        let elcr = self.elcr;
        let elcr_mask = self.elcr_mask;
        *self = Self {
            elcr,
            elcr_mask,
            ..Default::default()
        };
    }

    fn set_line(&mut self, line: u8, high: bool) {
        let mask = 1u8 << line;
        if self.elcr & mask != 0 {
            // Level triggered: IRR follows the line.
            if high {
                self.irr |= mask;
                self.last_irr |= mask;
            } else {
                self.irr &= !mask;
                self.last_irr &= !mask;
            }
        } else if high {
            // Edge triggered: latch on the rising edge only.
            if self.last_irr & mask == 0 {
                self.irr |= mask;
            }
            self.last_irr |= mask;
        } else {
            self.last_irr &= !mask;
        }
    }

    fn highest_priority(&self, mask: u8) -> Option<u8> {
        if mask == 0 {
            return None;
        }
        (0..8).find(|&p| mask & (1 << ((p + self.priority_add) & 7)) != 0)
    }

    /// Line number of the next interrupt to service, honoring IMR, the
    /// in-service priority fence, and special mask mode.
    fn pending_line(&self) -> Option<u8> {
        let mask = self.irr & !self.imr;
        let priority = self.highest_priority(mask)?;
        let isr_fence = if self.special_mask {
            self.isr & !self.imr
        } else {
            self.isr
        };
        match self.highest_priority(isr_fence) {
            Some(cur) if cur <= priority => None,
            _ => Some((priority + self.priority_add) & 7),
        }
    }

    fn ack(&mut self, line: u8) {
        let mask = 1u8 << line;
        self.isr |= mask;
        if self.elcr & mask == 0 {
            self.irr &= !mask;
        }
        if self.auto_eoi {
            if self.rotate_on_auto_eoi {
                self.priority_add = (line + 1) & 7;
            }
            self.isr &= !mask;
        }
    }

    fn non_specific_eoi(&mut self, rotate: bool) {
        let fence = if self.special_mask {
            self.isr & !self.imr
        } else {
            self.isr
        };
        if let Some(priority) = self.highest_priority(fence) {
            let line = (priority + self.priority_add) & 7;
            self.isr &= !(1 << line);
            if rotate {
                self.priority_add = (line + 1) & 7;
            }
        }
    }

    fn write_cmd(&mut self, value: u8) {
        if value & 0x10 != 0 {
            // ICW1: restart the init sequence.
            self.init_reset();
            self.icw_step = 1;
            self.expects_icw4 = value & 0x01 != 0;
            if value & 0x02 != 0 {
                // Single mode: no ICW3 follows; remember by skipping it.
                self.icw_step = 0x81;
            }
        } else if value & 0x08 != 0 {
            // OCW3.
            if value & 0x02 != 0 {
                self.read_isr = value & 0x01 != 0;
            }
            if value & 0x04 != 0 {
                self.poll = true;
            }
            if value & 0x40 != 0 {
                self.special_mask = value & 0x20 != 0;
            }
        } else {
            // OCW2.
            let rotate = value & 0x80 != 0;
            match (value >> 5) & 0x3 {
                0b01 => self.non_specific_eoi(rotate),
                0b11 => {
                    // Specific EOI.
                    let line = value & 0x7;
                    self.isr &= !(1 << line);
                    if rotate {
                        self.priority_add = (line + 1) & 7;
                    }
                }
                0b00 if rotate => self.rotate_on_auto_eoi = true,
                0b10 if rotate => {
                    // Set priority command.
                    self.priority_add = ((value & 0x7) + 1) & 7;
                }
                _ => {}
            }
        }
    }

    fn write_data(&mut self, value: u8) {
        match self.icw_step & 0x7F {
            1 => {
                self.vector_base = value & 0xF8;
                if self.icw_step & 0x80 != 0 {
                    // Single mode skipped ICW3.
                    self.icw_step = if self.expects_icw4 { 3 } else { 0 };
                } else {
                    self.icw_step = 2;
                }
            }
            2 => {
                // ICW3 (cascade wiring) is fixed by the board; only advance.
                self.icw_step = if self.expects_icw4 { 3 } else { 0 };
            }
            3 => {
                self.auto_eoi = value & 0x02 != 0;
                self.icw_step = 0;
            }
            _ => self.imr = value,
        }
    }

    fn read_cmd(&mut self) -> u8 {
        if self.poll {
            self.poll = false;
            match self.pending_line() {
                Some(line) => {
                    self.ack(line);
                    0x80 | line
                }
                None => 0,
            }
        } else if self.read_isr {
            self.isr
        } else {
            self.irr
        }
    }
}

/// Master + slave pair with the cascade on master line 2.
pub struct Pic8259Pair {
    master: Pic,
    slave: Pic,
}

impl Default for Pic8259Pair {
    fn default() -> Self {
        Self::new()
    }
}

impl Pic8259Pair {
    pub fn new() -> Self {
        Self {
            // IRQ0 (PIT) and IRQ1 (keyboard) are always edge; IRQ2 is the
            // cascade; IRQ8 (RTC) and IRQ13 (FPU) likewise fixed edge.
            master: Pic::new(!0b0000_0111),
            slave: Pic::new(!0b0010_0001),
        }
    }

    pub fn reset(&mut self) {
        self.master.init_reset();
        self.slave.init_reset();
        self.master.elcr = 0;
        self.slave.elcr = 0;
    }

    /// Convenience for tests and firmware-free bring-up.
    pub fn set_offsets(&mut self, master_base: u8, slave_base: u8) {
        self.master.vector_base = master_base & 0xF8;
        self.slave.vector_base = slave_base & 0xF8;
    }

    /// The universal raise/lower primitive; `line` is 0..15.
    pub fn set_irq(&mut self, line: u8, high: bool) {
        debug_assert!(line < 16);
        if line < 8 {
            self.master.set_line(line, high);
        } else {
            self.slave.set_line(line - 8, high);
        }
        self.update_cascade();
    }

    fn update_cascade(&mut self) {
        let slave_int = self.slave.pending_line().is_some();
        self.master.set_line(CASCADE_LINE, slave_int);
    }

    /// Sampled by the CPU between instructions.
    pub fn has_pending(&self) -> bool {
        self.master.pending_line().is_some()
    }

    /// INTA cycle: returns the vector to service. An acknowledge with
    /// nothing pending yields the spurious vector (base+7 of the chip that
    /// saw the request evaporate).
    pub fn ack(&mut self) -> u8 {
        match self.master.pending_line() {
            Some(CASCADE_LINE) => {
                self.master.ack(CASCADE_LINE);
                let vector = match self.slave.pending_line() {
                    Some(line) => {
                        self.slave.ack(line);
                        self.slave.vector_base + line
                    }
                    None => self.slave.vector_base + 7,
                };
                self.update_cascade();
                vector
            }
            Some(line) => {
                self.master.ack(line);
                self.master.vector_base + line
            }
            None => self.master.vector_base + 7,
        }
    }

    pub fn in_service(&self) -> (u8, u8) {
        (self.master.isr, self.slave.isr)
    }

    pub fn irr(&self) -> (u8, u8) {
        (self.master.irr, self.slave.irr)
    }

    pub fn imr(&self) -> (u8, u8) {
        (self.master.imr, self.slave.imr)
    }
}

impl PortIoDevice for Pic8259Pair {
    fn read(&mut self, port: u16, _size: u8) -> u32 {
        let value = match port {
            MASTER_CMD => self.master.read_cmd(),
            MASTER_DATA => self.master.imr,
            SLAVE_CMD => self.slave.read_cmd(),
            SLAVE_DATA => self.slave.imr,
            ELCR_MASTER => self.master.elcr,
            ELCR_SLAVE => self.slave.elcr,
            _ => 0xFF,
        };
        value.into()
    }

    fn write(&mut self, port: u16, _size: u8, value: u32) {
        let value = value as u8;
        match port {
            MASTER_CMD => self.master.write_cmd(value),
            MASTER_DATA => self.master.write_data(value),
            SLAVE_CMD => self.slave.write_cmd(value),
            SLAVE_DATA => self.slave.write_data(value),
            // ELCR: the fixed lines (timer, keyboard, cascade, RTC, FPU)
            // cannot be made level-triggered.
            ELCR_MASTER => self.master.elcr = value & self.master.elcr_mask,
            ELCR_SLAVE => self.slave.elcr = value & self.slave.elcr_mask,
            _ => {}
        }
        self.update_cascade();
    }
}

impl InterruptController for Pic8259Pair {
    fn set_irq_line(&mut self, line: u8, high: bool) {
        self.set_irq(line, high);
    }
}
