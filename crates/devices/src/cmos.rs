//! MC146818-compatible RTC with 128 bytes of battery-backed CMOS.
//!
//! Index port 0x70 (bit 7 doubles as the NMI mask on AT boards), data port
//! 0x71. The time-of-day registers tick from a one-second queue event; the
//! periodic interrupt reprograms its own queue deadline from the rate bits
//! in status register A. The register file round-trips through
//! `nvram_bytes`/`load_nvram` for per-machine persistence.

use relic_timers::TimerQueue;

use crate::irq::IrqLine;
use crate::nmi::NmiLine;
use crate::DeviceTimer;

pub const CMOS_INDEX_PORT: u16 = 0x70;
pub const CMOS_DATA_PORT: u16 = 0x71;

pub const CMOS_SIZE: usize = 128;

const REG_SECONDS: usize = 0x00;
const REG_MINUTES: usize = 0x02;
const REG_HOURS: usize = 0x04;
const REG_DAY_OF_WEEK: usize = 0x06;
const REG_DAY: usize = 0x07;
const REG_MONTH: usize = 0x08;
const REG_YEAR: usize = 0x09;
const REG_STATUS_A: usize = 0x0A;
const REG_STATUS_B: usize = 0x0B;
const REG_STATUS_C: usize = 0x0C;
const REG_STATUS_D: usize = 0x0D;

const STATUS_A_UIP: u8 = 0x80;
const STATUS_B_SET: u8 = 0x80;
const STATUS_B_PIE: u8 = 0x40;
const STATUS_B_UIE: u8 = 0x10;
const STATUS_B_BINARY: u8 = 0x04;
const STATUS_C_IRQF: u8 = 0x80;
const STATUS_C_PF: u8 = 0x40;
const STATUS_C_UF: u8 = 0x10;

pub struct Cmos {
    regs: [u8; CMOS_SIZE],
    index: u8,
    irq8: Option<IrqLine>,
    nmi: Option<NmiLine>,
    periodic_armed: bool,
}

impl Default for Cmos {
    fn default() -> Self {
        Self::new()
    }
}

impl Cmos {
    pub fn new() -> Self {
        let mut regs = [0u8; CMOS_SIZE];
        regs[REG_STATUS_A] = 0x26; // 32.768 kHz base, 1024 Hz periodic rate
        regs[REG_STATUS_B] = 0x02; // 24-hour mode
        regs[REG_STATUS_D] = 0x80; // battery good
        Self {
            regs,
            index: 0,
            irq8: None,
            nmi: None,
            periodic_armed: false,
        }
    }

    pub fn set_irq8(&mut self, line: IrqLine) {
        self.irq8 = Some(line);
    }

    pub fn set_nmi(&mut self, line: NmiLine) {
        self.nmi = Some(line);
    }

    pub fn reset(&mut self) {
        // Register contents are battery backed; only the transient interrupt
        // state clears.
        self.regs[REG_STATUS_C] = 0;
        self.index = 0;
        self.periodic_armed = false;
        if let Some(irq8) = &self.irq8 {
            irq8.lower();
        }
    }

    fn binary_mode(&self) -> bool {
        self.regs[REG_STATUS_B] & STATUS_B_BINARY != 0
    }

    fn encode(&self, value: u8) -> u8 {
        if self.binary_mode() {
            value
        } else {
            ((value / 10) << 4) | (value % 10)
        }
    }

    fn decode(&self, value: u8) -> u8 {
        if self.binary_mode() {
            value
        } else {
            (value >> 4) * 10 + (value & 0x0F)
        }
    }

    /// Seeds the clock registers from a broken-down time.
    pub fn set_time(&mut self, year: u16, month: u8, day: u8, hour: u8, min: u8, sec: u8) {
        self.regs[REG_SECONDS] = self.encode(sec);
        self.regs[REG_MINUTES] = self.encode(min);
        self.regs[REG_HOURS] = self.encode(hour);
        self.regs[REG_DAY] = self.encode(day);
        self.regs[REG_MONTH] = self.encode(month);
        self.regs[REG_YEAR] = self.encode((year % 100) as u8);
        self.regs[0x32] = self.encode((year / 100) as u8);
    }

    fn periodic_interval_ns(&self) -> Option<u64> {
        let rate = self.regs[REG_STATUS_A] & 0x0F;
        if rate == 0 {
            return None;
        }
        // Rates 1 and 2 alias to 8192/4096 Hz per the datasheet.
        let rate = if rate < 3 { rate + 7 } else { rate };
        let hz = 32768u64 >> (rate - 1);
        Some(1_000_000_000 / hz)
    }

    fn reschedule_periodic(&mut self, now_ns: u64, queue: &mut TimerQueue<DeviceTimer>) {
        if self.regs[REG_STATUS_B] & STATUS_B_PIE == 0 {
            self.periodic_armed = false;
            return;
        }
        let Some(interval) = self.periodic_interval_ns() else {
            self.periodic_armed = false;
            return;
        };
        if !self.periodic_armed {
            self.periodic_armed = true;
            queue.schedule_at(now_ns + interval, DeviceTimer::RtcPeriodic);
        }
    }

    /// Periodic-rate expiration.
    pub fn handle_periodic(&mut self, deadline_ns: u64, queue: &mut TimerQueue<DeviceTimer>) {
        if !self.periodic_armed {
            return;
        }
        if self.regs[REG_STATUS_B] & STATUS_B_PIE == 0 {
            self.periodic_armed = false;
            return;
        }
        self.regs[REG_STATUS_C] |= STATUS_C_IRQF | STATUS_C_PF;
        if let Some(irq8) = &self.irq8 {
            irq8.raise();
        }
        match self.periodic_interval_ns() {
            Some(interval) => queue.schedule_at(deadline_ns + interval, DeviceTimer::RtcPeriodic),
            None => self.periodic_armed = false,
        }
    }

    /// One-second tick: advance the time-of-day registers.
    pub fn handle_second(&mut self, deadline_ns: u64, queue: &mut TimerQueue<DeviceTimer>) {
        queue.schedule_at(deadline_ns + 1_000_000_000, DeviceTimer::RtcSecond);
        if self.regs[REG_STATUS_B] & STATUS_B_SET != 0 {
            return;
        }
        self.tick_second();
        if self.regs[REG_STATUS_B] & STATUS_B_UIE != 0 {
            self.regs[REG_STATUS_C] |= STATUS_C_IRQF | STATUS_C_UF;
            if let Some(irq8) = &self.irq8 {
                irq8.raise();
            }
        }
    }

    fn tick_second(&mut self) {
        let mut sec = self.decode(self.regs[REG_SECONDS]) + 1;
        let mut min = self.decode(self.regs[REG_MINUTES]);
        let mut hour = self.decode(self.regs[REG_HOURS]);
        if sec >= 60 {
            sec = 0;
            min += 1;
        }
        if min >= 60 {
            min = 0;
            hour += 1;
        }
        if hour >= 24 {
            hour = 0;
            let day = self.decode(self.regs[REG_DAY]) + 1;
            // Month-length handling is left to the guest's RTC service; the
            // register simply wraps at 31 like the part does without a
            // calendar fix-up.
            self.regs[REG_DAY] = self.encode(if day > 31 { 1 } else { day });
            let dow = self.decode(self.regs[REG_DAY_OF_WEEK]) % 7 + 1;
            self.regs[REG_DAY_OF_WEEK] = self.encode(dow);
        }
        self.regs[REG_SECONDS] = self.encode(sec);
        self.regs[REG_MINUTES] = self.encode(min);
        self.regs[REG_HOURS] = self.encode(hour);
    }

    pub fn read_port(&mut self, port: u16, _now_ns: u64) -> u8 {
        match port {
            CMOS_INDEX_PORT => self.index,
            CMOS_DATA_PORT => {
                let idx = (self.index & 0x7F) as usize;
                match idx {
                    REG_STATUS_A => {
                        // UIP toggles so polling loops make progress.
                        self.regs[REG_STATUS_A] ^= STATUS_A_UIP;
                        self.regs[REG_STATUS_A]
                    }
                    REG_STATUS_C => {
                        let value = self.regs[REG_STATUS_C];
                        self.regs[REG_STATUS_C] = 0;
                        if let Some(irq8) = &self.irq8 {
                            irq8.lower();
                        }
                        value
                    }
                    _ => self.regs[idx],
                }
            }
            _ => 0xFF,
        }
    }

    pub fn write_port(
        &mut self,
        port: u16,
        value: u8,
        now_ns: u64,
        queue: &mut TimerQueue<DeviceTimer>,
    ) {
        match port {
            CMOS_INDEX_PORT => {
                self.index = value;
                if let Some(nmi) = &self.nmi {
                    nmi.set_masked(value & 0x80 != 0);
                }
            }
            CMOS_DATA_PORT => {
                let idx = (self.index & 0x7F) as usize;
                match idx {
                    REG_STATUS_C | REG_STATUS_D => {} // read-only
                    REG_STATUS_A => {
                        self.regs[REG_STATUS_A] =
                            (value & 0x7F) | (self.regs[REG_STATUS_A] & STATUS_A_UIP);
                        self.reschedule_periodic(now_ns, queue);
                    }
                    REG_STATUS_B => {
                        self.regs[REG_STATUS_B] = value;
                        self.reschedule_periodic(now_ns, queue);
                    }
                    _ => self.regs[idx] = value,
                }
            }
            _ => {}
        }
    }

    /// Raw register file for NVRAM persistence.
    pub fn nvram_bytes(&self) -> [u8; CMOS_SIZE] {
        self.regs
    }

    pub fn load_nvram(&mut self, bytes: &[u8]) {
        let n = bytes.len().min(CMOS_SIZE);
        self.regs[..n].copy_from_slice(&bytes[..n]);
        // Transient interrupt flags never persist.
        self.regs[REG_STATUS_C] = 0;
        self.regs[REG_STATUS_D] = 0x80;
    }

    pub fn read_reg(&self, idx: u8) -> u8 {
        self.regs[(idx & 0x7F) as usize]
    }

    pub fn write_reg(&mut self, idx: u8, value: u8) {
        self.regs[(idx & 0x7F) as usize] = value;
    }
}
