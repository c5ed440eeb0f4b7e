//! 8254 programmable interval timer.
//!
//! Three channels clocked at 1,193,182 Hz. Channel 0 drives IRQ0 through the
//! platform timer queue; channel 2 feeds the speaker gate. Counter phase is
//! tracked in PIT ticks against a load timestamp, so live counter reads and
//! IRQ deadlines never accumulate rounding drift against guest time.

use relic_timers::TimerQueue;

use crate::irq::IrqLine;
use crate::DeviceTimer;

pub const PIT_CH0: u16 = 0x40;
pub const PIT_CH1: u16 = 0x41;
pub const PIT_CH2: u16 = 0x42;
pub const PIT_CMD: u16 = 0x43;

/// Base oscillator, 14.31818 MHz / 12.
pub const PIT_HZ: u64 = 1_193_182;

const NS_PER_SEC: u128 = 1_000_000_000;

fn ticks_to_ns(ticks: u64) -> u64 {
    ((ticks as u128 * NS_PER_SEC).div_ceil(PIT_HZ as u128)) as u64
}

fn ns_to_ticks(ns: u64) -> u64 {
    ((ns as u128 * PIT_HZ as u128) / NS_PER_SEC) as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AccessMode {
    LoByte,
    HiByte,
    LoHi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RwState {
    Idle,
    ExpectHi,
}

struct Channel {
    reload: u16,
    mode: u8,
    access: AccessMode,
    bcd: bool,
    rw_state: RwState,
    write_lo: u8,
    latched: Option<u16>,
    read_hi_pending: Option<u8>,
    status_latch: Option<u8>,
    // Guest time of the last full reload.
    load_ns: u64,
    armed: bool,
    gate: bool,
    null_count: bool,
}

impl Channel {
    fn new() -> Self {
        Self {
            reload: 0,
            mode: 0,
            access: AccessMode::LoHi,
            bcd: false,
            rw_state: RwState::Idle,
            write_lo: 0,
            latched: None,
            read_hi_pending: None,
            status_latch: None,
            load_ns: 0,
            armed: false,
            gate: true,
            null_count: true,
        }
    }

    fn effective_reload(&self) -> u64 {
        if self.reload == 0 {
            0x10000
        } else {
            u64::from(self.reload)
        }
    }

    /// Live counter value at `now`.
    fn current_count(&self, now_ns: u64) -> u16 {
        if !self.armed || !self.gate {
            return self.reload;
        }
        let reload = self.effective_reload();
        let elapsed = ns_to_ticks(now_ns.saturating_sub(self.load_ns));
        match self.mode {
            // Mode 0: counts through zero and wraps over the full range.
            0 | 1 | 4 | 5 => (reload.wrapping_sub(elapsed) & 0xFFFF) as u16,
            // Mode 2: reloads at 1, never shows 0.
            2 => {
                let phase = elapsed % reload;
                (reload - phase) as u16
            }
            // Mode 3: decrements by two, half period per out phase.
            _ => {
                let phase = elapsed % reload;
                let half = (phase * 2) % reload;
                (reload - half) as u16
            }
        }
    }

    fn out(&self, now_ns: u64) -> bool {
        if !self.armed {
            return self.mode != 2 && self.mode != 3;
        }
        let reload = self.effective_reload();
        let elapsed = ns_to_ticks(now_ns.saturating_sub(self.load_ns));
        match self.mode {
            0 => elapsed >= reload,
            2 => elapsed % reload != reload - 1,
            3 => (elapsed % reload) < reload.div_ceil(2),
            _ => true,
        }
    }
}

pub struct Pit {
    channels: [Channel; 3],
    irq0: Option<IrqLine>,
    speaker_gate: bool,
    speaker_data: bool,
}

impl Default for Pit {
    fn default() -> Self {
        Self::new()
    }
}

impl Pit {
    pub fn new() -> Self {
        Self {
            channels: [Channel::new(), Channel::new(), Channel::new()],
            irq0: None,
            speaker_gate: false,
            speaker_data: false,
        }
    }

    pub fn set_irq0(&mut self, line: IrqLine) {
        self.irq0 = Some(line);
    }

    pub fn reset(&mut self) {
        let irq0 = self.irq0.clone();
        *self = Self::new();
        self.irq0 = irq0;
    }

    pub fn write_command(&mut self, value: u8, now_ns: u64) {
        let ch = (value >> 6) & 0x3;
        if ch == 3 {
            // Read-back command: latch counts and/or status of the selected
            // channels.
            for i in 0..3 {
                if value & (0x02 << i) == 0 {
                    continue;
                }
                if value & 0x20 == 0 {
                    self.latch_count(i, now_ns);
                }
                if value & 0x10 == 0 {
                    self.latch_status(i, now_ns);
                }
            }
            return;
        }
        let ch = ch as usize;
        let access = (value >> 4) & 0x3;
        if access == 0 {
            self.latch_count(ch, now_ns);
            return;
        }
        let c = &mut self.channels[ch];
        c.access = match access {
            1 => AccessMode::LoByte,
            2 => AccessMode::HiByte,
            _ => AccessMode::LoHi,
        };
        c.mode = (value >> 1) & 0x7;
        if c.mode > 5 {
            c.mode -= 4;
        }
        c.bcd = value & 0x01 != 0;
        c.rw_state = RwState::Idle;
        c.latched = None;
        c.read_hi_pending = None;
        c.status_latch = None;
        c.armed = false;
        c.null_count = true;
    }

    /// Data-port write. `now_ns` is current guest time; channel 0 reprograms
    /// its IRQ deadline in `queue`.
    pub fn write_data(
        &mut self,
        ch: usize,
        value: u8,
        now_ns: u64,
        queue: &mut TimerQueue<DeviceTimer>,
    ) {
        let c = &mut self.channels[ch];
        let complete = match c.access {
            AccessMode::LoByte => {
                c.reload = (c.reload & 0xFF00) | u16::from(value);
                true
            }
            AccessMode::HiByte => {
                c.reload = (c.reload & 0x00FF) | (u16::from(value) << 8);
                true
            }
            AccessMode::LoHi => match c.rw_state {
                RwState::Idle => {
                    c.write_lo = value;
                    c.rw_state = RwState::ExpectHi;
                    false
                }
                RwState::ExpectHi => {
                    c.reload = u16::from_le_bytes([c.write_lo, value]);
                    c.rw_state = RwState::Idle;
                    true
                }
            },
        };
        if complete {
            c.load_ns = now_ns;
            c.armed = true;
            c.null_count = false;
            if ch == 0 {
                self.schedule_irq0(now_ns, queue);
            }
        }
    }

    fn schedule_irq0(&mut self, now_ns: u64, queue: &mut TimerQueue<DeviceTimer>) {
        let c = &self.channels[0];
        if !c.armed {
            return;
        }
        let reload = c.effective_reload();
        let ticks = match c.mode {
            // Mode 0: one shot when the count expires.
            0 | 1 | 4 | 5 => reload,
            // Modes 2/3: periodic.
            _ => reload,
        };
        queue.schedule_at(now_ns + ticks_to_ns(ticks), DeviceTimer::PitChannel0);
    }

    /// Timer-queue expiration for channel 0.
    pub fn handle_timer_event(
        &mut self,
        deadline_ns: u64,
        queue: &mut TimerQueue<DeviceTimer>,
    ) {
        let (armed, mode, reload, load_ns) = {
            let c = &self.channels[0];
            (c.armed, c.mode, c.effective_reload(), c.load_ns)
        };
        // Events armed before the last reload are stale.
        if !armed || deadline_ns < load_ns {
            return;
        }
        if let Some(irq0) = &self.irq0 {
            match mode {
                0 => irq0.raise(),
                _ => irq0.pulse(),
            }
        }
        if mode == 2 || mode == 3 {
            // Re-arm from the expired deadline so the period has no drift.
            queue.schedule_at(deadline_ns + ticks_to_ns(reload), DeviceTimer::PitChannel0);
        }
    }

    pub fn read_data(&mut self, ch: usize, now_ns: u64) -> u8 {
        let c = &mut self.channels[ch];
        if let Some(status) = c.status_latch.take() {
            return status;
        }
        if let Some(hi) = c.read_hi_pending.take() {
            return hi;
        }
        let count = c.latched.take().unwrap_or_else(|| c.current_count(now_ns));
        match c.access {
            AccessMode::LoByte => count as u8,
            AccessMode::HiByte => (count >> 8) as u8,
            _ => {
                c.read_hi_pending = Some((count >> 8) as u8);
                count as u8
            }
        }
    }

    /// Latches the current count of `ch` (command-port counter latch).
    pub fn latch_count(&mut self, ch: usize, now_ns: u64) {
        let count = self.channels[ch].current_count(now_ns);
        let c = &mut self.channels[ch];
        if c.latched.is_none() {
            c.latched = Some(count);
        }
    }

    /// Latches the read-back status byte of `ch`.
    fn latch_status(&mut self, ch: usize, now_ns: u64) {
        let out = self.channels[ch].out(now_ns);
        let c = &mut self.channels[ch];
        if c.status_latch.is_none() {
            let access_bits = match c.access {
                AccessMode::LoByte => 1,
                AccessMode::HiByte => 2,
                AccessMode::LoHi => 3,
            };
            c.status_latch = Some(
                (u8::from(out) << 7)
                    | (u8::from(c.null_count) << 6)
                    | (access_bits << 4)
                    | (c.mode << 1)
                    | u8::from(c.bcd),
            );
        }
    }

    /// Channel 2 gate (port 0x61 bit 0).
    pub fn set_gate2(&mut self, high: bool, now_ns: u64) {
        let c = &mut self.channels[2];
        if !c.gate && high {
            // Rising gate restarts the count in the periodic modes.
            c.load_ns = now_ns;
        }
        c.gate = high;
    }

    pub fn out2(&self, now_ns: u64) -> bool {
        self.channels[2].out(now_ns)
    }

    pub fn speaker_control(&self) -> (bool, bool) {
        (self.speaker_gate, self.speaker_data)
    }

    pub fn set_speaker_control(&mut self, gate: bool, data: bool, now_ns: u64) {
        self.speaker_gate = gate;
        self.speaker_data = data;
        self.set_gate2(gate, now_ns);
    }

    pub fn current_count(&self, ch: usize, now_ns: u64) -> u16 {
        self.channels[ch].current_count(now_ns)
    }

    pub fn mode(&self, ch: usize) -> u8 {
        self.channels[ch].mode
    }

    pub fn reload_value(&self, ch: usize) -> u16 {
        self.channels[ch].reload
    }
}
