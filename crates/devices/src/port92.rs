//! System control port A (0x92): the fast A20 gate and fast CPU reset.

use relic_platform::io::PortIoDevice;
use relic_platform::reset::{ResetEvent, ResetLine};

use crate::a20::A20Gate;

pub const PORT_92: u16 = 0x92;

pub struct Port92 {
    a20: A20Gate,
    reset: ResetLine,
    last: u8,
}

impl Port92 {
    pub fn new(a20: A20Gate, reset: ResetLine) -> Self {
        Self {
            a20,
            reset,
            last: 0,
        }
    }

    pub fn reset(&mut self) {
        self.last = 0;
        self.a20.set_enabled(false);
    }
}

impl PortIoDevice for Port92 {
    fn read(&mut self, _port: u16, _size: u8) -> u32 {
        let mut value = self.last & !0x03;
        if self.a20.enabled() {
            value |= 0x02;
        }
        value.into()
    }

    fn write(&mut self, _port: u16, _size: u8, value: u32) {
        let value = value as u8;
        self.a20.set_enabled(value & 0x02 != 0);
        // Bit 0: fast reset on the rising edge only.
        if value & 0x01 != 0 && self.last & 0x01 == 0 {
            self.reset.request(ResetEvent::Cpu);
        }
        self.last = value;
    }
}
