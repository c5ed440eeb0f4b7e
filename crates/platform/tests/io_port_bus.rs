use std::cell::RefCell;
use std::rc::Rc;

use relic_platform::io::{IoPortBus, PortIoDevice};

struct Latch {
    regs: [u8; 4],
}

impl PortIoDevice for Latch {
    fn read(&mut self, port: u16, size: u8) -> u32 {
        let mut v = 0u32;
        for i in 0..size as usize {
            v |= u32::from(self.regs[(port as usize + i) & 3]) << (8 * i);
        }
        v
    }

    fn write(&mut self, port: u16, size: u8, value: u32) {
        for i in 0..size as usize {
            self.regs[(port as usize + i) & 3] = (value >> (8 * i)) as u8;
        }
    }
}

#[test]
fn unclaimed_ports_float_high() {
    let mut bus = IoPortBus::new();
    assert_eq!(bus.read_u8(0x10), 0xFF);
    assert_eq!(bus.read_u16(0x10), 0xFFFF);
    assert_eq!(bus.read_u32(0x10), 0xFFFF_FFFF);
    // Writes are swallowed.
    bus.write_u32(0x10, 0x1234_5678);
}

#[test]
fn word_access_over_byte_claims_concatenates() {
    let mut bus = IoPortBus::new();
    let latch = Rc::new(RefCell::new(Latch { regs: [0; 4] }));
    // Claim only the low byte; the high byte of a word access floats.
    bus.register(0x60, 1, latch.clone());

    bus.write_u8(0x60, 0xAB);
    assert_eq!(bus.read_u16(0x60), 0xFFAB);
}

#[test]
fn overlapping_registrations_follow_stack_discipline() {
    let mut bus = IoPortBus::new();
    let low = Rc::new(RefCell::new(Latch { regs: [0x11; 4] }));
    let high = Rc::new(RefCell::new(Latch { regs: [0x22; 4] }));

    bus.register(0x300, 4, low.clone());
    let top = bus.register(0x300, 4, high.clone());

    assert_eq!(bus.read_u8(0x300), 0x22);

    // Unregistering the top claim re-exposes the earlier one.
    bus.unregister(top);
    assert_eq!(bus.read_u8(0x300), 0x11);
}

#[test]
fn full_width_claim_gets_single_dispatch() {
    let mut bus = IoPortBus::new();
    let latch = Rc::new(RefCell::new(Latch { regs: [0; 4] }));
    bus.register(0xCFC, 4, latch.clone());

    bus.write_u32(0xCFC, 0xA1B2_C3D4);
    assert_eq!(bus.read_u32(0xCFC), 0xA1B2_C3D4);
    assert_eq!(bus.read_u8(0xCFE), 0xB2);
}
