//! 16-bit port-I/O dispatch.
//!
//! Devices claim port ranges; overlapping claims follow stack discipline, so
//! the most recent registration wins and unregistering re-exposes whatever it
//! occluded. Unclaimed reads float high (`0xFF...`).

use std::cell::RefCell;
use std::rc::Rc;

/// A device reachable through port I/O. `size` is 1, 2 or 4.
pub trait PortIoDevice {
    fn read(&mut self, port: u16, size: u8) -> u32;
    fn write(&mut self, port: u16, size: u8, value: u32);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IoHandlerId(u32);

struct Registration {
    base: u16,
    len: u32,
    device: Rc<RefCell<dyn PortIoDevice>>,
    live: bool,
}

/// The 65536-slot port bus.
pub struct IoPortBus {
    registrations: Vec<Registration>,
    // Per-port registration stack, most recent last.
    ports: Vec<Vec<u32>>,
}

impl Default for IoPortBus {
    fn default() -> Self {
        Self::new()
    }
}

impl IoPortBus {
    pub fn new() -> Self {
        Self {
            registrations: Vec::new(),
            ports: vec![Vec::new(); 0x10000],
        }
    }

    /// Claims `[base, base+len)` for `device`. Later claims occlude earlier
    /// ones on overlapping ports.
    pub fn register(
        &mut self,
        base: u16,
        len: u32,
        device: Rc<RefCell<dyn PortIoDevice>>,
    ) -> IoHandlerId {
        let id = self.registrations.len() as u32;
        self.registrations.push(Registration {
            base,
            len,
            device,
            live: true,
        });
        for off in 0..len {
            let port = base as u32 + off;
            if port < 0x10000 {
                self.ports[port as usize].push(id);
            }
        }
        IoHandlerId(id)
    }

    /// Releases a claim; occluded claims become effective again.
    pub fn unregister(&mut self, id: IoHandlerId) {
        let reg = &mut self.registrations[id.0 as usize];
        if !reg.live {
            log::error!("I/O handler {id:?} unregistered twice");
            panic!("double unregister of I/O handler");
        }
        reg.live = false;
        let (base, len) = (reg.base, reg.len);
        for off in 0..len {
            let port = base as u32 + off;
            if port < 0x10000 {
                self.ports[port as usize].retain(|&r| r != id.0);
            }
        }
    }

    fn top(&self, port: u16) -> Option<u32> {
        self.ports[port as usize].last().copied()
    }

    /// True when one registration claims every port of `[port, port+size)`
    /// as the topmost handler, so the device can see the full-width access.
    fn full_width_claim(&self, port: u16, size: u8) -> Option<u32> {
        let first = self.top(port)?;
        for i in 1..size as u16 {
            if self.top(port.checked_add(i)?) != Some(first) {
                return None;
            }
        }
        Some(first)
    }

    pub fn read(&mut self, port: u16, size: u8) -> u32 {
        debug_assert!(matches!(size, 1 | 2 | 4));
        if let Some(id) = self.full_width_claim(port, size) {
            let device = self.registrations[id as usize].device.clone();
            let value = device.borrow_mut().read(port, size);
            return value & width_mask(size);
        }
        // Decompose: byte reads against whoever claims each port,
        // unclaimed bytes float high.
        let mut value = 0u32;
        for i in 0..size as u32 {
            let p = port.wrapping_add(i as u16);
            let byte = match self.top(p) {
                Some(id) => {
                    let device = self.registrations[id as usize].device.clone();
                    let b = device.borrow_mut().read(p, 1);
                    b & 0xFF
                }
                None => 0xFF,
            };
            value |= byte << (8 * i);
        }
        value
    }

    pub fn write(&mut self, port: u16, size: u8, value: u32) {
        debug_assert!(matches!(size, 1 | 2 | 4));
        if let Some(id) = self.full_width_claim(port, size) {
            let device = self.registrations[id as usize].device.clone();
            device.borrow_mut().write(port, size, value & width_mask(size));
            return;
        }
        for i in 0..size as u32 {
            let p = port.wrapping_add(i as u16);
            if let Some(id) = self.top(p) {
                let device = self.registrations[id as usize].device.clone();
                device.borrow_mut().write(p, 1, (value >> (8 * i)) & 0xFF);
            }
        }
    }

    pub fn read_u8(&mut self, port: u16) -> u8 {
        self.read(port, 1) as u8
    }

    pub fn read_u16(&mut self, port: u16) -> u16 {
        self.read(port, 2) as u16
    }

    pub fn read_u32(&mut self, port: u16) -> u32 {
        self.read(port, 4)
    }

    pub fn write_u8(&mut self, port: u16, value: u8) {
        self.write(port, 1, value.into());
    }

    pub fn write_u16(&mut self, port: u16, value: u16) {
        self.write(port, 2, value.into());
    }

    pub fn write_u32(&mut self, port: u16, value: u32) {
        self.write(port, 4, value);
    }
}

fn width_mask(size: u8) -> u32 {
    match size {
        1 => 0xFF,
        2 => 0xFFFF,
        _ => 0xFFFF_FFFF,
    }
}
