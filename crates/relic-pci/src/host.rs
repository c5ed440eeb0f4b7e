use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use relic_platform::io::{IoPortBus, PortIoDevice};
use relic_platform::reset::{ResetEvent, ResetLine};

use crate::config::PciDevice;
use crate::PciBdf;

/// The slot table: up to 256 bus numbers × 32 devices × 8 functions.
/// Unpopulated coordinates read all-ones.
#[derive(Default)]
pub struct PciBus {
    devices: BTreeMap<PciBdf, Box<dyn PciDevice>>,
}

impl PciBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_device(&mut self, bdf: PciBdf, device: Box<dyn PciDevice>) {
        if self.devices.insert(bdf, device).is_some() {
            log::warn!("PCI function {bdf:?} replaced an existing device");
        }
    }

    pub fn device(&self, bdf: PciBdf) -> Option<&dyn PciDevice> {
        self.devices.get(&bdf).map(|d| &**d)
    }

    pub fn device_mut(&mut self, bdf: PciBdf) -> Option<&mut (dyn PciDevice + '_)> {
        match self.devices.get_mut(&bdf) {
            Some(d) => Some(d.as_mut()),
            None => None,
        }
    }

    pub fn bdfs(&self) -> Vec<PciBdf> {
        self.devices.keys().copied().collect()
    }

    pub fn config_read(&mut self, bdf: PciBdf, offset: u8, size: u8) -> u32 {
        match self.devices.get_mut(&bdf) {
            Some(dev) => dev.config_read(offset, size),
            None => match size {
                1 => 0xFF,
                2 => 0xFFFF,
                _ => 0xFFFF_FFFF,
            },
        }
    }

    pub fn config_write(&mut self, bdf: PciBdf, offset: u8, size: u8, value: u32) {
        if let Some(dev) = self.devices.get_mut(&bdf) {
            dev.config_write(offset, size, value);
        }
    }

    pub fn reset_all(&mut self) {
        for dev in self.devices.values_mut() {
            dev.reset();
        }
    }
}

pub const PCI_CFG_ADDR_PORT: u16 = 0xCF8;
pub const PCI_CFG_DATA_PORT: u16 = 0xCFC;

pub const RESET_CTRL_PORT: u16 = 0xCF9;
pub const RESET_CTRL_RESET_VALUE: u8 = 0x06;

/// Configuration mechanism #1: dword address latch at 0xCF8, data window at
/// 0xCFC–0xCFF. Byte-sized access to 0xCF9 decodes as the chipset reset
/// control register instead of an address-latch lane, as on real south
/// bridges.
pub struct ConfigMech1Io {
    bus: Rc<RefCell<PciBus>>,
    addr: u32,
    reset: Option<ResetLine>,
}

impl ConfigMech1Io {
    pub fn new(bus: Rc<RefCell<PciBus>>) -> Self {
        Self {
            bus,
            addr: 0,
            reset: None,
        }
    }

    pub fn set_reset_line(&mut self, reset: ResetLine) {
        self.reset = Some(reset);
    }

    pub fn attach(this: &Rc<RefCell<Self>>, io: &mut IoPortBus) {
        io.register(PCI_CFG_ADDR_PORT, 8, this.clone());
    }

    fn decode(&self, data_port: u16) -> Option<(PciBdf, u8)> {
        if self.addr & 0x8000_0000 == 0 {
            return None;
        }
        let bdf = PciBdf {
            bus: (self.addr >> 16) as u8,
            device: ((self.addr >> 11) & 0x1F) as u8,
            function: ((self.addr >> 8) & 0x7) as u8,
        };
        let register = (self.addr & 0xFC) as u8 + (data_port - PCI_CFG_DATA_PORT) as u8;
        Some((bdf, register))
    }
}

impl PortIoDevice for ConfigMech1Io {
    fn read(&mut self, port: u16, size: u8) -> u32 {
        match port {
            0xCF8..=0xCFB => {
                let shift = 8 * (port - 0xCF8) as u32;
                let mut value = 0u32;
                for i in 0..size as u32 {
                    value |= ((self.addr >> (shift + 8 * i)) & 0xFF) << (8 * i);
                }
                value
            }
            0xCFC..=0xCFF => match self.decode(port) {
                Some((bdf, register)) => self.bus.borrow_mut().config_read(bdf, register, size),
                None => match size {
                    1 => 0xFF,
                    2 => 0xFFFF,
                    _ => 0xFFFF_FFFF,
                },
            },
            _ => 0xFFFF_FFFF,
        }
    }

    fn write(&mut self, port: u16, size: u8, value: u32) {
        match port {
            RESET_CTRL_PORT if size == 1 && self.reset.is_some() => {
                if value as u8 & 0x04 != 0 {
                    self.reset.as_ref().unwrap().request(ResetEvent::System);
                }
            }
            0xCF8..=0xCFB => {
                let shift = 8 * (port - 0xCF8) as u32;
                for i in 0..size as u32 {
                    let bit = shift + 8 * i;
                    if bit < 32 {
                        self.addr &= !(0xFF << bit);
                        self.addr |= ((value >> (8 * i)) & 0xFF) << bit;
                    }
                }
            }
            0xCFC..=0xCFF => {
                if let Some((bdf, register)) = self.decode(port) {
                    self.bus
                        .borrow_mut()
                        .config_write(bdf, register, size, value);
                }
            }
            _ => {}
        }
    }
}

/// Configuration mechanism #2: CSE register at 0xCF8 (key in bits 7..4,
/// function in 3..1), forward (bus) register at 0xCFA, and a 4 KiB config
/// window at C000h–CFFFh where address bits 11..8 select the device.
pub struct ConfigMech2Io {
    bus: Rc<RefCell<PciBus>>,
    cse: u8,
    forward: u8,
}

impl ConfigMech2Io {
    pub fn new(bus: Rc<RefCell<PciBus>>) -> Self {
        Self {
            bus,
            cse: 0,
            forward: 0,
        }
    }

    pub fn attach(this: &Rc<RefCell<Self>>, io: &mut IoPortBus) {
        io.register(0xCF8, 1, this.clone());
        io.register(0xCFA, 1, this.clone());
        io.register(0xC000, 0x1000, this.clone());
    }

    fn enabled(&self) -> bool {
        self.cse & 0xF0 != 0
    }

    fn decode(&self, port: u16) -> (PciBdf, u8) {
        let bdf = PciBdf {
            bus: self.forward,
            device: ((port >> 8) & 0xF) as u8,
            function: (self.cse >> 1) & 0x7,
        };
        (bdf, port as u8)
    }
}

impl PortIoDevice for ConfigMech2Io {
    fn read(&mut self, port: u16, size: u8) -> u32 {
        match port {
            0xCF8 => self.cse.into(),
            0xCFA => self.forward.into(),
            0xC000..=0xCFFF if self.enabled() => {
                let (bdf, register) = self.decode(port);
                self.bus.borrow_mut().config_read(bdf, register, size)
            }
            _ => match size {
                1 => 0xFF,
                2 => 0xFFFF,
                _ => 0xFFFF_FFFF,
            },
        }
    }

    fn write(&mut self, port: u16, size: u8, value: u32) {
        match port {
            0xCF8 => self.cse = value as u8,
            0xCFA => self.forward = value as u8,
            0xC000..=0xCFFF if self.enabled() => {
                let (bdf, register) = self.decode(port);
                self.bus
                    .borrow_mut()
                    .config_write(bdf, register, size, value);
            }
            _ => {}
        }
    }
}

/// Convenience bundle: the slot table plus its mechanism #1 decoder.
pub struct PciHost {
    pub bus: Rc<RefCell<PciBus>>,
    pub mech1: Rc<RefCell<ConfigMech1Io>>,
}

impl PciHost {
    pub fn new() -> Self {
        let bus = Rc::new(RefCell::new(PciBus::new()));
        let mech1 = Rc::new(RefCell::new(ConfigMech1Io::new(bus.clone())));
        Self { bus, mech1 }
    }

    pub fn attach(&self, io: &mut IoPortBus) {
        ConfigMech1Io::attach(&self.mech1, io);
    }
}

impl Default for PciHost {
    fn default() -> Self {
        Self::new()
    }
}
