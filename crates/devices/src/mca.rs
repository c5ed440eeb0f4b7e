//! Micro Channel POS (Programmable Option Select) fabric.
//!
//! Eight slots; the adapter-setup register at 0x96 selects which slot's
//! 8-byte POS block answers at 0x100–0x107. POS bytes 0/1 carry the adapter
//! ID, byte 2 bit 0 is the card-enable by convention; everything past the ID
//! is card-defined.

use std::cell::RefCell;
use std::rc::Rc;

use relic_platform::io::PortIoDevice;

pub const MCA_SETUP_PORT: u16 = 0x96;
pub const MCA_POS_BASE: u16 = 0x100;
pub const MCA_SLOTS: usize = 8;

const SETUP_ACTIVE: u8 = 0x08;

pub trait McaCard {
    fn pos_read(&mut self, reg: u8) -> u8;
    fn pos_write(&mut self, reg: u8, value: u8);
    fn feedback(&mut self) -> u8 {
        0
    }
    fn reset(&mut self) {}
}

pub struct McaBus {
    slots: [Option<Rc<RefCell<dyn McaCard>>>; MCA_SLOTS],
    setup: u8,
}

impl Default for McaBus {
    fn default() -> Self {
        Self::new()
    }
}

impl McaBus {
    pub fn new() -> Self {
        Self {
            slots: Default::default(),
            setup: 0,
        }
    }

    /// Seats a card in the first free slot; returns the slot number.
    pub fn add_card(&mut self, card: Rc<RefCell<dyn McaCard>>) -> Option<usize> {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(card);
                return Some(i);
            }
        }
        log::warn!("all MCA slots populated");
        None
    }

    pub fn card(&self, slot: usize) -> Option<Rc<RefCell<dyn McaCard>>> {
        self.slots.get(slot)?.clone()
    }

    fn selected(&self) -> Option<Rc<RefCell<dyn McaCard>>> {
        if self.setup & SETUP_ACTIVE == 0 {
            return None;
        }
        self.slots[(self.setup & 0x07) as usize].clone()
    }

    pub fn feedback(&mut self) -> u8 {
        match self.selected() {
            Some(card) => u8::from(card.borrow_mut().feedback() != 0),
            None => 0,
        }
    }

    /// Channel reset: broadcast to every seated card.
    pub fn reset(&mut self) {
        self.setup = 0;
        for card in self.slots.iter().flatten() {
            card.borrow_mut().reset();
        }
    }
}

impl PortIoDevice for McaBus {
    fn read(&mut self, port: u16, _size: u8) -> u32 {
        let value = match port {
            MCA_SETUP_PORT => self.setup,
            MCA_POS_BASE..=0x107 => match self.selected() {
                Some(card) => card.borrow_mut().pos_read((port - MCA_POS_BASE) as u8),
                None => 0xFF,
            },
            _ => 0xFF,
        };
        value.into()
    }

    fn write(&mut self, port: u16, _size: u8, value: u32) {
        let value = value as u8;
        match port {
            MCA_SETUP_PORT => self.setup = value,
            MCA_POS_BASE..=0x107 => {
                if let Some(card) = self.selected() {
                    card.borrow_mut().pos_write((port - MCA_POS_BASE) as u8, value);
                }
            }
            _ => {}
        }
    }
}
