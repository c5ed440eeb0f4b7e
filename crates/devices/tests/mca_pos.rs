use std::cell::RefCell;
use std::rc::Rc;

use relic_devices::mca::{McaBus, McaCard, MCA_POS_BASE, MCA_SETUP_PORT};
use relic_platform::io::PortIoDevice;

struct OptionCard {
    adapter_id: u16,
    pos: [u8; 8],
    resets: u32,
}

impl OptionCard {
    fn new(adapter_id: u16) -> Self {
        Self {
            adapter_id,
            pos: [0; 8],
            resets: 0,
        }
    }
}

impl McaCard for OptionCard {
    fn pos_read(&mut self, reg: u8) -> u8 {
        match reg {
            0 => self.adapter_id as u8,
            1 => (self.adapter_id >> 8) as u8,
            r => self.pos[r as usize],
        }
    }

    fn pos_write(&mut self, reg: u8, value: u8) {
        if reg >= 2 {
            self.pos[reg as usize] = value;
        }
    }

    fn feedback(&mut self) -> u8 {
        1
    }

    fn reset(&mut self) {
        self.resets += 1;
        self.pos = [0; 8];
    }
}

#[test]
fn pos_access_requires_setup_mode_and_slot_select() {
    let mut bus = McaBus::new();
    let card0 = Rc::new(RefCell::new(OptionCard::new(0xEFFF)));
    let card1 = Rc::new(RefCell::new(OptionCard::new(0x6FC0)));
    assert_eq!(bus.add_card(card0.clone()), Some(0));
    assert_eq!(bus.add_card(card1.clone()), Some(1));

    // Setup inactive: the channel floats.
    assert_eq!(bus.read(MCA_POS_BASE, 1), 0xFF);

    // Select slot 1 in setup mode and read its adapter ID.
    bus.write(MCA_SETUP_PORT, 1, 0x08 | 0x01);
    assert_eq!(bus.read(MCA_POS_BASE, 1), 0xC0);
    assert_eq!(bus.read(MCA_POS_BASE + 1, 1), 0x6F);

    // POS register 2 write lands on the selected card only.
    bus.write(MCA_POS_BASE + 2, 1, 0x01);
    assert_eq!(card1.borrow().pos[2], 0x01);
    assert_eq!(card0.borrow().pos[2], 0x00);

    // Leaving setup mode hides the POS block again.
    bus.write(MCA_SETUP_PORT, 1, 0x01);
    assert_eq!(bus.read(MCA_POS_BASE, 1), 0xFF);
}

#[test]
fn channel_reset_broadcasts_to_all_cards() {
    let mut bus = McaBus::new();
    let card0 = Rc::new(RefCell::new(OptionCard::new(0xEFFF)));
    let card1 = Rc::new(RefCell::new(OptionCard::new(0x6FC0)));
    bus.add_card(card0.clone());
    bus.add_card(card1.clone());

    bus.reset();
    assert_eq!(card0.borrow().resets, 1);
    assert_eq!(card1.borrow().resets, 1);
}

#[test]
fn feedback_reflects_selected_card() {
    let mut bus = McaBus::new();
    assert_eq!(bus.feedback(), 0, "no setup mode, no feedback");

    let card = Rc::new(RefCell::new(OptionCard::new(0xEFFF)));
    bus.add_card(card);
    bus.write(MCA_SETUP_PORT, 1, 0x08);
    assert_eq!(bus.feedback(), 1);
}
