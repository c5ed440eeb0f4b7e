//! ISA Plug and Play enumeration.
//!
//! Cards listen for the 32-byte LFSR initiation key on the ADDRESS port
//! (0x279), then take part in serial isolation on the relocatable READ_DATA
//! port: 72 identifier bits read as 0x55/0xAA pairs, losers dropping to
//! sleep, until one card remains and is assigned a CSN. Configuration then
//! happens per logical device through the standard register set (I/O base
//! descriptors, IRQ/DMA selects, activate).

use relic_platform::io::PortIoDevice;

pub const PNP_ADDRESS_PORT: u16 = 0x279;
pub const PNP_WRITE_DATA_PORT: u16 = 0xA79;
/// Power-on default; machines may relocate it via register 0x00.
pub const PNP_DEFAULT_READ_PORT: u16 = 0x203;

/// The initiation key, as generated by the standard 8-bit LFSR seeded with
/// 0x6A.
pub const INIT_KEY: [u8; 32] = init_key();

const fn init_key() -> [u8; 32] {
    let mut key = [0u8; 32];
    let mut lfsr = 0x6Au8;
    let mut i = 0;
    while i < 32 {
        key[i] = lfsr;
        let feedback = ((lfsr & 1) ^ ((lfsr >> 1) & 1)) << 7;
        lfsr = (lfsr >> 1) | feedback;
        i += 1;
    }
    key
}

/// Computes the trailing checksum byte of a 9-byte serial identifier.
pub fn serial_checksum(id: &[u8; 8]) -> u8 {
    let mut lfsr = 0x6Au8;
    for byte in id {
        for bit in 0..8 {
            let b = (byte >> bit) & 1;
            let feedback = (((lfsr & 1) ^ ((lfsr >> 1) & 1)) ^ b) << 7;
            lfsr = (lfsr >> 1) | feedback;
        }
    }
    lfsr
}

/// Builds a full serial identifier from an EISA-style vendor ID and serial
/// number.
pub fn serial_identifier(vendor: [u8; 4], serial: u32) -> [u8; 9] {
    let mut id = [0u8; 9];
    id[..4].copy_from_slice(&vendor);
    id[4..8].copy_from_slice(&serial.to_le_bytes());
    let body: [u8; 8] = id[..8].try_into().unwrap();
    id[8] = serial_checksum(&body);
    id
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CardState {
    WaitForKey,
    Sleep,
    Isolation,
    Config,
}

pub const MAX_LOGICAL_DEVICES: usize = 4;

#[derive(Clone, Copy, Default)]
pub struct LogicalDeviceConfig {
    pub io_base: [u16; 8],
    pub irq: [u8; 2],
    pub irq_type: [u8; 2],
    pub dma: [u8; 2],
    pub active: bool,
}

pub struct IsaPnpCard {
    id: [u8; 9],
    resources: Vec<u8>,
    csn: u8,
    state: CardState,
    isolation_bit: usize,
    resource_ptr: usize,
    logical_device: u8,
    logical_count: u8,
    config: [LogicalDeviceConfig; MAX_LOGICAL_DEVICES],
}

impl IsaPnpCard {
    pub fn new(id: [u8; 9], logical_count: u8, resources: Vec<u8>) -> Self {
        debug_assert!(logical_count as usize <= MAX_LOGICAL_DEVICES);
        Self {
            id,
            resources,
            csn: 0,
            state: CardState::WaitForKey,
            isolation_bit: 0,
            resource_ptr: 0,
            logical_device: 0,
            logical_count,
            config: [LogicalDeviceConfig::default(); MAX_LOGICAL_DEVICES],
        }
    }

    fn identifier_bit(&self, bit: usize) -> bool {
        let byte = self.id[bit / 8];
        byte & (1 << (bit % 8)) != 0
    }

    fn reset_config(&mut self) {
        self.config = [LogicalDeviceConfig::default(); MAX_LOGICAL_DEVICES];
        self.logical_device = 0;
    }

    pub fn csn(&self) -> u8 {
        self.csn
    }

    pub fn id(&self) -> &[u8; 9] {
        &self.id
    }

    pub fn logical_config(&self, ld: usize) -> &LogicalDeviceConfig {
        &self.config[ld]
    }
}

pub struct IsaPnpBus {
    cards: Vec<IsaPnpCard>,
    address: u8,
    key_progress: usize,
    read_port: u16,
    pending_read_port: Option<u16>,
    // Second read of the 0x55/0xAA pair pending.
    isolation_second: bool,
    next_csn: u8,
}

impl Default for IsaPnpBus {
    fn default() -> Self {
        Self::new()
    }
}

impl IsaPnpBus {
    pub fn new() -> Self {
        Self {
            cards: Vec::new(),
            address: 0,
            key_progress: 0,
            read_port: PNP_DEFAULT_READ_PORT,
            pending_read_port: None,
            isolation_second: false,
            next_csn: 1,
        }
    }

    pub fn add_card(&mut self, card: IsaPnpCard) -> usize {
        self.cards.push(card);
        self.cards.len() - 1
    }

    pub fn card(&self, index: usize) -> &IsaPnpCard {
        &self.cards[index]
    }

    pub fn read_port(&self) -> u16 {
        self.read_port
    }

    /// The platform re-registers the READ_DATA claim when this yields a
    /// port.
    pub fn take_read_port_change(&mut self) -> Option<u16> {
        self.pending_read_port.take()
    }

    pub fn reset(&mut self) {
        self.address = 0;
        self.key_progress = 0;
        self.isolation_second = false;
        self.next_csn = 1;
        for card in &mut self.cards {
            card.state = CardState::WaitForKey;
            card.csn = 0;
            card.isolation_bit = 0;
            card.resource_ptr = 0;
            card.reset_config();
        }
    }

    fn handle_address_write(&mut self, value: u8) {
        // Key detection runs whenever any card still waits for it.
        if self.cards.iter().any(|c| c.state == CardState::WaitForKey) {
            if value == INIT_KEY[self.key_progress] {
                self.key_progress += 1;
                if self.key_progress == INIT_KEY.len() {
                    self.key_progress = 0;
                    for card in &mut self.cards {
                        if card.state == CardState::WaitForKey {
                            card.state = CardState::Sleep;
                        }
                    }
                }
            } else {
                self.key_progress = usize::from(value == INIT_KEY[0]);
            }
        }
        self.address = value;
        self.isolation_second = false;
    }

    fn handle_data_write(&mut self, value: u8) {
        match self.address {
            0x00 => {
                // SET_RD_DATA: bits map to address lines A9..A2.
                self.read_port = (u16::from(value) << 2) | 0x3;
                self.pending_read_port = Some(self.read_port);
            }
            0x02 => {
                // CONFIG_CONTROL.
                if value & 0x01 != 0 {
                    for card in &mut self.cards {
                        card.reset_config();
                    }
                }
                if value & 0x02 != 0 {
                    for card in &mut self.cards {
                        card.state = CardState::WaitForKey;
                    }
                }
                if value & 0x04 != 0 {
                    for card in &mut self.cards {
                        card.csn = 0;
                    }
                    self.next_csn = 1;
                }
            }
            0x03 => {
                // WAKE[CSN].
                for card in &mut self.cards {
                    if card.state == CardState::WaitForKey {
                        continue;
                    }
                    if value == 0 && card.csn == 0 {
                        card.state = CardState::Isolation;
                        card.isolation_bit = 0;
                        card.resource_ptr = 0;
                    } else if value != 0 && card.csn == value {
                        card.state = CardState::Config;
                        card.resource_ptr = 0;
                    } else {
                        card.state = CardState::Sleep;
                    }
                }
                self.isolation_second = false;
            }
            0x06 => {
                // CSN assignment to the isolation winner.
                for card in &mut self.cards {
                    if card.state == CardState::Isolation {
                        card.csn = value;
                        card.state = CardState::Config;
                        self.next_csn = self.next_csn.max(value.wrapping_add(1));
                    }
                }
            }
            0x07 => {
                for card in &mut self.cards {
                    if card.state == CardState::Config {
                        card.logical_device = value.min(card.logical_count.saturating_sub(1));
                    }
                }
            }
            reg => {
                for card in &mut self.cards {
                    if card.state != CardState::Config {
                        continue;
                    }
                    let ld = card.logical_device as usize;
                    let cfg = &mut card.config[ld];
                    match reg {
                        0x30 => cfg.active = value & 0x01 != 0,
                        0x60..=0x6F => {
                            let idx = ((reg - 0x60) / 2) as usize;
                            if reg & 1 == 0 {
                                cfg.io_base[idx] =
                                    (cfg.io_base[idx] & 0x00FF) | (u16::from(value) << 8);
                            } else {
                                cfg.io_base[idx] = (cfg.io_base[idx] & 0xFF00) | u16::from(value);
                            }
                        }
                        0x70 => cfg.irq[0] = value & 0x0F,
                        0x71 => cfg.irq_type[0] = value,
                        0x72 => cfg.irq[1] = value & 0x0F,
                        0x73 => cfg.irq_type[1] = value,
                        0x74 => cfg.dma[0] = value & 0x07,
                        0x75 => cfg.dma[1] = value & 0x07,
                        _ => {}
                    }
                }
            }
        }
    }

    fn serial_isolation_read(&mut self) -> u8 {
        let driven = self
            .cards
            .iter()
            .any(|c| c.state == CardState::Isolation && c.identifier_bit(c.isolation_bit));

        if !self.isolation_second {
            self.isolation_second = true;
            if driven {
                0x55
            } else {
                0xFF
            }
        } else {
            self.isolation_second = false;
            let result = if driven { 0xAA } else { 0xFF };
            // End of the bit cell: cards holding a zero bit lose if someone
            // drove the pair; everyone advances.
            for card in &mut self.cards {
                if card.state != CardState::Isolation {
                    continue;
                }
                if driven && !card.identifier_bit(card.isolation_bit) {
                    card.state = CardState::Sleep;
                    continue;
                }
                card.isolation_bit += 1;
                if card.isolation_bit >= 72 {
                    card.isolation_bit = 0;
                }
            }
            result
        }
    }

    fn handle_data_read(&mut self) -> u8 {
        match self.address {
            0x01 => self.serial_isolation_read(),
            0x04 => {
                // Resource data, byte at a time.
                for card in &mut self.cards {
                    if card.state == CardState::Config {
                        let byte = card
                            .resources
                            .get(card.resource_ptr)
                            .copied()
                            .unwrap_or(0xFF);
                        card.resource_ptr += 1;
                        return byte;
                    }
                }
                0xFF
            }
            0x05 => 0x01, // resource byte always available
            0x06 => self
                .cards
                .iter()
                .find(|c| c.state == CardState::Config)
                .map(|c| c.csn)
                .unwrap_or(0xFF),
            0x07 => self
                .cards
                .iter()
                .find(|c| c.state == CardState::Config)
                .map(|c| c.logical_device)
                .unwrap_or(0xFF),
            reg => {
                for card in &self.cards {
                    if card.state != CardState::Config {
                        continue;
                    }
                    let cfg = &card.config[card.logical_device as usize];
                    return match reg {
                        0x30 => cfg.active.into(),
                        0x60..=0x6F => {
                            let idx = ((reg - 0x60) / 2) as usize;
                            if reg & 1 == 0 {
                                (cfg.io_base[idx] >> 8) as u8
                            } else {
                                cfg.io_base[idx] as u8
                            }
                        }
                        0x70 => cfg.irq[0],
                        0x71 => cfg.irq_type[0],
                        0x72 => cfg.irq[1],
                        0x73 => cfg.irq_type[1],
                        0x74 => cfg.dma[0],
                        0x75 => cfg.dma[1],
                        _ => 0xFF,
                    };
                }
                0xFF
            }
        }
    }
}

impl PortIoDevice for IsaPnpBus {
    fn read(&mut self, port: u16, _size: u8) -> u32 {
        if port == self.read_port {
            return self.handle_data_read().into();
        }
        0xFF
    }

    fn write(&mut self, port: u16, _size: u8, value: u32) {
        let value = value as u8;
        match port {
            PNP_ADDRESS_PORT => self.handle_address_write(value),
            PNP_WRITE_DATA_PORT => self.handle_data_write(value),
            _ => {}
        }
    }
}
