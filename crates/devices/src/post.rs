//! Port 0x80 POST diagnostic latch.

use relic_platform::io::PortIoDevice;

pub const POST_PORT: u16 = 0x80;

#[derive(Default)]
pub struct PostCard {
    last: u8,
    history: Vec<u8>,
}

impl PostCard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_code(&self) -> u8 {
        self.last
    }

    /// Every code written since the last drain, in order.
    pub fn take_history(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.history)
    }

    pub fn reset(&mut self) {
        self.last = 0;
        self.history.clear();
    }
}

impl PortIoDevice for PostCard {
    fn read(&mut self, _port: u16, _size: u8) -> u32 {
        self.last.into()
    }

    fn write(&mut self, _port: u16, _size: u8, value: u32) {
        self.last = value as u8;
        self.history.push(self.last);
        log::debug!("POST {:02X}", self.last);
    }
}
