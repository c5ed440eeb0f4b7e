//! Port adapters for devices whose register accesses need the guest clock
//! or the timer queue (the `PortIoDevice` signature carries neither).

use std::cell::RefCell;
use std::rc::Rc;

use relic_devices::cmos::{Cmos, CMOS_DATA_PORT, CMOS_INDEX_PORT};
use relic_devices::pit8254::{Pit, PIT_CH0, PIT_CMD};
use relic_devices::DeviceTimer;
use relic_platform::io::PortIoDevice;
use relic_time::ManualClock;
use relic_timers::TimerQueue;

pub struct PitPorts {
    pub pit: Rc<RefCell<Pit>>,
    pub clock: ManualClock,
    pub timers: Rc<RefCell<TimerQueue<DeviceTimer>>>,
}

impl PortIoDevice for PitPorts {
    fn read(&mut self, port: u16, _size: u8) -> u32 {
        let now = self.clock.now_ns();
        match port {
            PIT_CH0..=0x42 => self
                .pit
                .borrow_mut()
                .read_data((port - PIT_CH0) as usize, now)
                .into(),
            _ => 0xFF,
        }
    }

    fn write(&mut self, port: u16, _size: u8, value: u32) {
        let now = self.clock.now_ns();
        let value = value as u8;
        match port {
            PIT_CMD => self.pit.borrow_mut().write_command(value, now),
            PIT_CH0..=0x42 => {
                let mut timers = self.timers.borrow_mut();
                self.pit
                    .borrow_mut()
                    .write_data((port - PIT_CH0) as usize, value, now, &mut timers);
            }
            _ => {}
        }
    }
}

pub struct CmosPorts {
    pub cmos: Rc<RefCell<Cmos>>,
    pub clock: ManualClock,
    pub timers: Rc<RefCell<TimerQueue<DeviceTimer>>>,
}

impl PortIoDevice for CmosPorts {
    fn read(&mut self, port: u16, _size: u8) -> u32 {
        let now = self.clock.now_ns();
        self.cmos.borrow_mut().read_port(port, now).into()
    }

    fn write(&mut self, port: u16, _size: u8, value: u32) {
        let now = self.clock.now_ns();
        debug_assert!(matches!(port, CMOS_INDEX_PORT | CMOS_DATA_PORT));
        let mut timers = self.timers.borrow_mut();
        self.cmos
            .borrow_mut()
            .write_port(port, value as u8, now, &mut timers);
    }
}

/// Port 0x61: PC speaker gate/data plus the refresh toggle bit that POST
/// routines poll.
pub struct PortB {
    pub pit: Rc<RefCell<Pit>>,
    pub clock: ManualClock,
    refresh_toggle: bool,
}

impl PortB {
    pub fn new(pit: Rc<RefCell<Pit>>, clock: ManualClock) -> Self {
        Self {
            pit,
            clock,
            refresh_toggle: false,
        }
    }
}

impl PortIoDevice for PortB {
    fn read(&mut self, _port: u16, _size: u8) -> u32 {
        let now = self.clock.now_ns();
        let pit = self.pit.borrow();
        let (gate, data) = pit.speaker_control();
        let out2 = pit.out2(now);
        drop(pit);
        self.refresh_toggle = !self.refresh_toggle;
        (u32::from(gate))
            | (u32::from(data) << 1)
            | (u32::from(self.refresh_toggle) << 4)
            | (u32::from(out2) << 5)
    }

    fn write(&mut self, _port: u16, _size: u8, value: u32) {
        let now = self.clock.now_ns();
        self.pit
            .borrow_mut()
            .set_speaker_control(value & 1 != 0, value & 2 != 0, now);
    }
}
