use std::cell::RefCell;
use std::rc::Rc;

use relic_devices::cmos::{Cmos, CMOS_DATA_PORT, CMOS_INDEX_PORT};
use relic_devices::irq::{InterruptController, IrqLine};
use relic_devices::DeviceTimer;
use relic_timers::TimerQueue;

#[derive(Default)]
struct IrqRecorder {
    rises: u32,
    falls: u32,
}

impl InterruptController for IrqRecorder {
    fn set_irq_line(&mut self, _line: u8, high: bool) {
        if high {
            self.rises += 1;
        } else {
            self.falls += 1;
        }
    }
}

fn rtc() -> (Cmos, Rc<RefCell<IrqRecorder>>) {
    let rec = Rc::new(RefCell::new(IrqRecorder::default()));
    let mut cmos = Cmos::new();
    cmos.set_irq8(IrqLine::new(rec.clone(), 8));
    (cmos, rec)
}

fn pump(cmos: &mut Cmos, queue: &mut TimerQueue<DeviceTimer>, now: u64) {
    while let Some(ev) = queue.pop_due(now) {
        match ev.payload {
            DeviceTimer::RtcPeriodic => cmos.handle_periodic(ev.deadline_ns, queue),
            DeviceTimer::RtcSecond => cmos.handle_second(ev.deadline_ns, queue),
            other => panic!("unexpected timer {other:?}"),
        }
    }
}

#[test]
fn nvram_round_trips_through_ports() {
    let (mut cmos, _rec) = rtc();
    let mut queue = TimerQueue::new();

    cmos.write_port(CMOS_INDEX_PORT, 0x20, 0, &mut queue);
    cmos.write_port(CMOS_DATA_PORT, 0x42, 0, &mut queue);
    cmos.write_port(CMOS_INDEX_PORT, 0x20, 0, &mut queue);
    assert_eq!(cmos.read_port(CMOS_DATA_PORT, 0), 0x42);

    let saved = cmos.nvram_bytes();
    let (mut restored, _rec2) = rtc();
    restored.load_nvram(&saved);
    assert_eq!(restored.read_reg(0x20), 0x42);
}

#[test]
fn periodic_interrupt_fires_at_programmed_rate_and_clears_on_status_c_read() {
    let (mut cmos, rec) = rtc();
    let mut queue = TimerQueue::new();

    // Rate 6 = 1024 Hz, enable PIE.
    cmos.write_port(CMOS_INDEX_PORT, 0x0A, 0, &mut queue);
    cmos.write_port(CMOS_DATA_PORT, 0x26, 0, &mut queue);
    cmos.write_port(CMOS_INDEX_PORT, 0x0B, 0, &mut queue);
    cmos.write_port(CMOS_DATA_PORT, 0x42, 0, &mut queue);

    let interval = 1_000_000_000 / 1024;
    pump(&mut cmos, &mut queue, interval * 4);
    assert_eq!(rec.borrow().rises, 4);

    // Status C read reports PF|IRQF once and lowers the line.
    cmos.write_port(CMOS_INDEX_PORT, 0x0C, 0, &mut queue);
    let c = cmos.read_port(CMOS_DATA_PORT, 0);
    assert_eq!(c & 0xC0, 0xC0);
    assert!(rec.borrow().falls >= 1);
    cmos.write_port(CMOS_INDEX_PORT, 0x0C, 0, &mut queue);
    assert_eq!(cmos.read_port(CMOS_DATA_PORT, 0), 0);

    // Clearing PIE stops the stream.
    cmos.write_port(CMOS_INDEX_PORT, 0x0B, 0, &mut queue);
    cmos.write_port(CMOS_DATA_PORT, 0x02, 0, &mut queue);
    let before = rec.borrow().rises;
    pump(&mut cmos, &mut queue, interval * 64);
    assert_eq!(rec.borrow().rises, before);
}

#[test]
fn seconds_tick_in_bcd_and_carry() {
    let (mut cmos, _rec) = rtc();
    let mut queue = TimerQueue::new();

    cmos.set_time(1997, 8, 26, 23, 59, 59);
    queue.schedule_at(1_000_000_000, DeviceTimer::RtcSecond);
    pump(&mut cmos, &mut queue, 1_000_000_000);

    // BCD encoding: midnight rollover carried through hours.
    assert_eq!(cmos.read_reg(0x00), 0x00);
    assert_eq!(cmos.read_reg(0x02), 0x00);
    assert_eq!(cmos.read_reg(0x04), 0x00);
    assert_eq!(cmos.read_reg(0x07), 0x27);
    assert_eq!(cmos.read_reg(0x09), 0x97);
}
