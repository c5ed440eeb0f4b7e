use std::cell::RefCell;
use std::rc::Rc;

use relic_pci::{
    ConfigMech1Io, ConfigMech2Io, IntxPin, IntxRouter, PciBarDefinition, PciBdf, PciBus,
    PciConfigSpace, PciDevice, SlotKind,
};
use relic_platform::io::IoPortBus;

struct PlainFunction {
    cfg: PciConfigSpace,
}

impl PlainFunction {
    fn new(vendor: u16, device: u16) -> Self {
        Self {
            cfg: PciConfigSpace::new(vendor, device),
        }
    }
}

impl PciDevice for PlainFunction {
    fn config(&self) -> &PciConfigSpace {
        &self.cfg
    }

    fn config_mut(&mut self) -> &mut PciConfigSpace {
        &mut self.cfg
    }
}

fn cfg_addr(bdf: PciBdf, offset: u8) -> u32 {
    0x8000_0000
        | ((bdf.bus as u32) << 16)
        | ((bdf.device as u32) << 11)
        | ((bdf.function as u32) << 8)
        | (offset as u32 & 0xFC)
}

fn mech1_bus() -> (IoPortBus, Rc<RefCell<PciBus>>) {
    let bus = Rc::new(RefCell::new(PciBus::new()));
    let mech1 = Rc::new(RefCell::new(ConfigMech1Io::new(bus.clone())));
    let mut io = IoPortBus::new();
    ConfigMech1Io::attach(&mech1, &mut io);
    (io, bus)
}

#[test]
fn mechanism1_reads_vendor_device_of_host_bridge() {
    let (mut io, bus) = mech1_bus();
    let mut bridge = PlainFunction::new(0x8086, 0x1237);
    bridge.cfg.set_class(0x06, 0x00, 0x00);
    bus.borrow_mut()
        .add_device(PciBdf::new(0, 0, 0), Box::new(bridge));

    io.write_u32(0xCF8, 0x8000_0000);
    let id = io.read_u32(0xCFC);
    assert_eq!(id, 0x1237_8086);

    // Class code dword at 0x08.
    io.write_u32(0xCF8, 0x8000_0008);
    assert_eq!(io.read_u32(0xCFC) >> 16, 0x0600);
}

#[test]
fn mechanism1_unpopulated_coordinates_read_all_ones() {
    let (mut io, _bus) = mech1_bus();
    io.write_u32(0xCF8, cfg_addr(PciBdf::new(0, 13, 0), 0));
    assert_eq!(io.read_u32(0xCFC), 0xFFFF_FFFF);

    // Disabled (bit 31 clear) accesses also float.
    io.write_u32(0xCF8, 0x0000_0000);
    assert_eq!(io.read_u32(0xCFC), 0xFFFF_FFFF);
}

#[test]
fn config_write_read_roundtrip_respects_masks() {
    let (mut io, bus) = mech1_bus();
    let mut f = PlainFunction::new(0x10EC, 0x8029);
    f.cfg.set_interrupt_pin(1);
    bus.borrow_mut()
        .add_device(PciBdf::new(0, 5, 0), Box::new(f));
    let bdf = PciBdf::new(0, 5, 0);

    // Vendor/device are read-only: writes keep the initial value.
    io.write_u32(0xCF8, cfg_addr(bdf, 0x00));
    io.write_u32(0xCFC, 0xDEAD_BEEF);
    assert_eq!(io.read_u32(0xCFC), 0x8029_10EC);

    // Command register: writable bits stick, reserved bits read zero.
    io.write_u32(0xCF8, cfg_addr(bdf, 0x04));
    io.write_u32(0xCFC, 0x0000_FFFF);
    assert_eq!(io.read_u32(0xCFC) & 0xFFFF, 0x0547);

    // Interrupt line is scratch; interrupt pin is read-only.
    io.write_u32(0xCF8, cfg_addr(bdf, 0x3C));
    io.write_u32(0xCFC, 0x0000_020B);
    assert_eq!(io.read_u32(0xCFC) & 0xFFFF, 0x010B);
}

#[test]
fn bar_probe_returns_size_mask() {
    let (mut io, bus) = mech1_bus();
    let mut f = PlainFunction::new(0x5333, 0x8811);
    f.cfg
        .set_bar_definition(0, PciBarDefinition::Memory { size: 0x0100_0000, prefetchable: true });
    f.cfg.set_bar_definition(1, PciBarDefinition::Io { size: 0x20 });
    bus.borrow_mut()
        .add_device(PciBdf::new(0, 8, 0), Box::new(f));
    let bdf = PciBdf::new(0, 8, 0);

    io.write_u32(0xCF8, cfg_addr(bdf, 0x10));
    io.write_u32(0xCFC, 0xFFFF_FFFF);
    assert_eq!(io.read_u32(0xCFC), 0xFF00_0008);

    io.write_u32(0xCF8, cfg_addr(bdf, 0x14));
    io.write_u32(0xCFC, 0xFFFF_FFFF);
    assert_eq!(io.read_u32(0xCFC), 0xFFFF_FFE1);

    // Program a base; flag bits are preserved by hardware.
    io.write_u32(0xCF8, cfg_addr(bdf, 0x10));
    io.write_u32(0xCFC, 0x0400_0000);
    assert_eq!(io.read_u32(0xCFC), 0x0400_0008);
    assert_eq!(
        bus.borrow().device(bdf).unwrap().config().bar_base(0),
        Some(0x0400_0000)
    );
}

#[test]
fn mechanism2_window_selects_device_by_address_bits() {
    let bus = Rc::new(RefCell::new(PciBus::new()));
    bus.borrow_mut()
        .add_device(PciBdf::new(0, 3, 0), Box::new(PlainFunction::new(0x1013, 0x00A0)));
    let mech2 = Rc::new(RefCell::new(ConfigMech2Io::new(bus)));
    let mut io = IoPortBus::new();
    ConfigMech2Io::attach(&mech2, &mut io);

    // Window disabled until the CSE key is non-zero.
    assert_eq!(io.read_u16(0xC300), 0xFFFF);

    io.write_u8(0xCF8, 0x80); // key
    io.write_u8(0xCFA, 0x00); // bus 0
    assert_eq!(io.read_u16(0xC300), 0x1013);
    assert_eq!(io.read_u16(0xC302), 0x00A0);
}

#[test]
fn intx_router_steers_pins_through_links() {
    let mut router = IntxRouter::new();
    router.register_slot(0, 8, SlotKind::Video, [0, 1, 2, 3]);
    router.register_slot(0, 9, SlotKind::Network, [1, 2, 3, 0]);

    // Nothing routes until the chipset programs the links.
    assert_eq!(router.resolve(0, 8, IntxPin::IntA), None);

    router.set_link_irq(0, Some(11));
    router.set_link_irq(1, Some(10));

    assert_eq!(router.resolve(0, 8, IntxPin::IntA), Some(11));
    assert_eq!(router.resolve(0, 9, IntxPin::IntA), Some(10));
    // Swizzled pin B of slot 9 lands on link 2, which is unrouted.
    assert_eq!(router.resolve(0, 9, IntxPin::IntB), None);

    router.set_link_irq(0, None);
    assert_eq!(router.resolve(0, 8, IntxPin::IntA), None);
    assert_eq!(router.slot_kind(0, 8), Some(SlotKind::Video));
}
