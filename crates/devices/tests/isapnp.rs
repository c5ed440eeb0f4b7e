use relic_devices::isapnp::{
    serial_identifier, IsaPnpBus, IsaPnpCard, INIT_KEY, PNP_ADDRESS_PORT, PNP_WRITE_DATA_PORT,
};
use relic_platform::io::PortIoDevice;

fn send_key(bus: &mut IsaPnpBus) {
    for byte in INIT_KEY {
        bus.write(PNP_ADDRESS_PORT, 1, byte.into());
    }
}

fn addr(bus: &mut IsaPnpBus, reg: u8) {
    bus.write(PNP_ADDRESS_PORT, 1, reg.into());
}

fn wdata(bus: &mut IsaPnpBus, reg: u8, value: u8) {
    addr(bus, reg);
    bus.write(PNP_WRITE_DATA_PORT, 1, value.into());
}

fn rdata(bus: &mut IsaPnpBus, reg: u8) -> u8 {
    addr(bus, reg);
    let port = bus.read_port();
    bus.read(port, 1) as u8
}

/// Runs one serial-isolation pass and returns the 72 bits read, assigning
/// `csn` to the winner.
fn isolate(bus: &mut IsaPnpBus, csn: u8) -> Vec<u8> {
    wdata(bus, 0x03, 0); // Wake[0]: CSN-less cards enter isolation
    addr(bus, 0x01);
    let port = bus.read_port();
    let mut bytes = Vec::new();
    for _ in 0..72 {
        let a = bus.read(port, 1) as u8;
        let b = bus.read(port, 1) as u8;
        bytes.push(if a == 0x55 && b == 0xAA { 1 } else { 0 });
    }
    wdata(bus, 0x06, csn);
    bytes
}

fn bits_to_bytes(bits: &[u8]) -> Vec<u8> {
    bits.chunks(8)
        .map(|c| c.iter().enumerate().fold(0u8, |acc, (i, b)| acc | (b << i)))
        .collect()
}

#[test]
fn init_key_matches_published_sequence_start() {
    assert_eq!(&INIT_KEY[..4], &[0x6A, 0xB5, 0xDA, 0xED]);
}

#[test]
fn single_card_isolation_yields_identifier_and_csn() {
    let id = serial_identifier(*b"RLC0", 0x0000_1234);
    let mut bus = IsaPnpBus::new();
    let card = bus.add_card(IsaPnpCard::new(id, 1, vec![0x0A, 0x10, 0x0B]));

    send_key(&mut bus);
    let bits = isolate(&mut bus, 1);
    assert_eq!(bits_to_bytes(&bits), id.to_vec());
    assert_eq!(bus.card(card).csn(), 1);

    // Resource data reads back the card's ROM.
    assert_eq!(rdata(&mut bus, 0x04), 0x0A);
    assert_eq!(rdata(&mut bus, 0x04), 0x10);
    assert_eq!(rdata(&mut bus, 0x04), 0x0B);
}

#[test]
fn two_cards_isolate_in_two_passes() {
    // Card A's identifier begins with more one-bits in the low vendor byte,
    // so whichever card drives longest wins; the exact winner is fixed by
    // the IDs chosen here.
    let id_a = serial_identifier(*b"AAA0", 1);
    let id_b = serial_identifier(*b"BBB0", 2);
    let mut bus = IsaPnpBus::new();
    let a = bus.add_card(IsaPnpCard::new(id_a, 1, Vec::new()));
    let b = bus.add_card(IsaPnpCard::new(id_b, 1, Vec::new()));

    send_key(&mut bus);
    let first = bits_to_bytes(&isolate(&mut bus, 1));
    let second = bits_to_bytes(&isolate(&mut bus, 2));

    let (first_card, second_card) = if first == id_a.to_vec() { (a, b) } else { (b, a) };
    assert_eq!(second, bus.card(second_card).id().to_vec());
    assert_eq!(bus.card(first_card).csn(), 1);
    assert_eq!(bus.card(second_card).csn(), 2);
}

#[test]
fn wake_by_csn_enters_config_and_programs_logical_device() {
    let id = serial_identifier(*b"RLC1", 7);
    let mut bus = IsaPnpBus::new();
    let card = bus.add_card(IsaPnpCard::new(id, 2, Vec::new()));

    send_key(&mut bus);
    isolate(&mut bus, 5);

    // Return to sleep, then wake by CSN.
    wdata(&mut bus, 0x03, 5);
    assert_eq!(rdata(&mut bus, 0x06), 5);

    // Program logical device 1: I/O base 0x220, IRQ 5, DMA 1, activate.
    wdata(&mut bus, 0x07, 1);
    wdata(&mut bus, 0x60, 0x02);
    wdata(&mut bus, 0x61, 0x20);
    wdata(&mut bus, 0x70, 5);
    wdata(&mut bus, 0x74, 1);
    wdata(&mut bus, 0x30, 1);

    let cfg = bus.card(card).logical_config(1);
    assert_eq!(cfg.io_base[0], 0x220);
    assert_eq!(cfg.irq[0], 5);
    assert_eq!(cfg.dma[0], 1);
    assert!(cfg.active);

    // Config readback through the read port.
    assert_eq!(rdata(&mut bus, 0x61), 0x20);
    assert_eq!(rdata(&mut bus, 0x30), 0x01);
}

#[test]
fn read_port_relocation_is_surfaced_to_the_platform() {
    let id = serial_identifier(*b"RLC2", 9);
    let mut bus = IsaPnpBus::new();
    bus.add_card(IsaPnpCard::new(id, 1, Vec::new()));

    send_key(&mut bus);
    wdata(&mut bus, 0x00, 0x6E); // RD_DATA at (0x6E << 2) | 3 = 0x1BB
    assert_eq!(bus.take_read_port_change(), Some(0x1BB));
    assert_eq!(bus.read_port(), 0x1BB);
    assert_eq!(bus.take_read_port_change(), None);
}
