use relic_devices::nmi::{NmiLine, NmiMask};
use relic_platform::io::PortIoDevice;

#[test]
fn nmi_starts_masked_and_unmasks_via_bit7() {
    let line = NmiLine::new();
    let mut mask = NmiMask::new(line.clone());

    // Masked at power-on: assertions are discarded.
    line.assert();
    assert!(!line.take());

    // Bit 7 set enables delivery.
    mask.write(0xA0, 1, 0x80);
    line.assert();
    assert!(line.take());
    assert!(!line.take(), "NMI is an edge event");

    // Masking again swallows a pending edge.
    line.assert();
    mask.write(0xA0, 1, 0x00);
    assert!(!line.take());
}
