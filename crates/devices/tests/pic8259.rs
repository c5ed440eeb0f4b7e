use relic_devices::pic8259::{
    Pic8259Pair, ELCR_MASTER, MASTER_CMD, MASTER_DATA, SLAVE_CMD, SLAVE_DATA,
};
use relic_platform::io::PortIoDevice;

/// Runs the standard BIOS ICW sequence: vectors 0x08/0x70, cascade on IRQ2,
/// 8086 mode.
fn init_pair(pic: &mut Pic8259Pair) {
    pic.write(MASTER_CMD, 1, 0x11);
    pic.write(MASTER_DATA, 1, 0x08);
    pic.write(MASTER_DATA, 1, 0x04);
    pic.write(MASTER_DATA, 1, 0x01);
    pic.write(SLAVE_CMD, 1, 0x11);
    pic.write(SLAVE_DATA, 1, 0x70);
    pic.write(SLAVE_DATA, 1, 0x02);
    pic.write(SLAVE_DATA, 1, 0x01);
    // Unmask everything.
    pic.write(MASTER_DATA, 1, 0x00);
    pic.write(SLAVE_DATA, 1, 0x00);
}

#[test]
fn edge_irq_delivers_vector_and_eoi_clears_isr() {
    let mut pic = Pic8259Pair::new();
    init_pair(&mut pic);

    assert!(!pic.has_pending());
    pic.set_irq(1, true);
    assert!(pic.has_pending());
    assert_eq!(pic.ack(), 0x09);

    // In service until EOI; the same edge does not retrigger.
    assert!(!pic.has_pending());
    let (isr, _) = pic.in_service();
    assert_eq!(isr, 0x02);

    pic.write(MASTER_CMD, 1, 0x20); // non-specific EOI
    let (isr, _) = pic.in_service();
    assert_eq!(isr, 0x00);

    // A new edge retriggers.
    pic.set_irq(1, false);
    pic.set_irq(1, true);
    assert!(pic.has_pending());
}

#[test]
fn masked_line_does_not_interrupt() {
    let mut pic = Pic8259Pair::new();
    init_pair(&mut pic);

    pic.write(MASTER_DATA, 1, 0x02); // mask IRQ1
    pic.set_irq(1, true);
    assert!(!pic.has_pending());

    // Unmask: the latched request surfaces.
    pic.write(MASTER_DATA, 1, 0x00);
    assert!(pic.has_pending());
    assert_eq!(pic.ack(), 0x09);
}

#[test]
fn slave_irq_routes_through_cascade() {
    let mut pic = Pic8259Pair::new();
    init_pair(&mut pic);

    pic.set_irq(14, true);
    assert!(pic.has_pending());
    assert_eq!(pic.ack(), 0x76);

    let (master_isr, slave_isr) = pic.in_service();
    assert_eq!(master_isr, 0x04, "cascade line in service on the master");
    assert_eq!(slave_isr, 0x40);

    // EOI both chips, slave first.
    pic.write(SLAVE_CMD, 1, 0x20);
    pic.write(MASTER_CMD, 1, 0x20);
    assert_eq!(pic.in_service(), (0, 0));
}

#[test]
fn priority_blocks_lower_requests_until_eoi() {
    let mut pic = Pic8259Pair::new();
    init_pair(&mut pic);

    pic.set_irq(3, true);
    assert_eq!(pic.ack(), 0x0B);

    // A lower-priority request waits.
    pic.set_irq(5, true);
    assert!(!pic.has_pending());

    // A higher-priority request preempts.
    pic.set_irq(0, true);
    assert!(pic.has_pending());
    assert_eq!(pic.ack(), 0x08);

    pic.write(MASTER_CMD, 1, 0x20); // EOI IRQ0
    pic.write(MASTER_CMD, 1, 0x20); // EOI IRQ3
    assert!(pic.has_pending());
    assert_eq!(pic.ack(), 0x0D);
}

#[test]
fn spurious_interrupt_returns_irq7_vector() {
    let mut pic = Pic8259Pair::new();
    init_pair(&mut pic);

    // INTA with nothing pending: spurious IRQ7.
    assert_eq!(pic.ack(), 0x0F);
    let (isr, _) = pic.in_service();
    assert_eq!(isr, 0, "spurious interrupt leaves no ISR bit");
}

#[test]
fn elcr_level_mode_follows_line_state() {
    let mut pic = Pic8259Pair::new();
    init_pair(&mut pic);

    // IRQ5 level-triggered.
    pic.write(ELCR_MASTER, 1, 0x20);
    assert_eq!(pic.read(ELCR_MASTER, 1), 0x20);

    pic.set_irq(5, true);
    assert_eq!(pic.ack(), 0x0D);
    pic.write(MASTER_CMD, 1, 0x20); // EOI

    // Still asserted: a level interrupt re-fires after EOI.
    assert!(pic.has_pending());
    pic.set_irq(5, false);
    assert!(!pic.has_pending());

    // The fixed lines cannot be switched to level mode.
    pic.write(ELCR_MASTER, 1, 0xFF);
    assert_eq!(pic.read(ELCR_MASTER, 1), 0xF8);
}

#[test]
fn ocw3_selects_irr_and_isr_reads() {
    let mut pic = Pic8259Pair::new();
    init_pair(&mut pic);

    pic.set_irq(4, true);
    pic.write(MASTER_CMD, 1, 0x0A); // read IRR
    assert_eq!(pic.read(MASTER_CMD, 1), 0x10);

    let _ = pic.ack();
    pic.write(MASTER_CMD, 1, 0x0B); // read ISR
    assert_eq!(pic.read(MASTER_CMD, 1), 0x10);
}
