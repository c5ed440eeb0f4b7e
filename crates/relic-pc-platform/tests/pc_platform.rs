use relic_pc_platform::PcPlatform;
use relic_pci::{PCI_CFG_ADDR_PORT, PCI_CFG_DATA_PORT, RESET_CTRL_PORT};
use relic_platform::reset::ResetEvent;

#[test]
fn pc_platform_wires_canonical_ports_and_a20() {
    let mut pc = PcPlatform::new(2 * 1024 * 1024);

    // A20 masking starts disabled: the second megabyte aliases the first.
    pc.memory.write_u8(0x0, 0xAA);
    assert_eq!(pc.memory.read_u8(0x10_0000), 0xAA);

    // Enable A20 via port 0x92.
    pc.io.write_u8(0x92, 0x02);
    assert!(pc.a20.enabled());
    pc.memory.set_a20_enabled(true);
    pc.memory.write_u8(0x10_0000, 0xBB);
    assert_eq!(pc.memory.read_u8(0x0), 0xAA);
    assert_eq!(pc.memory.read_u8(0x10_0000), 0xBB);

    // Unclaimed ports float high; the DMA scratch page registers do not.
    assert_eq!(pc.io.read_u8(0x10F), 0xFF);
    pc.io.write_u8(0x84, 0x12);
    assert_eq!(pc.io.read_u8(0x84), 0x12);

    // POST port keeps the last code.
    pc.io.write_u8(0x80, 0x55);
    assert_eq!(pc.post.borrow().last_code(), 0x55);
}

#[test]
fn pci_mechanism1_enumerates_the_northbridge() {
    let mut pc = PcPlatform::new(2 * 1024 * 1024);

    // Write 0x80000000 to CF8, read the vendor/device dword at CFC.
    pc.io.write_u32(PCI_CFG_ADDR_PORT, 0x8000_0000);
    let id = pc.io.read_u32(PCI_CFG_DATA_PORT);
    assert_eq!(id & 0xFFFF, 0x8086);
    assert_eq!(id >> 16, 0x1237);

    // Class code: host bridge.
    pc.io.write_u32(PCI_CFG_ADDR_PORT, 0x8000_0008);
    assert_eq!(pc.io.read_u32(PCI_CFG_DATA_PORT) >> 16, 0x0600);

    // Unpopulated device floats.
    pc.io.write_u32(PCI_CFG_ADDR_PORT, 0x8000_9800);
    assert_eq!(pc.io.read_u32(PCI_CFG_DATA_PORT), 0xFFFF_FFFF);
}

#[test]
fn reset_control_port_queues_a_system_reset() {
    let mut pc = PcPlatform::new(2 * 1024 * 1024);
    assert!(pc.take_reset_events().is_empty());

    pc.io.write_u8(RESET_CTRL_PORT, 0x06);
    assert_eq!(pc.take_reset_events(), vec![ResetEvent::System]);

    // Port 0x92 bit 0 requests a CPU reset on the rising edge.
    pc.io.write_u8(0x92, 0x01);
    assert_eq!(pc.take_reset_events(), vec![ResetEvent::Cpu]);
    pc.io.write_u8(0x92, 0x01);
    assert!(pc.take_reset_events().is_empty(), "level, not edge");
}

#[test]
fn shadow_toggle_via_chipset_index_data_pair() {
    let mut pc = PcPlatform::new(2 * 1024 * 1024);
    // A ROM at F0000 backed by zeroes.
    pc.load_bios(vec![0; 0x10000]);

    // Writes to the ROM window bounce while shadow is off.
    pc.memory.write_u8(0xF8000, 0x5A);
    assert_eq!(pc.memory.read_u8(0xF8000), 0x00);

    // Unlock the chipset, select write-to-DRAM for the F8000 granule.
    let write_reg = |pc: &mut PcPlatform, index: u8, value: u8| {
        pc.io.write_u8(0x22, index);
        pc.io.write_u8(0x23, value);
        pc.apply_chipset_updates();
    };
    write_reg(&mut pc, 0x03, 0xC5); // unlock
    write_reg(&mut pc, 0x14, 0x03); // shadow source: read+write DRAM
    write_reg(&mut pc, 0x13, 0x80); // enable granule 7 (F8000-FFFFF)

    pc.memory.write_u8(0xF8000, 0x5A);
    assert_eq!(pc.memory.read_u8(0xF8000), 0x5A, "shadowed DRAM readable");

    // Write-protect by flipping the write source back to ROM.
    write_reg(&mut pc, 0x14, 0x01);
    pc.memory.write_u8(0xF8000, 0x77);
    assert_eq!(pc.memory.read_u8(0xF8000), 0x5A);
}

#[test]
fn pit_programmed_through_ports_fires_irq0_via_pic() {
    let mut pc = PcPlatform::new(2 * 1024 * 1024);

    // Unmask IRQ0 and give the PIC its usual offsets.
    pc.io.write_u8(0x20, 0x11);
    pc.io.write_u8(0x21, 0x08);
    pc.io.write_u8(0x21, 0x04);
    pc.io.write_u8(0x21, 0x01);
    pc.io.write_u8(0xA0, 0x11);
    pc.io.write_u8(0xA1, 0x70);
    pc.io.write_u8(0xA1, 0x02);
    pc.io.write_u8(0xA1, 0x01);
    pc.io.write_u8(0x21, 0xFE);
    pc.io.write_u8(0xA1, 0xFF);

    // Mode 2, reload 0x1000.
    pc.io.write_u8(0x43, 0x34);
    pc.io.write_u8(0x40, 0x00);
    pc.io.write_u8(0x40, 0x10);

    assert!(!pc.pic.borrow().has_pending());
    let deadline = pc.next_timer_deadline_ns().expect("PIT armed");

    pc.clock.set_ns(deadline);
    pc.process_timers();
    assert!(pc.pic.borrow().has_pending());
    assert_eq!(pc.pic.borrow_mut().ack(), 0x08);

    // Counter readback decreases monotonically modulo the reload.
    pc.io.write_u8(0x43, 0x00); // latch channel 0
    let lo = pc.io.read_u8(0x40);
    let hi = pc.io.read_u8(0x40);
    let first = u16::from_le_bytes([lo, hi]);
    pc.clock.advance_ns(100_000);
    pc.io.write_u8(0x43, 0x00);
    let lo = pc.io.read_u8(0x40);
    let hi = pc.io.read_u8(0x40);
    let second = u16::from_le_bytes([lo, hi]);
    assert_ne!(first, second);
    assert!(first <= 0x1000 && second <= 0x1000);
}

#[test]
fn smram_register_opens_overlay_only_in_smm_state() {
    let mut pc = PcPlatform::new(2 * 1024 * 1024);

    // Normal mode: the A0000 hole is open bus (no adapter installed).
    assert_eq!(pc.memory.read_u8(0xA0000), 0xFF);

    // Unlock and open SMRAM in the normal state for handler installation.
    pc.io.write_u8(0x22, 0x03);
    pc.io.write_u8(0x23, 0xC5);
    pc.io.write_u8(0x22, 0x19);
    pc.io.write_u8(0x23, 0x03); // open in SMM and normal state
    pc.apply_chipset_updates();

    pc.memory.write_u8(0xA0000, 0x42);
    assert_eq!(pc.memory.read_u8(0xA0000), 0x42);

    // Close the normal state; the DRAM value hides but survives.
    pc.io.write_u8(0x22, 0x19);
    pc.io.write_u8(0x23, 0x01);
    pc.apply_chipset_updates();
    assert_eq!(pc.memory.read_u8(0xA0000), 0xFF);

    // SMM entry reveals it again.
    pc.smram.enter_smm(&mut pc.memory);
    assert_eq!(pc.memory.read_u8(0xA0000), 0x42);
    pc.smram.exit_smm(&mut pc.memory);
    assert_eq!(pc.memory.read_u8(0xA0000), 0xFF);
}

#[test]
fn platform_reset_restores_power_on_state() {
    let mut pc = PcPlatform::new(2 * 1024 * 1024);

    pc.io.write_u8(0x21, 0xAA); // scribble the PIC mask
    pc.io.write_u8(0x80, 0x33);
    pc.io.write_u8(0x92, 0x02);
    assert!(pc.a20.enabled());

    pc.reset();
    assert!(!pc.a20.enabled());
    assert_eq!(pc.post.borrow().last_code(), 0);
    // The CMOS contents are battery backed and survive reset.
    assert_eq!(pc.cmos.borrow().read_reg(0x15), 0x80);
}
