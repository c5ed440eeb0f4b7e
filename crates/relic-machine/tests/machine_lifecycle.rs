use pretty_assertions::assert_eq;
use relic_machine::{ConfigStore, ConfigValue, Machine, MachineConfig, MachineError, MachineKind, RunExit};
use relic_platform::reset::ResetEvent;

fn tiny_rom() -> Vec<u8> {
    // 2K ROM: reset vector halts immediately.
    let mut rom = vec![0xFFu8; 0x800];
    rom[0x7F0] = 0xF4; // hlt at F000:FFF0
    rom
}

#[test]
fn machine_without_rom_fails_before_any_device_is_live() {
    let err = Machine::new(MachineConfig {
        bios: None,
        ..Default::default()
    })
    .unwrap_err();
    assert!(matches!(err, MachineError::MissingRom));
}

#[test]
fn malformed_rom_is_rejected() {
    let err = Machine::new(MachineConfig {
        bios: Some(vec![0; 0x801]),
        ..Default::default()
    })
    .unwrap_err();
    assert!(matches!(err, MachineError::BadRom { len: 0x801 }));
}

#[test]
fn undersized_ram_aborts_composition() {
    let err = Machine::new(MachineConfig {
        bios: Some(tiny_rom()),
        ram_size_bytes: 64 * 1024,
        ..Default::default()
    })
    .unwrap_err();
    assert!(matches!(err, MachineError::DeviceInit { .. }));
}

#[test]
fn reset_request_surfaces_through_run_slice() {
    let mut m = Machine::new(MachineConfig {
        bios: Some(tiny_rom()),
        ..Default::default()
    })
    .unwrap();

    // Fabric-level reset request (port 0xCF9 semantics).
    m.bus().platform.io.write_u8(0xCF9, 0x06);
    assert_eq!(
        m.run_slice(1000),
        RunExit::ResetRequested(ResetEvent::System)
    );

    // After a machine reset the CPU is back at the reset vector and the
    // ROM halts it again.
    m.reset();
    assert_eq!(m.cpu().state.eip, 0xFFF0);
    assert_eq!(m.run_slice(1000), RunExit::Halted);
}

#[test]
fn devices_register_in_composition_order() {
    let m = Machine::new(MachineConfig {
        bios: Some(tiny_rom()),
        kind: MachineKind::Ps2Model80Mca,
        ..Default::default()
    })
    .unwrap();
    // Common init (PIC/PIT/DMA/CMOS/chipset/POST) plus the MCA planar.
    assert_eq!(m.device_count(), 7);
}

#[test]
fn nvram_round_trips_through_the_filesystem() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("scamp486.nvr");

    {
        let mut m = Machine::new(MachineConfig {
            bios: Some(tiny_rom()),
            nvram_path: Some(path.clone()),
            ..Default::default()
        })
        .unwrap();
        m.bus().platform.cmos.borrow_mut().write_reg(0x40, 0x5A);
        m.nvram_save().unwrap();
    }

    let m = Machine::new(MachineConfig {
        bios: Some(tiny_rom()),
        nvram_path: Some(path),
        ..Default::default()
    })
    .unwrap();
    assert_eq!(m.cmos_reg(0x40), 0x5A);
}

#[test]
fn config_store_snapshot_and_json_round_trip() {
    let mut m = Machine::new(MachineConfig {
        bios: Some(tiny_rom()),
        kind: MachineKind::Scamp486Isa,
        ..Default::default()
    })
    .unwrap();

    let mut store = m.snapshot_config();
    assert_eq!(store.get_str("machine", "type", ""), "scamp486");
    assert_eq!(store.get_int("machine", "mem_size", 0), 2048);

    store.set("video", "card", ConfigValue::Str("none".into()));
    store.set("storage", "hdd_base", ConfigValue::hex(0x1F0));

    let json = store.to_json();
    let restored = ConfigStore::from_json(&json).unwrap();
    assert_eq!(restored, store);
    assert_eq!(restored.get_int("storage", "hdd_base", 0), 0x1F0);

    m.apply_config(&restored);
    let again = m.snapshot_config();
    assert_eq!(again.get_str("video", "card", ""), "none");
}
