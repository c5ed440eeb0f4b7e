use std::cell::RefCell;
use std::rc::Rc;

use memory::shadow::{set_shadow, ShadowSource, GRANULE_32K};
use memory::smram::SmramRegion;
use memory::{DenseMemory, MemAccess, MemoryMap};

fn bios_machine_map() -> MemoryMap {
    // 2 MiB of DRAM with a ROM overlaying the top of the first megabyte.
    let mut map = MemoryMap::new(Box::new(DenseMemory::new(0x20_0000).unwrap()));
    let rom: Vec<u8> = (0..0x10000u32).map(|i| (i & 0xFF) as u8).collect();
    map.add_rom(0xF0000, Rc::new(RefCell::new(rom)));
    map.set_access(0xC0000, 0x40000, MemAccess::EXTERNAL);
    map
}

#[test]
fn shadow_disabled_rom_ignores_writes() {
    let mut map = bios_machine_map();

    assert_eq!(map.read_u8(0xF8000), 0x00);
    map.write_u8(0xF8000, 0x5A);
    assert_eq!(map.read_u8(0xF8000), 0x00, "ROM must swallow the write");
}

#[test]
fn write_through_shadow_then_read_shadow() {
    let mut map = bios_machine_map();

    // Classic shadow fill: reads still from ROM, writes land in DRAM.
    set_shadow(
        &mut map,
        0xF8000,
        GRANULE_32K,
        ShadowSource::External,
        ShadowSource::Internal,
    );
    map.write_u8(0xF8000, 0x5A);
    assert_eq!(map.read_u8(0xF8000), 0x00, "reads still come from ROM");

    // Flip reads to DRAM: the shadowed byte appears.
    set_shadow(
        &mut map,
        0xF8000,
        GRANULE_32K,
        ShadowSource::Internal,
        ShadowSource::Internal,
    );
    assert_eq!(map.read_u8(0xF8000), 0x5A);

    // Write-protect the shadowed copy.
    set_shadow(
        &mut map,
        0xF8000,
        GRANULE_32K,
        ShadowSource::Internal,
        ShadowSource::Disabled,
    );
    map.write_u8(0xF8000, 0x77);
    assert_eq!(map.read_u8(0xF8000), 0x5A);
}

#[test]
fn smram_overlay_only_visible_in_smm() {
    let mut map = MemoryMap::new(Box::new(DenseMemory::new(0x20_0000).unwrap()));
    // Stand-in for adapter memory at A0000.
    let vga = Rc::new(RefCell::new(vec![0xEEu8; 0x20000]));
    map.add_rom(0xA0000, vga);
    map.set_access(0xA0000, 0x20000, MemAccess::EXTERNAL);

    // SMRAM: A0000 window backed by DRAM at 0xA0000, invisible when not in
    // SMM.
    let mut smram = SmramRegion::new(
        &mut map,
        0xA0000,
        0xA0000,
        0x10000,
        MemAccess::EXTERNAL,
        MemAccess::RAM,
    );

    assert_eq!(map.read_u8(0xA0000), 0xEE);
    map.write_u8(0xA0000, 0x12); // swallowed by the ROM stand-in
    assert_eq!(map.read_u8(0xA0000), 0xEE);

    smram.enter_smm(&mut map);
    map.write_u8(0xA0000, 0x34);
    assert_eq!(map.read_u8(0xA0000), 0x34, "SMM sees the DRAM overlay");

    smram.exit_smm(&mut map);
    assert_eq!(map.read_u8(0xA0000), 0xEE, "overlay hidden again after RSM");

    // The SMM-state store survives in DRAM.
    smram.enter_smm(&mut map);
    assert_eq!(map.read_u8(0xA0000), 0x34);
    smram.exit_smm(&mut map);
}

#[test]
fn smram_reprogram_inside_smm_is_undone_on_exit() {
    let mut map = MemoryMap::new(Box::new(DenseMemory::new(0x20_0000).unwrap()));
    let mut smram = SmramRegion::new(
        &mut map,
        0xA0000,
        0x10_0000,
        0x10000,
        MemAccess::DISABLED,
        MemAccess::RAM,
    );

    smram.enter_smm(&mut map);
    map.write_u8(0xA0000, 0x99);
    assert_eq!(map.read_u8(0xA0000), 0x99);

    // The handler moves the window; exit must restore the original geometry.
    smram.relocate(&mut map, 0xB0000, 0x10000);
    assert_eq!(map.read_u8(0xB0000), 0x99);

    smram.exit_smm(&mut map);
    assert_eq!(smram.host_base(), 0xA0000);
    assert_eq!(map.read_u8(0xA0000), 0xFF, "disabled in normal state");
}
