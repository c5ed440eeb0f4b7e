use memory::shadow::ShadowSource;
use relic_devices::chipset::{
    MemUpdate, ScampChipset, CHIPSET_DATA_PORT, CHIPSET_INDEX_PORT, REG_LOCK, REG_SHADOW_ENABLE,
    REG_SHADOW_SOURCE, UNLOCK_VALUE,
};
use relic_platform::io::PortIoDevice;

fn write_reg(dev: &mut ScampChipset, index: u8, value: u8) {
    dev.write(CHIPSET_INDEX_PORT, 1, index.into());
    dev.write(CHIPSET_DATA_PORT, 1, value.into());
}

fn read_reg(dev: &mut ScampChipset, index: u8) -> u8 {
    dev.write(CHIPSET_INDEX_PORT, 1, index.into());
    dev.read(CHIPSET_DATA_PORT, 1) as u8
}

#[test]
fn registers_are_inert_until_unlocked() {
    let mut dev = ScampChipset::new();
    let _ = dev.take_updates(); // power-on recalc

    write_reg(&mut dev, REG_SHADOW_ENABLE, 0xFF);
    assert!(
        dev.take_updates().is_empty(),
        "locked chipset must not reconfigure memory"
    );

    write_reg(&mut dev, REG_LOCK, UNLOCK_VALUE);
    write_reg(&mut dev, REG_SHADOW_ENABLE, 0xFF);
    assert!(!dev.take_updates().is_empty());
}

#[test]
fn any_nonzero_lock_byte_unlocks() {
    // The lock comparison is kept verbatim from the original, where a
    // logical && makes every non-zero byte unlock.
    let mut dev = ScampChipset::new();
    let _ = dev.take_updates();

    write_reg(&mut dev, REG_LOCK, 0x01);
    write_reg(&mut dev, REG_SHADOW_ENABLE, 0x01);
    assert!(!dev.take_updates().is_empty());

    // Writing zero locks again.
    write_reg(&mut dev, REG_LOCK, 0x00);
    write_reg(&mut dev, REG_SHADOW_ENABLE, 0x02);
    assert!(dev.take_updates().is_empty());
}

#[test]
fn shadow_updates_reflect_enable_and_source_bits() {
    let mut dev = ScampChipset::new();
    let _ = dev.take_updates();
    write_reg(&mut dev, REG_LOCK, UNLOCK_VALUE);

    // Enable granule 7 (F8000), read+write from DRAM.
    write_reg(&mut dev, REG_SHADOW_SOURCE, 0x03);
    write_reg(&mut dev, REG_SHADOW_ENABLE, 0x80);
    let updates = dev.take_updates();

    let f8000 = updates
        .iter()
        .filter_map(|u| match u {
            MemUpdate::Shadow {
                base, read, write, ..
            } if *base == 0xF8000 => Some((*read, *write)),
            _ => None,
        })
        .last()
        .expect("granule F8000 update present");
    assert_eq!(f8000, (ShadowSource::Internal, ShadowSource::Internal));

    // Disabled granules fall back to the external stack.
    let c0000 = updates
        .iter()
        .filter_map(|u| match u {
            MemUpdate::Shadow {
                base, read, write, ..
            } if *base == 0xC0000 => Some((*read, *write)),
            _ => None,
        })
        .last()
        .unwrap();
    assert_eq!(c0000, (ShadowSource::External, ShadowSource::External));
}

#[test]
fn register_file_reads_back_and_cyrix_guard_hides_high_indexes() {
    let mut dev = ScampChipset::new();
    write_reg(&mut dev, 0x42, 0x55);
    assert_eq!(read_reg(&mut dev, 0x42), 0x55);

    dev.set_cyrix_guard(true);
    write_reg(&mut dev, 0xC3, 0x12);
    assert_eq!(read_reg(&mut dev, 0xC3), 0xFF);
    assert_eq!(read_reg(&mut dev, 0x42), 0x55);
}
