use memory::{DenseMemory, MemoryMap};
use relic_devices::dma8237::{DmaController, DMA_NODATA};
use relic_platform::io::PortIoDevice;

fn mem() -> MemoryMap {
    MemoryMap::new(Box::new(DenseMemory::new(0x20_0000).unwrap()))
}

/// Programs a channel 0–3 transfer: mode, page, address, count.
fn program_channel(dma: &mut DmaController, ch: u16, mode: u8, page: u8, addr: u16, count: u16) {
    dma.write(0x0B, 1, u32::from(mode | ch as u8));
    // Page register ports are scattered; channel 1 is 0x83, channel 2 0x81.
    let page_port = match ch {
        0 => 0x87,
        1 => 0x83,
        2 => 0x81,
        _ => 0x82,
    };
    dma.write(page_port, 1, page.into());
    dma.write(0x0C, 1, 0); // clear flip-flop
    dma.write(ch * 2, 1, (addr & 0xFF).into());
    dma.write(ch * 2, 1, (addr >> 8).into());
    dma.write(ch * 2 + 1, 1, (count & 0xFF).into());
    dma.write(ch * 2 + 1, 1, (count >> 8).into());
    dma.write(0x0A, 1, u32::from(ch)); // unmask
}

#[test]
fn memory_to_device_read_advances_and_sets_tc() {
    let mut dma = DmaController::new();
    let mut mem = mem();
    mem.write_physical(0x1_2000, &[0x11, 0x22, 0x33]);

    // Channel 1, read transfer (memory -> device), single mode, count 2 (= 3
    // transfers).
    program_channel(&mut dma, 1, 0x48, 0x01, 0x2000, 2);

    assert_eq!(dma.channel_read(1, &mut mem), 0x11);
    assert_eq!(dma.channel_read(1, &mut mem), 0x22);
    let last = dma.channel_read(1, &mut mem);
    assert_eq!(last & 0xFFFF, 0x33);
    assert_ne!(last & 0x10000, 0, "terminal count on the final transfer");

    // Without auto-init the channel masks itself at TC.
    assert_eq!(dma.channel_read(1, &mut mem), DMA_NODATA);

    // Status: TC bit for channel 1, cleared by the read.
    assert_eq!(dma.read(0x08, 1) & 0x02, 0x02);
    assert_eq!(dma.read(0x08, 1) & 0x02, 0x00);
}

#[test]
fn device_to_memory_write_with_autoinit_reloads() {
    let mut dma = DmaController::new();
    let mut mem = mem();

    // Channel 2, write transfer (device -> memory), auto-init, count 1.
    program_channel(&mut dma, 2, 0x54, 0x02, 0x4000, 1);

    assert_eq!(dma.channel_write(2, 0xAA, &mut mem), 0);
    assert_eq!(dma.channel_write(2, 0xBB, &mut mem), 0x10000);
    // Auto-init reloaded base address/count: next write lands at the start.
    assert_eq!(dma.channel_write(2, 0xCC, &mut mem), 0);

    assert_eq!(mem.read_u8(0x2_4000), 0xCC);
    assert_eq!(mem.read_u8(0x2_4001), 0xBB);
}

#[test]
fn masked_channel_refuses_transfers() {
    let mut dma = DmaController::new();
    let mut mem = mem();

    program_channel(&mut dma, 1, 0x48, 0x00, 0x100, 10);
    dma.write(0x0A, 1, 0x05); // set mask on channel 1
    assert_eq!(dma.channel_read(1, &mut mem), DMA_NODATA);

    dma.write(0x0A, 1, 0x01); // clear mask
    assert_ne!(dma.channel_read(1, &mut mem), DMA_NODATA);
}

#[test]
fn current_address_readback_uses_flipflop() {
    let mut dma = DmaController::new();
    let mut mem = mem();

    program_channel(&mut dma, 1, 0x48, 0x00, 0x1234, 0xFF);
    let _ = dma.channel_read(1, &mut mem);

    dma.write(0x0C, 1, 0); // clear flip-flop
    let lo = dma.read(0x02, 1);
    let hi = dma.read(0x02, 1);
    assert_eq!((hi << 8) | lo, 0x1235);
}

#[test]
fn word_channel_shifts_address_and_moves_words() {
    let mut dma = DmaController::new();
    let mut mem = mem();
    mem.write_physical(0x2468, &[0xCD, 0xAB]);

    // Channel 5: mode on controller 2's channel 1.
    dma.write(0xD6, 1, 0x49); // mode: read, single, channel 1-of-4
    dma.write(0x8B, 1, 0x00); // page
    dma.write(0xD8, 1, 0); // clear flip-flop
    dma.write(0xC4, 1, 0x34); // address 0x1234 (word address)
    dma.write(0xC4, 1, 0x12);
    dma.write(0xC6, 1, 0x00); // count 0
    dma.write(0xC6, 1, 0x00);
    dma.write(0xD4, 1, 0x01); // unmask channel 5

    let datum = dma.channel_read(5, &mut mem);
    assert_eq!(datum & 0xFFFF, 0xABCD, "word read at byte address 0x2468");
    assert_ne!(datum & 0x10000, 0);
}

#[test]
fn page_register_file_is_readable_scratch() {
    let mut dma = DmaController::new();
    dma.write(0x84, 1, 0x5A); // an unassigned page register
    assert_eq!(dma.read(0x84, 1), 0x5A);
}
