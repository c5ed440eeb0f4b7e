//! Boot-ROM bring-up: a hand-assembled POST program in a 64K ROM reaches
//! its final port-0x80 write, driven by the PIT through HLT.

use relic_machine::{Machine, MachineConfig, MachineKind, RunExit};

/// 64K BIOS image: reset vector jumps to F000:8000, which runs POST.
fn build_post_rom() -> Vec<u8> {
    let mut rom = vec![0xFFu8; 0x1_0000];
    let mut post: Vec<u8> = Vec::new();

    post.push(0xFA); // cli
    post.extend_from_slice(&[0xBC, 0x00, 0x7C]); // mov sp, 0x7C00
    post.extend_from_slice(&[0xB0, 0x01, 0xE6, 0x80]); // POST code 01

    // PIC init: vectors 0x08/0x70, cascade on IRQ2, 8086 mode.
    for (port, value) in [
        (0x20u8, 0x11u8),
        (0x21, 0x08),
        (0x21, 0x04),
        (0x21, 0x01),
        (0xA0, 0x11),
        (0xA1, 0x70),
        (0xA1, 0x02),
        (0xA1, 0x01),
        (0x21, 0xFE), // unmask IRQ0 only
        (0xA1, 0xFF),
    ] {
        post.extend_from_slice(&[0xB0, value, 0xE6, port]);
    }

    // DS = 0 for IVT and handler pokes.
    post.extend_from_slice(&[0x31, 0xC0, 0x8E, 0xD8]);

    // IVT[8] -> 0000:0500.
    post.extend_from_slice(&[0xC7, 0x06, 0x20, 0x00, 0x00, 0x05]);
    post.extend_from_slice(&[0xC7, 0x06, 0x22, 0x00, 0x00, 0x00]);

    // IRQ0 handler at 0x500:
    //   push ax; mov al, 0xFF; out 0x80, al; mov al, 0x20; out 0x20, al;
    //   pop ax; iret
    let handler = [
        0x50, 0xB0, 0xFF, 0xE6, 0x80, 0xB0, 0x20, 0xE6, 0x20, 0x58, 0xCF,
    ];
    for (n, byte) in handler.iter().enumerate() {
        post.extend_from_slice(&[0xC6, 0x06, n as u8, 0x05, *byte]);
    }

    // PIT channel 0: mode 2, reload 0x20.
    post.extend_from_slice(&[0xB0, 0x34, 0xE6, 0x43]);
    post.extend_from_slice(&[0xB0, 0x20, 0xE6, 0x40]);
    post.extend_from_slice(&[0xB0, 0x00, 0xE6, 0x40]);

    post.push(0xFB); // sti
    post.push(0xF4); // hlt (woken by IRQ0)
    post.push(0xF4); // hlt (final resting state)

    rom[0x8000..0x8000 + post.len()].copy_from_slice(&post);
    // Reset vector: jmp F000:8000.
    rom[0xFFF0..0xFFF5].copy_from_slice(&[0xEA, 0x00, 0x80, 0x00, 0xF0]);
    rom
}

fn boot_machine(kind: MachineKind, enable_jit: bool) -> Machine {
    Machine::new(MachineConfig {
        kind,
        bios: Some(build_post_rom()),
        enable_jit,
        ..Default::default()
    })
    .unwrap()
}

fn run_until_final_post(m: &mut Machine) -> Vec<u8> {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut codes = Vec::new();
    for _ in 0..200 {
        match m.run_slice(100_000) {
            RunExit::Completed | RunExit::Halted => {}
            other => panic!("unexpected exit: {other:?}"),
        }
        codes.extend(m.take_post_codes());
        if codes.contains(&0xFF) {
            return codes;
        }
    }
    panic!("POST never reached the final code; saw {codes:02X?}");
}

#[test]
fn post_reaches_final_code_interpreted() {
    let mut m = boot_machine(MachineKind::PentiumPci, false);
    let codes = run_until_final_post(&mut m);
    assert_eq!(codes.first(), Some(&0x01));
    assert_eq!(codes.last(), Some(&0xFF));
}

#[test]
fn post_reaches_final_code_with_block_tier() {
    let mut m = boot_machine(MachineKind::PentiumPci, true);
    let codes = run_until_final_post(&mut m);
    assert_eq!(codes.last(), Some(&0xFF));
}

#[test]
fn post_runs_on_the_isa_and_mca_machines_too() {
    for kind in [MachineKind::Scamp486Isa, MachineKind::Ps2Model80Mca] {
        let mut m = boot_machine(kind, false);
        let codes = run_until_final_post(&mut m);
        assert_eq!(codes.last(), Some(&0xFF), "machine {kind:?}");
    }
}

#[test]
fn pit_wakes_hlt_by_advancing_virtual_time() {
    let mut m = boot_machine(MachineKind::PentiumPci, false);
    // A single generous slice must carry POST through the HLT wait without
    // the host spinning: the run loop fast-forwards to the PIT deadline.
    let mut codes = Vec::new();
    for _ in 0..50 {
        let _ = m.run_slice(1_000_000);
        codes.extend(m.take_post_codes());
        if codes.contains(&0xFF) {
            break;
        }
    }
    assert!(codes.contains(&0xFF));
}
