//! Protected-mode transitions: GDT loads, far transfers, interrupt gates,
//! privilege-transition stacks, and IRET.

mod common;

use common::FlatBus;
use relic_cpu_core::cpuid::CpuModel;
use relic_cpu_core::exec::{run_batch, BatchExit, CpuCore, NoInterrupts};
use relic_cpu_core::interp::step;
use relic_cpu_core::state::{gpr, seg, SegmentReg, CR0_PE};
use relic_cpu_core::{CpuState, Exception};

fn write_descriptor(bus: &mut FlatBus, gdt: u32, index: u32, base: u32, limit: u32, access: u8, attrib: u8) {
    let low = (limit & 0xFFFF) | (base << 16);
    let high = ((base >> 16) & 0xFF)
        | (u32::from(access) << 8)
        | (limit & 0xF_0000)
        | (u32::from(attrib) << 20)
        | (base & 0xFF00_0000);
    let off = (gdt + index * 8) as usize;
    bus.mem[off..off + 4].copy_from_slice(&low.to_le_bytes());
    bus.mem[off + 4..off + 8].copy_from_slice(&high.to_le_bytes());
}

fn write_idt_gate32(bus: &mut FlatBus, idt: u32, vector: u32, selector: u16, offset: u32, type_attr: u8) {
    let off = (idt + vector * 8) as usize;
    bus.mem[off..off + 2].copy_from_slice(&(offset as u16).to_le_bytes());
    bus.mem[off + 2..off + 4].copy_from_slice(&selector.to_le_bytes());
    bus.mem[off + 4] = 0;
    bus.mem[off + 5] = type_attr;
    bus.mem[off + 6..off + 8].copy_from_slice(&((offset >> 16) as u16).to_le_bytes());
}

/// GDT at 0x1000: null, flat code DPL0 (0x08), flat data DPL0 (0x10),
/// flat code DPL3 (0x1B), flat data DPL3 (0x23).
fn flat_gdt(bus: &mut FlatBus) {
    write_descriptor(bus, 0x1000, 1, 0, 0xF_FFFF, 0x9A, 0xC);
    write_descriptor(bus, 0x1000, 2, 0, 0xF_FFFF, 0x92, 0xC);
    write_descriptor(bus, 0x1000, 3, 0, 0xF_FFFF, 0xFA, 0xC);
    write_descriptor(bus, 0x1000, 4, 0, 0xF_FFFF, 0xF2, 0xC);
}

fn protected_cpu(bus: &mut FlatBus) -> CpuState {
    flat_gdt(bus);
    let mut state = CpuState::new(CpuModel::pentium());
    state.cr0 |= CR0_PE;
    state.gdtr.base = 0x1000;
    state.gdtr.limit = 0xFF;
    state.idtr.base = 0x2000;
    state.idtr.limit = 0x7FF;
    state.segs[seg::CS] = SegmentReg::flat_code32();
    state.segs[seg::SS] = SegmentReg::flat_data32(0x10);
    state.segs[seg::DS] = SegmentReg::flat_data32(0x10);
    state.set_reg32(gpr::ESP, 0x9000);
    state
}

#[test]
fn mov_ds_validates_descriptor_and_caches_it() {
    let mut bus = FlatBus::new(0x10000);
    let mut state = protected_cpu(&mut bus);
    // mov ax, 0x10; mov ds, ax
    bus.load(0x4000, &[0xB8, 0x10, 0x00, 0x00, 0x00, 0x8E, 0xD8]);
    state.eip = 0x4000;
    step(&mut state, &mut bus).unwrap();
    step(&mut state, &mut bus).unwrap();
    assert_eq!(state.segs[seg::DS].selector, 0x10);
    assert_eq!(state.segs[seg::DS].base, 0);
    assert_eq!(state.segs[seg::DS].limit, 0xFFFF_FFFF);
    // Accessed bit landed in the GDT image.
    assert_eq!(bus.mem[0x1000 + 2 * 8 + 5] & 0x01, 0x01);
}

#[test]
fn load_of_non_present_segment_faults_np() {
    let mut bus = FlatBus::new(0x10000);
    let mut state = protected_cpu(&mut bus);
    write_descriptor(&mut bus, 0x1000, 5, 0, 0xF_FFFF, 0x12, 0xC); // P=0 data
    // mov ax, 0x28; mov ds, ax
    bus.load(0x4000, &[0xB8, 0x28, 0x00, 0x00, 0x00, 0x8E, 0xD8]);
    state.eip = 0x4000;
    step(&mut state, &mut bus).unwrap();
    assert_eq!(
        step(&mut state, &mut bus),
        Err(Exception::NotPresent(0x28))
    );
}

#[test]
fn int_gate_from_user_switches_to_kernel_stack_and_iret_returns() {
    let mut bus = FlatBus::new(0x20000);
    let mut state = protected_cpu(&mut bus);

    // TSS with the ring-0 stack: SS0 = 0x10, ESP0 = 0xE000.
    let tss_base = 0x6000u32;
    bus.mem[tss_base as usize + 4..tss_base as usize + 8]
        .copy_from_slice(&0xE000u32.to_le_bytes());
    bus.mem[tss_base as usize + 8..tss_base as usize + 12]
        .copy_from_slice(&0x10u32.to_le_bytes());
    // TSS descriptor at GDT index 5 (selector 0x28), type 9 (avail 32-bit).
    write_descriptor(&mut bus, 0x1000, 5, tss_base, 0x67, 0x89, 0x0);
    state.tr.selector = 0x28;
    state.tr.base = tss_base;
    state.tr.limit = 0x67;
    state.tr.access = 0x8B;

    // Vector 0x30: interrupt gate, DPL 3, kernel code target at 0x5000.
    write_idt_gate32(&mut bus, 0x2000, 0x30, 0x08, 0x5000, 0xEE);
    // Handler: iretd.
    bus.mem[0x5000] = 0xCF;

    // User code at 0x4000: int 0x30; hlt would #GP at CPL3, use nop.
    bus.load(0x4000, &[0xCD, 0x30, 0x90]);

    // Drop to ring 3.
    state.segs[seg::CS] = SegmentReg {
        selector: 0x1B,
        base: 0,
        limit: 0xFFFF_FFFF,
        access: 0xFB,
        attrib: 0xC,
        valid: true,
    };
    state.segs[seg::SS] = SegmentReg {
        selector: 0x23,
        base: 0,
        limit: 0xFFFF_FFFF,
        access: 0xF3,
        attrib: 0xC,
        valid: true,
    };
    state.segs[seg::DS] = state.segs[seg::SS];
    state.set_reg32(gpr::ESP, 0xC000);
    state.eip = 0x4000;

    // INT 0x30 enters ring 0 on the TSS stack.
    step(&mut state, &mut bus).unwrap();
    assert_eq!(state.cpl(), 0);
    assert_eq!(state.segs[seg::CS].selector & !3, 0x08);
    assert_eq!(state.segs[seg::SS].selector, 0x10);
    // Frame: SS3, ESP3, EFLAGS, CS3, EIP.
    assert_eq!(state.reg32(gpr::ESP), 0xE000 - 20);
    assert_eq!(state.eip, 0x5000);

    // IRET returns to ring 3 with the user stack restored.
    step(&mut state, &mut bus).unwrap();
    assert_eq!(state.cpl(), 3);
    assert_eq!(state.segs[seg::CS].selector, 0x1B);
    assert_eq!(state.segs[seg::SS].selector, 0x23);
    assert_eq!(state.reg32(gpr::ESP), 0xC000);
    assert_eq!(state.eip, 0x4002);
}

#[test]
fn software_int_through_low_dpl_gate_faults_gp() {
    let mut bus = FlatBus::new(0x10000);
    let mut state = protected_cpu(&mut bus);
    // Vector 0x31: DPL 0 gate.
    write_idt_gate32(&mut bus, 0x2000, 0x31, 0x08, 0x5000, 0x8E);
    bus.load(0x4000, &[0xCD, 0x31]);
    state.segs[seg::CS] = SegmentReg {
        selector: 0x1B,
        base: 0,
        limit: 0xFFFF_FFFF,
        access: 0xFB,
        attrib: 0xC,
        valid: true,
    };
    state.segs[seg::SS] = SegmentReg {
        selector: 0x23,
        base: 0,
        limit: 0xFFFF_FFFF,
        access: 0xF3,
        attrib: 0xC,
        valid: true,
    };
    state.eip = 0x4000;
    state.set_reg32(gpr::ESP, 0xC000);

    // #GP with the gate-style error code (vector*8 | 2).
    assert_eq!(
        step(&mut state, &mut bus),
        Err(Exception::GeneralProtection((0x31 << 3) | 2))
    );
}

#[test]
fn far_jump_between_flat_code_segments() {
    let mut bus = FlatBus::new(0x10000);
    let mut state = protected_cpu(&mut bus);
    // jmp 0x08:0x4800
    bus.load(0x4000, &[0xEA, 0x00, 0x48, 0x00, 0x00, 0x08, 0x00]);
    bus.mem[0x4800] = 0x90;
    state.eip = 0x4000;
    step(&mut state, &mut bus).unwrap();
    assert_eq!(state.eip, 0x4800);
    assert_eq!(state.segs[seg::CS].selector & !3, 0x08);
}

#[test]
fn triple_fault_reported_when_idt_is_unusable() {
    let mut bus = FlatBus::new(0x10000);
    let mut cpu = CpuCore::new(CpuModel::pentium());
    cpu.state = protected_cpu(&mut bus);
    // Empty IDT: any exception cascades to a triple fault.
    cpu.state.idtr.limit = 0;
    // ud2
    bus.load(0x4000, &[0x0F, 0x0B]);
    cpu.state.eip = 0x4000;
    let mut ctrl = NoInterrupts;
    let res = run_batch(&mut cpu, &mut bus, &mut ctrl, 100);
    assert_eq!(res.exit, BatchExit::TripleFault);
}
