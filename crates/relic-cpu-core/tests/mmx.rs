mod common;

use common::FlatBus;
use relic_cpu_core::cpuid::CpuModel;
use relic_cpu_core::interp::step;
use relic_cpu_core::state::{gpr, seg, SegmentReg};
use relic_cpu_core::CpuState;

fn mmx_cpu(code_base: u32) -> CpuState {
    let mut state = CpuState::new(CpuModel::pentium_mmx());
    state.segs[seg::CS] = SegmentReg::real_mode(0);
    state.eip = code_base;
    state.set_reg16(gpr::ESP, 0x8000);
    state
}

#[test]
fn movd_roundtrip_and_emms_restores_empty_tags() {
    let mut bus = FlatBus::new(0x10000);
    // movd mm0, eax; movd ebx, mm0; emms
    bus.load(
        0x200,
        &[0x0F, 0x6E, 0xC0, 0x0F, 0x7E, 0xC3, 0x0F, 0x77],
    );
    let mut state = mmx_cpu(0x200);
    state.set_reg32(gpr::EAX, 0xDEAD_BEEF);

    step(&mut state, &mut bus).unwrap();
    assert_ne!(
        state.fpu.tag_word(),
        0xFFFF,
        "MMX use claims the register file"
    );
    step(&mut state, &mut bus).unwrap();
    assert_eq!(state.reg32(gpr::EBX), 0xDEAD_BEEF);

    step(&mut state, &mut bus).unwrap();
    assert_eq!(state.fpu.tag_word(), 0xFFFF, "EMMS empties every tag");
}

#[test]
fn packed_add_with_saturation_lanes() {
    let mut bus = FlatBus::new(0x10000);
    bus.load(0x3000, &0x7F01_80FF_0102_0304u64.to_le_bytes());
    // movq mm1, [0x3000]; paddsb mm1, [0x3000]
    bus.load(
        0x200,
        &[
            0x0F, 0x6F, 0x0E, 0x00, 0x30, // movq mm1, [0x3000]
            0x0F, 0xEC, 0x0E, 0x00, 0x30, // paddsb mm1, [0x3000]
        ],
    );
    let mut state = mmx_cpu(0x200);
    state.segs[seg::DS] = SegmentReg::real_mode(0);
    step(&mut state, &mut bus).unwrap();
    step(&mut state, &mut bus).unwrap();

    // Per-lane signed saturation: 0x7F+0x7F=0x7F, 0x80+0x80=0x80,
    // 0xFF+0xFF=0xFE, plain small sums double.
    assert_eq!(state.fpu.mmx_read(1), 0x7F02_80FE_0204_0608);
}

#[test]
fn pand_pxor_por_bitwise() {
    let mut bus = FlatBus::new(0x10000);
    bus.load(0x3000, &0xFF00_FF00_FF00_FF00u64.to_le_bytes());
    bus.load(0x3008, &0x0F0F_0F0F_0F0F_0F0Fu64.to_le_bytes());
    bus.load(
        0x200,
        &[
            0x0F, 0x6F, 0x06, 0x00, 0x30, // movq mm0, [0x3000]
            0x0F, 0xDB, 0x06, 0x08, 0x30, // pand mm0, [0x3008]
            0x0F, 0xEB, 0x06, 0x08, 0x30, // por  mm0, [0x3008]
            0x0F, 0xEF, 0x06, 0x00, 0x30, // pxor mm0, [0x3000]
        ],
    );
    let mut state = mmx_cpu(0x200);
    state.segs[seg::DS] = SegmentReg::real_mode(0);
    for _ in 0..4 {
        step(&mut state, &mut bus).unwrap();
    }
    assert_eq!(state.fpu.mmx_read(0), 0xF00F_F00F_F00F_F00F);
}

#[test]
fn mmx_on_non_mmx_model_is_invalid_opcode() {
    let mut bus = FlatBus::new(0x10000);
    bus.load(0x200, &[0x0F, 0x77]); // emms
    let mut state = CpuState::new(CpuModel::i486dx());
    state.segs[seg::CS] = SegmentReg::real_mode(0);
    state.eip = 0x200;
    assert_eq!(
        step(&mut state, &mut bus),
        Err(relic_cpu_core::Exception::InvalidOpcode)
    );
}
