//! Decode-length diff against iced-x86: for straight-line instructions the
//! interpreter's EIP advance must equal the reference decoder's length.

mod common;

use common::FlatBus;
use iced_x86::{Decoder, DecoderOptions};
use relic_cpu_core::cpuid::CpuModel;
use relic_cpu_core::interp::step;
use relic_cpu_core::state::{gpr, seg, SegmentReg, CR0_PE};
use relic_cpu_core::CpuState;

fn protected_cpu(code_base: u32) -> CpuState {
    let mut state = CpuState::new(CpuModel::pentium_mmx());
    state.cr0 |= CR0_PE;
    state.segs[seg::CS] = SegmentReg::flat_code32();
    state.segs[seg::SS] = SegmentReg::flat_data32(0x10);
    state.segs[seg::DS] = SegmentReg::flat_data32(0x10);
    state.segs[seg::ES] = SegmentReg::flat_data32(0x10);
    state.segs[seg::FS] = SegmentReg::flat_data32(0x10);
    state.segs[seg::GS] = SegmentReg::flat_data32(0x10);
    state.eip = code_base;
    state.set_reg32(gpr::ESP, 0x8000);
    state
}

/// Non-branching encodings across prefixes, ModR/M and SIB shapes.
fn corpus() -> Vec<Vec<u8>> {
    vec![
        vec![0x90],                                     // nop
        vec![0xB8, 0x78, 0x56, 0x34, 0x12],             // mov eax, imm32
        vec![0x66, 0xB8, 0x34, 0x12],                   // mov ax, imm16
        vec![0xB4, 0x7F],                               // mov ah, imm8
        vec![0x01, 0xD8],                               // add eax, ebx
        vec![0x03, 0x04, 0x8D, 0x00, 0x20, 0x00, 0x00], // add eax, [ecx*4+0x2000]
        vec![0x81, 0xC3, 0x44, 0x33, 0x22, 0x11],       // add ebx, imm32
        vec![0x83, 0xC3, 0x7F],                         // add ebx, imm8
        vec![0x31, 0x5D, 0x10],                         // xor [ebp+0x10], ebx
        vec![0x88, 0x41, 0x05],                         // mov [ecx+5], al
        vec![0x8A, 0x82, 0x00, 0x10, 0x00, 0x00],       // mov al, [edx+0x1000]
        vec![0x8D, 0x44, 0x58, 0x08],                   // lea eax, [eax+ebx*2+8]
        vec![0xC6, 0x05, 0x00, 0x30, 0x00, 0x00, 0xAB], // mov byte [0x3000], 0xAB
        vec![0xC7, 0x40, 0x04, 0x01, 0x00, 0x00, 0x00], // mov dword [eax+4], 1
        vec![0xF7, 0xD8],                               // neg eax
        vec![0xF6, 0xC1, 0x0F],                         // test cl, 0x0F
        vec![0xC1, 0xE0, 0x03],                         // shl eax, 3
        vec![0xD1, 0xF8],                               // sar eax, 1
        vec![0x0F, 0xAF, 0xC3],                         // imul eax, ebx
        vec![0x69, 0xC0, 0x10, 0x00, 0x00, 0x00],       // imul eax, eax, 0x10
        vec![0x0F, 0xB6, 0xC1],                         // movzx eax, cl
        vec![0x0F, 0xBF, 0xC2],                         // movsx eax, dx
        vec![0x0F, 0x94, 0xC0],                         // sete al
        vec![0x0F, 0x47, 0xC3],                         // cmova eax, ebx
        vec![0x0F, 0xA3, 0xD8],                         // bt eax, ebx
        vec![0x0F, 0xBA, 0xE0, 0x05],                   // bt eax, 5
        vec![0x0F, 0xBC, 0xC3],                         // bsf eax, ebx
        vec![0x0F, 0xC8],                               // bswap eax
        vec![0x0F, 0xC1, 0xD8],                         // xadd eax, ebx
        vec![0x86, 0xDA],                               // xchg dl, bl
        vec![0x50],                                     // push eax
        vec![0x58],                                     // pop eax
        vec![0x68, 0x78, 0x56, 0x34, 0x12],             // push imm32
        vec![0x6A, 0x10],                               // push imm8
        vec![0x98],                                     // cwde
        vec![0x99],                                     // cdq
        vec![0xA0, 0x00, 0x30, 0x00, 0x00],             // mov al, [0x3000]
        vec![0xA3, 0x00, 0x30, 0x00, 0x00],             // mov [0x3000], eax
        vec![0x64, 0x8B, 0x0D, 0x00, 0x30, 0x00, 0x00], // mov ecx, fs:[0x3000]
        vec![0x66, 0x01, 0x44, 0x24, 0x02],             // add [esp+2], ax
        vec![0x0F, 0x6E, 0xC0],                         // movd mm0, eax
        vec![0x0F, 0xEF, 0xC9],                         // pxor mm1, mm1
        vec![0xD9, 0xE8],                               // fld1
        vec![0xDD, 0xD8],                               // fstp st0
    ]
}

#[test]
fn eip_advance_matches_iced_lengths() {
    for bytes in corpus() {
        let mut bus = FlatBus::new(0x10000);
        bus.load(0x1000, &bytes);
        let mut state = protected_cpu(0x1000);
        // Registers small enough that every memory form stays in bounds.
        state.set_reg32(gpr::EAX, 0x100);
        state.set_reg32(gpr::EBX, 0x40);
        state.set_reg32(gpr::ECX, 0x40);
        state.set_reg32(gpr::EDX, 0x200);
        state.set_reg32(gpr::EBP, 0x4000);

        step(&mut state, &mut bus)
            .unwrap_or_else(|e| panic!("{bytes:02x?} faulted: {e:?}"));

        let mut decoder = Decoder::with_ip(32, &bytes, 0x1000, DecoderOptions::NONE);
        let inst = decoder.decode();
        assert_eq!(
            state.eip - 0x1000,
            inst.len() as u32,
            "length mismatch for {bytes:02x?} ({:?})",
            inst.code()
        );
    }
}
