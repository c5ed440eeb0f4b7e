//! Privileged and system instructions: port I/O with IOPL/TSS-bitmap
//! gating, control/debug register moves, MSRs, CPUID, HLT, interrupt-flag
//! control, and AMD SYSCALL/SYSRET.

use crate::bus::CpuBus;
use crate::exceptions::Exception;
use crate::state::{gpr, seg as sr, CpuMode, CpuState, SegmentReg, CR0_TS, CR4_TSD, EFER_SCE};

use super::{decode_modrm, fetch_u8, Ea, Instr};

/// I/O permission: IOPL in protected mode, the TSS bitmap when IOPL is
/// insufficient (and always in V86 mode).
pub fn check_io_permission<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    port: u16,
    len: u16,
) -> Result<(), Exception> {
    match state.mode() {
        CpuMode::Real => Ok(()),
        CpuMode::Protected if state.cpl() <= state.flags.iopl() => Ok(()),
        _ => {
            // Consult the TSS I/O bitmap.
            if state.tr.limit < 0x67 {
                return Err(Exception::gp0());
            }
            let io_base = bus.read_u16(state.tr.base.wrapping_add(0x66))?;
            let first = u32::from(io_base) + u32::from(port / 8);
            let last = u32::from(io_base) + u32::from((port + len - 1) / 8);
            if last > state.tr.limit {
                return Err(Exception::gp0());
            }
            let bits = u16::from(bus.read_u8(state.tr.base.wrapping_add(first))?)
                | (u16::from(
                    bus.read_u8(state.tr.base.wrapping_add(last))?,
                ) << 8);
            let shifted = bits >> (port % 8);
            let mask = (1u16 << len) - 1;
            if shifted & mask != 0 {
                return Err(Exception::gp0());
            }
            Ok(())
        }
    }
}

pub fn in_out<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    i: &mut Instr,
    opcode: u8,
) -> Result<(), Exception> {
    let bits = if opcode & 1 == 0 { 8 } else { i.op_bits() };
    let port = if opcode & 0x08 == 0 {
        u16::from(fetch_u8(state, bus, i)?)
    } else {
        state.reg16(gpr::EDX)
    };
    check_io_permission(state, bus, port, (bits / 8) as u16)?;
    if opcode & 0x02 == 0 {
        // IN.
        let value = bus.io_read(port, (bits / 8) as u8);
        state.set_reg(gpr::EAX, bits, value);
    } else {
        let value = state.reg(gpr::EAX, bits);
        bus.io_write(port, (bits / 8) as u8, value);
    }
    Ok(())
}

pub fn hlt(state: &mut CpuState) -> Result<(), Exception> {
    if state.protected_mode() && state.cpl() != 0 {
        return Err(Exception::gp0());
    }
    state.halted = true;
    Ok(())
}

pub fn cli(state: &mut CpuState) -> Result<(), Exception> {
    match state.mode() {
        CpuMode::Real => {}
        _ => {
            if state.cpl() > state.flags.iopl() {
                return Err(Exception::gp0());
            }
        }
    }
    state.flags.set_if(false);
    Ok(())
}

pub fn sti(state: &mut CpuState) -> Result<(), Exception> {
    match state.mode() {
        CpuMode::Real => {}
        _ => {
            if state.cpl() > state.flags.iopl() {
                return Err(Exception::gp0());
            }
        }
    }
    if !state.flags.if_set() {
        // Interrupts stay blocked for exactly one more instruction.
        state.inhibit.sti_shadow = true;
    }
    state.flags.set_if(true);
    Ok(())
}

pub fn clts(state: &mut CpuState) -> Result<(), Exception> {
    if state.protected_mode() && state.cpl() != 0 {
        return Err(Exception::gp0());
    }
    state.cr0 &= !CR0_TS;
    Ok(())
}

pub fn mov_cr_dr<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    i: &mut Instr,
    opcode: u8,
) -> Result<(), Exception> {
    if state.protected_mode() && state.cpl() != 0 {
        return Err(Exception::gp0());
    }
    let m = decode_modrm(state, bus, i)?;
    // CR/DR moves always use the register form regardless of mod bits.
    let Ea::Reg(rm) = m.ea else {
        return Err(Exception::InvalidOpcode);
    };
    match opcode {
        0x20 => {
            let value = match m.reg {
                0 => state.cr0,
                2 => state.cr2,
                3 => state.cr3,
                4 => state.cr4,
                _ => return Err(Exception::InvalidOpcode),
            };
            state.set_reg32(rm, value);
        }
        0x22 => {
            let value = state.reg32(rm);
            match m.reg {
                0 => {
                    state.cr0 = value | 0x10; // ET is hard-wired
                    bus.flush_tlb();
                }
                2 => state.cr2 = value,
                3 => {
                    state.cr3 = value;
                    bus.flush_tlb();
                }
                4 => {
                    state.cr4 = value;
                    bus.flush_tlb();
                }
                _ => return Err(Exception::InvalidOpcode),
            }
            bus.sync(state);
        }
        0x21 => state.set_reg32(rm, state.dr[m.reg]),
        _ => state.dr[m.reg] = state.reg32(rm),
    }
    Ok(())
}

pub fn rdtsc(state: &mut CpuState) -> Result<(), Exception> {
    if !state.model.has_tsc() {
        return Err(Exception::InvalidOpcode);
    }
    if state.cr4 & CR4_TSD != 0 && state.cpl() != 0 {
        return Err(Exception::gp0());
    }
    state.set_reg32(gpr::EAX, state.tsc as u32);
    state.set_reg32(gpr::EDX, (state.tsc >> 32) as u32);
    Ok(())
}

pub fn rdmsr(state: &mut CpuState) -> Result<(), Exception> {
    if state.protected_mode() && state.cpl() != 0 {
        return Err(Exception::gp0());
    }
    let index = state.reg32(gpr::ECX);
    let value: u64 = match index {
        0x10 => state.tsc,
        0x1B => state.msrs.apic_base,
        0xC000_0080 => state.msrs.efer,
        0xC000_0081 => state.msrs.star,
        0x277 => state.msrs.pat,
        _ => {
            log::trace!("rdmsr of unknown msr {index:#x}");
            0
        }
    };
    state.set_reg32(gpr::EAX, value as u32);
    state.set_reg32(gpr::EDX, (value >> 32) as u32);
    Ok(())
}

pub fn wrmsr(state: &mut CpuState) -> Result<(), Exception> {
    if state.protected_mode() && state.cpl() != 0 {
        return Err(Exception::gp0());
    }
    let index = state.reg32(gpr::ECX);
    let value = (u64::from(state.reg32(gpr::EDX)) << 32) | u64::from(state.reg32(gpr::EAX));
    match index {
        0x10 => state.tsc = value,
        0x1B => state.msrs.apic_base = value,
        0xC000_0080 => state.msrs.efer = value & EFER_SCE,
        0xC000_0081 => state.msrs.star = value,
        0x277 => state.msrs.pat = value,
        _ => log::trace!("wrmsr of unknown msr {index:#x} = {value:#x}"),
    }
    Ok(())
}

pub fn cpuid(state: &mut CpuState) -> Result<(), Exception> {
    let leaf = state.reg32(gpr::EAX);
    let model = state.model;
    let (a, b, c, d) = match leaf {
        0 => {
            let (ebx, edx, ecx) = model.vendor.id_string();
            (1, ebx, ecx, edx)
        }
        1 => (model.signature(), 0, 0, model.features),
        0x8000_0000 if model.has_syscall => (0x8000_0001, 0, 0, 0),
        0x8000_0001 if model.has_syscall => {
            // AMD extended features: SYSCALL bit 11.
            (model.signature(), 0, 0, model.features | (1 << 11))
        }
        _ => (0, 0, 0, 0),
    };
    state.set_reg32(gpr::EAX, a);
    state.set_reg32(gpr::EBX, b);
    state.set_reg32(gpr::ECX, c);
    state.set_reg32(gpr::EDX, d);
    Ok(())
}

/// AMD K6-style SYSCALL, gated on EFER.SCE.
pub fn syscall<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    i: &mut Instr,
) -> Result<(), Exception> {
    if state.msrs.efer & EFER_SCE == 0 || !state.model.has_syscall {
        return Err(Exception::InvalidOpcode);
    }
    if !state.protected_mode() {
        return Err(Exception::InvalidOpcode);
    }
    let star = state.msrs.star;
    let cs_sel = ((star >> 32) & 0xFFFF) as u16;

    // Return address in ECX.
    state.set_reg32(gpr::ECX, i.cur);
    state.segs[sr::CS] = SegmentReg::flat_code32();
    state.segs[sr::CS].selector = cs_sel & !3;
    state.segs[sr::SS] = SegmentReg::flat_data32((cs_sel & !3) + 8);
    state.flags.set_if(false);
    state.flags.set_vm(false);
    state.eip = (star & 0xFFFF_FFFF) as u32;
    i.jumped = true;
    bus.sync(state);
    Ok(())
}

pub fn sysret<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    i: &mut Instr,
) -> Result<(), Exception> {
    if state.msrs.efer & EFER_SCE == 0 || !state.model.has_syscall {
        return Err(Exception::InvalidOpcode);
    }
    if !state.protected_mode() || state.cpl() != 0 {
        return Err(Exception::gp0());
    }
    let star = state.msrs.star;
    let cs_sel = ((star >> 48) & 0xFFFF) as u16;

    state.segs[sr::CS] = SegmentReg::flat_code32();
    state.segs[sr::CS].selector = (cs_sel & !3) | 3;
    state.segs[sr::CS].access = 0xFB; // DPL 3 code
    state.segs[sr::SS] = SegmentReg::flat_data32(((cs_sel & !3) + 8) | 3);
    state.segs[sr::SS].access = 0xF3;
    state.eip = state.reg32(gpr::ECX);
    state.flags.set_if(true);
    i.jumped = true;
    bus.sync(state);
    Ok(())
}

/// RSM outside SMM is undefined opcode; the real path lives in `smm`.
pub fn rsm<B: CpuBus>(state: &mut CpuState, bus: &mut B, i: &mut Instr) -> Result<(), Exception> {
    if !state.in_smm {
        return Err(Exception::InvalidOpcode);
    }
    crate::smm::resume_from_smm(state, bus);
    i.jumped = true;
    Ok(())
}
