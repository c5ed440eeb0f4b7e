//! Fused decode + dispatch interpreter.
//!
//! Prefixes accumulate into the per-instruction context, ModR/M resolves an
//! effective address against the selected segment's descriptor cache, and
//! each opcode family executes immediately. Faults short-circuit through
//! `Result`; the step loop commits EIP only on success so a faulting
//! instruction restarts cleanly.

pub mod alu;
pub mod bcd;
pub mod control;
pub mod fpu_ops;
pub mod mmx;
pub mod seg;
pub mod string;
pub mod sys;

use crate::bus::CpuBus;
use crate::cpuid::CycleClass;
use crate::exceptions::Exception;
use crate::flags;
use crate::state::{gpr, seg as sr, CpuState};

pub const MAX_INSTR_LEN: u32 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rep {
    Repe,
    Repne,
}

/// Per-instruction decode context.
pub struct Instr {
    pub start_eip: u32,
    /// Fetch cursor (EIP-relative, absolute value).
    pub cur: u32,
    pub opsize32: bool,
    pub addrsize32: bool,
    pub seg_override: Option<usize>,
    pub rep: Option<Rep>,
    pub lock: bool,
    pub jumped: bool,
    /// Set when the memory form of ModR/M was used, for cycle costing.
    pub mem_op: bool,
    /// Extra cycles charged by individual handlers (MUL, string runs...).
    pub extra_cycles: u32,
}

impl Instr {
    fn new(state: &CpuState) -> Self {
        let code32 = state.code_32();
        Self {
            start_eip: state.eip,
            cur: state.eip,
            opsize32: code32,
            addrsize32: code32,
            seg_override: None,
            rep: None,
            lock: false,
            jumped: false,
            mem_op: false,
            extra_cycles: 0,
        }
    }

    pub fn op_bits(&self) -> u32 {
        if self.opsize32 {
            32
        } else {
            16
        }
    }

    pub fn data_seg(&self) -> usize {
        self.seg_override.unwrap_or(sr::DS)
    }
}

/// Effective address: a register or a segment-relative offset.
#[derive(Debug, Clone, Copy)]
pub enum Ea {
    Reg(usize),
    Mem { seg: usize, off: u32 },
}

pub struct Modrm {
    pub reg: usize,
    pub ea: Ea,
    pub byte: u8,
}

// ----------------------------------------------------------------------
// Fetch
// ----------------------------------------------------------------------

pub fn fetch_u8<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    i: &mut Instr,
) -> Result<u8, Exception> {
    if i.cur.wrapping_sub(i.start_eip) >= MAX_INSTR_LEN {
        return Err(Exception::gp0());
    }
    let cs = &state.segs[sr::CS];
    if !cs.limit_check(i.cur, 1) {
        return Err(Exception::gp0());
    }
    let lin = cs.base.wrapping_add(i.cur);
    let byte = bus.fetch_u8(lin)?;
    i.cur = i.cur.wrapping_add(1);
    Ok(byte)
}

pub fn fetch_u16<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    i: &mut Instr,
) -> Result<u16, Exception> {
    Ok(u16::from_le_bytes([
        fetch_u8(state, bus, i)?,
        fetch_u8(state, bus, i)?,
    ]))
}

pub fn fetch_u32<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    i: &mut Instr,
) -> Result<u32, Exception> {
    Ok(u32::from(fetch_u16(state, bus, i)?) | (u32::from(fetch_u16(state, bus, i)?) << 16))
}

/// Immediate of the current operand size.
pub fn fetch_imm<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    i: &mut Instr,
) -> Result<u32, Exception> {
    if i.opsize32 {
        fetch_u32(state, bus, i)
    } else {
        Ok(fetch_u16(state, bus, i)?.into())
    }
}

// ----------------------------------------------------------------------
// ModR/M + SIB
// ----------------------------------------------------------------------

pub fn decode_modrm<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    i: &mut Instr,
) -> Result<Modrm, Exception> {
    let byte = fetch_u8(state, bus, i)?;
    let md = byte >> 6;
    let reg = ((byte >> 3) & 7) as usize;
    let rm = (byte & 7) as usize;

    if md == 3 {
        return Ok(Modrm {
            reg,
            ea: Ea::Reg(rm),
            byte,
        });
    }
    i.mem_op = true;

    let (seg_default, off) = if i.addrsize32 {
        decode_mem32(state, bus, i, md, rm)?
    } else {
        decode_mem16(state, bus, i, md, rm)?
    };
    let seg = i.seg_override.unwrap_or(seg_default);
    Ok(Modrm {
        reg,
        ea: Ea::Mem { seg, off },
        byte,
    })
}

fn decode_mem16<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    i: &mut Instr,
    md: u8,
    rm: usize,
) -> Result<(usize, u32), Exception> {
    let (base, seg) = match rm {
        0 => (state.reg16(gpr::EBX).wrapping_add(state.reg16(gpr::ESI)), sr::DS),
        1 => (state.reg16(gpr::EBX).wrapping_add(state.reg16(gpr::EDI)), sr::DS),
        2 => (state.reg16(gpr::EBP).wrapping_add(state.reg16(gpr::ESI)), sr::SS),
        3 => (state.reg16(gpr::EBP).wrapping_add(state.reg16(gpr::EDI)), sr::SS),
        4 => (state.reg16(gpr::ESI), sr::DS),
        5 => (state.reg16(gpr::EDI), sr::DS),
        6 => {
            if md == 0 {
                let disp = fetch_u16(state, bus, i)?;
                return Ok((sr::DS, disp.into()));
            }
            (state.reg16(gpr::EBP), sr::SS)
        }
        _ => (state.reg16(gpr::EBX), sr::DS),
    };
    let disp = match md {
        0 => 0i16,
        1 => i16::from(fetch_u8(state, bus, i)? as i8),
        _ => fetch_u16(state, bus, i)? as i16,
    };
    Ok((seg, u32::from(base.wrapping_add(disp as u16))))
}

fn decode_mem32<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    i: &mut Instr,
    md: u8,
    rm: usize,
) -> Result<(usize, u32), Exception> {
    let mut seg = sr::DS;
    let mut off: u32;

    if rm == 4 {
        // SIB byte.
        let sib = fetch_u8(state, bus, i)?;
        let scale = sib >> 6;
        let index = ((sib >> 3) & 7) as usize;
        let base = (sib & 7) as usize;

        off = if index == 4 {
            0
        } else {
            state.reg32(index) << scale
        };
        if base == 5 && md == 0 {
            off = off.wrapping_add(fetch_u32(state, bus, i)?);
        } else {
            if base == gpr::ESP || base == gpr::EBP {
                seg = sr::SS;
            }
            off = off.wrapping_add(state.reg32(base));
        }
    } else if rm == 5 && md == 0 {
        off = fetch_u32(state, bus, i)?;
    } else {
        if rm == gpr::EBP {
            seg = sr::SS;
        }
        off = state.reg32(rm);
    }

    match md {
        0 => {}
        1 => off = off.wrapping_add(fetch_u8(state, bus, i)? as i8 as u32),
        _ => off = off.wrapping_add(fetch_u32(state, bus, i)?),
    }
    Ok((seg, off))
}

// ----------------------------------------------------------------------
// Segment-checked memory access
// ----------------------------------------------------------------------

fn seg_fault(seg_idx: usize) -> Exception {
    if seg_idx == sr::SS {
        Exception::StackFault(0)
    } else {
        Exception::gp0()
    }
}

/// Checks limits/rights and returns the linear address for an access of
/// `len` bytes.
pub fn lin_addr(
    state: &CpuState,
    seg_idx: usize,
    off: u32,
    len: u32,
    write: bool,
) -> Result<u32, Exception> {
    let seg = &state.segs[seg_idx];
    if !seg.valid {
        return Err(seg_fault(seg_idx));
    }
    if state.protected_mode() && !state.flags.vm() {
        if write && !seg.writable() && !seg.is_system() && seg.executable() {
            return Err(seg_fault(seg_idx));
        }
        if write && !seg.executable() && !seg.writable() {
            return Err(seg_fault(seg_idx));
        }
        if !write && !seg.readable() {
            return Err(seg_fault(seg_idx));
        }
    }
    if !seg.limit_check(off, len) {
        return Err(seg_fault(seg_idx));
    }
    Ok(seg.base.wrapping_add(off))
}

pub fn read_mem<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    seg_idx: usize,
    off: u32,
    bits: u32,
) -> Result<u32, Exception> {
    let lin = lin_addr(state, seg_idx, off, bits / 8, false)?;
    match bits {
        8 => Ok(bus.read_u8(lin)?.into()),
        16 => Ok(bus.read_u16(lin)?.into()),
        _ => bus.read_u32(lin),
    }
}

pub fn write_mem<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    seg_idx: usize,
    off: u32,
    bits: u32,
    value: u32,
) -> Result<(), Exception> {
    let lin = lin_addr(state, seg_idx, off, bits / 8, true)?;
    match bits {
        8 => bus.write_u8(lin, value as u8),
        16 => bus.write_u16(lin, value as u16),
        _ => bus.write_u32(lin, value),
    }
}

pub fn read_ea<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    ea: Ea,
    bits: u32,
) -> Result<u32, Exception> {
    match ea {
        Ea::Reg(idx) => Ok(state.reg(idx, bits)),
        Ea::Mem { seg, off } => read_mem(state, bus, seg, off, bits),
    }
}

pub fn write_ea<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    ea: Ea,
    bits: u32,
    value: u32,
) -> Result<(), Exception> {
    match ea {
        Ea::Reg(idx) => {
            state.set_reg(idx, bits, value);
            Ok(())
        }
        Ea::Mem { seg, off } => write_mem(state, bus, seg, off, bits, value),
    }
}

// ----------------------------------------------------------------------
// Stack
// ----------------------------------------------------------------------

pub fn push<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    bits: u32,
    value: u32,
) -> Result<(), Exception> {
    let delta = bits / 8;
    let sp = if state.stack_32() {
        state.esp().wrapping_sub(delta)
    } else {
        u32::from((state.esp() as u16).wrapping_sub(delta as u16))
    };
    write_mem(state, bus, sr::SS, sp, bits, value)?;
    if state.stack_32() {
        state.set_esp(sp);
    } else {
        state.set_reg16(gpr::ESP, sp as u16);
    }
    Ok(())
}

pub fn pop<B: CpuBus>(state: &mut CpuState, bus: &mut B, bits: u32) -> Result<u32, Exception> {
    let sp = state.stack_ptr();
    let value = read_mem(state, bus, sr::SS, sp, bits)?;
    state.adjust_stack_ptr((bits / 8) as i32);
    Ok(value)
}

// ----------------------------------------------------------------------
// Step
// ----------------------------------------------------------------------

/// Result of executing one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Normal,
    Halted,
}

pub fn step<B: CpuBus>(state: &mut CpuState, bus: &mut B) -> Result<StepOutcome, Exception> {
    let mut i = Instr::new(state);

    // Prefix accumulation.
    let opcode = loop {
        let byte = fetch_u8(state, bus, &mut i)?;
        match byte {
            0x26 => i.seg_override = Some(sr::ES),
            0x2E => i.seg_override = Some(sr::CS),
            0x36 => i.seg_override = Some(sr::SS),
            0x3E => i.seg_override = Some(sr::DS),
            0x64 => i.seg_override = Some(sr::FS),
            0x65 => i.seg_override = Some(sr::GS),
            0x66 => i.opsize32 = !state.code_32(),
            0x67 => i.addrsize32 = !state.code_32(),
            0xF0 => i.lock = true,
            0xF2 => i.rep = Some(Rep::Repne),
            0xF3 => i.rep = Some(Rep::Repe),
            _ => break byte,
        }
    };

    dispatch(state, bus, &mut i, opcode)?;

    if !i.jumped {
        state.eip = i.cur;
    }
    state.tsc = state.tsc.wrapping_add(1);
    state.cycles -= i64::from(cycle_cost(state, &i, opcode));
    Ok(if state.halted {
        StepOutcome::Halted
    } else {
        StepOutcome::Normal
    })
}

fn dispatch<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    i: &mut Instr,
    opcode: u8,
) -> Result<(), Exception> {
    // The 0x00-0x3F ALU block (holes are segment push/pop and BCD ops).
    if opcode < 0x40 && (opcode & 7) < 6 {
        return alu::exec_alu_block(state, bus, i, opcode);
    }

    match opcode {
        // Segment register push/pop.
        0x06 => push(state, bus, i.op_bits(), state.segs[sr::ES].selector.into()),
        0x0E => push(state, bus, i.op_bits(), state.segs[sr::CS].selector.into()),
        0x16 => push(state, bus, i.op_bits(), state.segs[sr::SS].selector.into()),
        0x1E => push(state, bus, i.op_bits(), state.segs[sr::DS].selector.into()),
        0x07 => seg::pop_seg(state, bus, i, sr::ES),
        0x17 => seg::pop_seg(state, bus, i, sr::SS),
        0x1F => seg::pop_seg(state, bus, i, sr::DS),

        0x0F => dispatch_0f(state, bus, i),

        0x27 => bcd::daa(state),
        0x2F => bcd::das(state),
        0x37 => bcd::aaa(state),
        0x3F => bcd::aas(state),

        0x40..=0x47 => alu::inc_reg(state, i, (opcode & 7) as usize),
        0x48..=0x4F => alu::dec_reg(state, i, (opcode & 7) as usize),

        0x50..=0x57 => {
            let value = state.reg((opcode & 7) as usize, i.op_bits());
            push(state, bus, i.op_bits(), value)
        }
        0x58..=0x5F => {
            let value = pop(state, bus, i.op_bits())?;
            state.set_reg((opcode & 7) as usize, i.op_bits(), value);
            Ok(())
        }

        0x60 => alu::pusha(state, bus, i),
        0x61 => alu::popa(state, bus, i),
        0x62 => alu::bound(state, bus, i),
        0x63 => seg::arpl(state, bus, i),

        0x68 => {
            let imm = fetch_imm(state, bus, i)?;
            push(state, bus, i.op_bits(), imm)
        }
        0x69 => alu::imul_imm(state, bus, i, false),
        0x6A => {
            let imm = fetch_u8(state, bus, i)? as i8 as u32;
            push(state, bus, i.op_bits(), imm)
        }
        0x6B => alu::imul_imm(state, bus, i, true),

        0x6C | 0x6D => string::ins(state, bus, i, opcode),
        0x6E | 0x6F => string::outs(state, bus, i, opcode),

        0x70..=0x7F => control::jcc_rel8(state, bus, i, opcode),

        0x80..=0x83 => alu::exec_group1(state, bus, i, opcode),
        0x84 | 0x85 => alu::test_rm_reg(state, bus, i, opcode),
        0x86 | 0x87 => alu::xchg_rm_reg(state, bus, i, opcode),
        0x88..=0x8B => alu::mov_rm_reg(state, bus, i, opcode),
        0x8C => seg::mov_rm_sreg(state, bus, i),
        0x8D => alu::lea(state, bus, i),
        0x8E => seg::mov_sreg_rm(state, bus, i),
        0x8F => {
            // POP r/m.
            let value = pop(state, bus, i.op_bits())?;
            let m = decode_modrm(state, bus, i)?;
            write_ea(state, bus, m.ea, i.op_bits(), value)
        }

        0x90 => Ok(()), // NOP (XCHG eAX, eAX)
        0x91..=0x97 => {
            let idx = (opcode & 7) as usize;
            let bits = i.op_bits();
            let a = state.reg(gpr::EAX, bits);
            let b = state.reg(idx, bits);
            state.set_reg(gpr::EAX, bits, b);
            state.set_reg(idx, bits, a);
            Ok(())
        }

        0x98 => {
            // CBW/CWDE.
            if i.opsize32 {
                state.set_reg32(gpr::EAX, state.reg16(gpr::EAX) as i16 as i32 as u32);
            } else {
                state.set_reg16(gpr::EAX, state.reg8(gpr::EAX) as i8 as i16 as u16);
            }
            Ok(())
        }
        0x99 => {
            // CWD/CDQ.
            if i.opsize32 {
                let sign = if state.reg32(gpr::EAX) & 0x8000_0000 != 0 {
                    0xFFFF_FFFF
                } else {
                    0
                };
                state.set_reg32(gpr::EDX, sign);
            } else {
                let sign = if state.reg16(gpr::EAX) & 0x8000 != 0 {
                    0xFFFF
                } else {
                    0
                };
                state.set_reg16(gpr::EDX, sign);
            }
            Ok(())
        }

        0x9A => control::call_far_imm(state, bus, i),
        0x9B => fpu_ops::wait(state),
        0x9C => control::pushf(state, bus, i),
        0x9D => control::popf(state, bus, i),
        0x9E => {
            // SAHF.
            let ah = state.reg8(4); // AH
            let mask = flags::CF | flags::PF | flags::AF | flags::ZF | flags::SF;
            state.flags.set_masked(ah.into(), mask);
            Ok(())
        }
        0x9F => {
            // LAHF.
            let value = state.flags.get() as u8;
            state.set_reg8(4, value);
            Ok(())
        }

        0xA0..=0xA3 => alu::mov_moffs(state, bus, i, opcode),
        0xA4 | 0xA5 => string::movs(state, bus, i, opcode),
        0xA6 | 0xA7 => string::cmps(state, bus, i, opcode),
        0xA8 | 0xA9 => alu::test_acc_imm(state, bus, i, opcode),
        0xAA | 0xAB => string::stos(state, bus, i, opcode),
        0xAC | 0xAD => string::lods(state, bus, i, opcode),
        0xAE | 0xAF => string::scas(state, bus, i, opcode),

        0xB0..=0xB7 => {
            let imm = fetch_u8(state, bus, i)?;
            state.set_reg8((opcode & 7) as usize, imm);
            Ok(())
        }
        0xB8..=0xBF => {
            let imm = fetch_imm(state, bus, i)?;
            state.set_reg((opcode & 7) as usize, i.op_bits(), imm);
            Ok(())
        }

        0xC0 | 0xC1 | 0xD0..=0xD3 => alu::exec_shift_group(state, bus, i, opcode),

        0xC2 => control::ret_near(state, bus, i, true),
        0xC3 => control::ret_near(state, bus, i, false),
        0xC4 => seg::load_far_pointer(state, bus, i, sr::ES),
        0xC5 => seg::load_far_pointer(state, bus, i, sr::DS),
        0xC6 | 0xC7 => {
            let bits = if opcode == 0xC6 { 8 } else { i.op_bits() };
            let m = decode_modrm(state, bus, i)?;
            let imm = if bits == 8 {
                fetch_u8(state, bus, i)?.into()
            } else {
                fetch_imm(state, bus, i)?
            };
            write_ea(state, bus, m.ea, bits, imm)
        }
        0xC8 => control::enter(state, bus, i),
        0xC9 => control::leave(state, bus, i),
        0xCA => control::ret_far(state, bus, i, true),
        0xCB => control::ret_far(state, bus, i, false),
        0xCC => control::int_sw(state, bus, i, 3, control::IntKind::Int3),
        0xCD => {
            let vector = fetch_u8(state, bus, i)?;
            control::int_sw(state, bus, i, vector, control::IntKind::Software)
        }
        0xCE => {
            if state.flags.of() {
                control::int_sw(state, bus, i, 4, control::IntKind::Into)
            } else {
                Ok(())
            }
        }
        0xCF => control::iret(state, bus, i),

        0xD4 => bcd::aam(state, bus, i),
        0xD5 => bcd::aad(state, bus, i),
        0xD6 => {
            // SALC.
            let value = if state.flags.cf() { 0xFF } else { 0x00 };
            state.set_reg8(0, value);
            Ok(())
        }
        0xD7 => {
            // XLAT.
            let base = if i.addrsize32 {
                state.reg32(gpr::EBX).wrapping_add(state.reg8(0).into())
            } else {
                u32::from(
                    state
                        .reg16(gpr::EBX)
                        .wrapping_add(u16::from(state.reg8(0))),
                )
            };
            let value = read_mem(state, bus, i.data_seg(), base, 8)?;
            state.set_reg8(0, value as u8);
            Ok(())
        }

        0xD8..=0xDF => fpu_ops::exec(state, bus, i, opcode),

        0xE0..=0xE3 => control::loop_ops(state, bus, i, opcode),
        0xE4..=0xE7 | 0xEC..=0xEF => sys::in_out(state, bus, i, opcode),
        0xE8 => control::call_rel(state, bus, i),
        0xE9 => control::jmp_rel(state, bus, i),
        0xEA => control::jmp_far_imm(state, bus, i),
        0xEB => {
            let disp = fetch_u8(state, bus, i)? as i8;
            control::jump_near(state, i, i.cur.wrapping_add(disp as u32));
            Ok(())
        }

        0xF1 => control::int_sw(state, bus, i, 1, control::IntKind::Int3),
        0xF4 => sys::hlt(state),
        0xF5 => {
            let cf = state.flags.cf();
            state.flags.set_cf(!cf);
            Ok(())
        }
        0xF6 | 0xF7 => alu::exec_group3(state, bus, i, opcode),
        0xF8 => {
            state.flags.set_cf(false);
            Ok(())
        }
        0xF9 => {
            state.flags.set_cf(true);
            Ok(())
        }
        0xFA => sys::cli(state),
        0xFB => sys::sti(state),
        0xFC => {
            state.flags.set_bit(flags::DF, false);
            Ok(())
        }
        0xFD => {
            state.flags.set_bit(flags::DF, true);
            Ok(())
        }
        0xFE => alu::exec_group4(state, bus, i),
        0xFF => alu::exec_group5(state, bus, i),

        _ => Err(Exception::InvalidOpcode),
    }
}

fn dispatch_0f<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    i: &mut Instr,
) -> Result<(), Exception> {
    let opcode = fetch_u8(state, bus, i)?;
    match opcode {
        0x00 => seg::exec_group6(state, bus, i),
        0x01 => seg::exec_group7(state, bus, i),
        0x02 => seg::lar(state, bus, i),
        0x03 => seg::lsl(state, bus, i),
        0x05 => sys::syscall(state, bus, i),
        0x06 => sys::clts(state),
        0x07 => sys::sysret(state, bus, i),
        0x08 | 0x09 => Ok(()), // INVD/WBINVD: caches are not modeled
        0x0B => Err(Exception::InvalidOpcode), // UD2
        0x20..=0x23 => sys::mov_cr_dr(state, bus, i, opcode),
        0x30 => sys::wrmsr(state),
        0x31 => sys::rdtsc(state),
        0x32 => sys::rdmsr(state),
        0x40..=0x4F => alu::cmov(state, bus, i, opcode),
        0x60..=0x6B | 0x6E | 0x6F => mmx::exec(state, bus, i, opcode),
        0x71..=0x77 => mmx::exec(state, bus, i, opcode),
        0x7E | 0x7F => mmx::exec(state, bus, i, opcode),
        0x80..=0x8F => control::jcc_rel(state, bus, i, opcode),
        0x90..=0x9F => alu::setcc(state, bus, i, opcode),
        0xA0 => push(state, bus, i.op_bits(), state.segs[sr::FS].selector.into()),
        0xA1 => seg::pop_seg(state, bus, i, sr::FS),
        0xA2 => sys::cpuid(state),
        0xA3 | 0xAB | 0xB3 | 0xBB => alu::bt_rm_reg(state, bus, i, opcode),
        0xA4 | 0xA5 | 0xAC | 0xAD => alu::shld_shrd(state, bus, i, opcode),
        0xA8 => push(state, bus, i.op_bits(), state.segs[sr::GS].selector.into()),
        0xA9 => seg::pop_seg(state, bus, i, sr::GS),
        0xAA => sys::rsm(state, bus, i),
        0xAF => alu::imul_reg_rm(state, bus, i),
        0xB0 | 0xB1 => alu::cmpxchg(state, bus, i, opcode),
        0xB2 => seg::load_far_pointer(state, bus, i, sr::SS),
        0xB4 => seg::load_far_pointer(state, bus, i, sr::FS),
        0xB5 => seg::load_far_pointer(state, bus, i, sr::GS),
        0xB6 | 0xB7 | 0xBE | 0xBF => alu::movzx_movsx(state, bus, i, opcode),
        0xBA => alu::exec_group8(state, bus, i),
        0xBC | 0xBD => alu::bsf_bsr(state, bus, i, opcode),
        0xC0 | 0xC1 => alu::xadd(state, bus, i, opcode),
        0xC7 => alu::cmpxchg8b(state, bus, i),
        0xC8..=0xCF => {
            let idx = (opcode & 7) as usize;
            state.set_reg32(idx, state.reg32(idx).swap_bytes());
            Ok(())
        }
        0xD1..=0xD3 | 0xD5 | 0xD8..=0xDF | 0xE1 | 0xE2 | 0xE5 | 0xE8..=0xEF | 0xF1..=0xF3
        | 0xF5..=0xFE => mmx::exec(state, bus, i, opcode),
        _ => Err(Exception::InvalidOpcode),
    }
}

/// Condition-code predicate for Jcc/SETcc/CMOVcc low nibbles.
pub fn condition(state: &CpuState, cc: u8) -> bool {
    let f = &state.flags;
    let base = match cc >> 1 {
        0 => f.of(),
        1 => f.cf(),
        2 => f.zf(),
        3 => f.cf() || f.zf(),
        4 => f.sf(),
        5 => f.pf(),
        6 => f.sf() != f.of(),
        _ => f.zf() || (f.sf() != f.of()),
    };
    if cc & 1 != 0 {
        !base
    } else {
        base
    }
}

/// Coarse per-instruction cycle cost by model class. The tables distinguish
/// the classes that matter for pacing (486 vs Pentium-class vs Cyrix); exact
/// pairing behavior is not modeled.
fn cycle_cost(state: &CpuState, i: &Instr, opcode: u8) -> u32 {
    let class = state.model.cycle_class;
    let base: u32 = match opcode {
        // String and flag ops lean heavier on the 486.
        0xA4..=0xA7 | 0xAA..=0xAF => 4,
        0xF6 | 0xF7 => 10, // MUL/DIV group dominates
        0xC8 => 10,        // ENTER
        0xCD | 0xCC | 0xCE => 16,
        0xCF => 20,
        0x9A | 0xEA => 12,
        0xD8..=0xDF => 8,
        _ => 1,
    };
    let mem = if i.mem_op { 1 } else { 0 };
    let scale = match class {
        CycleClass::I486 => 2,
        CycleClass::Pentium | CycleClass::PentiumMmx => 1,
        CycleClass::K6 => 1,
        CycleClass::Cx6x86 => 1,
    };
    (base + mem) * scale + i.extra_cycles
}
