//! ALU families: the 0x00-0x3F block, immediate groups, shifts/rotates,
//! bit ops, and the multiply/divide group.

use crate::bus::CpuBus;
use crate::exceptions::Exception;
use crate::flags::{self, FlagKind};
use crate::state::{gpr, CpuState};

use super::{
    condition, decode_modrm, fetch_imm, fetch_u8, lin_addr, pop, push, read_ea, read_mem,
    write_ea, write_mem, Ea, Instr,
};

fn mask(bits: u32) -> u32 {
    if bits == 32 {
        u32::MAX
    } else {
        (1 << bits) - 1
    }
}

/// Applies ALU operation `op` (the (opcode>>3)&7 index) and records flags.
/// Returns `None` for CMP (no writeback).
pub fn alu_apply(state: &mut CpuState, op: u8, bits: u32, a: u32, b: u32) -> Option<u32> {
    let m = mask(bits);
    let a = a & m;
    let b = b & m;
    match op {
        0 => {
            let r = a.wrapping_add(b) & m;
            state.flags.record(FlagKind::Add, bits, a, b, r);
            Some(r)
        }
        1 => {
            let r = a | b;
            state.flags.record(FlagKind::Logic, bits, a, b, r);
            Some(r)
        }
        2 => {
            let c = u32::from(state.flags.cf());
            let r = a.wrapping_add(b).wrapping_add(c) & m;
            state.flags.record(FlagKind::Adc, bits, a, b, r);
            Some(r)
        }
        3 => {
            let c = u32::from(state.flags.cf());
            let r = a.wrapping_sub(b).wrapping_sub(c) & m;
            state.flags.record(FlagKind::Sbb, bits, a, b, r);
            Some(r)
        }
        4 => {
            let r = a & b;
            state.flags.record(FlagKind::Logic, bits, a, b, r);
            Some(r)
        }
        5 => {
            let r = a.wrapping_sub(b) & m;
            state.flags.record(FlagKind::Sub, bits, a, b, r);
            Some(r)
        }
        6 => {
            let r = a ^ b;
            state.flags.record(FlagKind::Logic, bits, a, b, r);
            Some(r)
        }
        _ => {
            let r = a.wrapping_sub(b) & m;
            state.flags.record(FlagKind::Sub, bits, a, b, r);
            None
        }
    }
}

/// The regular 0x00-0x3F encodings: Eb,Gb / Ev,Gv / Gb,Eb / Gv,Ev / AL,Ib /
/// eAX,Iv.
pub fn exec_alu_block<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    i: &mut Instr,
    opcode: u8,
) -> Result<(), Exception> {
    let op = (opcode >> 3) & 7;
    match opcode & 7 {
        0 | 1 => {
            let bits = if opcode & 1 == 0 { 8 } else { i.op_bits() };
            let m = decode_modrm(state, bus, i)?;
            let a = read_ea(state, bus, m.ea, bits)?;
            let b = state.reg(m.reg, bits);
            if let Some(r) = alu_apply(state, op, bits, a, b) {
                write_ea(state, bus, m.ea, bits, r)?;
            }
            Ok(())
        }
        2 | 3 => {
            let bits = if opcode & 1 == 0 { 8 } else { i.op_bits() };
            let m = decode_modrm(state, bus, i)?;
            let a = state.reg(m.reg, bits);
            let b = read_ea(state, bus, m.ea, bits)?;
            if let Some(r) = alu_apply(state, op, bits, a, b) {
                state.set_reg(m.reg, bits, r);
            }
            Ok(())
        }
        4 => {
            let imm = fetch_u8(state, bus, i)?;
            let a = state.reg8(0);
            if let Some(r) = alu_apply(state, op, 8, a.into(), imm.into()) {
                state.set_reg8(0, r as u8);
            }
            Ok(())
        }
        _ => {
            let bits = i.op_bits();
            let imm = fetch_imm(state, bus, i)?;
            let a = state.reg(gpr::EAX, bits);
            if let Some(r) = alu_apply(state, op, bits, a, imm) {
                state.set_reg(gpr::EAX, bits, r);
            }
            Ok(())
        }
    }
}

/// Group 1: 0x80/0x81/0x83 immediate forms.
pub fn exec_group1<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    i: &mut Instr,
    opcode: u8,
) -> Result<(), Exception> {
    let bits = if opcode == 0x80 { 8 } else { i.op_bits() };
    let m = decode_modrm(state, bus, i)?;
    let imm = match opcode {
        0x80 => u32::from(fetch_u8(state, bus, i)?),
        0x83 => fetch_u8(state, bus, i)? as i8 as u32,
        _ => fetch_imm(state, bus, i)?,
    };
    let a = read_ea(state, bus, m.ea, bits)?;
    if let Some(r) = alu_apply(state, m.reg as u8, bits, a, imm) {
        write_ea(state, bus, m.ea, bits, r)?;
    }
    Ok(())
}

pub fn inc_reg(state: &mut CpuState, i: &mut Instr, idx: usize) -> Result<(), Exception> {
    let bits = i.op_bits();
    let a = state.reg(idx, bits);
    let r = a.wrapping_add(1) & mask(bits);
    state.flags.record_inc_dec(true, bits, a, r);
    state.set_reg(idx, bits, r);
    Ok(())
}

pub fn dec_reg(state: &mut CpuState, i: &mut Instr, idx: usize) -> Result<(), Exception> {
    let bits = i.op_bits();
    let a = state.reg(idx, bits);
    let r = a.wrapping_sub(1) & mask(bits);
    state.flags.record_inc_dec(false, bits, a, r);
    state.set_reg(idx, bits, r);
    Ok(())
}

pub fn pusha<B: CpuBus>(state: &mut CpuState, bus: &mut B, i: &mut Instr) -> Result<(), Exception> {
    let bits = i.op_bits();
    let sp = state.reg(gpr::ESP, bits);
    for idx in 0..8 {
        let value = if idx == gpr::ESP {
            sp
        } else {
            state.reg(idx, bits)
        };
        push(state, bus, bits, value)?;
    }
    Ok(())
}

pub fn popa<B: CpuBus>(state: &mut CpuState, bus: &mut B, i: &mut Instr) -> Result<(), Exception> {
    let bits = i.op_bits();
    for idx in (0..8).rev() {
        let value = pop(state, bus, bits)?;
        if idx != gpr::ESP {
            state.set_reg(idx, bits, value);
        }
    }
    Ok(())
}

pub fn bound<B: CpuBus>(state: &mut CpuState, bus: &mut B, i: &mut Instr) -> Result<(), Exception> {
    let bits = i.op_bits();
    let m = decode_modrm(state, bus, i)?;
    let Ea::Mem { seg, off } = m.ea else {
        return Err(Exception::InvalidOpcode);
    };
    let index = state.reg(m.reg, bits);
    let lower = read_mem(state, bus, seg, off, bits)?;
    let upper = read_mem(state, bus, seg, off.wrapping_add(bits / 8), bits)?;
    let (index, lower, upper) = if bits == 16 {
        (index as u16 as i16 as i32, lower as u16 as i16 as i32, upper as u16 as i16 as i32)
    } else {
        (index as i32, lower as i32, upper as i32)
    };
    if index < lower || index > upper {
        return Err(Exception::BoundRange);
    }
    Ok(())
}

pub fn test_rm_reg<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    i: &mut Instr,
    opcode: u8,
) -> Result<(), Exception> {
    let bits = if opcode == 0x84 { 8 } else { i.op_bits() };
    let m = decode_modrm(state, bus, i)?;
    let a = read_ea(state, bus, m.ea, bits)?;
    let b = state.reg(m.reg, bits);
    let r = a & b;
    state.flags.record(FlagKind::Logic, bits, a, b, r);
    Ok(())
}

pub fn test_acc_imm<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    i: &mut Instr,
    opcode: u8,
) -> Result<(), Exception> {
    let bits = if opcode == 0xA8 { 8 } else { i.op_bits() };
    let imm = if bits == 8 {
        fetch_u8(state, bus, i)?.into()
    } else {
        fetch_imm(state, bus, i)?
    };
    let a = state.reg(gpr::EAX, bits);
    let r = a & imm;
    state.flags.record(FlagKind::Logic, bits, a, imm, r);
    Ok(())
}

pub fn xchg_rm_reg<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    i: &mut Instr,
    opcode: u8,
) -> Result<(), Exception> {
    let bits = if opcode == 0x86 { 8 } else { i.op_bits() };
    let m = decode_modrm(state, bus, i)?;
    let a = read_ea(state, bus, m.ea, bits)?;
    let b = state.reg(m.reg, bits);
    write_ea(state, bus, m.ea, bits, b)?;
    state.set_reg(m.reg, bits, a);
    Ok(())
}

pub fn mov_rm_reg<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    i: &mut Instr,
    opcode: u8,
) -> Result<(), Exception> {
    let bits = if opcode & 1 == 0 { 8 } else { i.op_bits() };
    let m = decode_modrm(state, bus, i)?;
    if opcode & 2 == 0 {
        // MOV r/m, r.
        let value = state.reg(m.reg, bits);
        write_ea(state, bus, m.ea, bits, value)
    } else {
        // MOV r, r/m.
        let value = read_ea(state, bus, m.ea, bits)?;
        state.set_reg(m.reg, bits, value);
        Ok(())
    }
}

pub fn lea<B: CpuBus>(state: &mut CpuState, bus: &mut B, i: &mut Instr) -> Result<(), Exception> {
    let m = decode_modrm(state, bus, i)?;
    let Ea::Mem { off, .. } = m.ea else {
        return Err(Exception::InvalidOpcode);
    };
    state.set_reg(m.reg, i.op_bits(), off);
    Ok(())
}

pub fn mov_moffs<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    i: &mut Instr,
    opcode: u8,
) -> Result<(), Exception> {
    let off = if i.addrsize32 {
        super::fetch_u32(state, bus, i)?
    } else {
        super::fetch_u16(state, bus, i)?.into()
    };
    let seg = i.data_seg();
    let bits = if opcode & 1 == 0 { 8 } else { i.op_bits() };
    if opcode & 2 == 0 {
        let value = read_mem(state, bus, seg, off, bits)?;
        state.set_reg(gpr::EAX, bits, value);
    } else {
        let value = state.reg(gpr::EAX, bits);
        write_mem(state, bus, seg, off, bits, value)?;
    }
    Ok(())
}

// ----------------------------------------------------------------------
// Shifts and rotates
// ----------------------------------------------------------------------

fn rotate(state: &mut CpuState, subop: u8, bits: u32, a: u32, count: u32) -> u32 {
    // Rotates touch only CF/OF; materialize, compute, patch.
    state.flags.rebuild();
    let m = mask(bits);
    let a = a & m;
    let n = count % bits;
    let r = match subop {
        0 => {
            // ROL
            let r = if n == 0 { a } else { ((a << n) | (a >> (bits - n))) & m };
            state.flags.set_bit(flags::CF, r & 1 != 0);
            r
        }
        1 => {
            // ROR
            let r = if n == 0 { a } else { ((a >> n) | (a << (bits - n))) & m };
            state.flags.set_bit(flags::CF, r & (1 << (bits - 1)) != 0);
            r
        }
        2 => {
            // RCL: rotate through carry, width bits+1.
            let mut r = a;
            let mut cf = u32::from(state.flags.cf());
            for _ in 0..count % (bits + 1) {
                let new_cf = (r >> (bits - 1)) & 1;
                r = ((r << 1) | cf) & m;
                cf = new_cf;
            }
            state.flags.set_bit(flags::CF, cf != 0);
            r
        }
        _ => {
            // RCR
            let mut r = a;
            let mut cf = u32::from(state.flags.cf());
            for _ in 0..count % (bits + 1) {
                let new_cf = r & 1;
                r = (r >> 1) | (cf << (bits - 1));
                cf = new_cf;
            }
            state.flags.set_bit(flags::CF, cf != 0);
            r
        }
    };
    let msb = (r >> (bits - 1)) & 1;
    let next = (r >> (bits - 2)) & 1;
    let of = match subop {
        0 | 2 => msb ^ u32::from(state.flags.cf()),
        _ => msb ^ next,
    };
    state.flags.set_bit(flags::OF, of != 0);
    r
}

pub fn exec_shift_group<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    i: &mut Instr,
    opcode: u8,
) -> Result<(), Exception> {
    let bits = if opcode & 1 == 0 { 8 } else { i.op_bits() };
    let m = decode_modrm(state, bus, i)?;
    let count = match opcode {
        0xC0 | 0xC1 => u32::from(fetch_u8(state, bus, i)?),
        0xD0 | 0xD1 => 1,
        _ => u32::from(state.reg8(1)), // CL
    } & 0x1F;

    let a = read_ea(state, bus, m.ea, bits)?;
    if count == 0 {
        return Ok(());
    }
    let mm = mask(bits);
    let r = match m.reg as u8 {
        0..=3 => rotate(state, m.reg as u8, bits, a, count),
        4 | 6 => {
            // SHL.
            let r = if count >= 32 { 0 } else { (a << count) & mm };
            state
                .flags
                .record_shift(FlagKind::Shl, bits, a & mm, count, r);
            r
        }
        5 => {
            let r = if count >= 32 { 0 } else { (a & mm) >> count };
            state
                .flags
                .record_shift(FlagKind::Shr, bits, a & mm, count, r);
            r
        }
        _ => {
            // SAR: sign-extend within the operand width.
            let sa = ((a & mm) << (32 - bits)) as i32;
            let r = ((sa >> (count + (32 - bits)).min(31)) as u32) & mm;
            state
                .flags
                .record_shift(FlagKind::Sar, bits, a & mm, count, r);
            r
        }
    };
    write_ea(state, bus, m.ea, bits, r)
}

// ----------------------------------------------------------------------
// Group 3 (TEST/NOT/NEG/MUL/IMUL/DIV/IDIV)
// ----------------------------------------------------------------------

pub fn exec_group3<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    i: &mut Instr,
    opcode: u8,
) -> Result<(), Exception> {
    let bits = if opcode == 0xF6 { 8 } else { i.op_bits() };
    let m = decode_modrm(state, bus, i)?;
    match m.reg {
        0 | 1 => {
            let a = read_ea(state, bus, m.ea, bits)?;
            let imm = if bits == 8 {
                fetch_u8(state, bus, i)?.into()
            } else {
                fetch_imm(state, bus, i)?
            };
            let r = a & imm;
            state.flags.record(FlagKind::Logic, bits, a, imm, r);
            Ok(())
        }
        2 => {
            let a = read_ea(state, bus, m.ea, bits)?;
            write_ea(state, bus, m.ea, bits, !a & mask(bits))
        }
        3 => {
            let b = read_ea(state, bus, m.ea, bits)?;
            let r = 0u32.wrapping_sub(b) & mask(bits);
            state.flags.record(FlagKind::Sub, bits, 0, b, r);
            write_ea(state, bus, m.ea, bits, r)
        }
        4 => {
            // MUL.
            i.extra_cycles += bits;
            let b = read_ea(state, bus, m.ea, bits)?;
            mul_unsigned(state, bits, b);
            Ok(())
        }
        5 => {
            i.extra_cycles += bits;
            let b = read_ea(state, bus, m.ea, bits)?;
            mul_signed(state, bits, b);
            Ok(())
        }
        6 => {
            i.extra_cycles += bits + 8;
            let b = read_ea(state, bus, m.ea, bits)?;
            div_unsigned(state, bits, b)
        }
        _ => {
            i.extra_cycles += bits + 8;
            let b = read_ea(state, bus, m.ea, bits)?;
            div_signed(state, bits, b)
        }
    }
}

fn set_mul_flags(state: &mut CpuState, overflow: bool) {
    state.flags.rebuild();
    state.flags.set_bit(flags::CF, overflow);
    state.flags.set_bit(flags::OF, overflow);
}

fn mul_unsigned(state: &mut CpuState, bits: u32, b: u32) {
    match bits {
        8 => {
            let r = u32::from(state.reg8(0)) * (b & 0xFF);
            state.set_reg16(gpr::EAX, r as u16);
            set_mul_flags(state, r > 0xFF);
        }
        16 => {
            let r = u32::from(state.reg16(gpr::EAX)) * (b & 0xFFFF);
            state.set_reg16(gpr::EAX, r as u16);
            state.set_reg16(gpr::EDX, (r >> 16) as u16);
            set_mul_flags(state, r > 0xFFFF);
        }
        _ => {
            let r = u64::from(state.reg32(gpr::EAX)) * u64::from(b);
            state.set_reg32(gpr::EAX, r as u32);
            state.set_reg32(gpr::EDX, (r >> 32) as u32);
            set_mul_flags(state, r > u64::from(u32::MAX));
        }
    }
}

fn mul_signed(state: &mut CpuState, bits: u32, b: u32) {
    match bits {
        8 => {
            let r = i32::from(state.reg8(0) as i8) * i32::from(b as u8 as i8);
            state.set_reg16(gpr::EAX, r as u16);
            set_mul_flags(state, r != i32::from(r as i8));
        }
        16 => {
            let r = i32::from(state.reg16(gpr::EAX) as i16) * i32::from(b as u16 as i16);
            state.set_reg16(gpr::EAX, r as u16);
            state.set_reg16(gpr::EDX, (r >> 16) as u16);
            set_mul_flags(state, r != i32::from(r as i16));
        }
        _ => {
            let r = i64::from(state.reg32(gpr::EAX) as i32) * i64::from(b as i32);
            state.set_reg32(gpr::EAX, r as u32);
            state.set_reg32(gpr::EDX, (r >> 32) as u32);
            set_mul_flags(state, r != i64::from(r as i32));
        }
    }
}

fn div_unsigned(state: &mut CpuState, bits: u32, b: u32) -> Result<(), Exception> {
    match bits {
        8 => {
            let divisor = b & 0xFF;
            if divisor == 0 {
                return Err(Exception::DivideError);
            }
            let dividend = u32::from(state.reg16(gpr::EAX));
            let q = dividend / divisor;
            if q > 0xFF {
                return Err(Exception::DivideError);
            }
            state.set_reg8(0, q as u8);
            state.set_reg8(4, (dividend % divisor) as u8);
        }
        16 => {
            let divisor = b & 0xFFFF;
            if divisor == 0 {
                return Err(Exception::DivideError);
            }
            let dividend =
                (u32::from(state.reg16(gpr::EDX)) << 16) | u32::from(state.reg16(gpr::EAX));
            let q = dividend / divisor;
            if q > 0xFFFF {
                return Err(Exception::DivideError);
            }
            state.set_reg16(gpr::EAX, q as u16);
            state.set_reg16(gpr::EDX, (dividend % divisor) as u16);
        }
        _ => {
            if b == 0 {
                return Err(Exception::DivideError);
            }
            let dividend =
                (u64::from(state.reg32(gpr::EDX)) << 32) | u64::from(state.reg32(gpr::EAX));
            let q = dividend / u64::from(b);
            if q > u64::from(u32::MAX) {
                return Err(Exception::DivideError);
            }
            state.set_reg32(gpr::EAX, q as u32);
            state.set_reg32(gpr::EDX, (dividend % u64::from(b)) as u32);
        }
    }
    Ok(())
}

fn div_signed(state: &mut CpuState, bits: u32, b: u32) -> Result<(), Exception> {
    match bits {
        8 => {
            let divisor = i32::from(b as u8 as i8);
            if divisor == 0 {
                return Err(Exception::DivideError);
            }
            let dividend = i32::from(state.reg16(gpr::EAX) as i16);
            let q = dividend.wrapping_div(divisor);
            if q > 0x7F || q < -0x80 {
                return Err(Exception::DivideError);
            }
            state.set_reg8(0, q as u8);
            state.set_reg8(4, dividend.wrapping_rem(divisor) as u8);
        }
        16 => {
            let divisor = i32::from(b as u16 as i16);
            if divisor == 0 {
                return Err(Exception::DivideError);
            }
            let dividend = ((u32::from(state.reg16(gpr::EDX)) << 16)
                | u32::from(state.reg16(gpr::EAX))) as i32;
            let q = dividend.wrapping_div(divisor);
            if q > 0x7FFF || q < -0x8000 {
                return Err(Exception::DivideError);
            }
            state.set_reg16(gpr::EAX, q as u16);
            state.set_reg16(gpr::EDX, dividend.wrapping_rem(divisor) as u16);
        }
        _ => {
            let divisor = i64::from(b as i32);
            if divisor == 0 {
                return Err(Exception::DivideError);
            }
            let dividend = ((u64::from(state.reg32(gpr::EDX)) << 32)
                | u64::from(state.reg32(gpr::EAX))) as i64;
            let q = dividend.wrapping_div(divisor);
            if q > i64::from(i32::MAX) || q < i64::from(i32::MIN) {
                return Err(Exception::DivideError);
            }
            state.set_reg32(gpr::EAX, q as u32);
            state.set_reg32(gpr::EDX, dividend.wrapping_rem(divisor) as u32);
        }
    }
    Ok(())
}

// ----------------------------------------------------------------------
// IMUL variants
// ----------------------------------------------------------------------

fn imul_2op(state: &mut CpuState, bits: u32, a: u32, b: u32) -> u32 {
    if bits == 16 {
        let r = i32::from(a as u16 as i16) * i32::from(b as u16 as i16);
        set_mul_flags(state, r != i32::from(r as i16));
        r as u16 as u32
    } else {
        let r = i64::from(a as i32) * i64::from(b as i32);
        set_mul_flags(state, r != i64::from(r as i32));
        r as u32
    }
}

pub fn imul_imm<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    i: &mut Instr,
    byte_imm: bool,
) -> Result<(), Exception> {
    let bits = i.op_bits();
    let m = decode_modrm(state, bus, i)?;
    let a = read_ea(state, bus, m.ea, bits)?;
    let b = if byte_imm {
        fetch_u8(state, bus, i)? as i8 as u32
    } else {
        fetch_imm(state, bus, i)?
    };
    let r = imul_2op(state, bits, a, b);
    state.set_reg(m.reg, bits, r);
    Ok(())
}

pub fn imul_reg_rm<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    i: &mut Instr,
) -> Result<(), Exception> {
    let bits = i.op_bits();
    let m = decode_modrm(state, bus, i)?;
    let b = read_ea(state, bus, m.ea, bits)?;
    let a = state.reg(m.reg, bits);
    let r = imul_2op(state, bits, a, b);
    state.set_reg(m.reg, bits, r);
    Ok(())
}

// ----------------------------------------------------------------------
// Groups 4/5 and 8, bit ops, misc 0F arithmetic
// ----------------------------------------------------------------------

pub fn exec_group4<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    i: &mut Instr,
) -> Result<(), Exception> {
    let m = decode_modrm(state, bus, i)?;
    let a = read_ea(state, bus, m.ea, 8)?;
    match m.reg {
        0 => {
            let r = a.wrapping_add(1) & 0xFF;
            state.flags.record_inc_dec(true, 8, a, r);
            write_ea(state, bus, m.ea, 8, r)
        }
        1 => {
            let r = a.wrapping_sub(1) & 0xFF;
            state.flags.record_inc_dec(false, 8, a, r);
            write_ea(state, bus, m.ea, 8, r)
        }
        _ => Err(Exception::InvalidOpcode),
    }
}

pub fn exec_group5<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    i: &mut Instr,
) -> Result<(), Exception> {
    let bits = i.op_bits();
    let m = decode_modrm(state, bus, i)?;
    match m.reg {
        0 => {
            let a = read_ea(state, bus, m.ea, bits)?;
            let r = a.wrapping_add(1) & mask(bits);
            state.flags.record_inc_dec(true, bits, a, r);
            write_ea(state, bus, m.ea, bits, r)
        }
        1 => {
            let a = read_ea(state, bus, m.ea, bits)?;
            let r = a.wrapping_sub(1) & mask(bits);
            state.flags.record_inc_dec(false, bits, a, r);
            write_ea(state, bus, m.ea, bits, r)
        }
        2 => {
            // CALL near indirect.
            let target = read_ea(state, bus, m.ea, bits)?;
            let ret = i.cur;
            push(state, bus, bits, ret)?;
            super::control::jump_near(state, i, target & if bits == 16 { 0xFFFF } else { !0 });
            Ok(())
        }
        3 => super::control::call_far_indirect(state, bus, i, m.ea),
        4 => {
            let target = read_ea(state, bus, m.ea, bits)?;
            super::control::jump_near(state, i, target & if bits == 16 { 0xFFFF } else { !0 });
            Ok(())
        }
        5 => super::control::jmp_far_indirect(state, bus, i, m.ea),
        6 => {
            let value = read_ea(state, bus, m.ea, bits)?;
            push(state, bus, bits, value)
        }
        _ => Err(Exception::InvalidOpcode),
    }
}

/// BT/BTS/BTR/BTC with a register bit index (0F A3/AB/B3/BB).
pub fn bt_rm_reg<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    i: &mut Instr,
    opcode: u8,
) -> Result<(), Exception> {
    let bits = i.op_bits();
    let m = decode_modrm(state, bus, i)?;
    let index = state.reg(m.reg, bits);
    bt_common(state, bus, i, m.ea, bits, index, (opcode >> 3) & 3)
}

pub fn exec_group8<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    i: &mut Instr,
) -> Result<(), Exception> {
    let bits = i.op_bits();
    let m = decode_modrm(state, bus, i)?;
    let index = u32::from(fetch_u8(state, bus, i)?);
    if m.reg < 4 {
        return Err(Exception::InvalidOpcode);
    }
    bt_common(state, bus, i, m.ea, bits, index, (m.reg - 4) as u8)
}

fn bt_common<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    _i: &mut Instr,
    ea: Ea,
    bits: u32,
    index: u32,
    op: u8,
) -> Result<(), Exception> {
    // Memory forms index beyond the operand: fold the word offset into the
    // effective address.
    let (ea, bitpos) = match ea {
        Ea::Reg(r) => (Ea::Reg(r), index % bits),
        Ea::Mem { seg, off } => {
            let word_off = ((index as i32) >> (if bits == 16 { 4 } else { 5 })) * (bits as i32 / 8);
            (
                Ea::Mem {
                    seg,
                    off: off.wrapping_add(word_off as u32),
                },
                index % bits,
            )
        }
    };
    let value = read_ea(state, bus, ea, bits)?;
    let bit = (value >> bitpos) & 1;
    state.flags.set_cf(bit != 0);
    let new = match op {
        0 => return Ok(()),                 // BT
        1 => value | (1 << bitpos),         // BTS
        2 => value & !(1 << bitpos),        // BTR
        _ => value ^ (1 << bitpos),         // BTC
    };
    write_ea(state, bus, ea, bits, new)
}

pub fn bsf_bsr<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    i: &mut Instr,
    opcode: u8,
) -> Result<(), Exception> {
    let bits = i.op_bits();
    let m = decode_modrm(state, bus, i)?;
    let value = read_ea(state, bus, m.ea, bits)? & mask(bits);
    state.flags.rebuild();
    if value == 0 {
        state.flags.set_bit(flags::ZF, true);
        return Ok(());
    }
    state.flags.set_bit(flags::ZF, false);
    let result = if opcode == 0xBC {
        value.trailing_zeros()
    } else {
        31 - value.leading_zeros()
    };
    state.set_reg(m.reg, bits, result);
    Ok(())
}

pub fn shld_shrd<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    i: &mut Instr,
    opcode: u8,
) -> Result<(), Exception> {
    let bits = i.op_bits();
    let m = decode_modrm(state, bus, i)?;
    let count = match opcode {
        0xA4 | 0xAC => u32::from(fetch_u8(state, bus, i)?),
        _ => u32::from(state.reg8(1)),
    } & 0x1F;
    if count == 0 {
        return Ok(());
    }
    let a = read_ea(state, bus, m.ea, bits)? & mask(bits);
    let b = state.reg(m.reg, bits) & mask(bits);
    let left = opcode == 0xA4 || opcode == 0xA5;
    let wide = if bits == 16 {
        // Counts above the width pull bits back out of the duplicated pair.
        let pair = if left {
            (u64::from(a) << 16) | u64::from(b)
        } else {
            (u64::from(b) << 16) | u64::from(a)
        };
        if left {
            ((pair << count) >> 16) as u32 & 0xFFFF
        } else {
            (pair >> count) as u32 & 0xFFFF
        }
    } else {
        let pair = if left {
            (u64::from(a) << 32) | u64::from(b)
        } else {
            (u64::from(b) << 32) | u64::from(a)
        };
        if left {
            ((pair << count) >> 32) as u32
        } else {
            (pair >> count) as u32
        }
    };
    let kind = if left { FlagKind::Shl } else { FlagKind::Shr };
    state.flags.record_shift(kind, bits, a, count, wide);
    write_ea(state, bus, m.ea, bits, wide)
}

pub fn movzx_movsx<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    i: &mut Instr,
    opcode: u8,
) -> Result<(), Exception> {
    let src_bits = if opcode & 1 == 0 { 8 } else { 16 };
    let m = decode_modrm(state, bus, i)?;
    let raw = read_ea(state, bus, m.ea, src_bits)?;
    let value = match (opcode & 0x08 != 0, src_bits) {
        (false, 8) => raw & 0xFF,
        (false, _) => raw & 0xFFFF,
        (true, 8) => raw as u8 as i8 as i32 as u32,
        (true, _) => raw as u16 as i16 as i32 as u32,
    };
    state.set_reg(m.reg, i.op_bits(), value);
    Ok(())
}

pub fn setcc<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    i: &mut Instr,
    opcode: u8,
) -> Result<(), Exception> {
    let m = decode_modrm(state, bus, i)?;
    let value = u32::from(condition(state, opcode & 0xF));
    write_ea(state, bus, m.ea, 8, value)
}

pub fn cmov<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    i: &mut Instr,
    opcode: u8,
) -> Result<(), Exception> {
    let bits = i.op_bits();
    let m = decode_modrm(state, bus, i)?;
    let value = read_ea(state, bus, m.ea, bits)?;
    if condition(state, opcode & 0xF) {
        state.set_reg(m.reg, bits, value);
    }
    Ok(())
}

pub fn cmpxchg<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    i: &mut Instr,
    opcode: u8,
) -> Result<(), Exception> {
    let bits = if opcode == 0xB0 { 8 } else { i.op_bits() };
    let m = decode_modrm(state, bus, i)?;
    let dest = read_ea(state, bus, m.ea, bits)?;
    let acc = state.reg(gpr::EAX, bits);
    let r = acc.wrapping_sub(dest) & mask(bits);
    state.flags.record(FlagKind::Sub, bits, acc, dest, r);
    if acc == dest {
        let src = state.reg(m.reg, bits);
        write_ea(state, bus, m.ea, bits, src)?;
    } else {
        state.set_reg(gpr::EAX, bits, dest);
        // The destination is still written back on mismatch.
        write_ea(state, bus, m.ea, bits, dest)?;
    }
    Ok(())
}

pub fn cmpxchg8b<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    i: &mut Instr,
) -> Result<(), Exception> {
    let m = decode_modrm(state, bus, i)?;
    if m.reg != 1 {
        return Err(Exception::InvalidOpcode);
    }
    let Ea::Mem { seg, off } = m.ea else {
        return Err(Exception::InvalidOpcode);
    };
    let lin = lin_addr(state, seg, off, 8, true)?;
    let current = bus.read_u64(lin)?;
    let compare = (u64::from(state.reg32(gpr::EDX)) << 32) | u64::from(state.reg32(gpr::EAX));
    state.flags.rebuild();
    if current == compare {
        let new = (u64::from(state.reg32(gpr::ECX)) << 32) | u64::from(state.reg32(gpr::EBX));
        bus.write_u64(lin, new)?;
        state.flags.set_bit(flags::ZF, true);
    } else {
        state.set_reg32(gpr::EAX, current as u32);
        state.set_reg32(gpr::EDX, (current >> 32) as u32);
        state.flags.set_bit(flags::ZF, false);
    }
    Ok(())
}

pub fn xadd<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    i: &mut Instr,
    opcode: u8,
) -> Result<(), Exception> {
    let bits = if opcode == 0xC0 { 8 } else { i.op_bits() };
    let m = decode_modrm(state, bus, i)?;
    let dest = read_ea(state, bus, m.ea, bits)?;
    let src = state.reg(m.reg, bits);
    let r = dest.wrapping_add(src) & mask(bits);
    state.flags.record(FlagKind::Add, bits, dest, src, r);
    state.set_reg(m.reg, bits, dest);
    write_ea(state, bus, m.ea, bits, r)
}
