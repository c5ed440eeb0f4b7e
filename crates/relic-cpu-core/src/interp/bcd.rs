//! BCD adjustment helpers. AAM/AAD take their base from the immediate only
//! on Intel parts; other vendors hard-wire ten.

use crate::bus::CpuBus;
use crate::exceptions::Exception;
use crate::flags::{self, FlagKind};
use crate::state::CpuState;

use super::{fetch_u8, Instr};

fn set_szp8(state: &mut CpuState, r: u8) {
    // Record as a logic result so SZP derive; CF/AF are patched by the
    // callers.
    state.flags.record(FlagKind::Logic, 8, r.into(), 0, r.into());
}

fn set_szp16(state: &mut CpuState, r: u16) {
    state.flags.record(FlagKind::Logic, 16, r.into(), 0, r.into());
}

pub fn aaa(state: &mut CpuState) -> Result<(), Exception> {
    let af = state.flags.af();
    state.flags.rebuild();
    let al = state.reg8(0);
    if af || (al & 0xF) > 9 {
        state.set_reg8(0, al.wrapping_add(6) & 0xF);
        state.set_reg8(4, state.reg8(4).wrapping_add(1));
        state.flags.set_bit(flags::AF, true);
        state.flags.set_bit(flags::CF, true);
    } else {
        state.set_reg8(0, al & 0xF);
        state.flags.set_bit(flags::AF, false);
        state.flags.set_bit(flags::CF, false);
    }
    Ok(())
}

pub fn aas(state: &mut CpuState) -> Result<(), Exception> {
    let af = state.flags.af();
    state.flags.rebuild();
    let al = state.reg8(0);
    if af || (al & 0xF) > 9 {
        state.set_reg8(0, al.wrapping_sub(6) & 0xF);
        state.set_reg8(4, state.reg8(4).wrapping_sub(1));
        state.flags.set_bit(flags::AF, true);
        state.flags.set_bit(flags::CF, true);
    } else {
        state.set_reg8(0, al & 0xF);
        state.flags.set_bit(flags::AF, false);
        state.flags.set_bit(flags::CF, false);
    }
    Ok(())
}

pub fn aam<B: CpuBus>(state: &mut CpuState, bus: &mut B, i: &mut Instr) -> Result<(), Exception> {
    let imm = fetch_u8(state, bus, i)?;
    let base = if imm == 0 || !state.model.is_intel() {
        10
    } else {
        imm
    };
    if base == 0 {
        return Err(Exception::DivideError);
    }
    let al = state.reg8(0);
    state.set_reg8(4, al / base);
    state.set_reg8(0, al % base);
    set_szp16(state, state.reg16(0));
    Ok(())
}

pub fn aad<B: CpuBus>(state: &mut CpuState, bus: &mut B, i: &mut Instr) -> Result<(), Exception> {
    let imm = fetch_u8(state, bus, i)?;
    let base = if state.model.is_intel() { imm } else { 10 };
    let al = state
        .reg8(4)
        .wrapping_mul(base)
        .wrapping_add(state.reg8(0));
    state.set_reg8(0, al);
    state.set_reg8(4, 0);
    set_szp16(state, state.reg16(0));
    Ok(())
}

pub fn daa(state: &mut CpuState) -> Result<(), Exception> {
    let af = state.flags.af();
    let cf = state.flags.cf();
    state.flags.rebuild();
    let mut al = state.reg8(0);
    let mut new_cf = cf;
    let mut new_af = false;

    if af || (al & 0xF) > 9 {
        let wide = u16::from(al) + 6;
        al = al.wrapping_add(6);
        new_af = true;
        if wide & 0x100 != 0 {
            new_cf = true;
        }
    }
    if cf || al > 0x9F {
        al = al.wrapping_add(0x60);
        new_cf = true;
    }
    state.set_reg8(0, al);
    set_szp8(state, al);
    state.flags.set_bit(flags::AF, new_af);
    state.flags.set_bit(flags::CF, new_cf);
    Ok(())
}

pub fn das(state: &mut CpuState) -> Result<(), Exception> {
    let af = state.flags.af();
    let cf = state.flags.cf();
    state.flags.rebuild();
    let mut al = state.reg8(0);
    let mut new_cf = cf;
    let mut new_af = false;

    if af || (al & 0xF) > 9 {
        let wide = u16::from(al).wrapping_sub(6);
        al = al.wrapping_sub(6);
        new_af = true;
        if wide & 0x100 != 0 {
            new_cf = true;
        }
    }
    if cf || al > 0x9F {
        al = al.wrapping_sub(0x60);
        new_cf = true;
    }
    state.set_reg8(0, al);
    set_szp8(state, al);
    state.flags.set_bit(flags::AF, new_af);
    state.flags.set_bit(flags::CF, new_cf);
    Ok(())
}
