//! x87 floating point (D8–DF).
//!
//! Register contents are f64-backed; 80-bit loads and stores convert through
//! the exact extended-format image so bit patterns survive a spill/reload.
//! Condition codes land in C0/C2/C3 the way FCOM defines them.

use crate::bus::CpuBus;
use crate::exceptions::Exception;
use crate::fpu::{f64_to_f80, f80_to_f64, SW_C0, SW_C2, SW_C3};
use crate::state::{CpuState, CR0_EM, CR0_MP, CR0_TS};

use super::{decode_modrm, lin_addr, read_mem, write_mem, Ea, Instr};

pub fn wait(state: &mut CpuState) -> Result<(), Exception> {
    if state.cr0 & CR0_MP != 0 && state.cr0 & CR0_TS != 0 {
        return Err(Exception::DeviceNotAvailable);
    }
    Ok(())
}

fn fpu_enter(state: &mut CpuState) -> Result<(), Exception> {
    if state.cr0 & CR0_EM != 0 || state.cr0 & CR0_TS != 0 {
        return Err(Exception::DeviceNotAvailable);
    }
    Ok(())
}

fn compare(state: &mut CpuState, a: f64, b: f64) {
    state.fpu.status &= !(SW_C0 | SW_C2 | SW_C3);
    if a.is_nan() || b.is_nan() {
        state.fpu.status |= SW_C0 | SW_C2 | SW_C3;
    } else if a < b {
        state.fpu.status |= SW_C0;
    } else if a == b {
        state.fpu.status |= SW_C3;
    }
}

fn arith(op: usize, a: f64, b: f64) -> f64 {
    match op {
        0 => a + b,
        1 => a * b,
        4 => a - b,
        5 => b - a,
        6 => a / b,
        _ => b / a,
    }
}

fn read_f32<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    seg: usize,
    off: u32,
) -> Result<f64, Exception> {
    Ok(f64::from(f32::from_bits(read_mem(state, bus, seg, off, 32)?)))
}

fn read_f64<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    seg: usize,
    off: u32,
) -> Result<f64, Exception> {
    let lin = lin_addr(state, seg, off, 8, false)?;
    Ok(f64::from_bits(bus.read_u64(lin)?))
}

fn write_f64<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    seg: usize,
    off: u32,
    value: f64,
) -> Result<(), Exception> {
    let lin = lin_addr(state, seg, off, 8, true)?;
    bus.write_u64(lin, value.to_bits())
}

/// Rounds per the control-word RC field.
fn round(state: &CpuState, value: f64) -> f64 {
    match (state.fpu.control >> 10) & 3 {
        0 => {
            // Nearest-even.
            let r = value.round();
            if (value - value.trunc()).abs() == 0.5 && r % 2.0 != 0.0 {
                r - value.signum()
            } else {
                r
            }
        }
        1 => value.floor(),
        2 => value.ceil(),
        _ => value.trunc(),
    }
}

pub fn exec<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    i: &mut Instr,
    opcode: u8,
) -> Result<(), Exception> {
    fpu_enter(state)?;
    let m = decode_modrm(state, bus, i)?;
    match m.ea {
        Ea::Mem { seg, off } => exec_mem(state, bus, opcode, m.reg, seg, off),
        Ea::Reg(rm) => exec_reg(state, bus, i, opcode, m.reg, rm),
    }
}

fn exec_mem<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    opcode: u8,
    op: usize,
    seg: usize,
    off: u32,
) -> Result<(), Exception> {
    match opcode {
        0xD8 | 0xDC => {
            // Arithmetic with a real operand.
            let b = if opcode == 0xD8 {
                read_f32(state, bus, seg, off)?
            } else {
                read_f64(state, bus, seg, off)?
            };
            let a = state.fpu.st(0);
            if op == 2 || op == 3 {
                compare(state, a, b);
                if op == 3 {
                    state.fpu.pop();
                }
            } else {
                let r = arith(op, a, b);
                state.fpu.set_st(0, r);
            }
            Ok(())
        }
        0xD9 => match op {
            0 => {
                let v = read_f32(state, bus, seg, off)?;
                state.fpu.push(v);
                Ok(())
            }
            2 | 3 => {
                let v = state.fpu.st(0);
                write_mem(state, bus, seg, off, 32, (v as f32).to_bits())?;
                if op == 3 {
                    state.fpu.pop();
                }
                Ok(())
            }
            4 => {
                // FLDENV: 14/28-byte environment; restore CW/SW/TW.
                let cw = read_mem(state, bus, seg, off, 16)? as u16;
                let sw = read_mem(state, bus, seg, off.wrapping_add(4), 16)? as u16;
                let tw = read_mem(state, bus, seg, off.wrapping_add(8), 16)? as u16;
                state.fpu.control = cw;
                state.fpu.status = sw & !0x3800;
                state.fpu.top = ((sw >> 11) & 7) as u8;
                state.fpu.set_tag_word(tw);
                Ok(())
            }
            5 => {
                let cw = read_mem(state, bus, seg, off, 16)? as u16;
                state.fpu.control = cw;
                Ok(())
            }
            6 => {
                // FNSTENV.
                write_mem(state, bus, seg, off, 16, state.fpu.control.into())?;
                write_mem(
                    state,
                    bus,
                    seg,
                    off.wrapping_add(4),
                    16,
                    state.fpu.status_word().into(),
                )?;
                write_mem(
                    state,
                    bus,
                    seg,
                    off.wrapping_add(8),
                    16,
                    state.fpu.tag_word().into(),
                )
            }
            7 => write_mem(state, bus, seg, off, 16, state.fpu.control.into()),
            _ => Err(Exception::InvalidOpcode),
        },
        0xDA | 0xDE => {
            // Arithmetic with an integer operand.
            let raw = read_mem(state, bus, seg, off, if opcode == 0xDA { 32 } else { 16 })?;
            let b = if opcode == 0xDA {
                f64::from(raw as i32)
            } else {
                f64::from(raw as u16 as i16)
            };
            let a = state.fpu.st(0);
            if op == 2 || op == 3 {
                compare(state, a, b);
                if op == 3 {
                    state.fpu.pop();
                }
            } else {
                let r = arith(op, a, b);
                state.fpu.set_st(0, r);
            }
            Ok(())
        }
        0xDB => match op {
            0 => {
                let v = read_mem(state, bus, seg, off, 32)?;
                state.fpu.push(f64::from(v as i32));
                Ok(())
            }
            2 | 3 => {
                let v = round(state, state.fpu.st(0));
                let out = if v.is_nan() || v > f64::from(i32::MAX) || v < f64::from(i32::MIN) {
                    0x8000_0000u32
                } else {
                    (v as i32) as u32
                };
                write_mem(state, bus, seg, off, 32, out)?;
                if op == 3 {
                    state.fpu.pop();
                }
                Ok(())
            }
            5 => {
                // FLD m80.
                let lin = lin_addr(state, seg, off, 10, false)?;
                let mantissa = bus.read_u64(lin)?;
                let se = bus.read_u16(lin.wrapping_add(8))?;
                state.fpu.push(f80_to_f64(se, mantissa));
                Ok(())
            }
            7 => {
                // FSTP m80.
                let (se, mantissa) = f64_to_f80(state.fpu.st(0));
                let lin = lin_addr(state, seg, off, 10, true)?;
                bus.write_u64(lin, mantissa)?;
                bus.write_u16(lin.wrapping_add(8), se)?;
                state.fpu.pop();
                Ok(())
            }
            _ => Err(Exception::InvalidOpcode),
        },
        0xDD => match op {
            0 => {
                let v = read_f64(state, bus, seg, off)?;
                state.fpu.push(v);
                Ok(())
            }
            2 | 3 => {
                let v = state.fpu.st(0);
                write_f64(state, bus, seg, off, v)?;
                if op == 3 {
                    state.fpu.pop();
                }
                Ok(())
            }
            4 => {
                // FRSTOR: environment then the eight 80-bit registers.
                let cw = read_mem(state, bus, seg, off, 16)? as u16;
                let sw = read_mem(state, bus, seg, off.wrapping_add(4), 16)? as u16;
                let tw = read_mem(state, bus, seg, off.wrapping_add(8), 16)? as u16;
                state.fpu.control = cw;
                state.fpu.status = sw & !0x3800;
                state.fpu.top = ((sw >> 11) & 7) as u8;
                state.fpu.set_tag_word(tw);
                let regs_off = off.wrapping_add(28);
                for n in 0..8u32 {
                    let lin = lin_addr(state, seg, regs_off.wrapping_add(n * 10), 10, false)?;
                    let mantissa = bus.read_u64(lin)?;
                    let se = bus.read_u16(lin.wrapping_add(8))?;
                    let phys = ((state.fpu.top as usize) + n as usize) & 7;
                    state.fpu.regs[phys] = f80_to_f64(se, mantissa);
                    state.fpu.mmx[phys] = mantissa;
                }
                Ok(())
            }
            6 => {
                // FNSAVE, then FNINIT.
                write_mem(state, bus, seg, off, 16, state.fpu.control.into())?;
                write_mem(
                    state,
                    bus,
                    seg,
                    off.wrapping_add(4),
                    16,
                    state.fpu.status_word().into(),
                )?;
                write_mem(
                    state,
                    bus,
                    seg,
                    off.wrapping_add(8),
                    16,
                    state.fpu.tag_word().into(),
                )?;
                let regs_off = off.wrapping_add(28);
                for n in 0..8u32 {
                    let phys = ((state.fpu.top as usize) + n as usize) & 7;
                    let (se, mantissa) = f64_to_f80(state.fpu.regs[phys]);
                    let lin = lin_addr(state, seg, regs_off.wrapping_add(n * 10), 10, true)?;
                    bus.write_u64(lin, mantissa)?;
                    bus.write_u16(lin.wrapping_add(8), se)?;
                }
                state.fpu.reset();
                Ok(())
            }
            7 => write_mem(state, bus, seg, off, 16, state.fpu.status_word().into()),
            _ => Err(Exception::InvalidOpcode),
        },
        0xDF => match op {
            0 => {
                let v = read_mem(state, bus, seg, off, 16)?;
                state.fpu.push(f64::from(v as u16 as i16));
                Ok(())
            }
            2 | 3 => {
                let v = round(state, state.fpu.st(0));
                let out = if v.is_nan() || v > f64::from(i16::MAX) || v < f64::from(i16::MIN) {
                    0x8000u32
                } else {
                    (v as i16) as u16 as u32
                };
                write_mem(state, bus, seg, off, 16, out)?;
                if op == 3 {
                    state.fpu.pop();
                }
                Ok(())
            }
            5 => {
                // FILD m64.
                let lin = lin_addr(state, seg, off, 8, false)?;
                let v = bus.read_u64(lin)? as i64;
                state.fpu.push(v as f64);
                Ok(())
            }
            7 => {
                // FISTP m64.
                let v = round(state, state.fpu.st(0));
                let out = if v.is_nan() || v >= 9.2233720368547758e18 || v < -9.2233720368547758e18
                {
                    i64::MIN as u64
                } else {
                    (v as i64) as u64
                };
                let lin = lin_addr(state, seg, off, 8, true)?;
                bus.write_u64(lin, out)?;
                state.fpu.pop();
                Ok(())
            }
            _ => Err(Exception::InvalidOpcode),
        },
        _ => Err(Exception::InvalidOpcode),
    }
}

fn exec_reg<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    _i: &mut Instr,
    opcode: u8,
    op: usize,
    rm: usize,
) -> Result<(), Exception> {
    match opcode {
        0xD8 => {
            let a = state.fpu.st(0);
            let b = state.fpu.st(rm);
            match op {
                2 => compare(state, a, b),
                3 => {
                    compare(state, a, b);
                    state.fpu.pop();
                }
                _ => {
                    let r = arith(op, a, b);
                    state.fpu.set_st(0, r);
                }
            }
            Ok(())
        }
        0xD9 => match (op, rm) {
            (0, _) => {
                // FLD ST(i).
                let v = state.fpu.st(rm);
                state.fpu.push(v);
                Ok(())
            }
            (1, _) => {
                // FXCH.
                let a = state.fpu.st(0);
                let b = state.fpu.st(rm);
                state.fpu.set_st(0, b);
                state.fpu.set_st(rm, a);
                Ok(())
            }
            (4, 0) => {
                let v = -state.fpu.st(0);
                state.fpu.set_st(0, v);
                Ok(())
            }
            (4, 1) => {
                let v = state.fpu.st(0).abs();
                state.fpu.set_st(0, v);
                Ok(())
            }
            (4, 4) => {
                let v = state.fpu.st(0);
                compare(state, v, 0.0);
                Ok(())
            }
            (4, 5) => {
                // FXAM.
                let v = state.fpu.st(0);
                state.fpu.status &= !(SW_C0 | SW_C2 | SW_C3);
                if state.fpu.is_empty(0) {
                    state.fpu.status |= SW_C0 | SW_C3;
                } else if v.is_nan() {
                    state.fpu.status |= SW_C0;
                } else if v.is_infinite() {
                    state.fpu.status |= SW_C0 | SW_C2;
                } else if v == 0.0 {
                    state.fpu.status |= SW_C3;
                } else {
                    state.fpu.status |= SW_C2;
                }
                Ok(())
            }
            (5, c) => {
                let v = match c {
                    0 => 1.0,
                    1 => std::f64::consts::LOG2_10,
                    2 => std::f64::consts::LOG2_E,
                    3 => std::f64::consts::PI,
                    4 => std::f64::consts::LOG10_2,
                    5 => std::f64::consts::LN_2,
                    6 => 0.0,
                    _ => return Err(Exception::InvalidOpcode),
                };
                state.fpu.push(v);
                Ok(())
            }
            (6, c) => {
                let v = state.fpu.st(0);
                match c {
                    0 => {
                        // F2XM1.
                        state.fpu.set_st(0, v.exp2() - 1.0);
                    }
                    1 => {
                        // FYL2X.
                        let y = state.fpu.st(1);
                        state.fpu.pop();
                        state.fpu.set_st(0, y * v.log2());
                    }
                    2 => {
                        // FPTAN pushes 1.0 after the tangent.
                        state.fpu.set_st(0, v.tan());
                        state.fpu.push(1.0);
                        state.fpu.status &= !SW_C2;
                    }
                    3 => {
                        // FPATAN.
                        let y = state.fpu.st(1);
                        state.fpu.pop();
                        state.fpu.set_st(0, y.atan2(v));
                    }
                    4 => {
                        // FXTRACT.
                        let exp = v.abs().log2().floor();
                        let sig = v / exp.exp2();
                        state.fpu.set_st(0, exp);
                        state.fpu.push(sig);
                    }
                    5 => {
                        // FPREM1.
                        let y = state.fpu.st(1);
                        state.fpu.set_st(0, v % y);
                        state.fpu.status &= !SW_C2;
                    }
                    6 => state.fpu.top = state.fpu.top.wrapping_sub(1) & 7, // FDECSTP
                    _ => state.fpu.top = (state.fpu.top + 1) & 7,           // FINCSTP
                }
                Ok(())
            }
            (7, c) => {
                let v = state.fpu.st(0);
                match c {
                    0 => {
                        // FPREM.
                        let y = state.fpu.st(1);
                        state.fpu.set_st(0, v % y);
                        state.fpu.status &= !SW_C2;
                    }
                    1 => {
                        // FYL2XP1.
                        let y = state.fpu.st(1);
                        state.fpu.pop();
                        state.fpu.set_st(0, y * (v + 1.0).log2());
                    }
                    2 => state.fpu.set_st(0, v.sqrt()),
                    3 => {
                        // FSINCOS.
                        state.fpu.set_st(0, v.sin());
                        state.fpu.push(v.cos());
                        state.fpu.status &= !SW_C2;
                    }
                    4 => {
                        let r = round(state, v);
                        state.fpu.set_st(0, r); // FRNDINT
                    }
                    5 => {
                        // FSCALE.
                        let scale = state.fpu.st(1).trunc();
                        state.fpu.set_st(0, v * scale.exp2());
                    }
                    6 => {
                        state.fpu.set_st(0, v.sin());
                        state.fpu.status &= !SW_C2;
                    }
                    _ => state.fpu.set_st(0, v.cos()),
                }
                Ok(())
            }
            _ => Err(Exception::InvalidOpcode),
        },
        0xDA => match (op, rm) {
            (5, 1) => {
                // FUCOMPP.
                let a = state.fpu.st(0);
                let b = state.fpu.st(1);
                compare(state, a, b);
                state.fpu.pop();
                state.fpu.pop();
                Ok(())
            }
            _ => Err(Exception::InvalidOpcode),
        },
        0xDB => match (op, rm) {
            (4, 2) => {
                // FNCLEX.
                state.fpu.status &= !0x80FF;
                Ok(())
            }
            (4, 3) => {
                state.fpu.reset();
                Ok(())
            }
            _ => Err(Exception::InvalidOpcode),
        },
        0xDC => {
            // Arithmetic into ST(i); the subtract/divide senses are the
            // reverse of the D8 encodings.
            let a = state.fpu.st(rm);
            let b = state.fpu.st(0);
            let op = if op >= 4 { op ^ 1 } else { op };
            let r = arith(op, a, b);
            state.fpu.set_st(rm, r);
            Ok(())
        }
        0xDD => match op {
            0 => {
                // FFREE.
                let phys = ((state.fpu.top as usize) + rm) & 7;
                state.fpu.tags[phys] = crate::fpu::TAG_EMPTY;
                Ok(())
            }
            2 => {
                let v = state.fpu.st(0);
                state.fpu.set_st(rm, v);
                Ok(())
            }
            3 => {
                let v = state.fpu.st(0);
                state.fpu.set_st(rm, v);
                state.fpu.pop();
                Ok(())
            }
            4 | 5 => {
                // FUCOM/FUCOMP.
                let a = state.fpu.st(0);
                let b = state.fpu.st(rm);
                compare(state, a, b);
                if op == 5 {
                    state.fpu.pop();
                }
                Ok(())
            }
            _ => Err(Exception::InvalidOpcode),
        },
        0xDE => {
            if op == 3 && rm == 1 {
                // FCOMPP.
                let a = state.fpu.st(0);
                let b = state.fpu.st(1);
                compare(state, a, b);
                state.fpu.pop();
                state.fpu.pop();
                return Ok(());
            }
            // Arithmetic into ST(i), then pop; reversed senses as for 0xDC.
            let a = state.fpu.st(rm);
            let b = state.fpu.st(0);
            let op = if op >= 4 { op ^ 1 } else { op };
            let r = arith(op, a, b);
            state.fpu.set_st(rm, r);
            state.fpu.pop();
            Ok(())
        }
        0xDF => match (op, rm) {
            (4, 0) => {
                // FNSTSW AX.
                let sw = state.fpu.status_word();
                state.set_reg16(crate::state::gpr::EAX, sw);
                let _ = bus;
                Ok(())
            }
            _ => Err(Exception::InvalidOpcode),
        },
        _ => Err(Exception::InvalidOpcode),
    }
}
