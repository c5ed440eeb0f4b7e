//! MMX integer SIMD over the x87 register file.

use crate::bus::CpuBus;
use crate::exceptions::Exception;
use crate::state::{CpuState, CR0_EM, CR0_TS};

use super::{decode_modrm, fetch_u8, lin_addr, read_ea, write_ea, Ea, Instr};

fn mmx_enter(state: &mut CpuState) -> Result<(), Exception> {
    if !state.model.has_mmx() {
        return Err(Exception::InvalidOpcode);
    }
    if state.cr0 & CR0_EM != 0 {
        return Err(Exception::InvalidOpcode);
    }
    if state.cr0 & CR0_TS != 0 {
        return Err(Exception::DeviceNotAvailable);
    }
    state.fpu.mmx_enter();
    Ok(())
}

fn read_rm64<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    ea: Ea,
) -> Result<u64, Exception> {
    match ea {
        Ea::Reg(r) => Ok(state.fpu.mmx_read(r)),
        Ea::Mem { seg, off } => {
            let lin = lin_addr(state, seg, off, 8, false)?;
            bus.read_u64(lin)
        }
    }
}

fn write_rm64<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    ea: Ea,
    value: u64,
) -> Result<(), Exception> {
    match ea {
        Ea::Reg(r) => {
            state.fpu.mmx_write(r, value);
            Ok(())
        }
        Ea::Mem { seg, off } => {
            let lin = lin_addr(state, seg, off, 8, true)?;
            bus.write_u64(lin, value)
        }
    }
}

fn lanes8(v: u64) -> [u8; 8] {
    v.to_le_bytes()
}

fn lanes16(v: u64) -> [u16; 4] {
    let b = v.to_le_bytes();
    [
        u16::from_le_bytes([b[0], b[1]]),
        u16::from_le_bytes([b[2], b[3]]),
        u16::from_le_bytes([b[4], b[5]]),
        u16::from_le_bytes([b[6], b[7]]),
    ]
}

fn lanes32(v: u64) -> [u32; 2] {
    [v as u32, (v >> 32) as u32]
}

fn pack8(l: [u8; 8]) -> u64 {
    u64::from_le_bytes(l)
}

fn pack16(l: [u16; 4]) -> u64 {
    let mut b = [0u8; 8];
    for (n, w) in l.iter().enumerate() {
        b[2 * n..2 * n + 2].copy_from_slice(&w.to_le_bytes());
    }
    u64::from_le_bytes(b)
}

fn pack32(l: [u32; 2]) -> u64 {
    u64::from(l[0]) | (u64::from(l[1]) << 32)
}

fn map8(a: u64, b: u64, f: impl Fn(u8, u8) -> u8) -> u64 {
    let (la, lb) = (lanes8(a), lanes8(b));
    let mut out = [0u8; 8];
    for n in 0..8 {
        out[n] = f(la[n], lb[n]);
    }
    pack8(out)
}

fn map16(a: u64, b: u64, f: impl Fn(u16, u16) -> u16) -> u64 {
    let (la, lb) = (lanes16(a), lanes16(b));
    let mut out = [0u16; 4];
    for n in 0..4 {
        out[n] = f(la[n], lb[n]);
    }
    pack16(out)
}

fn map32(a: u64, b: u64, f: impl Fn(u32, u32) -> u32) -> u64 {
    let (la, lb) = (lanes32(a), lanes32(b));
    pack32([f(la[0], lb[0]), f(la[1], lb[1])])
}

pub fn exec<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    i: &mut Instr,
    opcode: u8,
) -> Result<(), Exception> {
    mmx_enter(state)?;

    // EMMS has no ModR/M.
    if opcode == 0x77 {
        state.fpu.emms();
        return Ok(());
    }

    let m = decode_modrm(state, bus, i)?;
    let dst_reg = m.reg;

    // Shift-immediate group (0F 71/72/73): sub-op in the reg field, MMX
    // register in r/m.
    if matches!(opcode, 0x71..=0x73) {
        let imm = u32::from(fetch_u8(state, bus, i)?);
        let Ea::Reg(rm) = m.ea else {
            return Err(Exception::InvalidOpcode);
        };
        let value = state.fpu.mmx_read(rm);
        let out = match (opcode, m.reg) {
            (0x71, 2) => map16(value, 0, |a, _| if imm > 15 { 0 } else { a >> imm }),
            (0x71, 4) => map16(value, 0, |a, _| {
                ((a as i16) >> imm.min(15)) as u16
            }),
            (0x71, 6) => map16(value, 0, |a, _| if imm > 15 { 0 } else { a << imm }),
            (0x72, 2) => map32(value, 0, |a, _| if imm > 31 { 0 } else { a >> imm }),
            (0x72, 4) => map32(value, 0, |a, _| ((a as i32) >> imm.min(31)) as u32),
            (0x72, 6) => map32(value, 0, |a, _| if imm > 31 { 0 } else { a << imm }),
            (0x73, 2) => {
                if imm > 63 {
                    0
                } else {
                    value >> imm
                }
            }
            (0x73, 6) => {
                if imm > 63 {
                    0
                } else {
                    value << imm
                }
            }
            _ => return Err(Exception::InvalidOpcode),
        };
        state.fpu.mmx_write(rm, out);
        return Ok(());
    }

    match opcode {
        // MOVD mm, r/m32 and back.
        0x6E => {
            let value = read_ea(state, bus, m.ea, 32)?;
            state.fpu.mmx_write(dst_reg, value.into());
            Ok(())
        }
        0x7E => {
            let value = state.fpu.mmx_read(dst_reg) as u32;
            write_ea(state, bus, m.ea, 32, value)
        }
        // MOVQ.
        0x6F => {
            let value = read_rm64(state, bus, m.ea)?;
            state.fpu.mmx_write(dst_reg, value);
            Ok(())
        }
        0x7F => {
            let value = state.fpu.mmx_read(dst_reg);
            write_rm64(state, bus, m.ea, value)
        }
        _ => {
            let a = state.fpu.mmx_read(dst_reg);
            let b = read_rm64(state, bus, m.ea)?;
            let out = match opcode {
                // Unpack low/high.
                0x60 => {
                    let (la, lb) = (lanes8(a), lanes8(b));
                    pack8([la[0], lb[0], la[1], lb[1], la[2], lb[2], la[3], lb[3]])
                }
                0x61 => {
                    let (la, lb) = (lanes16(a), lanes16(b));
                    pack16([la[0], lb[0], la[1], lb[1]])
                }
                0x62 => {
                    let (la, lb) = (lanes32(a), lanes32(b));
                    pack32([la[0], lb[0]])
                }
                0x68 => {
                    let (la, lb) = (lanes8(a), lanes8(b));
                    pack8([la[4], lb[4], la[5], lb[5], la[6], lb[6], la[7], lb[7]])
                }
                0x69 => {
                    let (la, lb) = (lanes16(a), lanes16(b));
                    pack16([la[2], lb[2], la[3], lb[3]])
                }
                0x6A => {
                    let (la, lb) = (lanes32(a), lanes32(b));
                    pack32([la[1], lb[1]])
                }
                // Packs with saturation.
                0x63 => {
                    // PACKSSWB.
                    let (la, lb) = (lanes16(a), lanes16(b));
                    let sat = |w: u16| (w as i16).clamp(-128, 127) as i8 as u8;
                    pack8([
                        sat(la[0]),
                        sat(la[1]),
                        sat(la[2]),
                        sat(la[3]),
                        sat(lb[0]),
                        sat(lb[1]),
                        sat(lb[2]),
                        sat(lb[3]),
                    ])
                }
                0x67 => {
                    // PACKUSWB.
                    let (la, lb) = (lanes16(a), lanes16(b));
                    let sat = |w: u16| (w as i16).clamp(0, 255) as u8;
                    pack8([
                        sat(la[0]),
                        sat(la[1]),
                        sat(la[2]),
                        sat(la[3]),
                        sat(lb[0]),
                        sat(lb[1]),
                        sat(lb[2]),
                        sat(lb[3]),
                    ])
                }
                0x6B => {
                    // PACKSSDW.
                    let (la, lb) = (lanes32(a), lanes32(b));
                    let sat = |d: u32| (d as i32).clamp(-32768, 32767) as i16 as u16;
                    pack16([sat(la[0]), sat(la[1]), sat(lb[0]), sat(lb[1])])
                }
                // Compares.
                0x74 => map8(a, b, |x, y| if x == y { 0xFF } else { 0 }),
                0x75 => map16(a, b, |x, y| if x == y { 0xFFFF } else { 0 }),
                0x76 => map32(a, b, |x, y| if x == y { 0xFFFF_FFFF } else { 0 }),
                0x64 => map8(a, b, |x, y| if (x as i8) > (y as i8) { 0xFF } else { 0 }),
                0x65 => map16(a, b, |x, y| if (x as i16) > (y as i16) { 0xFFFF } else { 0 }),
                0x66 => map32(a, b, |x, y| {
                    if (x as i32) > (y as i32) {
                        0xFFFF_FFFF
                    } else {
                        0
                    }
                }),
                // Register-count shifts.
                0xD1 => {
                    let c = b.min(64);
                    map16(a, 0, |x, _| if c > 15 { 0 } else { x >> c })
                }
                0xD2 => {
                    let c = b.min(64);
                    map32(a, 0, |x, _| if c > 31 { 0 } else { x >> c })
                }
                0xD3 => {
                    if b > 63 {
                        0
                    } else {
                        a >> b
                    }
                }
                0xE1 => {
                    let c = (b.min(64) as u32).min(15);
                    map16(a, 0, |x, _| ((x as i16) >> c) as u16)
                }
                0xE2 => {
                    let c = (b.min(64) as u32).min(31);
                    map32(a, 0, |x, _| ((x as i32) >> c) as u32)
                }
                0xF1 => {
                    let c = b.min(64);
                    map16(a, 0, |x, _| if c > 15 { 0 } else { x << c })
                }
                0xF2 => {
                    let c = b.min(64);
                    map32(a, 0, |x, _| if c > 31 { 0 } else { x << c })
                }
                0xF3 => {
                    if b > 63 {
                        0
                    } else {
                        a << b
                    }
                }
                // Multiplies.
                0xD5 => map16(a, b, |x, y| (x as i16).wrapping_mul(y as i16) as u16),
                0xE5 => map16(a, b, |x, y| {
                    ((i32::from(x as i16) * i32::from(y as i16)) >> 16) as u16
                }),
                0xF5 => {
                    // PMADDWD.
                    let (la, lb) = (lanes16(a), lanes16(b));
                    let p = |n: usize| i32::from(la[n] as i16) * i32::from(lb[n] as i16);
                    pack32([
                        (p(0).wrapping_add(p(1))) as u32,
                        (p(2).wrapping_add(p(3))) as u32,
                    ])
                }
                // Logic.
                0xDB => a & b,
                0xDF => !a & b,
                0xEB => a | b,
                0xEF => a ^ b,
                // Saturating subtract/add.
                0xD8 => map8(a, b, |x, y| x.saturating_sub(y)),
                0xD9 => map16(a, b, |x, y| x.saturating_sub(y)),
                0xDC => map8(a, b, |x, y| x.saturating_add(y)),
                0xDD => map16(a, b, |x, y| x.saturating_add(y)),
                0xE8 => map8(a, b, |x, y| (x as i8).saturating_sub(y as i8) as u8),
                0xE9 => map16(a, b, |x, y| (x as i16).saturating_sub(y as i16) as u16),
                0xEC => map8(a, b, |x, y| (x as i8).saturating_add(y as i8) as u8),
                0xED => map16(a, b, |x, y| (x as i16).saturating_add(y as i16) as u16),
                // Wrapping subtract/add.
                0xF8 => map8(a, b, |x, y| x.wrapping_sub(y)),
                0xF9 => map16(a, b, |x, y| x.wrapping_sub(y)),
                0xFA => map32(a, b, |x, y| x.wrapping_sub(y)),
                0xFC => map8(a, b, |x, y| x.wrapping_add(y)),
                0xFD => map16(a, b, |x, y| x.wrapping_add(y)),
                0xFE => map32(a, b, |x, y| x.wrapping_add(y)),
                _ => return Err(Exception::InvalidOpcode),
            };
            state.fpu.mmx_write(dst_reg, out);
            Ok(())
        }
    }
}
