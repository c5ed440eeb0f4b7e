//! Segmentation: descriptor fetch and validation, segment-register loads,
//! the system-table instructions, and the descriptor-query instructions.
//!
//! A load either installs a fully validated descriptor cache or faults; no
//! partially loaded state is observable.

use crate::bus::CpuBus;
use crate::exceptions::Exception;
use crate::flags;
use crate::state::{seg as sr, CpuState, SegmentReg, SystemSeg};

use super::{decode_modrm, pop, read_ea, read_mem, write_ea, Ea, Instr};

/// A raw 8-byte descriptor split into its halves.
#[derive(Debug, Clone, Copy)]
pub struct RawDescriptor {
    pub low: u32,
    pub high: u32,
}

impl RawDescriptor {
    pub fn base(&self) -> u32 {
        (self.low >> 16) | ((self.high & 0xFF) << 16) | (self.high & 0xFF00_0000)
    }

    pub fn limit(&self) -> u32 {
        let raw = (self.low & 0xFFFF) | (self.high & 0x000F_0000);
        if self.granular() {
            (raw << 12) | 0xFFF
        } else {
            raw
        }
    }

    pub fn access(&self) -> u8 {
        (self.high >> 8) as u8
    }

    pub fn attrib(&self) -> u8 {
        ((self.high >> 20) & 0xF) as u8
    }

    pub fn granular(&self) -> bool {
        self.high & 0x0080_0000 != 0
    }

    pub fn present(&self) -> bool {
        self.access() & 0x80 != 0
    }

    pub fn dpl(&self) -> u8 {
        (self.access() >> 5) & 3
    }

    pub fn is_system(&self) -> bool {
        self.access() & 0x10 == 0
    }

    pub fn sys_type(&self) -> u8 {
        self.access() & 0xF
    }

    pub fn to_segment(&self, selector: u16) -> SegmentReg {
        SegmentReg {
            selector,
            base: self.base(),
            limit: self.limit(),
            access: self.access(),
            attrib: self.attrib(),
            valid: true,
        }
    }
}

/// Reads a descriptor from the GDT or LDT, checking table limits.
pub fn read_descriptor<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    selector: u16,
) -> Result<RawDescriptor, Exception> {
    let index = u32::from(selector & !7);
    let (table_base, table_limit) = if selector & 4 != 0 {
        (state.ldtr.base, state.ldtr.limit)
    } else {
        (state.gdtr.base, u32::from(state.gdtr.limit))
    };
    if index + 7 > table_limit {
        return Err(Exception::GeneralProtection(selector & !3));
    }
    let addr = table_base.wrapping_add(index);
    Ok(RawDescriptor {
        low: bus.read_u32(addr)?,
        high: bus.read_u32(addr.wrapping_add(4))?,
    })
}

/// Sets the accessed bit in the descriptor in memory.
fn mark_accessed<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    selector: u16,
    desc: &RawDescriptor,
) -> Result<(), Exception> {
    if desc.access() & 0x01 != 0 {
        return Ok(());
    }
    let table_base = if selector & 4 != 0 {
        state.ldtr.base
    } else {
        state.gdtr.base
    };
    let addr = table_base.wrapping_add(u32::from(selector & !7)) + 5;
    bus.write_u8(addr, desc.access() | 0x01)
}

/// Loads a data-capable segment register (DS/ES/FS/GS/SS) in any mode.
pub fn load_segment<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    seg_idx: usize,
    selector: u16,
) -> Result<(), Exception> {
    debug_assert!(seg_idx != sr::CS);
    if !state.protected_mode() || state.flags.vm() {
        state.segs[seg_idx] = SegmentReg::real_mode(selector);
        return Ok(());
    }

    if selector & !3 == 0 {
        // Null selector: legal for data segments, #GP for SS.
        if seg_idx == sr::SS {
            return Err(Exception::gp0());
        }
        state.segs[seg_idx] = SegmentReg {
            selector,
            base: 0,
            limit: 0,
            access: 0,
            attrib: 0,
            valid: false,
        };
        return Ok(());
    }

    let desc = read_descriptor(state, bus, selector)?;
    let rpl = (selector & 3) as u8;
    let cpl = state.cpl();

    if desc.is_system() {
        return Err(Exception::GeneralProtection(selector & !3));
    }
    let seg = desc.to_segment(selector);
    if seg_idx == sr::SS {
        if rpl != cpl || desc.dpl() != cpl {
            return Err(Exception::GeneralProtection(selector & !3));
        }
        if seg.executable() || !seg.writable() {
            return Err(Exception::GeneralProtection(selector & !3));
        }
        if !desc.present() {
            return Err(Exception::StackFault(selector & !3));
        }
    } else {
        // Data or readable code.
        if seg.executable() && !seg.readable() {
            return Err(Exception::GeneralProtection(selector & !3));
        }
        if !seg.executable() || !seg.conforming() {
            if rpl.max(cpl) > desc.dpl() {
                return Err(Exception::GeneralProtection(selector & !3));
            }
        }
        if !desc.present() {
            return Err(Exception::NotPresent(selector & !3));
        }
    }
    mark_accessed(state, bus, selector, &desc)?;
    state.segs[seg_idx] = seg;
    Ok(())
}

/// Loads CS for a far control transfer that has already validated the
/// descriptor.
pub fn install_cs(state: &mut CpuState, selector: u16, desc: &RawDescriptor, cpl: u8) {
    let mut seg = desc.to_segment((selector & !3) | u16::from(cpl));
    // Conforming code keeps its DPL; the cache records the effective CPL in
    // the selector RPL.
    seg.selector = (selector & !3) | u16::from(cpl);
    state.segs[sr::CS] = seg;
}

pub fn pop_seg<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    i: &mut Instr,
    seg_idx: usize,
) -> Result<(), Exception> {
    let sp_before = state.esp();
    let value = pop(state, bus, i.op_bits())?;
    if let Err(e) = load_segment(state, bus, seg_idx, value as u16) {
        // The pop must not commit on a faulting load.
        state.set_esp(sp_before);
        return Err(e);
    }
    if seg_idx == sr::SS {
        state.inhibit.mov_ss_shadow = true;
        bus.sync(state);
    }
    Ok(())
}

pub fn mov_rm_sreg<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    i: &mut Instr,
) -> Result<(), Exception> {
    let m = decode_modrm(state, bus, i)?;
    if m.reg >= 6 {
        return Err(Exception::InvalidOpcode);
    }
    let value = u32::from(state.segs[m.reg].selector);
    // Register destination writes the full operand size; memory always 16.
    match m.ea {
        Ea::Reg(_) => write_ea(state, bus, m.ea, i.op_bits(), value),
        Ea::Mem { .. } => write_ea(state, bus, m.ea, 16, value),
    }
}

pub fn mov_sreg_rm<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    i: &mut Instr,
) -> Result<(), Exception> {
    let m = decode_modrm(state, bus, i)?;
    if m.reg >= 6 || m.reg == sr::CS {
        return Err(Exception::InvalidOpcode);
    }
    let selector = read_ea(state, bus, m.ea, 16)? as u16;
    load_segment(state, bus, m.reg, selector)?;
    if m.reg == sr::SS {
        state.inhibit.mov_ss_shadow = true;
        bus.sync(state);
    }
    Ok(())
}

/// LES/LDS/LSS/LFS/LGS.
pub fn load_far_pointer<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    i: &mut Instr,
    seg_idx: usize,
) -> Result<(), Exception> {
    let bits = i.op_bits();
    let m = decode_modrm(state, bus, i)?;
    let Ea::Mem { seg, off } = m.ea else {
        return Err(Exception::InvalidOpcode);
    };
    let offset = read_mem(state, bus, seg, off, bits)?;
    let selector = read_mem(state, bus, seg, off.wrapping_add(bits / 8), 16)? as u16;
    load_segment(state, bus, seg_idx, selector)?;
    state.set_reg(m.reg, bits, offset);
    if seg_idx == sr::SS {
        state.inhibit.mov_ss_shadow = true;
        bus.sync(state);
    }
    Ok(())
}

pub fn arpl<B: CpuBus>(state: &mut CpuState, bus: &mut B, i: &mut Instr) -> Result<(), Exception> {
    if !state.protected_mode() || state.flags.vm() {
        return Err(Exception::InvalidOpcode);
    }
    let m = decode_modrm(state, bus, i)?;
    let dest = read_ea(state, bus, m.ea, 16)? as u16;
    let src = state.reg16(m.reg);
    state.flags.rebuild();
    if (dest & 3) < (src & 3) {
        state.flags.set_bit(flags::ZF, true);
        write_ea(state, bus, m.ea, 16, u32::from((dest & !3) | (src & 3)))?;
    } else {
        state.flags.set_bit(flags::ZF, false);
    }
    Ok(())
}

// ----------------------------------------------------------------------
// Group 6/7 and descriptor queries
// ----------------------------------------------------------------------

pub fn exec_group6<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    i: &mut Instr,
) -> Result<(), Exception> {
    if !state.protected_mode() || state.flags.vm() {
        return Err(Exception::InvalidOpcode);
    }
    let m = decode_modrm(state, bus, i)?;
    match m.reg {
        0 => write_ea(state, bus, m.ea, 16, state.ldtr.selector.into()), // SLDT
        1 => write_ea(state, bus, m.ea, 16, state.tr.selector.into()),   // STR
        2 => {
            // LLDT.
            if state.cpl() != 0 {
                return Err(Exception::gp0());
            }
            let selector = read_ea(state, bus, m.ea, 16)? as u16;
            if selector & !3 == 0 {
                state.ldtr = SystemSeg::default();
                return Ok(());
            }
            if selector & 4 != 0 {
                return Err(Exception::GeneralProtection(selector & !3));
            }
            let desc = read_descriptor(state, bus, selector)?;
            if !desc.is_system() || desc.sys_type() != 0x2 {
                return Err(Exception::GeneralProtection(selector & !3));
            }
            if !desc.present() {
                return Err(Exception::NotPresent(selector & !3));
            }
            state.ldtr = SystemSeg {
                selector,
                base: desc.base(),
                limit: desc.limit(),
                access: desc.access(),
            };
            Ok(())
        }
        3 => {
            // LTR.
            if state.cpl() != 0 {
                return Err(Exception::gp0());
            }
            let selector = read_ea(state, bus, m.ea, 16)? as u16;
            if selector & !3 == 0 || selector & 4 != 0 {
                return Err(Exception::GeneralProtection(selector & !3));
            }
            let desc = read_descriptor(state, bus, selector)?;
            if !desc.is_system() || (desc.sys_type() != 0x9 && desc.sys_type() != 0x1) {
                return Err(Exception::GeneralProtection(selector & !3));
            }
            if !desc.present() {
                return Err(Exception::NotPresent(selector & !3));
            }
            // Mark busy.
            let addr = state.gdtr.base.wrapping_add(u32::from(selector & !7)) + 5;
            bus.write_u8(addr, desc.access() | 0x02)?;
            state.tr = SystemSeg {
                selector,
                base: desc.base(),
                limit: desc.limit(),
                access: desc.access() | 0x02,
            };
            Ok(())
        }
        4 | 5 => {
            // VERR/VERW.
            let selector = read_ea(state, bus, m.ea, 16)? as u16;
            let ok = verify_selector(state, bus, selector, m.reg == 5);
            state.flags.rebuild();
            state.flags.set_bit(flags::ZF, ok);
            Ok(())
        }
        _ => Err(Exception::InvalidOpcode),
    }
}

fn verify_selector<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    selector: u16,
    for_write: bool,
) -> bool {
    if selector & !3 == 0 {
        return false;
    }
    let Ok(desc) = read_descriptor(state, bus, selector) else {
        return false;
    };
    if desc.is_system() || !desc.present() {
        return false;
    }
    let seg = desc.to_segment(selector);
    let rpl = (selector & 3) as u8;
    if !seg.conforming() && rpl.max(state.cpl()) > desc.dpl() {
        return false;
    }
    if for_write {
        seg.writable()
    } else {
        seg.readable()
    }
}

pub fn exec_group7<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    i: &mut Instr,
) -> Result<(), Exception> {
    let m = decode_modrm(state, bus, i)?;
    match m.reg {
        0 | 1 => {
            // SGDT/SIDT.
            let Ea::Mem { seg, off } = m.ea else {
                return Err(Exception::InvalidOpcode);
            };
            let table = if m.reg == 0 { state.gdtr } else { state.idtr };
            super::write_mem(state, bus, seg, off, 16, table.limit.into())?;
            super::write_mem(state, bus, seg, off.wrapping_add(2), 32, table.base)
        }
        2 | 3 => {
            // LGDT/LIDT.
            if state.protected_mode() && state.cpl() != 0 {
                return Err(Exception::gp0());
            }
            let Ea::Mem { seg, off } = m.ea else {
                return Err(Exception::InvalidOpcode);
            };
            let limit = read_mem(state, bus, seg, off, 16)? as u16;
            let mut base = read_mem(state, bus, seg, off.wrapping_add(2), 32)?;
            if !i.opsize32 {
                base &= 0x00FF_FFFF;
            }
            let table = crate::state::DescTable { base, limit };
            if m.reg == 2 {
                state.gdtr = table;
            } else {
                state.idtr = table;
            }
            Ok(())
        }
        4 => {
            // SMSW.
            write_ea(state, bus, m.ea, 16, state.cr0 & 0xFFFF)
        }
        6 => {
            // LMSW: may set but never clear PE.
            if state.protected_mode() && state.cpl() != 0 {
                return Err(Exception::gp0());
            }
            let value = read_ea(state, bus, m.ea, 16)?;
            state.cr0 = (state.cr0 & !0xE) | (value & 0xE) | (state.cr0 & 1) | (value & 1);
            bus.sync(state);
            Ok(())
        }
        7 => {
            // INVLPG.
            if state.protected_mode() && state.cpl() != 0 {
                return Err(Exception::gp0());
            }
            let Ea::Mem { seg, off } = m.ea else {
                return Err(Exception::InvalidOpcode);
            };
            let lin = state.segs[seg].base.wrapping_add(off);
            bus.invlpg(lin);
            Ok(())
        }
        _ => Err(Exception::InvalidOpcode),
    }
}

pub fn lar<B: CpuBus>(state: &mut CpuState, bus: &mut B, i: &mut Instr) -> Result<(), Exception> {
    if !state.protected_mode() || state.flags.vm() {
        return Err(Exception::InvalidOpcode);
    }
    let bits = i.op_bits();
    let m = decode_modrm(state, bus, i)?;
    let selector = read_ea(state, bus, m.ea, 16)? as u16;
    let accessible = selector_accessible(state, bus, selector, false);
    state.flags.rebuild();
    match accessible {
        Some(desc) => {
            state.flags.set_bit(flags::ZF, true);
            let value = desc.high & 0x00FF_FF00;
            state.set_reg(m.reg, bits, value);
        }
        None => state.flags.set_bit(flags::ZF, false),
    }
    Ok(())
}

pub fn lsl<B: CpuBus>(state: &mut CpuState, bus: &mut B, i: &mut Instr) -> Result<(), Exception> {
    if !state.protected_mode() || state.flags.vm() {
        return Err(Exception::InvalidOpcode);
    }
    let bits = i.op_bits();
    let m = decode_modrm(state, bus, i)?;
    let selector = read_ea(state, bus, m.ea, 16)? as u16;
    let accessible = selector_accessible(state, bus, selector, true);
    state.flags.rebuild();
    match accessible {
        Some(desc) => {
            state.flags.set_bit(flags::ZF, true);
            state.set_reg(m.reg, bits, desc.limit());
        }
        None => state.flags.set_bit(flags::ZF, false),
    }
    Ok(())
}

fn selector_accessible<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    selector: u16,
    limit_query: bool,
) -> Option<RawDescriptor> {
    if selector & !3 == 0 {
        return None;
    }
    let desc = read_descriptor(state, bus, selector).ok()?;
    if desc.is_system() {
        // Only the segment-like system types answer.
        let ok = matches!(desc.sys_type(), 0x1 | 0x2 | 0x3 | 0x9 | 0xB)
            || (!limit_query && matches!(desc.sys_type(), 0x4 | 0x5 | 0xC));
        if !ok {
            return None;
        }
    } else {
        let seg = desc.to_segment(selector);
        let rpl = (selector & 3) as u8;
        if !seg.conforming() && rpl.max(state.cpl()) > desc.dpl() {
            return None;
        }
    }
    Some(desc)
}
