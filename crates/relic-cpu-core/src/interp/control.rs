//! Control transfers: relative jumps and calls, far transfers with
//! descriptor validation, software interrupts, IRET in all three modes,
//! hardware interrupt/exception delivery, and the 32-bit TSS task switch.

use crate::bus::CpuBus;
use crate::exceptions::Exception;
use crate::flags;
use crate::state::{gpr, seg as sr, CpuMode, CpuState, SegmentReg};

use super::seg::{install_cs, load_segment, read_descriptor, RawDescriptor};
use super::{condition, fetch_imm, fetch_u16, fetch_u8, pop, push, read_mem, Ea, Instr};

/// Why a vector is being delivered; gates the privilege checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntKind {
    /// INT n: gate DPL must admit CPL.
    Software,
    /// INT3 / ICEBP.
    Int3,
    /// INTO.
    Into,
    /// Hardware vector from the PIC.
    External,
    /// CPU exception.
    Exception,
}

impl IntKind {
    fn is_software(self) -> bool {
        matches!(self, IntKind::Software | IntKind::Int3 | IntKind::Into)
    }
}

pub fn jump_near(state: &mut CpuState, i: &mut Instr, target: u32) {
    state.eip = target;
    i.jumped = true;
}

pub fn jcc_rel8<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    i: &mut Instr,
    opcode: u8,
) -> Result<(), Exception> {
    let disp = fetch_u8(state, bus, i)? as i8;
    if condition(state, opcode & 0xF) {
        let target = i.cur.wrapping_add(disp as u32);
        let target = if i.opsize32 { target } else { target & 0xFFFF };
        jump_near(state, i, target);
    }
    Ok(())
}

pub fn jcc_rel<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    i: &mut Instr,
    opcode: u8,
) -> Result<(), Exception> {
    let disp = if i.opsize32 {
        super::fetch_u32(state, bus, i)?
    } else {
        fetch_u16(state, bus, i)? as i16 as u32
    };
    if condition(state, opcode & 0xF) {
        let target = i.cur.wrapping_add(disp);
        let target = if i.opsize32 { target } else { target & 0xFFFF };
        jump_near(state, i, target);
    }
    Ok(())
}

pub fn jmp_rel<B: CpuBus>(state: &mut CpuState, bus: &mut B, i: &mut Instr) -> Result<(), Exception> {
    let disp = if i.opsize32 {
        super::fetch_u32(state, bus, i)?
    } else {
        fetch_u16(state, bus, i)? as i16 as u32
    };
    let target = i.cur.wrapping_add(disp);
    let target = if i.opsize32 { target } else { target & 0xFFFF };
    jump_near(state, i, target);
    Ok(())
}

pub fn call_rel<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    i: &mut Instr,
) -> Result<(), Exception> {
    let disp = if i.opsize32 {
        super::fetch_u32(state, bus, i)?
    } else {
        fetch_u16(state, bus, i)? as i16 as u32
    };
    let ret = i.cur;
    push(state, bus, i.op_bits(), ret)?;
    let target = i.cur.wrapping_add(disp);
    let target = if i.opsize32 { target } else { target & 0xFFFF };
    jump_near(state, i, target);
    Ok(())
}

pub fn ret_near<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    i: &mut Instr,
    with_imm: bool,
) -> Result<(), Exception> {
    let drop = if with_imm {
        fetch_u16(state, bus, i)?
    } else {
        0
    };
    let target = pop(state, bus, i.op_bits())?;
    state.adjust_stack_ptr(i32::from(drop));
    let target = if i.opsize32 { target } else { target & 0xFFFF };
    jump_near(state, i, target);
    Ok(())
}

pub fn loop_ops<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    i: &mut Instr,
    opcode: u8,
) -> Result<(), Exception> {
    let disp = fetch_u8(state, bus, i)? as i8;
    let count = if i.addrsize32 {
        let c = state.reg32(gpr::ECX).wrapping_sub(1);
        if opcode != 0xE3 {
            state.set_reg32(gpr::ECX, c);
        }
        if opcode == 0xE3 {
            state.reg32(gpr::ECX)
        } else {
            c
        }
    } else {
        let c = state.reg16(gpr::ECX).wrapping_sub(1);
        if opcode != 0xE3 {
            state.set_reg16(gpr::ECX, c);
        }
        u32::from(if opcode == 0xE3 {
            state.reg16(gpr::ECX)
        } else {
            c
        })
    };
    let taken = match opcode {
        0xE0 => count != 0 && !state.flags.zf(), // LOOPNE
        0xE1 => count != 0 && state.flags.zf(),  // LOOPE
        0xE2 => count != 0,                      // LOOP
        _ => count == 0,                         // JCXZ
    };
    if taken {
        let target = i.cur.wrapping_add(disp as u32);
        let target = if i.opsize32 { target } else { target & 0xFFFF };
        jump_near(state, i, target);
    }
    Ok(())
}

// ----------------------------------------------------------------------
// PUSHF/POPF
// ----------------------------------------------------------------------

pub fn pushf<B: CpuBus>(state: &mut CpuState, bus: &mut B, i: &mut Instr) -> Result<(), Exception> {
    if state.mode() == CpuMode::Virtual8086 && state.flags.iopl() < 3 {
        return Err(Exception::gp0());
    }
    let value = state.flags.get() & !(flags::VM | flags::RF);
    push(state, bus, i.op_bits(), value)
}

pub fn popf<B: CpuBus>(state: &mut CpuState, bus: &mut B, i: &mut Instr) -> Result<(), Exception> {
    if state.mode() == CpuMode::Virtual8086 && state.flags.iopl() < 3 {
        return Err(Exception::gp0());
    }
    let value = pop(state, bus, i.op_bits())?;
    let mut mask = flags::CF
        | flags::PF
        | flags::AF
        | flags::ZF
        | flags::SF
        | flags::TF
        | flags::DF
        | flags::OF
        | flags::NT;
    if i.opsize32 {
        mask |= flags::AC | flags::ID;
    }
    match state.mode() {
        CpuMode::Real => mask |= flags::IF | flags::IOPL_MASK,
        CpuMode::Virtual8086 => mask |= flags::IF,
        CpuMode::Protected => {
            if state.cpl() == 0 {
                mask |= flags::IF | flags::IOPL_MASK;
            } else if state.cpl() <= state.flags.iopl() {
                mask |= flags::IF;
            }
        }
    }
    state.flags.set_masked(value, mask);
    Ok(())
}

// ----------------------------------------------------------------------
// Far transfers
// ----------------------------------------------------------------------

fn far_target<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    i: &mut Instr,
) -> Result<(u16, u32), Exception> {
    let offset = fetch_imm(state, bus, i)?;
    let selector = fetch_u16(state, bus, i)?;
    Ok((selector, offset))
}

fn far_target_indirect<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    i: &mut Instr,
    ea: Ea,
) -> Result<(u16, u32), Exception> {
    let Ea::Mem { seg, off } = ea else {
        return Err(Exception::InvalidOpcode);
    };
    let bits = i.op_bits();
    let offset = read_mem(state, bus, seg, off, bits)?;
    let selector = read_mem(state, bus, seg, off.wrapping_add(bits / 8), 16)? as u16;
    Ok((selector, offset))
}

pub fn jmp_far_imm<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    i: &mut Instr,
) -> Result<(), Exception> {
    let (selector, offset) = far_target(state, bus, i)?;
    jmp_far(state, bus, i, selector, offset)
}

pub fn jmp_far_indirect<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    i: &mut Instr,
    ea: Ea,
) -> Result<(), Exception> {
    let (selector, offset) = far_target_indirect(state, bus, i, ea)?;
    jmp_far(state, bus, i, selector, offset)
}

pub fn call_far_imm<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    i: &mut Instr,
) -> Result<(), Exception> {
    let (selector, offset) = far_target(state, bus, i)?;
    call_far(state, bus, i, selector, offset)
}

pub fn call_far_indirect<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    i: &mut Instr,
    ea: Ea,
) -> Result<(), Exception> {
    let (selector, offset) = far_target_indirect(state, bus, i, ea)?;
    call_far(state, bus, i, selector, offset)
}

fn jmp_far<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    i: &mut Instr,
    selector: u16,
    offset: u32,
) -> Result<(), Exception> {
    if !state.protected_mode() || state.flags.vm() {
        state.segs[sr::CS] = SegmentReg::real_mode(selector);
        state.segs[sr::CS].access = 0x9B;
        jump_near(state, i, if i.opsize32 { offset } else { offset & 0xFFFF });
        return Ok(());
    }

    if selector & !3 == 0 {
        return Err(Exception::gp0());
    }
    let desc = read_descriptor(state, bus, selector)?;
    let cpl = state.cpl();

    if desc.is_system() {
        match desc.sys_type() {
            0x9 | 0x1 => return task_switch(state, bus, i, selector, &desc, TaskEntry::Jmp),
            0x4 | 0xC => return call_gate_transfer(state, bus, i, selector, &desc, false),
            _ => return Err(Exception::GeneralProtection(selector & !3)),
        }
    }
    validate_code_target(selector, &desc, cpl)?;
    if !desc.present() {
        return Err(Exception::NotPresent(selector & !3));
    }
    let seg = desc.to_segment(selector);
    if !seg.limit_check(offset, 1) {
        return Err(Exception::gp0());
    }
    install_cs(state, selector, &desc, cpl);
    bus.sync(state);
    jump_near(state, i, offset);
    Ok(())
}

fn validate_code_target(selector: u16, desc: &RawDescriptor, cpl: u8) -> Result<(), Exception> {
    let seg_access = desc.access();
    let executable = seg_access & 0x08 != 0;
    let conforming = seg_access & 0x04 != 0;
    if !executable {
        return Err(Exception::GeneralProtection(selector & !3));
    }
    let rpl = (selector & 3) as u8;
    if conforming {
        if desc.dpl() > cpl {
            return Err(Exception::GeneralProtection(selector & !3));
        }
    } else {
        if rpl > cpl || desc.dpl() != cpl {
            return Err(Exception::GeneralProtection(selector & !3));
        }
    }
    Ok(())
}

fn call_far<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    i: &mut Instr,
    selector: u16,
    offset: u32,
) -> Result<(), Exception> {
    if !state.protected_mode() || state.flags.vm() {
        let bits = i.op_bits();
        push(state, bus, bits, state.segs[sr::CS].selector.into())?;
        push(state, bus, bits, i.cur)?;
        state.segs[sr::CS] = SegmentReg::real_mode(selector);
        state.segs[sr::CS].access = 0x9B;
        jump_near(state, i, if i.opsize32 { offset } else { offset & 0xFFFF });
        return Ok(());
    }

    if selector & !3 == 0 {
        return Err(Exception::gp0());
    }
    let desc = read_descriptor(state, bus, selector)?;
    let cpl = state.cpl();

    if desc.is_system() {
        match desc.sys_type() {
            0x9 | 0x1 => return task_switch(state, bus, i, selector, &desc, TaskEntry::Call),
            0x4 | 0xC => return call_gate_transfer(state, bus, i, selector, &desc, true),
            _ => return Err(Exception::GeneralProtection(selector & !3)),
        }
    }
    validate_code_target(selector, &desc, cpl)?;
    if !desc.present() {
        return Err(Exception::NotPresent(selector & !3));
    }
    let bits = i.op_bits();
    push(state, bus, bits, state.segs[sr::CS].selector.into())?;
    push(state, bus, bits, i.cur)?;
    install_cs(state, selector, &desc, cpl);
    bus.sync(state);
    jump_near(state, i, offset);
    Ok(())
}

/// Call/jmp through a call gate, with inner-stack switch on privilege
/// increase.
fn call_gate_transfer<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    i: &mut Instr,
    gate_selector: u16,
    gate: &RawDescriptor,
    is_call: bool,
) -> Result<(), Exception> {
    let cpl = state.cpl();
    let rpl = (gate_selector & 3) as u8;
    if gate.dpl() < cpl || gate.dpl() < rpl {
        return Err(Exception::GeneralProtection(gate_selector & !3));
    }
    if !gate.present() {
        return Err(Exception::NotPresent(gate_selector & !3));
    }
    let gate32 = gate.sys_type() == 0xC;
    let target_sel = (gate.low >> 16) as u16;
    let target_off = if gate32 {
        (gate.low & 0xFFFF) | (gate.high & 0xFFFF_0000)
    } else {
        gate.low & 0xFFFF
    };
    let param_count = (gate.high >> 8) & 0x1F;

    if target_sel & !3 == 0 {
        return Err(Exception::gp0());
    }
    let code = read_descriptor(state, bus, target_sel)?;
    if code.is_system() || code.access() & 0x08 == 0 || code.dpl() > cpl {
        return Err(Exception::GeneralProtection(target_sel & !3));
    }
    if !code.present() {
        return Err(Exception::NotPresent(target_sel & !3));
    }

    let conforming = code.access() & 0x04 != 0;
    let new_cpl = if conforming { cpl } else { code.dpl() };

    if is_call && new_cpl < cpl {
        // Inner stack from the TSS.
        let (new_ss, new_esp) = read_tss_stack(state, bus, new_cpl)?;
        let old_ss = state.segs[sr::SS].selector;
        let old_esp = state.esp();

        // Copy parameters from the outer stack.
        let bits = if gate32 { 32 } else { 16 };
        let mut params = Vec::new();
        for n in 0..param_count {
            let off = state.stack_ptr().wrapping_add(n * (bits / 8));
            params.push(read_mem(state, bus, sr::SS, off, bits)?);
        }

        // Switch to the inner stack.
        load_segment_for_stack(state, bus, new_ss, new_cpl)?;
        state.set_esp(new_esp);

        push(state, bus, bits, old_ss.into())?;
        push(state, bus, bits, old_esp)?;
        for value in params.iter().rev() {
            push(state, bus, bits, *value)?;
        }
        push(state, bus, bits, state.segs[sr::CS].selector.into())?;
        push(state, bus, bits, i.cur)?;
        install_cs(state, target_sel, &code, new_cpl);
    } else {
        if is_call {
            let bits = if gate32 { 32 } else { 16 };
            push(state, bus, bits, state.segs[sr::CS].selector.into())?;
            push(state, bus, bits, i.cur)?;
        }
        install_cs(state, target_sel, &code, cpl);
    }
    bus.sync(state);
    jump_near(state, i, target_off);
    Ok(())
}

/// Reads SS:ESP for `cpl` from the 32-bit TSS.
fn read_tss_stack<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    cpl: u8,
) -> Result<(u16, u32), Exception> {
    let offset = 4 + u32::from(cpl) * 8;
    if u32::from(offset + 5) > state.tr.limit {
        return Err(Exception::InvalidTss(state.tr.selector & !3));
    }
    let esp = bus.read_u32(state.tr.base.wrapping_add(offset))?;
    let ss = bus.read_u16(state.tr.base.wrapping_add(offset + 4))?;
    Ok((ss, esp))
}

/// SS load during a privilege transition: the new RPL must equal the new
/// CPL.
fn load_segment_for_stack<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    selector: u16,
    cpl: u8,
) -> Result<(), Exception> {
    if selector & !3 == 0 {
        return Err(Exception::InvalidTss(selector));
    }
    let desc = read_descriptor(state, bus, selector)?;
    if desc.is_system()
        || desc.dpl() != cpl
        || (selector & 3) as u8 != cpl
        || desc.access() & 0x08 != 0
        || desc.access() & 0x02 == 0
    {
        return Err(Exception::InvalidTss(selector & !3));
    }
    if !desc.present() {
        return Err(Exception::StackFault(selector & !3));
    }
    state.segs[sr::SS] = desc.to_segment(selector);
    Ok(())
}

pub fn ret_far<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    i: &mut Instr,
    with_imm: bool,
) -> Result<(), Exception> {
    let drop = if with_imm {
        fetch_u16(state, bus, i)?
    } else {
        0
    };
    let bits = i.op_bits();

    if !state.protected_mode() || state.flags.vm() {
        let offset = pop(state, bus, bits)?;
        let selector = pop(state, bus, bits)? as u16;
        state.adjust_stack_ptr(i32::from(drop));
        state.segs[sr::CS] = SegmentReg::real_mode(selector);
        state.segs[sr::CS].access = 0x9B;
        jump_near(state, i, if bits == 32 { offset } else { offset & 0xFFFF });
        return Ok(());
    }

    let offset = pop(state, bus, bits)?;
    let selector = pop(state, bus, bits)? as u16;
    let cpl = state.cpl();
    let rpl = (selector & 3) as u8;
    if rpl < cpl {
        return Err(Exception::GeneralProtection(selector & !3));
    }
    if selector & !3 == 0 {
        return Err(Exception::gp0());
    }
    let desc = read_descriptor(state, bus, selector)?;
    validate_ret_target(selector, &desc, rpl)?;
    if !desc.present() {
        return Err(Exception::NotPresent(selector & !3));
    }

    state.adjust_stack_ptr(i32::from(drop));
    if rpl > cpl {
        // Outer return: restore the caller's stack.
        let new_esp = pop(state, bus, bits)?;
        let new_ss = pop(state, bus, bits)? as u16;
        install_cs(state, selector, &desc, rpl);
        load_segment(state, bus, sr::SS, new_ss)?;
        state.set_esp(new_esp);
        drop_invalid_data_segments(state, rpl);
    } else {
        install_cs(state, selector, &desc, rpl);
    }
    bus.sync(state);
    jump_near(state, i, if bits == 32 { offset } else { offset & 0xFFFF });
    Ok(())
}

fn validate_ret_target(selector: u16, desc: &RawDescriptor, rpl: u8) -> Result<(), Exception> {
    if desc.is_system() || desc.access() & 0x08 == 0 {
        return Err(Exception::GeneralProtection(selector & !3));
    }
    let conforming = desc.access() & 0x04 != 0;
    if conforming {
        if desc.dpl() > rpl {
            return Err(Exception::GeneralProtection(selector & !3));
        }
    } else if desc.dpl() != rpl {
        return Err(Exception::GeneralProtection(selector & !3));
    }
    Ok(())
}

/// Data segments whose DPL no longer admits the new CPL become null on a
/// return to outer privilege.
fn drop_invalid_data_segments(state: &mut CpuState, cpl: u8) {
    for idx in [sr::ES, sr::DS, sr::FS, sr::GS] {
        let seg = &state.segs[idx];
        if seg.valid && !seg.is_system() && (!seg.executable() || !seg.conforming()) {
            if seg.dpl() < cpl {
                state.segs[idx].valid = false;
                state.segs[idx].selector = 0;
            }
        }
    }
}

// ----------------------------------------------------------------------
// INT / IRET
// ----------------------------------------------------------------------

pub fn int_sw<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    i: &mut Instr,
    vector: u8,
    kind: IntKind,
) -> Result<(), Exception> {
    // In V86 mode INT n is gated by IOPL (or redirected under VME).
    if state.mode() == CpuMode::Virtual8086 && kind == IntKind::Software {
        if state.cr4 & crate::state::CR4_VME != 0 {
            if vme_redirect(state, bus, i, vector)? {
                return Ok(());
            }
        } else if state.flags.iopl() < 3 {
            return Err(Exception::gp0());
        }
    }
    // The saved EIP for traps is the next instruction; a fault raised
    // during delivery must still point back at the INT itself.
    let fault_eip = state.eip;
    state.eip = i.cur;
    match deliver_interrupt(state, bus, vector, kind) {
        Ok(()) => {
            i.jumped = true;
            Ok(())
        }
        Err(e) => {
            state.eip = fault_eip;
            Err(e)
        }
    }
}

/// VME: INT n consults the redirection bitmap ahead of the IO bitmap in the
/// TSS; a clear bit redirects to the virtual 8086 IVT.
fn vme_redirect<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    i: &mut Instr,
    vector: u8,
) -> Result<bool, Exception> {
    // The software redirection bitmap sits 32 bytes below the IO bitmap.
    let io_base_off: u32 = 0x66;
    if u32::from(io_base_off) + 1 > state.tr.limit {
        return Err(Exception::InvalidTss(state.tr.selector & !3));
    }
    let io_base = bus.read_u16(state.tr.base.wrapping_add(0x66))?;
    let redir_base = u32::from(io_base) - 32;
    let byte = bus.read_u8(
        state
            .tr
            .base
            .wrapping_add(redir_base + u32::from(vector / 8)),
    )?;
    if byte & (1 << (vector % 8)) != 0 {
        // Bit set: fall back to the IOPL-gated protected path.
        if state.flags.iopl() < 3 {
            return Err(Exception::gp0());
        }
        return Ok(false);
    }
    // Redirect through the real-mode IVT inside the V86 task.
    let ivt = u32::from(vector) * 4;
    let new_ip = bus.read_u16(ivt)?;
    let new_cs = bus.read_u16(ivt + 2)?;
    let flags_image = state.flags.get() as u16 & !(flags::IF as u16);
    let flags_push = state.flags.get() as u16;
    let _ = flags_image;
    push(state, bus, 16, flags_push.into())?;
    push(state, bus, 16, state.segs[sr::CS].selector.into())?;
    push(state, bus, 16, i.cur & 0xFFFF)?;
    state.segs[sr::CS] = SegmentReg::real_mode(new_cs);
    state.eip = new_ip.into();
    i.jumped = true;
    state.flags.set_bit(flags::TF, false);
    Ok(true)
}

/// Delivers `vector` as an interrupt/trap; shared by hardware delivery,
/// software INT, and exception delivery.
pub fn deliver_interrupt<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    vector: u8,
    kind: IntKind,
) -> Result<(), Exception> {
    deliver(state, bus, vector, kind, None)
}

/// Exception delivery: same path, but pushes an error code when the vector
/// carries one. Any fault raised during delivery is returned for
/// double-fault escalation.
pub fn deliver_exception<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    exc: Exception,
) -> Result<(), Exception> {
    deliver(state, bus, exc.vector(), IntKind::Exception, exc.error_code())
}

fn deliver<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    vector: u8,
    kind: IntKind,
    error_code: Option<u32>,
) -> Result<(), Exception> {
    state.halted = false;
    if !state.protected_mode() {
        return deliver_real(state, bus, vector);
    }
    deliver_protected(state, bus, vector, kind, error_code)
}

fn deliver_real<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    vector: u8,
) -> Result<(), Exception> {
    let ivt = state.idtr.base.wrapping_add(u32::from(vector) * 4);
    if u32::from(vector) * 4 + 3 > u32::from(state.idtr.limit) {
        return Err(Exception::gp0());
    }
    let new_ip = bus.read_u16(ivt)?;
    let new_cs = bus.read_u16(ivt.wrapping_add(2))?;
    push(state, bus, 16, state.flags.get() & 0xFFFF)?;
    push(state, bus, 16, state.segs[sr::CS].selector.into())?;
    push(state, bus, 16, state.eip & 0xFFFF)?;
    state.flags.set_if(false);
    state.flags.set_bit(flags::TF, false);
    state.segs[sr::CS] = SegmentReg::real_mode(new_cs);
    state.eip = new_ip.into();
    Ok(())
}

fn deliver_protected<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    vector: u8,
    kind: IntKind,
    error_code: Option<u32>,
) -> Result<(), Exception> {
    let gate_ec = (u16::from(vector) << 3) | 2 | u16::from(kind == IntKind::External);
    let index = u32::from(vector) * 8;
    if index + 7 > u32::from(state.idtr.limit) {
        return Err(Exception::GeneralProtection(gate_ec));
    }
    let addr = state.idtr.base.wrapping_add(index);
    let gate = RawDescriptor {
        low: bus.read_u32(addr)?,
        high: bus.read_u32(addr.wrapping_add(4))?,
    };
    if !gate.is_system() {
        return Err(Exception::GeneralProtection(gate_ec));
    }
    let gate_type = gate.sys_type();
    let (gate32, is_trap) = match gate_type {
        0x6 => (false, false), // 16-bit interrupt gate
        0x7 => (false, true),  // 16-bit trap gate
        0xE => (true, false),
        0xF => (true, true),
        0x5 => {
            // Task gate.
            let tss_sel = (gate.low >> 16) as u16;
            if kind.is_software() && gate.dpl() < state.cpl() {
                return Err(Exception::GeneralProtection(gate_ec));
            }
            if !gate.present() {
                return Err(Exception::NotPresent(gate_ec));
            }
            let desc = read_descriptor(state, bus, tss_sel)?;
            let mut dummy = Instr::new(state);
            task_switch(state, bus, &mut dummy, tss_sel, &desc, TaskEntry::Int)?;
            if let Some(ec) = error_code {
                let bits = 32;
                push(state, bus, bits, ec)?;
            }
            return Ok(());
        }
        _ => return Err(Exception::GeneralProtection(gate_ec)),
    };

    if kind.is_software() && gate.dpl() < state.cpl() {
        return Err(Exception::GeneralProtection(gate_ec));
    }
    if !gate.present() {
        return Err(Exception::NotPresent(gate_ec));
    }

    let target_sel = (gate.low >> 16) as u16;
    let target_off = if gate32 {
        (gate.low & 0xFFFF) | (gate.high & 0xFFFF_0000)
    } else {
        gate.low & 0xFFFF
    };
    if target_sel & !3 == 0 {
        return Err(Exception::gp0());
    }
    let code = read_descriptor(state, bus, target_sel)?;
    if code.is_system() || code.access() & 0x08 == 0 {
        return Err(Exception::GeneralProtection(target_sel & !3));
    }
    if !code.present() {
        return Err(Exception::NotPresent(target_sel & !3));
    }

    let cpl = state.cpl();
    let conforming = code.access() & 0x04 != 0;
    let new_cpl = if conforming || code.dpl() >= cpl {
        cpl
    } else {
        code.dpl()
    };
    let from_v86 = state.flags.vm();
    let bits = if gate32 { 32 } else { 16 };

    if from_v86 && new_cpl != 0 {
        return Err(Exception::GeneralProtection(target_sel & !3));
    }

    if new_cpl < cpl || from_v86 {
        // Stack switch through the TSS.
        let (new_ss, new_esp) = read_tss_stack(state, bus, new_cpl)?;
        let old_ss = state.segs[sr::SS].selector;
        let old_esp = state.esp();
        let old_flags = state.flags.get();

        if from_v86 {
            state.flags.set_vm(false);
        }
        load_segment_for_stack(state, bus, new_ss, new_cpl)?;
        state.set_esp(new_esp);
        // CS must change before CPL-sensitive pushes; stash the old one.
        let old_cs = state.segs[sr::CS].selector;

        if from_v86 {
            push(state, bus, bits, state.segs[sr::GS].selector.into())?;
            push(state, bus, bits, state.segs[sr::FS].selector.into())?;
            push(state, bus, bits, state.segs[sr::DS].selector.into())?;
            push(state, bus, bits, state.segs[sr::ES].selector.into())?;
            for idx in [sr::ES, sr::DS, sr::FS, sr::GS] {
                state.segs[idx].valid = false;
                state.segs[idx].selector = 0;
            }
        }
        push(state, bus, bits, old_ss.into())?;
        push(state, bus, bits, old_esp)?;
        push(state, bus, bits, old_flags)?;
        push(state, bus, bits, old_cs.into())?;
        push(state, bus, bits, state.eip)?;
        if let Some(ec) = error_code {
            push(state, bus, bits, ec)?;
        }
        install_cs(state, target_sel, &code, new_cpl);
    } else {
        push(state, bus, bits, state.flags.get())?;
        push(state, bus, bits, state.segs[sr::CS].selector.into())?;
        push(state, bus, bits, state.eip)?;
        if let Some(ec) = error_code {
            push(state, bus, bits, ec)?;
        }
        install_cs(state, target_sel, &code, new_cpl);
    }

    if !is_trap {
        state.flags.set_if(false);
    }
    state.flags.set_bit(flags::TF, false);
    state.flags.set_bit(flags::NT, false);
    state.flags.set_bit(flags::RF, false);
    state.eip = target_off;
    bus.sync(state);
    Ok(())
}

pub fn iret<B: CpuBus>(state: &mut CpuState, bus: &mut B, i: &mut Instr) -> Result<(), Exception> {
    let bits = i.op_bits();
    match state.mode() {
        CpuMode::Real => {
            let ip = pop(state, bus, bits)?;
            let cs = pop(state, bus, bits)? as u16;
            let fl = pop(state, bus, bits)?;
            state.segs[sr::CS] = SegmentReg::real_mode(cs);
            let mask = if bits == 32 {
                !(flags::VM | flags::RF) // VM/RF unchanged from IRETD in real mode
            } else {
                0xFFFF
            };
            state.flags.set_masked(fl, mask);
            jump_near(state, i, if bits == 32 { ip } else { ip & 0xFFFF });
            Ok(())
        }
        CpuMode::Virtual8086 => {
            if state.flags.iopl() < 3 {
                return Err(Exception::gp0());
            }
            let ip = pop(state, bus, bits)?;
            let cs = pop(state, bus, bits)? as u16;
            let fl = pop(state, bus, bits)?;
            state.segs[sr::CS] = SegmentReg::real_mode(cs);
            let mask = (flags::CF
                | flags::PF
                | flags::AF
                | flags::ZF
                | flags::SF
                | flags::TF
                | flags::IF
                | flags::DF
                | flags::OF)
                | if bits == 32 { flags::AC | flags::ID | flags::NT } else { flags::NT };
            state.flags.set_masked(fl, mask);
            jump_near(state, i, if bits == 32 { ip } else { ip & 0xFFFF });
            Ok(())
        }
        CpuMode::Protected => iret_protected(state, bus, i),
    }
}

fn iret_protected<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    i: &mut Instr,
) -> Result<(), Exception> {
    let bits = i.op_bits();

    if state.flags.nt() {
        // Task return through the back link.
        let back = bus.read_u16(state.tr.base)?;
        let desc = read_descriptor(state, bus, back)?;
        return task_switch(state, bus, i, back, &desc, TaskEntry::Iret);
    }

    let ip = pop(state, bus, bits)?;
    let cs_sel = pop(state, bus, bits)? as u16;
    let fl = pop(state, bus, bits)?;

    if bits == 32 && fl & flags::VM != 0 && state.cpl() == 0 {
        // Return to virtual 8086.
        let esp = pop(state, bus, 32)?;
        let ss = pop(state, bus, 32)? as u16;
        let es = pop(state, bus, 32)? as u16;
        let ds = pop(state, bus, 32)? as u16;
        let fs = pop(state, bus, 32)? as u16;
        let gs = pop(state, bus, 32)? as u16;

        state.flags.set_all(fl | flags::VM);
        state.segs[sr::CS] = SegmentReg::real_mode(cs_sel);
        state.segs[sr::SS] = SegmentReg::real_mode(ss);
        state.segs[sr::ES] = SegmentReg::real_mode(es);
        state.segs[sr::DS] = SegmentReg::real_mode(ds);
        state.segs[sr::FS] = SegmentReg::real_mode(fs);
        state.segs[sr::GS] = SegmentReg::real_mode(gs);
        state.set_esp(esp);
        bus.sync(state);
        jump_near(state, i, ip & 0xFFFF);
        return Ok(());
    }

    let cpl = state.cpl();
    let rpl = (cs_sel & 3) as u8;
    if cs_sel & !3 == 0 {
        return Err(Exception::gp0());
    }
    if rpl < cpl {
        return Err(Exception::GeneralProtection(cs_sel & !3));
    }
    let desc = read_descriptor(state, bus, cs_sel)?;
    validate_ret_target(cs_sel, &desc, rpl)?;
    if !desc.present() {
        return Err(Exception::NotPresent(cs_sel & !3));
    }

    // Flag restore honors privilege: IOPL only at CPL 0, IF at IOPL.
    let mut mask = flags::CF
        | flags::PF
        | flags::AF
        | flags::ZF
        | flags::SF
        | flags::TF
        | flags::DF
        | flags::OF
        | flags::NT;
    if bits == 32 {
        mask |= flags::AC | flags::ID | flags::RF;
    }
    if cpl == 0 {
        mask |= flags::IOPL_MASK | flags::IF;
    } else if cpl <= state.flags.iopl() {
        mask |= flags::IF;
    }

    if rpl > cpl {
        let new_esp = pop(state, bus, bits)?;
        let new_ss = pop(state, bus, bits)? as u16;
        install_cs(state, cs_sel, &desc, rpl);
        load_segment(state, bus, sr::SS, new_ss)?;
        state.set_esp(new_esp);
        drop_invalid_data_segments(state, rpl);
    } else {
        install_cs(state, cs_sel, &desc, rpl);
    }
    state.flags.set_masked(fl, mask);
    bus.sync(state);
    jump_near(state, i, if bits == 32 { ip } else { ip & 0xFFFF });
    Ok(())
}

// ----------------------------------------------------------------------
// ENTER / LEAVE
// ----------------------------------------------------------------------

pub fn enter<B: CpuBus>(state: &mut CpuState, bus: &mut B, i: &mut Instr) -> Result<(), Exception> {
    let size = fetch_u16(state, bus, i)?;
    let level = fetch_u8(state, bus, i)? & 0x1F;
    let bits = i.op_bits();

    push(state, bus, bits, state.reg(gpr::EBP, bits))?;
    let frame = state.stack_ptr();
    if level > 0 {
        for n in 1..level {
            let off = state
                .reg(gpr::EBP, bits)
                .wrapping_sub(u32::from(n) * (bits / 8));
            let saved = read_mem(state, bus, sr::SS, off, bits)?;
            push(state, bus, bits, saved)?;
        }
        push(state, bus, bits, frame)?;
    }
    state.set_reg(gpr::EBP, bits, frame);
    state.adjust_stack_ptr(-i32::from(size));
    Ok(())
}

pub fn leave<B: CpuBus>(state: &mut CpuState, bus: &mut B, i: &mut Instr) -> Result<(), Exception> {
    let bits = i.op_bits();
    let bp = state.reg(gpr::EBP, bits);
    if state.stack_32() {
        state.set_esp(bp);
    } else {
        state.set_reg16(gpr::ESP, bp as u16);
    }
    let value = pop(state, bus, bits)?;
    state.set_reg(gpr::EBP, bits, value);
    Ok(())
}

// ----------------------------------------------------------------------
// Task switch (32-bit TSS)
// ----------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskEntry {
    Jmp,
    Call,
    Int,
    Iret,
}

mod tss {
    pub const BACKLINK: u32 = 0x00;
    pub const CR3: u32 = 0x1C;
    pub const EIP: u32 = 0x20;
    pub const EFLAGS: u32 = 0x24;
    pub const GPR: u32 = 0x28;
    pub const ES: u32 = 0x48;
    pub const CS: u32 = 0x4C;
    pub const SS: u32 = 0x50;
    pub const DS: u32 = 0x54;
    pub const FS: u32 = 0x58;
    pub const GS: u32 = 0x5C;
    pub const LDT: u32 = 0x60;
    pub const MIN_LIMIT: u32 = 0x67;
}

/// Hardware task switch via a 32-bit TSS. 16-bit TSS types are not carried
/// by this core; period 386+ operating systems use the 32-bit format.
pub fn task_switch<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    i: &mut Instr,
    selector: u16,
    desc: &RawDescriptor,
    entry: TaskEntry,
) -> Result<(), Exception> {
    let sys_type = desc.sys_type();
    let busy_expected = entry == TaskEntry::Iret;
    match sys_type {
        0x9 | 0xB => {}
        0x1 | 0x3 => {
            log::warn!("16-bit TSS task switch requested; not supported");
            return Err(Exception::InvalidTss(selector & !3));
        }
        _ => return Err(Exception::GeneralProtection(selector & !3)),
    }
    if (sys_type & 0x2 != 0) != busy_expected {
        return Err(Exception::GeneralProtection(selector & !3));
    }
    if !desc.present() {
        return Err(Exception::NotPresent(selector & !3));
    }
    if desc.limit() < tss::MIN_LIMIT {
        return Err(Exception::InvalidTss(selector & !3));
    }

    let old_base = state.tr.base;
    let new_base = desc.base();

    // Save outgoing context. The saved EIP is the instruction after the
    // switching instruction (or the faulting one for exceptions; the caller
    // has already set state.eip accordingly).
    let out_eip = if i.jumped { state.eip } else { i.cur };
    bus.write_u32(old_base.wrapping_add(tss::EIP), out_eip)?;
    bus.write_u32(old_base.wrapping_add(tss::EFLAGS), state.flags.get())?;
    for (n, value) in state.gpr.iter().enumerate() {
        bus.write_u32(old_base.wrapping_add(tss::GPR + 4 * n as u32), *value)?;
    }
    for (slot, idx) in [
        (tss::ES, sr::ES),
        (tss::CS, sr::CS),
        (tss::SS, sr::SS),
        (tss::DS, sr::DS),
        (tss::FS, sr::FS),
        (tss::GS, sr::GS),
    ] {
        bus.write_u32(
            old_base.wrapping_add(slot),
            state.segs[idx].selector.into(),
        )?;
    }

    // Clear busy on the outgoing TSS for JMP/IRET.
    if matches!(entry, TaskEntry::Jmp | TaskEntry::Iret) {
        let addr = state
            .gdtr
            .base
            .wrapping_add(u32::from(state.tr.selector & !7))
            + 5;
        let access = bus.read_u8(addr)?;
        bus.write_u8(addr, access & !0x02)?;
    }
    // NT on IRET is cleared in the outgoing image.
    if entry == TaskEntry::Iret {
        let fl = bus.read_u32(old_base.wrapping_add(tss::EFLAGS))?;
        bus.write_u32(old_base.wrapping_add(tss::EFLAGS), fl & !flags::NT)?;
    }

    // Incoming context.
    let new_cr3 = bus.read_u32(new_base.wrapping_add(tss::CR3))?;
    let new_eip = bus.read_u32(new_base.wrapping_add(tss::EIP))?;
    let mut new_flags = bus.read_u32(new_base.wrapping_add(tss::EFLAGS))?;
    let mut new_gpr = [0u32; 8];
    for (n, value) in new_gpr.iter_mut().enumerate() {
        *value = bus.read_u32(new_base.wrapping_add(tss::GPR + 4 * n as u32))?;
    }
    let read_sel = |bus: &mut B, slot: u32| -> Result<u16, Exception> {
        Ok(bus.read_u32(new_base.wrapping_add(slot))? as u16)
    };
    let new_es = read_sel(bus, tss::ES)?;
    let new_cs = read_sel(bus, tss::CS)?;
    let new_ss = read_sel(bus, tss::SS)?;
    let new_ds = read_sel(bus, tss::DS)?;
    let new_fs = read_sel(bus, tss::FS)?;
    let new_gs = read_sel(bus, tss::GS)?;
    let new_ldt = read_sel(bus, tss::LDT)?;

    // Link and mark busy for nesting entries.
    if matches!(entry, TaskEntry::Call | TaskEntry::Int) {
        bus.write_u32(
            new_base.wrapping_add(tss::BACKLINK),
            state.tr.selector.into(),
        )?;
        new_flags |= flags::NT;
    }
    if entry != TaskEntry::Iret {
        let addr = state.gdtr.base.wrapping_add(u32::from(selector & !7)) + 5;
        let access = bus.read_u8(addr)?;
        bus.write_u8(addr, access | 0x02)?;
    }

    // Commit: TR, LDT, CR3, registers, then segments.
    state.tr = crate::state::SystemSeg {
        selector,
        base: new_base,
        limit: desc.limit(),
        access: desc.access() | 0x02,
    };
    state.cr3 = new_cr3;
    bus.flush_tlb();

    if new_ldt & !3 != 0 {
        let ldt_desc = read_descriptor(state, bus, new_ldt & !0x4)?;
        state.ldtr = crate::state::SystemSeg {
            selector: new_ldt,
            base: ldt_desc.base(),
            limit: ldt_desc.limit(),
            access: ldt_desc.access(),
        };
    } else {
        state.ldtr = crate::state::SystemSeg::default();
    }

    state.gpr = new_gpr;
    state.flags.set_all(new_flags);
    state.eip = new_eip;

    if new_flags & flags::VM != 0 {
        for (idx, sel) in [
            (sr::ES, new_es),
            (sr::CS, new_cs),
            (sr::SS, new_ss),
            (sr::DS, new_ds),
            (sr::FS, new_fs),
            (sr::GS, new_gs),
        ] {
            state.segs[idx] = SegmentReg::real_mode(sel);
        }
    } else {
        // CS first so CPL is right for the data-segment checks.
        let cs_desc = read_descriptor(state, bus, new_cs)?;
        if cs_desc.is_system() || cs_desc.access() & 0x08 == 0 {
            return Err(Exception::InvalidTss(new_cs & !3));
        }
        let cpl = (new_cs & 3) as u8;
        install_cs(state, new_cs, &cs_desc, cpl);
        load_segment(state, bus, sr::SS, new_ss).map_err(|_| Exception::InvalidTss(new_ss & !3))?;
        for (idx, sel) in [
            (sr::ES, new_es),
            (sr::DS, new_ds),
            (sr::FS, new_fs),
            (sr::GS, new_gs),
        ] {
            load_segment(state, bus, idx, sel)?;
        }
    }

    i.jumped = true;
    bus.sync(state);
    Ok(())
}
