//! String operations with REP/REPE/REPNE.
//!
//! Repetition runs inside the handler but re-checks the cycle budget so a
//! huge REP MOVS cannot stall the scheduler; an interrupted run leaves
//! ECX/ESI/EDI mid-count and re-enters at the same instruction, exactly as
//! hardware resumes.

use crate::bus::CpuBus;
use crate::exceptions::Exception;
use crate::flags::FlagKind;
use crate::state::{gpr, seg as sr, CpuState};

use super::{read_mem, write_mem, Instr, Rep};

/// Per-slice cap on REP iterations before control returns to the scheduler.
const REP_CHUNK: u32 = 4096;

struct StrCtx {
    bits: u32,
    step: i32,
    addr32: bool,
}

impl StrCtx {
    fn new(state: &CpuState, i: &Instr, opcode: u8) -> Self {
        let bits = if opcode & 1 == 0 { 8 } else { i.op_bits() };
        let step = if state.flags.df() {
            -((bits / 8) as i32)
        } else {
            (bits / 8) as i32
        };
        Self {
            bits,
            step,
            addr32: i.addrsize32,
        }
    }

    fn index(&self, state: &CpuState, reg: usize) -> u32 {
        if self.addr32 {
            state.reg32(reg)
        } else {
            state.reg16(reg).into()
        }
    }

    fn advance(&self, state: &mut CpuState, reg: usize) {
        if self.addr32 {
            state.set_reg32(reg, state.reg32(reg).wrapping_add(self.step as u32));
        } else {
            state.set_reg16(reg, state.reg16(reg).wrapping_add(self.step as u16));
        }
    }

    fn count(&self, state: &CpuState) -> u32 {
        if self.addr32 {
            state.reg32(gpr::ECX)
        } else {
            state.reg16(gpr::ECX).into()
        }
    }

    fn dec_count(&self, state: &mut CpuState) {
        if self.addr32 {
            state.set_reg32(gpr::ECX, state.reg32(gpr::ECX).wrapping_sub(1));
        } else {
            state.set_reg16(gpr::ECX, state.reg16(gpr::ECX).wrapping_sub(1));
        }
    }
}

/// Drives one string primitive under the optional REP prefix. The closure
/// returns `Some(zf)` for the compare ops so REPE/REPNE can terminate.
fn rep_loop<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    i: &mut Instr,
    ctx: &StrCtx,
    mut unit: impl FnMut(&mut CpuState, &mut B, &StrCtx) -> Result<Option<bool>, Exception>,
) -> Result<(), Exception> {
    let Some(rep) = i.rep else {
        unit(state, bus, ctx)?;
        return Ok(());
    };
    let mut executed = 0u32;
    loop {
        if ctx.count(state) == 0 {
            return Ok(());
        }
        let zf = unit(state, bus, ctx)?;
        ctx.dec_count(state);
        executed += 1;
        i.extra_cycles = i.extra_cycles.saturating_add(2);
        if let Some(zf) = zf {
            let stop = match rep {
                Rep::Repe => !zf,
                Rep::Repne => zf,
            };
            if stop {
                return Ok(());
            }
        }
        if executed >= REP_CHUNK && ctx.count(state) != 0 {
            // Yield: rewind EIP so the instruction re-enters.
            state.eip = i.start_eip;
            i.jumped = true;
            return Ok(());
        }
    }
}

pub fn movs<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    i: &mut Instr,
    opcode: u8,
) -> Result<(), Exception> {
    let ctx = StrCtx::new(state, i, opcode);
    let src_seg = i.data_seg();
    rep_loop(state, bus, i, &ctx, move |state, bus, ctx| {
        let value = read_mem(state, bus, src_seg, ctx.index(state, gpr::ESI), ctx.bits)?;
        write_mem(state, bus, sr::ES, ctx.index(state, gpr::EDI), ctx.bits, value)?;
        ctx.advance(state, gpr::ESI);
        ctx.advance(state, gpr::EDI);
        Ok(None)
    })
}

pub fn stos<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    i: &mut Instr,
    opcode: u8,
) -> Result<(), Exception> {
    let ctx = StrCtx::new(state, i, opcode);
    rep_loop(state, bus, i, &ctx, |state, bus, ctx| {
        let value = state.reg(gpr::EAX, ctx.bits);
        write_mem(state, bus, sr::ES, ctx.index(state, gpr::EDI), ctx.bits, value)?;
        ctx.advance(state, gpr::EDI);
        Ok(None)
    })
}

pub fn lods<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    i: &mut Instr,
    opcode: u8,
) -> Result<(), Exception> {
    let ctx = StrCtx::new(state, i, opcode);
    let src_seg = i.data_seg();
    rep_loop(state, bus, i, &ctx, move |state, bus, ctx| {
        let value = read_mem(state, bus, src_seg, ctx.index(state, gpr::ESI), ctx.bits)?;
        state.set_reg(gpr::EAX, ctx.bits, value);
        ctx.advance(state, gpr::ESI);
        Ok(None)
    })
}

pub fn scas<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    i: &mut Instr,
    opcode: u8,
) -> Result<(), Exception> {
    let ctx = StrCtx::new(state, i, opcode);
    rep_loop(state, bus, i, &ctx, |state, bus, ctx| {
        let b = read_mem(state, bus, sr::ES, ctx.index(state, gpr::EDI), ctx.bits)?;
        let a = state.reg(gpr::EAX, ctx.bits);
        let m = if ctx.bits == 32 {
            u32::MAX
        } else {
            (1 << ctx.bits) - 1
        };
        let r = a.wrapping_sub(b) & m;
        state.flags.record(FlagKind::Sub, ctx.bits, a, b, r);
        ctx.advance(state, gpr::EDI);
        Ok(Some(r == 0))
    })
}

pub fn cmps<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    i: &mut Instr,
    opcode: u8,
) -> Result<(), Exception> {
    let ctx = StrCtx::new(state, i, opcode);
    let src_seg = i.data_seg();
    rep_loop(state, bus, i, &ctx, move |state, bus, ctx| {
        let a = read_mem(state, bus, src_seg, ctx.index(state, gpr::ESI), ctx.bits)?;
        let b = read_mem(state, bus, sr::ES, ctx.index(state, gpr::EDI), ctx.bits)?;
        let m = if ctx.bits == 32 {
            u32::MAX
        } else {
            (1 << ctx.bits) - 1
        };
        let r = a.wrapping_sub(b) & m;
        state.flags.record(FlagKind::Sub, ctx.bits, a, b, r);
        ctx.advance(state, gpr::ESI);
        ctx.advance(state, gpr::EDI);
        Ok(Some(r == 0))
    })
}

pub fn ins<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    i: &mut Instr,
    opcode: u8,
) -> Result<(), Exception> {
    super::sys::check_io_permission(state, bus, state.reg16(gpr::EDX), 1)?;
    let ctx = StrCtx::new(state, i, opcode);
    rep_loop(state, bus, i, &ctx, |state, bus, ctx| {
        let port = state.reg16(gpr::EDX);
        let value = bus.io_read(port, (ctx.bits / 8) as u8);
        write_mem(state, bus, sr::ES, ctx.index(state, gpr::EDI), ctx.bits, value)?;
        ctx.advance(state, gpr::EDI);
        Ok(None)
    })
}

pub fn outs<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    i: &mut Instr,
    opcode: u8,
) -> Result<(), Exception> {
    super::sys::check_io_permission(state, bus, state.reg16(gpr::EDX), 1)?;
    let ctx = StrCtx::new(state, i, opcode);
    let src_seg = i.data_seg();
    rep_loop(state, bus, i, &ctx, move |state, bus, ctx| {
        let value = read_mem(state, bus, src_seg, ctx.index(state, gpr::ESI), ctx.bits)?;
        let port = state.reg16(gpr::EDX);
        bus.io_write(port, (ctx.bits / 8) as u8, value);
        ctx.advance(state, gpr::ESI);
        Ok(None)
    })
}
