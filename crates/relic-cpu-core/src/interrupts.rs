//! External interrupt sampling.

use crate::bus::CpuBus;
use crate::exceptions::Exception;
use crate::interp::control;
use crate::state::CpuState;

/// The PIC pair (or an APIC front) as the CPU sees it.
pub trait InterruptController {
    fn has_pending(&mut self) -> bool;
    /// INTA cycle.
    fn acknowledge(&mut self) -> u8;
}

/// Why the execution loop stopped in a way the machine must handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuExit {
    /// Unrecoverable fault cascade; the machine resets the CPU.
    TripleFault,
}

/// Polls and, if the window is open, delivers one external interrupt.
/// Returns whether a vector was taken.
pub fn poll_external<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    ctrl: &mut impl InterruptController,
) -> Result<bool, CpuExit> {
    if !state.interrupts_open() || !ctrl.has_pending() {
        return Ok(false);
    }
    let vector = ctrl.acknowledge();
    state.halted = false;
    match control::deliver_interrupt(state, bus, vector, control::IntKind::External) {
        Ok(()) => Ok(true),
        Err(e) => {
            handle_exception(state, bus, e)?;
            Ok(true)
        }
    }
}

/// Delivers `exc`, escalating through double fault to a triple-fault exit.
pub fn handle_exception<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    mut exc: Exception,
) -> Result<(), CpuExit> {
    for _ in 0..4 {
        if let Exception::PageFault { addr, .. } = exc {
            state.cr2 = addr;
        }
        match control::deliver_exception(state, bus, exc) {
            Ok(()) => return Ok(()),
            Err(next) => match Exception::escalate(&exc, next) {
                Some(escalated) => exc = escalated,
                None => {
                    log::warn!("triple fault, resetting: {exc:?} then {next:?}");
                    return Err(CpuExit::TripleFault);
                }
            },
        }
    }
    Err(CpuExit::TripleFault)
}
