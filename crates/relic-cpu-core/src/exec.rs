//! The execution driver: single-step and cycle-budgeted batches, with SMI
//! and external-interrupt sampling at instruction boundaries.

use crate::bus::CpuBus;
use crate::cpuid::CpuModel;
use crate::interp::{self, StepOutcome};
use crate::interrupts::{handle_exception, poll_external, CpuExit, InterruptController};
use crate::smm;
use crate::state::CpuState;

/// The CPU plus its boundary-sampled pins.
pub struct CpuCore {
    pub state: CpuState,
    smi_pending: bool,
    nmi_pending: bool,
}

impl CpuCore {
    pub fn new(model: CpuModel) -> Self {
        Self {
            state: CpuState::new(model),
            smi_pending: false,
            nmi_pending: false,
        }
    }

    pub fn reset(&mut self) {
        self.state.reset();
        self.smi_pending = false;
        self.nmi_pending = false;
    }

    /// Level-asserted SMI pin; sampled at the next boundary.
    pub fn request_smi(&mut self) {
        self.smi_pending = true;
    }

    pub fn request_nmi(&mut self) {
        self.nmi_pending = true;
    }

    pub fn in_smm(&self) -> bool {
        self.state.in_smm
    }

    /// True when an SMI or NMI is waiting to be sampled at the next
    /// instruction boundary.
    pub fn pending_boundary_events(&self) -> bool {
        (self.smi_pending && !self.state.in_smm) || self.nmi_pending
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchExit {
    /// Cycle budget exhausted.
    Completed,
    /// HLT with interrupts unable to wake us this slice.
    Halted,
    /// Triple fault; the machine resets.
    TripleFault,
}

#[derive(Debug, Clone, Copy)]
pub struct BatchResult {
    pub exit: BatchExit,
    pub instructions: u64,
}

/// Executes one instruction, delivering any fault it raises.
pub fn step_one<B: CpuBus>(cpu: &mut CpuCore, bus: &mut B) -> Result<StepOutcome, CpuExit> {
    // The STI/MOV-SS shadows cover exactly one instruction: one set before
    // this step expires when the step completes, one set *by* this step
    // survives into the next boundary.
    let shadow = cpu.state.inhibit;
    match interp::step(&mut cpu.state, bus) {
        Ok(outcome) => {
            if shadow.sti_shadow {
                cpu.state.inhibit.sti_shadow = false;
            }
            if shadow.mov_ss_shadow {
                cpu.state.inhibit.mov_ss_shadow = false;
            }
            Ok(outcome)
        }
        Err(exc) => {
            // Faults restart the instruction: EIP stays at the boundary.
            cpu.state.retire_inhibit();
            handle_exception(&mut cpu.state, bus, exc)?;
            Ok(StepOutcome::Normal)
        }
    }
}

/// Samples SMI/NMI and the PIC at an instruction boundary.
fn sample_events<B: CpuBus>(
    cpu: &mut CpuCore,
    bus: &mut B,
    ctrl: &mut impl InterruptController,
) -> Result<(), CpuExit> {
    if cpu.smi_pending && !cpu.state.in_smm {
        cpu.smi_pending = false;
        if let Err(exc) = smm::enter_smm(&mut cpu.state, bus) {
            handle_exception(&mut cpu.state, bus, exc)?;
        }
        return Ok(());
    }
    if cpu.nmi_pending {
        cpu.nmi_pending = false;
        cpu.state.halted = false;
        if let Err(exc) =
            crate::interp::control::deliver_interrupt(&mut cpu.state, bus, 2, crate::interp::control::IntKind::External)
        {
            handle_exception(&mut cpu.state, bus, exc)?;
        }
        return Ok(());
    }
    poll_external(&mut cpu.state, bus, ctrl)?;
    Ok(())
}

/// Runs until the cycle pool drains, the CPU halts with nothing pending, or
/// a triple fault ends the world. `cycles` funds `state.cycles`; device
/// timers are the caller's business between batches.
pub fn run_batch<B: CpuBus>(
    cpu: &mut CpuCore,
    bus: &mut B,
    ctrl: &mut impl InterruptController,
    cycles: i64,
) -> BatchResult {
    cpu.state.cycles = cycles;
    let mut instructions = 0u64;

    loop {
        if let Err(CpuExit::TripleFault) = sample_events(cpu, bus, ctrl) {
            return BatchResult {
                exit: BatchExit::TripleFault,
                instructions,
            };
        }
        if cpu.state.halted {
            return BatchResult {
                exit: BatchExit::Halted,
                instructions,
            };
        }
        match step_one(cpu, bus) {
            Ok(StepOutcome::Halted) => {
                return BatchResult {
                    exit: BatchExit::Halted,
                    instructions: instructions + 1,
                }
            }
            Ok(StepOutcome::Normal) => instructions += 1,
            Err(CpuExit::TripleFault) => {
                return BatchResult {
                    exit: BatchExit::TripleFault,
                    instructions,
                }
            }
        }
        if cpu.state.cycles <= 0 {
            return BatchResult {
                exit: BatchExit::Completed,
                instructions,
            };
        }
    }
}

/// A controller with nothing to say; for bare-CPU tests.
#[derive(Default)]
pub struct NoInterrupts;

impl InterruptController for NoInterrupts {
    fn has_pending(&mut self) -> bool {
        false
    }

    fn acknowledge(&mut self) -> u8 {
        0xFF
    }
}
