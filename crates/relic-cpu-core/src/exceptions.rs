//! Architectural exceptions and their delivery classification.

/// A guest fault. These are values, not errors: they travel through
/// `Result` from the memory/decode layers to the dispatch loop, which
/// delivers them through the IDT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exception {
    DivideError,
    Debug,
    Breakpoint,
    Overflow,
    BoundRange,
    InvalidOpcode,
    DeviceNotAvailable,
    DoubleFault,
    InvalidTss(u16),
    NotPresent(u16),
    StackFault(u16),
    GeneralProtection(u16),
    PageFault { addr: u32, error_code: u32 },
    FpuError,
    AlignmentCheck,
    MachineCheck,
    SimdError,
}

impl Exception {
    /// Shorthand for the ubiquitous `#GP(0)`.
    pub fn gp0() -> Self {
        Exception::GeneralProtection(0)
    }

    pub fn vector(&self) -> u8 {
        match self {
            Exception::DivideError => 0,
            Exception::Debug => 1,
            Exception::Breakpoint => 3,
            Exception::Overflow => 4,
            Exception::BoundRange => 5,
            Exception::InvalidOpcode => 6,
            Exception::DeviceNotAvailable => 7,
            Exception::DoubleFault => 8,
            Exception::InvalidTss(_) => 10,
            Exception::NotPresent(_) => 11,
            Exception::StackFault(_) => 12,
            Exception::GeneralProtection(_) => 13,
            Exception::PageFault { .. } => 14,
            Exception::FpuError => 16,
            Exception::AlignmentCheck => 17,
            Exception::MachineCheck => 18,
            Exception::SimdError => 19,
        }
    }

    pub fn error_code(&self) -> Option<u32> {
        match self {
            Exception::DoubleFault => Some(0),
            Exception::InvalidTss(ec)
            | Exception::NotPresent(ec)
            | Exception::StackFault(ec)
            | Exception::GeneralProtection(ec) => Some(u32::from(*ec)),
            Exception::PageFault { error_code, .. } => Some(*error_code),
            Exception::AlignmentCheck => Some(0),
            _ => None,
        }
    }

    /// Contributory exceptions escalate to `#DF` when they collide with the
    /// delivery of another contributory exception or a page fault.
    pub fn is_contributory(&self) -> bool {
        matches!(
            self,
            Exception::DivideError
                | Exception::InvalidTss(_)
                | Exception::NotPresent(_)
                | Exception::StackFault(_)
                | Exception::GeneralProtection(_)
        )
    }

    pub fn is_page_fault(&self) -> bool {
        matches!(self, Exception::PageFault { .. })
    }

    /// Second fault while delivering `first`: either the escalated `#DF` or
    /// (from a double fault) the triple-fault shutdown, reported as `None`.
    pub fn escalate(first: &Exception, second: Exception) -> Option<Exception> {
        if matches!(first, Exception::DoubleFault) {
            return None; // triple fault
        }
        let benign = !(first.is_contributory() || first.is_page_fault());
        if benign {
            return Some(second);
        }
        if second.is_contributory() || (first.is_page_fault() && second.is_page_fault()) {
            Some(Exception::DoubleFault)
        } else {
            Some(second)
        }
    }
}
