//! Board-level device models: interrupt and timer chips, DMA, the CMOS RTC,
//! system control ports, a concrete index/data chipset, and the MCA/ISAPnP
//! enumeration fabrics, plus the device-instance registry that machines
//! compose from.
//!
//! Every model is a plain struct with explicit state and a `reset()`;
//! interrupts are raised through [`irq::IrqLine`] handles owned by the
//! platform mediator, never through stored device-to-device pointers.

pub mod a20;
pub mod chipset;
pub mod cmos;
pub mod dma8237;
pub mod irq;
pub mod isapnp;
pub mod mca;
pub mod nmi;
pub mod pic8259;
pub mod pit8254;
pub mod port92;
pub mod post;
pub mod registry;

/// Payloads for the platform's timer queue; one entry per timed device line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceTimer {
    PitChannel0,
    RtcPeriodic,
    RtcSecond,
}
