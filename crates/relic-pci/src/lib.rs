//! PCI configuration fabric: per-function config spaces with
//! writable/reserved masks, the bus/slot table, both legacy configuration
//! mechanisms, and INTx-to-ISA-IRQ steering.

mod config;
mod host;
mod routing;

pub use config::{PciBarDefinition, PciCommand, PciConfigSpace, PciDevice};
pub use host::{
    ConfigMech1Io, ConfigMech2Io, PciBus, PciHost, PCI_CFG_ADDR_PORT, PCI_CFG_DATA_PORT,
    RESET_CTRL_PORT, RESET_CTRL_RESET_VALUE,
};
pub use routing::{IntxPin, IntxRouter, SlotKind};

/// Bus/device/function address of one PCI function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PciBdf {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl PciBdf {
    pub fn new(bus: u8, device: u8, function: u8) -> Self {
        debug_assert!(device < 32 && function < 8);
        Self {
            bus,
            device,
            function,
        }
    }
}
