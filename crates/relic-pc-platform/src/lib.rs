//! The wired PC fabric: memory layout, the canonical port map, interrupt
//! and timer plumbing, and the adapter that presents it all to the CPU core
//! as a paged linear-address bus.

mod adapters;
mod cpu_bus;
mod platform;

pub use cpu_bus::PcCpuBus;
pub use platform::{PcPlatform, PcPlatformConfig};
