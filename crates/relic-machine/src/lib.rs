//! Machine composition and the top-level run loop.
//!
//! A `Machine` owns a composed [`relic_pc_platform::PcPlatform`] behind the
//! CPU bus, the CPU core, the optional block-recompilation tier, and the
//! device registry. Construction is transactional: a machine is fully up or
//! `Machine::new` returns an error with every partially registered device
//! unwound in reverse order.

pub mod config;
mod machine;
pub mod machines;
pub mod nvram;

pub use config::{ConfigStore, ConfigValue};
pub use machine::{Machine, MachineConfig, MachineError, MachineKind, RunExit};
