//! Layered physical memory for a PC-compatible machine.
//!
//! The address space is resolved at 4 KiB page granularity through a LUT
//! rebuilt from a stack of mappings: later registrations occlude earlier ones
//! within their extent, and per-page access-mode flags select whether reads
//! and writes are served by internal DRAM, by the external mapping stack
//! (ROM/MMIO), or not at all. Shadow RAM and SMRAM are thin layers over the
//! same access-mode machinery.

mod guest;
mod map;
pub mod shadow;
pub mod smram;

pub use guest::{DenseMemory, GuestMemory, GuestMemoryError, GuestMemoryResult};
pub use map::{
    Backing, MapChange, MappingId, MemAccess, MemoryMap, MmioHandler, PAGE_MASK, PAGE_SHIFT,
    PAGE_SIZE,
};
