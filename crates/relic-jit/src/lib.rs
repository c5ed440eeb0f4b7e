//! Block-recompilation fast path.
//!
//! The interpreter is always available and always correct; this tier caches
//! straight-line runs of guest code as validated byte images so repeated
//! execution skips translation and bus-level fetch entirely. Blocks are
//! keyed by entry physical address, guarded by per-page version counters,
//! and fall back to the interpreter for anything the scanner declines to
//! carry (the group-5 PUSH sub-case among them).

mod arena;
mod compiler;
mod runtime;

pub use arena::{ArenaError, CodeArena};
pub use compiler::{scan_block, BlockScan, Terminator, MAX_BLOCK_BYTES, MAX_BLOCK_INSTRUCTIONS};
pub use runtime::{CachedCodeBus, JitConfig, JitRuntime, RunExit};
