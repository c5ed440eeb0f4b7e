//! Bookkeeping shared between the execution dispatcher and the block
//! recompiler: the compiled-block cache, per-page version tracking for
//! self-modifying-code invalidation, and the hotness profile that promotes
//! entry points to compilation.

pub mod cache;
pub mod profile;
pub mod runtime;
