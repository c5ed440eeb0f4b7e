//! Virtual-time event scheduling.
//!
//! Two layers:
//!
//! * [`TimerQueue`] — a raw min-heap of `(deadline, payload)` events, ties
//!   broken FIFO. Device models that manage their own re-arm logic push into
//!   this directly.
//! * [`TimerSet`] — handle-based timers with enable/disable and periodic
//!   re-arm, the shape device lifecycles want: a handle is allocated once at
//!   device init and re-armed/disabled for the device's lifetime. A disabled
//!   timer never fires, even when a stale expiration is still queued.

mod queue;
mod set;

pub use queue::{TimerEvent, TimerQueue};
pub use set::{TimerHandle, TimerSet};
