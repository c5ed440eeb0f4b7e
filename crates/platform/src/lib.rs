//! Host-facing fabric shared by every machine: the port-I/O bus, the reset
//! event plumbing, the inter-thread primitives used by auxiliary (audio,
//! present, input) threads, and the fire-and-forget UI sinks.

pub mod io;
pub mod reset;
pub mod sync;
pub mod ui;
