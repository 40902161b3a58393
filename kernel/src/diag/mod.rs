//! Kernel diagnostics
//!
//! Counters here are purely observational; nothing in the kernel branches on
//! their values.

pub mod counters;

pub use counters::{snapshot, Counter};
