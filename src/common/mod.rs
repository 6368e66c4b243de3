//! Common types shared by every component of the memory-system simulator.
//!
//! This module provides the simulated time base, physical address ranges
//! and the error types used by the scheduler, the interconnect and the
//! caches.

/// Physical addresses and inclusive address ranges.
pub mod addr;

/// Error types for fatal simulation faults and configuration loading.
pub mod error;

pub use addr::{Addr, AddrRange, AddrRangeList};
pub use error::{ConfigError, SimError, SimResult};

/// Simulated time, in ticks.
///
/// Ticks are opaque, monotonically non-decreasing integers. Time only moves
/// forward when the event queue services its earliest event.
pub type Tick = u64;

/// The largest representable tick, used as "run forever".
pub const MAX_TICK: Tick = Tick::MAX;

/// Identifier of a port on an interconnect (its index in the port list).
pub type PortId = usize;
