//! Memory-system components below the cache: the bus and the memories,
//! plus the builder wiring a complete system together.

/// Construction and wiring of a complete system.
pub mod builder;

/// The shared bus routing transactions by address range.
pub mod interconnect;

/// Physical memory devices and their latency models.
pub mod memory;

pub use builder::{System, SystemCheckpoint};
pub use interconnect::{Bus, BusPort, DevMap};
pub use memory::{MemoryCheckpoint, PhysicalMemory};
