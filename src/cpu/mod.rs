//! Requesters.
//!
//! Components that originate memory traffic. The simulator drives its
//! memory system with a synthetic generator rather than a processor model.

pub mod traffic;

pub use traffic::{TrafficGen, TrafficPort};
