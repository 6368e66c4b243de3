//! Discrete-event simulation substrate.
//!
//! The [`EventQueue`] orders every timed activity in the simulated system.
//! Components receive a shared handle to the single queue that drives a
//! simulation when they are constructed, so they all observe the same time
//! base.

/// Event queue checkpointing.
pub mod checkpoint;

/// Events, flags, priorities and the event queue.
pub mod eventq;

/// The simulation loop and exit requests.
pub mod simulate;

pub use checkpoint::{EventCheckpoint, QueueCheckpoint};
pub use eventq::{priority, EventFlags, EventId, EventQueue, FnEvent, PendingEvent, Priority, Process};
pub use simulate::ExitCause;
