//! Simulation Errors.
//!
//! Every error in this module is fatal to the simulated run: the simulated
//! topology or a collaborator violated the protocol, and the binary reports
//! the diagnostic and exits. Contention and resource exhaustion are not
//! errors; they are handled by the retry protocol and by blocking causes.

use super::{Addr, AddrRange, PortId, Tick};
use thiserror::Error;

/// Result alias used throughout the simulator.
pub type SimResult<T> = Result<T, SimError>;

/// Fatal simulation faults.
#[derive(Debug, Error)]
pub enum SimError {
    /// No attached device claims the address of a broadcast packet.
    #[error("{bus}: unable to find destination for addr {addr:#x}")]
    UnmappedAddress {
        /// Name of the routing bus.
        bus: String,
        /// The offending address.
        addr: Addr,
    },

    /// Two ports announced overlapping address ranges.
    #[error("{bus}: range {range} of port {port} overlaps range {existing} of port {owner}")]
    OverlappingRanges {
        /// Name of the routing bus.
        bus: String,
        /// Port announcing the new range.
        port: PortId,
        /// The newly announced range.
        range: AddrRange,
        /// Port already owning the conflicting range.
        owner: PortId,
        /// The conflicting range.
        existing: AddrRange,
    },

    /// A packet named a destination port that does not exist.
    #[error("{component}: destination port {port} out of bounds ({count} ports)")]
    BadPortIndex {
        /// Name of the routing component.
        component: String,
        /// Requested port index.
        port: PortId,
        /// Number of attached ports.
        count: usize,
    },

    /// A packet would have been sent back to the port it came from.
    #[error("{component}: packet for addr {addr:#x} routed back to its source port {port}")]
    RoutingLoop {
        /// Name of the routing component.
        component: String,
        /// Source (and would-be destination) port.
        port: PortId,
        /// Packet address.
        addr: Addr,
    },

    /// A port was used before being bound to a peer.
    #[error("{port}: port is not connected")]
    Unconnected {
        /// Name of the unbound port.
        port: String,
    },

    /// A port was bound twice.
    #[error("{port}: port is already connected")]
    AlreadyConnected {
        /// Name of the port.
        port: String,
    },

    /// An event was scheduled while already pending.
    #[error("event {name} is already scheduled for tick {when}")]
    AlreadyScheduled {
        /// Event name.
        name: String,
        /// Tick it is pending for.
        when: Tick,
    },

    /// An event was scheduled before the current tick.
    #[error("event {name} scheduled for tick {when}, before current tick {now}")]
    ScheduleInPast {
        /// Event name.
        name: String,
        /// Requested tick.
        when: Tick,
        /// Current tick.
        now: Tick,
    },

    /// A stale or foreign event handle was used.
    #[error("unknown event handle {0}")]
    UnknownEvent(usize),

    /// `service_one` was called on an empty queue.
    #[error("event queue {0} is empty")]
    EmptyQueue(String),

    /// A collaborator broke the port/packet protocol.
    #[error("{component}: {message}")]
    Protocol {
        /// Component that detected the violation.
        component: String,
        /// Description of the violation.
        message: String,
    },

    /// A checkpoint could not be written or restored.
    #[error("checkpoint: {0}")]
    Checkpoint(String),

    /// An event action failed; the run cannot continue.
    #[error("tick {tick}: event {event}: {source}")]
    EventFailed {
        /// Tick at which the event fired.
        tick: Tick,
        /// Name of the failing event.
        event: String,
        /// Underlying fault.
        #[source]
        source: Box<SimError>,
    },
}

impl SimError {
    /// Builds a [`SimError::Protocol`] for `component`.
    pub fn protocol(component: impl Into<String>, message: impl Into<String>) -> Self {
        SimError::Protocol {
            component: component.into(),
            message: message.into(),
        }
    }

    /// Returns the innermost error, looking through [`SimError::EventFailed`].
    pub fn root_cause(&self) -> &SimError {
        match self {
            SimError::EventFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

/// Errors raised while loading a simulator configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config {path}: {source}")]
    Io {
        /// Path of the configuration file.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid TOML for [`crate::config::Config`].
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of its legal domain.
    #[error("invalid config value for {field}: {reason}")]
    Invalid {
        /// Dotted name of the offending field.
        field: &'static str,
        /// Why it was rejected.
        reason: String,
    },
}
