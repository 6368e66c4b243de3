//! Discrete-Event Memory System Simulator Library.
//!
//! This crate implements an event-driven simulator for a memory hierarchy. A
//! single event queue advances simulated time; components exchange packets
//! through bound ports using the timing, atomic and functional protocols.
//!
//! # Architecture
//!
//! * **Scheduler**: Tick-ordered event queue with priorities, squashing,
//!   checkpointing and an exit-driven simulation loop.
//! * **Transport**: Packets, requests, ports and time-ordered transmit lists.
//! * **Interconnect**: An address-routed bus that learns its map from the
//!   devices attached to it and arbitrates with retries.
//! * **Cache**: A blocking/draining timing engine with a pluggable miss
//!   handler.
//!
//! # Modules
//!
//! * `common`: Shared types, time base, address ranges and errors.
//! * `config`: Configuration loading and validation.
//! * `sim`: Event queue, simulation loop and checkpoints.
//! * `mem`: Packets, ports and transmit lists.
//! * `soc`: Bus, memories and the system builder.
//! * `cache`: Cache timing engine and miss handling.
//! * `cpu`: Traffic generators.
//! * `stats`: Statistics collection and reporting.

/// Shared types, constants and error handling.
///
/// Provides the tick time base, physical address ranges, and the error
/// types returned by every fallible operation in the simulator.
pub mod common;

/// Configuration system for traffic, cache, bus and memory settings.
///
/// Loads and validates TOML configuration files describing the simulated
/// system.
pub mod config;

/// Discrete-event scheduling.
///
/// Implements the event queue, the simulation loop and event checkpoints.
pub mod sim;

/// Memory transactions and the port protocols that carry them.
pub mod mem;

/// System components below the cache, and the system builder.
///
/// Implements the bus interconnect and physical memories, and wires them
/// together with a cache and a traffic generator into a runnable system.
pub mod soc;

/// Cache timing engine.
///
/// Handles blocking, bus request pacing, response delivery and draining,
/// with hit and miss decisions delegated to a miss handler.
pub mod cache;

/// Memory traffic sources.
pub mod cpu;

/// Performance statistics collection and reporting.
///
/// Tracks per-component counters and prints an end-of-run report.
pub mod stats;
