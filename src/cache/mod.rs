//! Cache Timing Engine.
//!
//! The cache is split in two. [`BaseCache`] owns everything that is common
//! to every cache model: the two ports, admission control through blocking
//! causes, pacing of bus requests, time-ordered response delivery, and the
//! drain barrier. What happens to an access (hit, miss, coalescing,
//! replacement) is decided by a [`MissHandler`] plugged into it.
//!
//! [`MissQueue`] is the miss handler shipped with the crate: a store with
//! no replacement in front of a fixed pool of miss status holding
//! registers (MSHRs).

pub mod base;
pub mod miss_queue;
pub mod port;

pub use base::{BaseCache, BlockedCause, CacheCheckpoint, DrainState, RequestCause};
pub use miss_queue::MissQueue;
pub use port::CachePort;

use crate::common::{Addr, SimResult, Tick};
use crate::mem::packet::PacketPtr;

/// Identifies the miss-tracking entry a downstream request belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MissHandle(pub usize);

/// The policy half of a cache.
///
/// The [`BaseCache`] calls into its handler with the handler mutably
/// borrowed. A handler may call back into the cache it is given (to block,
/// request the bus, or respond), and may send atomic or functional packets
/// through the cache's memory-side port, but must never send timing packets
/// itself; those leave through the cache's request events.
pub trait MissHandler {
    /// Returns `true` if the block holding `addr` is present.
    fn in_cache(&self, addr: Addr) -> bool;

    /// Returns `true` if a miss for the block holding `addr` is outstanding.
    fn in_miss_queue(&self, addr: Addr) -> bool;

    /// The next request to send downstream, if any.
    ///
    /// The request stays owned by the handler until [`send_result`]
    /// reports that it was accepted.
    ///
    /// [`send_result`]: MissHandler::send_result
    fn get_packet(&mut self) -> Option<(PacketPtr, MissHandle)>;

    /// The next snoop-originated request to send upstream, if any.
    fn get_coherence_packet(&mut self) -> Option<(PacketPtr, MissHandle)> {
        None
    }

    /// Reports whether the packet from [`get_packet`] was accepted.
    ///
    /// [`get_packet`]: MissHandler::get_packet
    fn send_result(
        &mut self,
        cache: &BaseCache,
        pkt: &PacketPtr,
        handle: MissHandle,
        success: bool,
    ) -> SimResult<()>;

    /// Reports whether the packet from [`get_coherence_packet`] was accepted.
    ///
    /// [`get_coherence_packet`]: MissHandler::get_coherence_packet
    fn send_coherence_result(
        &mut self,
        _cache: &BaseCache,
        _pkt: &PacketPtr,
        _handle: MissHandle,
        _success: bool,
    ) -> SimResult<()> {
        Ok(())
    }

    /// Handles a timing packet that arrived on one of the cache's ports.
    fn do_timing_access(
        &mut self,
        cache: &BaseCache,
        pkt: PacketPtr,
        is_cpu_side: bool,
    ) -> SimResult<bool>;

    /// Handles an atomic access and returns its latency.
    fn do_atomic_access(
        &mut self,
        cache: &BaseCache,
        pkt: &PacketPtr,
        is_cpu_side: bool,
    ) -> SimResult<Tick>;

    /// Handles a functional access.
    fn do_functional_access(
        &mut self,
        cache: &BaseCache,
        pkt: &PacketPtr,
        is_cpu_side: bool,
    ) -> SimResult<()>;
}
