//! Ports.
//!
//! A port is a named endpoint bound to exactly one peer port at wiring time.
//! Sending on a port calls the matching receive method of its peer, so the
//! three transport protocols are plain calls:
//!
//! * **Timing**: [`Port::send_timing`] returns `Ok(false)` when the peer is
//!   busy. The sender must hold the packet until its own
//!   [`Port::recv_retry`] is called.
//! * **Atomic**: [`Port::send_atomic`] completes synchronously and returns
//!   the latency of the access. It is never refused.
//! * **Functional**: [`Port::send_functional`] reads or writes immediately
//!   with no timing effects. It is never refused.
//!
//! Ports hold only a weak reference to their peer; the components that own
//! the ports keep them alive.

use super::packet::PacketPtr;
use crate::common::{AddrRangeList, SimError, SimResult, Tick};
use std::cell::RefCell;
use std::rc::{Rc, Weak};

/// Status notifications exchanged between peers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    /// The set of addresses reachable through the sender changed.
    RangeChange,
}

/// The address ranges a device responds to and snoops on.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceRanges {
    /// Ranges the device responds to.
    pub resp: AddrRangeList,
    /// Ranges the device wants to snoop.
    pub snoop: AddrRangeList,
}

/// Weak binding to a peer port.
#[derive(Default)]
pub struct PeerLink {
    peer: RefCell<Option<Weak<dyn Port>>>,
}

impl PeerLink {
    /// Creates an unbound link.
    pub fn new() -> Self {
        Self::default()
    }

    /// The bound peer, if it is still alive.
    pub fn get(&self) -> Option<Rc<dyn Port>> {
        self.peer.borrow().as_ref().and_then(Weak::upgrade)
    }

    /// Returns `true` once the link is bound.
    pub fn is_bound(&self) -> bool {
        self.peer.borrow().is_some()
    }

    fn bind(&self, peer: Weak<dyn Port>) {
        *self.peer.borrow_mut() = Some(peer);
    }
}

/// A transaction endpoint.
///
/// Implementors provide the receive side; the send side is provided in terms
/// of the peer's receive methods.
pub trait Port {
    /// Name of the port, for diagnostics.
    fn name(&self) -> &str;

    /// The link to this port's peer.
    fn peer_link(&self) -> &PeerLink;

    /// Receives a timing packet. `Ok(false)` rejects it; the sender will be
    /// told to retry later.
    fn recv_timing(&self, pkt: PacketPtr) -> SimResult<bool>;

    /// Receives an atomic packet and returns the access latency.
    fn recv_atomic(&self, pkt: &PacketPtr) -> SimResult<Tick>;

    /// Receives a functional packet.
    fn recv_functional(&self, pkt: &PacketPtr) -> SimResult<()>;

    /// Receives a status notification from the peer.
    fn recv_status_change(&self, status: Status) -> SimResult<()>;

    /// The peer is ready to accept a previously rejected timing packet.
    fn recv_retry(&self) -> SimResult<()> {
        Err(SimError::protocol(self.name(), "unexpected retry"))
    }

    /// Address ranges reachable through this port.
    fn device_address_ranges(&self) -> SimResult<DeviceRanges> {
        Ok(DeviceRanges::default())
    }

    /// Block size of the device behind this port, 0 if it has none.
    fn device_block_size(&self) -> SimResult<usize> {
        Ok(0)
    }

    /// The bound peer.
    fn peer(&self) -> SimResult<Rc<dyn Port>> {
        self.peer_link().get().ok_or_else(|| SimError::Unconnected {
            port: self.name().to_string(),
        })
    }

    /// Sends a timing packet to the peer.
    fn send_timing(&self, pkt: PacketPtr) -> SimResult<bool> {
        self.peer()?.recv_timing(pkt)
    }

    /// Sends an atomic packet to the peer.
    fn send_atomic(&self, pkt: &PacketPtr) -> SimResult<Tick> {
        self.peer()?.recv_atomic(pkt)
    }

    /// Sends a functional packet to the peer.
    fn send_functional(&self, pkt: &PacketPtr) -> SimResult<()> {
        self.peer()?.recv_functional(pkt)
    }

    /// Notifies the peer of a status change.
    fn send_status_change(&self, status: Status) -> SimResult<()> {
        self.peer()?.recv_status_change(status)
    }

    /// Tells the peer it may resend a rejected packet.
    fn send_retry(&self) -> SimResult<()> {
        self.peer()?.recv_retry()
    }

    /// Address ranges reachable through the peer.
    fn peer_address_ranges(&self) -> SimResult<DeviceRanges> {
        self.peer()?.device_address_ranges()
    }

    /// Block size of the device behind the peer.
    fn peer_block_size(&self) -> SimResult<usize> {
        self.peer()?.device_block_size()
    }
}

/// Binds two ports to each other.
///
/// Binding a port that already has a peer is a configuration fault.
pub fn connect<A, B>(a: &Rc<A>, b: &Rc<B>) -> SimResult<()>
where
    A: Port + 'static,
    B: Port + 'static,
{
    if a.peer_link().is_bound() {
        return Err(SimError::AlreadyConnected {
            port: a.name().to_string(),
        });
    }
    if b.peer_link().is_bound() {
        return Err(SimError::AlreadyConnected {
            port: b.name().to_string(),
        });
    }
    let a_dyn: Rc<dyn Port> = a.clone();
    let b_dyn: Rc<dyn Port> = b.clone();
    a.peer_link().bind(Rc::downgrade(&b_dyn));
    b.peer_link().bind(Rc::downgrade(&a_dyn));
    tracing::debug!(target: "port", "connected {} <-> {}", a.name(), b.name());
    Ok(())
}
