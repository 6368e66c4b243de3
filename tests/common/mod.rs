//! Shared helpers for the integration tests.

#![allow(dead_code)]

use memsim::common::{AddrRange, SimResult, Tick};
use memsim::mem::{DeviceRanges, PacketPtr, PeerLink, Port, Status};
use memsim::sim::EventQueue;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// A scripted device standing on the far side of a port.
pub struct TestPort {
    pub name: String,
    link: PeerLink,
    ranges: Vec<AddrRange>,
    clock: Option<Rc<EventQueue>>,
    /// Accept timing packets; refuse them when `false`.
    pub accept: Cell<bool>,
    pub received: RefCell<Vec<PacketPtr>>,
    /// Tick of every accepted timing packet, when a clock is attached.
    pub arrivals: RefCell<Vec<Tick>>,
    pub retries: Cell<u32>,
    pub status_changes: Cell<u32>,
    /// Packet resent whenever a retry arrives.
    pub resend: RefCell<Option<PacketPtr>>,
    pub atomic_latency: Tick,
}

impl TestPort {
    pub fn new(name: &str, ranges: Vec<AddrRange>) -> Rc<Self> {
        Rc::new(Self::build(name, ranges, None))
    }

    /// A port recording the tick at which timing packets arrive.
    pub fn timed(name: &str, queue: &Rc<EventQueue>) -> Rc<Self> {
        Rc::new(Self::build(name, Vec::new(), Some(queue.clone())))
    }

    fn build(name: &str, ranges: Vec<AddrRange>, clock: Option<Rc<EventQueue>>) -> Self {
        Self {
            name: name.to_string(),
            link: PeerLink::new(),
            ranges,
            clock,
            accept: Cell::new(true),
            received: RefCell::new(Vec::new()),
            arrivals: RefCell::new(Vec::new()),
            retries: Cell::new(0),
            status_changes: Cell::new(0),
            resend: RefCell::new(None),
            atomic_latency: 7,
        }
    }

    pub fn received_addrs(&self) -> Vec<u64> {
        self.received.borrow().iter().map(|p| p.borrow().addr()).collect()
    }

    pub fn last(&self) -> Option<PacketPtr> {
        self.received.borrow().last().cloned()
    }
}

impl Port for TestPort {
    fn name(&self) -> &str {
        &self.name
    }

    fn peer_link(&self) -> &PeerLink {
        &self.link
    }

    fn recv_timing(&self, pkt: PacketPtr) -> SimResult<bool> {
        if !self.accept.get() {
            return Ok(false);
        }
        if let Some(clock) = &self.clock {
            self.arrivals.borrow_mut().push(clock.cur_tick());
        }
        self.received.borrow_mut().push(pkt);
        Ok(true)
    }

    fn recv_atomic(&self, pkt: &PacketPtr) -> SimResult<Tick> {
        self.received.borrow_mut().push(pkt.clone());
        Ok(self.atomic_latency)
    }

    fn recv_functional(&self, pkt: &PacketPtr) -> SimResult<()> {
        self.received.borrow_mut().push(pkt.clone());
        Ok(())
    }

    fn recv_status_change(&self, _status: Status) -> SimResult<()> {
        self.status_changes.set(self.status_changes.get() + 1);
        Ok(())
    }

    fn recv_retry(&self) -> SimResult<()> {
        self.retries.set(self.retries.get() + 1);
        let resend = self.resend.borrow().clone();
        if let Some(pkt) = resend {
            self.send_timing(pkt)?;
        }
        Ok(())
    }

    fn device_address_ranges(&self) -> SimResult<DeviceRanges> {
        Ok(DeviceRanges {
            resp: self.ranges.clone(),
            snoop: Vec::new(),
        })
    }
}
