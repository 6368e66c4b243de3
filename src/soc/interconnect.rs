//! System Bus Interconnect.
//!
//! This module implements the shared bus, which routes memory transactions
//! between its attached ports based on the address map it learns from the
//! devices behind them. It handles address decoding, explicit-destination
//! forwarding for responses, and contention through the retry protocol.

use crate::common::{Addr, AddrRange, PortId, SimError, SimResult, Tick};
use crate::mem::packet::{Dest, PacketPtr};
use crate::mem::port::{DeviceRanges, PeerLink, Port, Status};
use crate::stats::BusStats;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

/// An entry of the bus address map.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DevMap {
    /// Port the range is reachable through.
    pub port_id: PortId,
    /// The address range.
    pub range: AddrRange,
}

/// Shared interconnect routing transactions by address range.
///
/// The bus owns its ports. Each port announces `RangeChange` when the
/// addresses reachable through it change; the bus then re-queries that
/// port's peer and tells every other port about the change.
pub struct Bus {
    name: String,
    bus_id: u32,
    interfaces: RefCell<Vec<Rc<BusPort>>>,
    port_list: RefCell<Vec<DevMap>>,
    retry_list: RefCell<VecDeque<PortId>>,
    stats: Cell<BusStats>,
}

impl Bus {
    /// Creates a new bus with no ports attached.
    ///
    /// # Arguments
    ///
    /// * `name` - Name used for ports and diagnostics
    /// * `bus_id` - A globally unique bus id
    pub fn new(name: impl Into<String>, bus_id: u32) -> Rc<Self> {
        Rc::new(Self {
            name: name.into(),
            bus_id,
            interfaces: RefCell::new(Vec::new()),
            port_list: RefCell::new(Vec::new()),
            retry_list: RefCell::new(VecDeque::new()),
            stats: Cell::new(BusStats::default()),
        })
    }

    /// Bus name, also the prefix of its port names.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Numeric identifier given at construction.
    pub fn bus_id(&self) -> u32 {
        self.bus_id
    }

    /// Creates and attaches a new port, named `<bus>-p<N>`.
    pub fn get_port(self: &Rc<Self>) -> Rc<BusPort> {
        let mut interfaces = self.interfaces.borrow_mut();
        let id = interfaces.len();
        let port = Rc::new(BusPort {
            name: format!("{}-p{}", self.name, id),
            id,
            bus: Rc::downgrade(self),
            link: PeerLink::new(),
        });
        interfaces.push(port.clone());
        port
    }

    /// Number of attached ports.
    pub fn num_ports(&self) -> usize {
        self.interfaces.borrow().len()
    }

    /// Snapshot of the address map.
    pub fn port_list(&self) -> Vec<DevMap> {
        self.port_list.borrow().clone()
    }

    /// Ports currently waiting for a retry, oldest first.
    pub fn retry_list(&self) -> Vec<PortId> {
        self.retry_list.borrow().iter().copied().collect()
    }

    /// A copy of the bus counters.
    pub fn stats(&self) -> BusStats {
        self.stats.get()
    }

    fn bump(&self, f: impl FnOnce(&mut BusStats)) {
        let mut s = self.stats.get();
        f(&mut s);
        self.stats.set(s);
    }

    fn interface(&self, id: PortId) -> SimResult<Rc<BusPort>> {
        let interfaces = self.interfaces.borrow();
        interfaces
            .get(id)
            .cloned()
            .ok_or_else(|| SimError::BadPortIndex {
                component: self.name.clone(),
                port: id,
                count: interfaces.len(),
            })
    }

    /// Asks every attached device for its ranges.
    pub fn init(&self) -> SimResult<()> {
        let interfaces: Vec<Rc<BusPort>> = self.interfaces.borrow().clone();
        for port in interfaces {
            port.send_status_change(Status::RangeChange)?;
        }
        Ok(())
    }

    /// Routes a timing packet that entered through port `pkt.src()`.
    ///
    /// Broadcast packets are routed by address; packets with an explicit
    /// destination are forwarded directly. If the destination refuses the
    /// packet, the originating port is queued for a retry.
    pub fn recv_timing(&self, pkt: PacketPtr) -> SimResult<bool> {
        let (src, dest, addr) = {
            let p = pkt.borrow();
            tracing::debug!(target: "bus", "{}: recvTiming: packet src {:?} dest {:?} addr {:#x} cmd {}", self.name, p.src(), p.dest(), p.addr(), p.cmd);
            (self.source_of(&p)?, p.dest(), p.addr())
        };

        let port = match dest {
            Dest::Broadcast => self.find_port(addr, src)?,
            Dest::Port(dest) => {
                let port = self.interface(dest)?;
                if dest == src {
                    return Err(SimError::RoutingLoop {
                        component: self.name.clone(),
                        port: src,
                        addr,
                    });
                }
                port
            }
        };

        if port.send_timing(pkt)? {
            self.bump(|s| s.timing_packets += 1);
            return Ok(true);
        }

        tracing::debug!(target: "bus", "{}: port {} refused packet, port {} waits for retry", self.name, port.id, src);
        self.bump(|s| s.rejections += 1);
        self.retry_list.borrow_mut().push_back(src);
        Ok(false)
    }

    /// One of the attached ports can accept packets again.
    ///
    /// Every port queued when the call starts is sent one retry, in the
    /// order the rejections happened. Ports refused again during this pass
    /// are queued behind and wait for the next one.
    pub fn recv_retry(&self, id: PortId) -> SimResult<()> {
        let initial_size = self.retry_list.borrow().len();
        tracing::debug!(target: "bus", "{}: recvRetry from port {}, {} waiting", self.name, id, initial_size);
        for _ in 0..initial_size {
            let Some(waiting) = self.retry_list.borrow_mut().pop_front() else {
                break;
            };
            self.bump(|s| s.retries += 1);
            self.interface(waiting)?.send_retry()?;
        }
        Ok(())
    }

    /// Finds the port owning `addr`.
    ///
    /// # Arguments
    ///
    /// * `addr` - The address to decode
    /// * `id` - The port the packet came from; it must not be the answer
    pub fn find_port(&self, addr: Addr, id: PortId) -> SimResult<Rc<BusPort>> {
        let dest_id = self
            .port_list
            .borrow()
            .iter()
            .find(|dm| dm.range.contains(addr))
            .map(|dm| dm.port_id)
            .ok_or_else(|| SimError::UnmappedAddress {
                bus: self.name.clone(),
                addr,
            })?;
        tracing::trace!(target: "bus", "{}:   found addr {:#x} on device {}", self.name, addr, dest_id);

        if dest_id == id {
            return Err(SimError::RoutingLoop {
                component: self.name.clone(),
                port: id,
                addr,
            });
        }
        self.interface(dest_id)
    }

    /// Routes an atomic access by address and returns its latency.
    pub fn recv_atomic(&self, pkt: &PacketPtr) -> SimResult<Tick> {
        let (src, addr) = self.broadcast_only(pkt, "recvAtomic")?;
        self.bump(|s| s.atomic_accesses += 1);
        self.find_port(addr, src)?.send_atomic(pkt)
    }

    /// Routes a functional access by address.
    pub fn recv_functional(&self, pkt: &PacketPtr) -> SimResult<()> {
        let (src, addr) = self.broadcast_only(pkt, "recvFunctional")?;
        self.bump(|s| s.functional_accesses += 1);
        self.find_port(addr, src)?.send_functional(pkt)
    }

    fn broadcast_only(&self, pkt: &PacketPtr, what: &str) -> SimResult<(PortId, Addr)> {
        let p = pkt.borrow();
        tracing::debug!(target: "bus", "{}: {}: packet src {:?} dest {:?} addr {:#x} cmd {}", self.name, what, p.src(), p.dest(), p.addr(), p.cmd);
        if p.dest() != Dest::Broadcast {
            return Err(SimError::protocol(
                &self.name,
                format!("{what} with explicit destination {:?}", p.dest()),
            ));
        }
        Ok((self.source_of(&p)?, p.addr()))
    }

    fn source_of(&self, p: &crate::mem::packet::Packet) -> SimResult<PortId> {
        p.src()
            .ok_or_else(|| SimError::protocol(&self.name, format!("packet without source: {p}")))
    }

    /// Rebuilds the address map entries of port `id` and propagates the
    /// change to every other port.
    pub fn recv_status_change(&self, status: Status, id: PortId) -> SimResult<()> {
        let Status::RangeChange = status;
        tracing::debug!(target: "bus_ranges", "{}: received RangeChange from device id {}", self.name, id);

        let port = self.interface(id)?;
        self.port_list.borrow_mut().retain(|dm| dm.port_id != id);

        let ranges = port.peer_address_ranges()?;
        if !ranges.snoop.is_empty() {
            return Err(SimError::protocol(
                &self.name,
                format!("port {id} announced snoop ranges, which the bus does not support"),
            ));
        }

        {
            let mut port_list = self.port_list.borrow_mut();
            for range in ranges.resp {
                if let Some(clash) = port_list.iter().find(|dm| dm.range.intersects(&range)) {
                    return Err(SimError::OverlappingRanges {
                        bus: self.name.clone(),
                        port: id,
                        range,
                        owner: clash.port_id,
                        existing: clash.range,
                    });
                }
                tracing::debug!(target: "bus_ranges", "{}: Adding range {} for id {}", self.name, range, id);
                port_list.push(DevMap { port_id: id, range });
            }
            tracing::debug!(target: "bus_ranges", "{}: port list has {} entries", self.name, port_list.len());
        }

        // The announcing device already knows.
        let others: Vec<Rc<BusPort>> = self
            .interfaces
            .borrow()
            .iter()
            .filter(|p| p.id != id)
            .cloned()
            .collect();
        for other in others {
            other.send_status_change(Status::RangeChange)?;
        }
        Ok(())
    }

    /// Every known range except those reachable through port `id`.
    pub fn address_ranges(&self, id: PortId) -> DeviceRanges {
        let resp = self
            .port_list
            .borrow()
            .iter()
            .filter(|dm| dm.port_id != id)
            .map(|dm| dm.range)
            .collect();
        DeviceRanges {
            resp,
            snoop: Vec::new(),
        }
    }
}

/// A port of the [`Bus`].
///
/// Packets entering through a bus port are stamped with the port's id as
/// their source before routing.
pub struct BusPort {
    name: String,
    id: PortId,
    bus: Weak<Bus>,
    link: PeerLink,
}

impl BusPort {
    /// Index of this port on its bus.
    pub fn id(&self) -> PortId {
        self.id
    }

    fn bus(&self) -> SimResult<Rc<Bus>> {
        self.bus
            .upgrade()
            .ok_or_else(|| SimError::protocol(&self.name, "bus was dropped"))
    }
}

impl Port for BusPort {
    fn name(&self) -> &str {
        &self.name
    }

    fn peer_link(&self) -> &PeerLink {
        &self.link
    }

    fn recv_timing(&self, pkt: PacketPtr) -> SimResult<bool> {
        pkt.borrow_mut().set_src(self.id);
        self.bus()?.recv_timing(pkt)
    }

    fn recv_atomic(&self, pkt: &PacketPtr) -> SimResult<Tick> {
        pkt.borrow_mut().set_src(self.id);
        self.bus()?.recv_atomic(pkt)
    }

    fn recv_functional(&self, pkt: &PacketPtr) -> SimResult<()> {
        pkt.borrow_mut().set_src(self.id);
        self.bus()?.recv_functional(pkt)
    }

    fn recv_status_change(&self, status: Status) -> SimResult<()> {
        self.bus()?.recv_status_change(status, self.id)
    }

    fn recv_retry(&self) -> SimResult<()> {
        self.bus()?.recv_retry(self.id)
    }

    fn device_address_ranges(&self) -> SimResult<DeviceRanges> {
        Ok(self.bus()?.address_ranges(self.id))
    }
}
