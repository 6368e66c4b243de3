//! Physical Memory.
//!
//! A memory device answering for one contiguous address range. Accesses are
//! applied to the backing store when they arrive; the access latency chosen
//! by the [`MemoryController`] only decides when the timing response leaves
//! the device. Pending responses wait in a [`TransmitList`].

pub mod controller;

use crate::common::{AddrRange, SimError, SimResult, Tick};
use crate::mem::packet::{Packet, PacketPtr, PacketResult};
use crate::mem::port::{DeviceRanges, PeerLink, Port, Status};
use crate::mem::transmit::{TransmitList, Wakeup};
use crate::sim::{priority, EventId, EventQueue, FnEvent};
use crate::stats::MemoryStats;
use controller::MemoryController;
use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};

const PAGE_SIZE: u64 = 4096;

/// Sparse byte store, allocated a page at a time on first write.
#[derive(Default)]
struct Backing {
    pages: HashMap<u64, Box<[u8]>>,
}

impl Backing {
    fn read(&self, offset: u64, buf: &mut [u8]) {
        for (i, byte) in buf.iter_mut().enumerate() {
            let a = offset + i as u64;
            *byte = self
                .pages
                .get(&(a / PAGE_SIZE))
                .map_or(0, |p| p[(a % PAGE_SIZE) as usize]);
        }
    }

    fn write(&mut self, offset: u64, data: &[u8]) {
        for (i, &byte) in data.iter().enumerate() {
            let a = offset + i as u64;
            let page = self
                .pages
                .entry(a / PAGE_SIZE)
                .or_insert_with(|| vec![0; PAGE_SIZE as usize].into_boxed_slice());
            page[(a % PAGE_SIZE) as usize] = byte;
        }
    }
}

/// Contents and counters of a memory.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MemoryCheckpoint {
    pub name: String,
    /// Written pages as `(page number, bytes)`, in page order.
    pub pages: Vec<(u64, Vec<u8>)>,
    pub stats: MemoryStats,
}

/// A memory device on the bus.
pub struct PhysicalMemory {
    name: String,
    queue: Rc<EventQueue>,
    range: AddrRange,
    store: RefCell<Backing>,
    controller: RefCell<Box<dyn MemoryController>>,
    port: Rc<MemoryPort>,
    transmit: RefCell<TransmitList>,
    send_event: EventId,
    /// Responses that may be queued before new requests are refused.
    max_outstanding: Option<usize>,
    must_send_retry: Cell<bool>,
    waiting_on_retry: Cell<bool>,
    stats: Cell<MemoryStats>,
}

impl PhysicalMemory {
    /// Creates a memory device.
    ///
    /// # Arguments
    ///
    /// * `name` - Name for the device and its port
    /// * `queue` - The simulation's event queue
    /// * `range` - Address range the device answers for
    /// * `controller` - Latency model
    /// * `max_outstanding` - Refuse requests while this many responses are queued
    pub fn new(
        name: impl Into<String>,
        queue: Rc<EventQueue>,
        range: AddrRange,
        controller: Box<dyn MemoryController>,
        max_outstanding: Option<usize>,
    ) -> Rc<Self> {
        let name = name.into();
        Rc::new_cyclic(|me: &Weak<PhysicalMemory>| {
            let owner = me.clone();
            let send_event = queue.create_event(
                format!("{name}.send_event"),
                priority::DEFAULT,
                Box::new(FnEvent::with_description(
                    "memory response",
                    move |_q: &EventQueue| match owner.upgrade() {
                        Some(mem) => mem.send_responses(),
                        None => Ok(()),
                    },
                )),
            );
            Self {
                port: Rc::new(MemoryPort {
                    name: format!("{name}.port"),
                    memory: me.clone(),
                    link: PeerLink::new(),
                }),
                name,
                queue,
                range,
                store: RefCell::new(Backing::default()),
                controller: RefCell::new(controller),
                transmit: RefCell::new(TransmitList::new()),
                send_event,
                max_outstanding,
                must_send_retry: Cell::new(false),
                waiting_on_retry: Cell::new(false),
                stats: Cell::new(MemoryStats::default()),
            }
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The device's single port.
    pub fn port(&self) -> Rc<MemoryPort> {
        self.port.clone()
    }

    pub fn send_event(&self) -> EventId {
        self.send_event
    }

    pub fn range(&self) -> AddrRange {
        self.range
    }

    pub fn stats(&self) -> MemoryStats {
        self.stats.get()
    }

    /// Announces the device's range to whatever its port is bound to.
    pub fn init(&self) -> SimResult<()> {
        if !self.port.peer_link().is_bound() {
            return Err(SimError::Unconnected {
                port: self.port.name.clone(),
            });
        }
        self.port.send_status_change(Status::RangeChange)
    }

    /// Captures the device contents. No response may be in flight.
    pub fn serialize(&self) -> SimResult<MemoryCheckpoint> {
        if !self.transmit.borrow().is_empty() {
            return Err(SimError::Checkpoint(format!(
                "{} has {} responses in flight",
                self.name,
                self.outstanding()
            )));
        }
        let store = self.store.borrow();
        let mut pages: Vec<(u64, Vec<u8>)> = store
            .pages
            .iter()
            .map(|(&n, page)| (n, page.to_vec()))
            .collect();
        pages.sort_unstable_by_key(|(n, _)| *n);
        Ok(MemoryCheckpoint {
            name: self.name.clone(),
            pages,
            stats: self.stats(),
        })
    }

    /// Replaces the device contents with a checkpoint's.
    pub fn unserialize(&self, cp: &MemoryCheckpoint) -> SimResult<()> {
        if cp.name != self.name {
            return Err(SimError::Checkpoint(format!(
                "checkpoint of {} cannot restore {}",
                cp.name, self.name
            )));
        }
        let mut store = self.store.borrow_mut();
        store.pages.clear();
        for (n, bytes) in &cp.pages {
            if bytes.len() != PAGE_SIZE as usize {
                return Err(SimError::Checkpoint(format!(
                    "{}: page {n} holds {} bytes",
                    self.name,
                    bytes.len()
                )));
            }
            store.pages.insert(*n, bytes.clone().into_boxed_slice());
        }
        self.stats.set(cp.stats);
        Ok(())
    }

    /// Number of responses waiting to leave the device.
    pub fn outstanding(&self) -> usize {
        self.transmit.borrow().len()
    }

    fn bump(&self, f: impl FnOnce(&mut MemoryStats)) {
        let mut s = self.stats.get();
        f(&mut s);
        self.stats.set(s);
    }

    /// Offset of the packet into the device, if it lies entirely inside.
    fn offset_of(&self, p: &Packet) -> Option<u64> {
        let last = p.addr().saturating_add((p.size() as u64).saturating_sub(1));
        (self.range.contains(p.addr()) && self.range.contains(last))
            .then(|| p.addr() - self.range.start)
    }

    /// Applies an access to the backing store and returns its latency.
    ///
    /// Accesses falling outside the device's range are answered with
    /// `BadAddress`.
    fn do_access(&self, pkt: &PacketPtr) -> Tick {
        let mut p = pkt.borrow_mut();
        let Some(offset) = self.offset_of(&p) else {
            tracing::warn!(target: "memory", "{}: access outside {}: {}", self.name, self.range, p);
            p.result = PacketResult::BadAddress;
            return 0;
        };
        let addr = p.addr();
        let size = p.size() as u64;
        if p.is_read() {
            let mut buf = vec![0; p.size()];
            self.store.borrow().read(offset, &mut buf);
            p.set_data(buf);
            self.bump(|s| {
                s.reads += 1;
                s.bytes_read += size;
            });
        } else if p.is_write() {
            if let Some(data) = p.data() {
                self.store.borrow_mut().write(offset, data);
            }
            self.bump(|s| {
                s.writes += 1;
                s.bytes_written += size;
            });
        }
        if p.result == PacketResult::Unknown {
            p.result = PacketResult::Success;
        }
        self.controller.borrow_mut().access_latency(addr)
    }

    fn recv_timing(&self, pkt: PacketPtr) -> SimResult<bool> {
        let queued = self.transmit.borrow().len();
        if self.max_outstanding.is_some_and(|max| queued >= max) {
            tracing::debug!(target: "memory", "{}: {} responses outstanding, refusing {}", self.name, queued, pkt.borrow());
            self.must_send_retry.set(true);
            self.bump(|s| s.refused += 1);
            return Ok(false);
        }

        let latency = self.do_access(&pkt);
        if !pkt.borrow().needs_response() {
            return Ok(true);
        }

        pkt.borrow_mut().make_timing_response()?;
        let when = self.queue.cur_tick() + latency;
        tracing::trace!(target: "memory", "{}: response {} ready @ {}", self.name, pkt.borrow(), when);
        let wakeup = self.transmit.borrow_mut().push(when, pkt);
        match wakeup {
            Wakeup::Schedule(t) if !self.waiting_on_retry.get() => {
                self.queue.schedule(self.send_event, t)?
            }
            Wakeup::Reschedule(t) if !self.waiting_on_retry.get() => {
                self.queue.reschedule(self.send_event, t)?
            }
            _ => {}
        }
        Ok(true)
    }

    /// Sends the response at the front of the transmit list.
    fn send_responses(&self) -> SimResult<()> {
        let front = self.transmit.borrow().front();
        let Some(pkt) = front else {
            return Ok(());
        };

        if !self.port.send_timing(pkt)? {
            tracing::debug!(target: "memory", "{}: response refused, waiting for retry", self.name);
            self.waiting_on_retry.set(true);
            return Ok(());
        }
        self.transmit.borrow_mut().pop_front();

        let next = self.transmit.borrow().front_tick();
        if let Some(t) = next {
            let when = t.max(self.queue.cur_tick() + 1);
            self.queue.reschedule(self.send_event, when)?;
        }

        if self.must_send_retry.get()
            && self
                .max_outstanding
                .map_or(true, |max| self.transmit.borrow().len() < max)
        {
            self.must_send_retry.set(false);
            self.port.send_retry()?;
        }
        Ok(())
    }

    fn recv_retry(&self) -> SimResult<()> {
        if !self.waiting_on_retry.replace(false) {
            return Err(SimError::protocol(&self.name, "retry without a refused response"));
        }
        self.send_responses()
    }

    fn recv_atomic(&self, pkt: &PacketPtr) -> SimResult<Tick> {
        let latency = self.do_access(pkt);
        if pkt.borrow().needs_response() {
            pkt.borrow_mut().make_atomic_response()?;
        }
        Ok(latency)
    }

    fn recv_functional(&self, pkt: &PacketPtr) -> SimResult<()> {
        for in_flight in self.transmit.borrow().packets() {
            pkt.borrow_mut().fix_functional(&mut in_flight.borrow_mut());
        }

        let mut p = pkt.borrow_mut();
        let Some(offset) = self.offset_of(&p) else {
            p.result = PacketResult::BadAddress;
            return Ok(());
        };
        if p.is_read() {
            let mut buf = vec![0; p.size()];
            self.store.borrow().read(offset, &mut buf);
            p.set_data(buf);
        } else if p.is_write() {
            if let Some(data) = p.data() {
                self.store.borrow_mut().write(offset, data);
            }
        }
        if p.needs_response() {
            p.make_atomic_response()?;
        }
        Ok(())
    }
}

/// The port of a [`PhysicalMemory`].
pub struct MemoryPort {
    name: String,
    memory: Weak<PhysicalMemory>,
    link: PeerLink,
}

impl MemoryPort {
    fn memory(&self) -> SimResult<Rc<PhysicalMemory>> {
        self.memory
            .upgrade()
            .ok_or_else(|| SimError::protocol(&self.name, "memory was dropped"))
    }
}

impl Port for MemoryPort {
    fn name(&self) -> &str {
        &self.name
    }

    fn peer_link(&self) -> &PeerLink {
        &self.link
    }

    fn recv_timing(&self, pkt: PacketPtr) -> SimResult<bool> {
        self.memory()?.recv_timing(pkt)
    }

    fn recv_atomic(&self, pkt: &PacketPtr) -> SimResult<Tick> {
        self.memory()?.recv_atomic(pkt)
    }

    fn recv_functional(&self, pkt: &PacketPtr) -> SimResult<()> {
        self.memory()?.recv_functional(pkt)
    }

    /// Memory has a fixed range; it ignores range changes.
    fn recv_status_change(&self, _status: Status) -> SimResult<()> {
        Ok(())
    }

    fn recv_retry(&self) -> SimResult<()> {
        self.memory()?.recv_retry()
    }

    fn device_address_ranges(&self) -> SimResult<DeviceRanges> {
        Ok(DeviceRanges {
            resp: vec![self.memory()?.range],
            snoop: Vec::new(),
        })
    }
}
