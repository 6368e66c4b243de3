//! Synthetic Traffic Generator.
//!
//! A deterministic initiator standing in for a processor. It walks a
//! strided address pattern, turning every `write_interval`-th access into a
//! write, and issues one access per `interval` ticks while fewer than
//! `max_outstanding` responses are owed. Refused requests are held until
//! the peer sends a retry.

use crate::common::{Addr, SimError, SimResult, Tick};
use crate::config::{AccessMode, TrafficConfig};
use crate::mem::packet::{MemCmd, Packet, PacketPtr, PacketResult};
use crate::mem::port::{PeerLink, Port, Status};
use crate::sim::{priority, EventId, EventQueue, FnEvent};
use crate::stats::TrafficStats;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

/// A synthetic memory requester with a single port.
pub struct TrafficGen {
    name: String,
    queue: Rc<EventQueue>,
    config: TrafficConfig,
    port: Rc<TrafficPort>,
    issue_event: EventId,
    /// Accesses accepted downstream so far.
    issued: Cell<u64>,
    outstanding: Cell<usize>,
    running: Cell<bool>,
    /// A request the peer refused, held until it retries.
    retry_pkt: RefCell<Option<PacketPtr>>,
    stats: Cell<TrafficStats>,
}

impl TrafficGen {
    /// Creates a generator. Nothing is issued before [`start`](Self::start).
    pub fn new(name: impl Into<String>, queue: Rc<EventQueue>, config: &TrafficConfig) -> Rc<Self> {
        let name = name.into();
        Rc::new_cyclic(|me: &Weak<TrafficGen>| {
            let owner = me.clone();
            let issue_event = queue.create_event(
                format!("{name}.issue_event"),
                priority::CPU_TICK,
                Box::new(FnEvent::with_description(
                    "traffic issue",
                    move |_q: &EventQueue| match owner.upgrade() {
                        Some(gen) => gen.issue(),
                        None => Ok(()),
                    },
                )),
            );
            Self {
                port: Rc::new(TrafficPort {
                    name: format!("{name}.port"),
                    gen: me.clone(),
                    link: PeerLink::new(),
                }),
                name,
                queue,
                config: config.clone(),
                issue_event,
                issued: Cell::new(0),
                outstanding: Cell::new(0),
                running: Cell::new(false),
                retry_pkt: RefCell::new(None),
                stats: Cell::new(TrafficStats::default()),
            }
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn port(&self) -> Rc<TrafficPort> {
        self.port.clone()
    }

    pub fn issue_event(&self) -> EventId {
        self.issue_event
    }

    pub fn stats(&self) -> TrafficStats {
        self.stats.get()
    }

    /// Accesses accepted downstream so far.
    pub fn issued(&self) -> u64 {
        self.issued.get()
    }

    /// Responses still owed to the generator.
    pub fn outstanding(&self) -> usize {
        self.outstanding.get()
    }

    /// Returns `true` while a refused request waits for a retry.
    pub fn is_waiting_for_retry(&self) -> bool {
        self.retry_pkt.borrow().is_some()
    }

    /// Returns `true` once every access has been issued and answered.
    pub fn is_done(&self) -> bool {
        self.issued.get() >= self.config.count && self.outstanding.get() == 0
    }

    fn bump(&self, f: impl FnOnce(&mut TrafficStats)) {
        let mut s = self.stats.get();
        f(&mut s);
        self.stats.set(s);
    }

    /// Schedules the first access at the current tick.
    pub fn start(&self) -> SimResult<()> {
        self.running.set(true);
        if self.config.count > 0 && !self.queue.is_scheduled(self.issue_event) {
            self.queue.schedule(self.issue_event, self.queue.cur_tick())?;
        }
        Ok(())
    }

    /// Stops issuing new accesses. Outstanding ones still complete.
    pub fn stop(&self) -> SimResult<()> {
        self.running.set(false);
        if self.queue.is_scheduled(self.issue_event) {
            self.queue.deschedule(self.issue_event)?;
        }
        Ok(())
    }

    /// Restores progress from a checkpoint.
    pub fn set_issued(&self, issued: u64) {
        self.issued.set(issued);
    }

    pub fn set_stats(&self, stats: TrafficStats) {
        self.stats.set(stats);
    }

    /// Address of the `n`-th access.
    pub fn address_of(&self, n: u64) -> Addr {
        let span = self.config.span.max(1);
        self.config.start_addr + (n.wrapping_mul(self.config.stride) % span)
    }

    /// Payload written by the `n`-th access, derived from its address.
    pub fn pattern(addr: Addr, size: usize) -> Vec<u8> {
        (0..size).map(|i| (addr as u8).wrapping_add(i as u8)).collect()
    }

    fn build(&self, n: u64) -> PacketPtr {
        let addr = self.address_of(n);
        let size = self.config.size;
        let is_write = self.config.write_interval > 0
            && n % self.config.write_interval == self.config.write_interval - 1;
        let cmd = if is_write { MemCmd::WriteReq } else { MemCmd::ReadReq };
        let pkt = Packet::request(cmd, addr, size, self.queue.cur_tick());
        if is_write {
            pkt.borrow_mut().set_data(Self::pattern(addr, size));
        }
        pkt
    }

    /// Issue event: send the next access.
    fn issue(&self) -> SimResult<()> {
        if self.retry_pkt.borrow().is_some()
            || self.issued.get() >= self.config.count
            || self.outstanding.get() >= self.config.max_outstanding
        {
            return Ok(());
        }

        let pkt = self.build(self.issued.get());
        match self.config.mode {
            AccessMode::Timing => {
                tracing::trace!(target: "traffic", "{}: issuing {}", self.name, pkt.borrow());
                if !self.port.send_timing(pkt.clone())? {
                    tracing::debug!(target: "traffic", "{}: request refused, waiting for retry", self.name);
                    self.bump(|s| s.refused += 1);
                    *self.retry_pkt.borrow_mut() = Some(pkt);
                    return Ok(());
                }
                self.accepted(&pkt);
                self.schedule_next(self.queue.cur_tick() + self.config.interval.max(1))
            }
            AccessMode::Atomic => {
                let latency = self.port.send_atomic(&pkt)?;
                self.accepted(&pkt);
                self.complete(&pkt, latency);
                self.schedule_next(self.queue.cur_tick() + latency.max(self.config.interval).max(1))
            }
        }
    }

    fn accepted(&self, pkt: &PacketPtr) {
        self.issued.set(self.issued.get() + 1);
        let is_write = pkt.borrow().is_write();
        self.bump(|s| {
            s.issued += 1;
            if is_write {
                s.writes += 1;
            } else {
                s.reads += 1;
            }
        });
        if self.config.mode == AccessMode::Timing && pkt.borrow().needs_response() {
            self.outstanding.set(self.outstanding.get() + 1);
        }
    }

    fn complete(&self, pkt: &PacketPtr, latency: Tick) {
        let failed = pkt.borrow().result != PacketResult::Success;
        self.bump(|s| {
            s.completed += 1;
            s.total_latency += latency;
            s.max_latency = s.max_latency.max(latency);
            if failed {
                s.errors += 1;
            }
        });
    }

    fn schedule_next(&self, when: Tick) -> SimResult<()> {
        if self.running.get()
            && self.issued.get() < self.config.count
            && !self.queue.is_scheduled(self.issue_event)
        {
            self.queue.schedule(self.issue_event, when)?;
        }
        Ok(())
    }

    fn recv_response(&self, pkt: PacketPtr) -> SimResult<bool> {
        let latency = self.queue.cur_tick() - pkt.borrow().req().time();
        tracing::trace!(target: "traffic", "{}: {} completed after {} ticks", self.name, pkt.borrow(), latency);
        self.outstanding.set(self.outstanding.get().saturating_sub(1));
        self.complete(&pkt, latency);
        if self.retry_pkt.borrow().is_none() {
            self.schedule_next(self.queue.cur_tick() + 1)?;
        }
        Ok(true)
    }

    fn recv_retry(&self) -> SimResult<()> {
        let held = self.retry_pkt.borrow_mut().take();
        let Some(pkt) = held else {
            return Err(SimError::protocol(&self.name, "retry without a refused request"));
        };
        tracing::debug!(target: "traffic", "{}: retrying {}", self.name, pkt.borrow());
        self.bump(|s| s.retries += 1);
        if !self.port.send_timing(pkt.clone())? {
            *self.retry_pkt.borrow_mut() = Some(pkt);
            return Ok(());
        }
        self.accepted(&pkt);
        self.schedule_next(self.queue.cur_tick() + self.config.interval.max(1))
    }

    /// Reads memory through the generator's port without timing effects.
    pub fn functional_read(&self, addr: Addr, size: usize) -> SimResult<Vec<u8>> {
        let pkt = Packet::request(MemCmd::ReadReq, addr, size, self.queue.cur_tick());
        self.port.send_functional(&pkt)?;
        let p = pkt.borrow();
        Ok(p.data().map_or_else(|| vec![0; size], <[u8]>::to_vec))
    }
}

/// The port of a [`TrafficGen`].
pub struct TrafficPort {
    name: String,
    gen: Weak<TrafficGen>,
    link: PeerLink,
}

impl TrafficPort {
    fn gen(&self) -> SimResult<Rc<TrafficGen>> {
        self.gen
            .upgrade()
            .ok_or_else(|| SimError::protocol(&self.name, "traffic generator was dropped"))
    }
}

impl Port for TrafficPort {
    fn name(&self) -> &str {
        &self.name
    }

    fn peer_link(&self) -> &PeerLink {
        &self.link
    }

    fn recv_timing(&self, pkt: PacketPtr) -> SimResult<bool> {
        if !pkt.borrow().is_response() {
            return Err(SimError::protocol(
                &self.name,
                format!("unexpected request {}", pkt.borrow()),
            ));
        }
        self.gen()?.recv_response(pkt)
    }

    fn recv_atomic(&self, _pkt: &PacketPtr) -> SimResult<Tick> {
        Err(SimError::protocol(&self.name, "requester received an atomic access"))
    }

    fn recv_functional(&self, _pkt: &PacketPtr) -> SimResult<()> {
        Ok(())
    }

    fn recv_status_change(&self, _status: Status) -> SimResult<()> {
        Ok(())
    }

    fn recv_retry(&self) -> SimResult<()> {
        self.gen()?.recv_retry()
    }
}

impl Drop for TrafficGen {
    fn drop(&mut self) {
        let _ = self.queue.release(self.issue_event);
    }
}
