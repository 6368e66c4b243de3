//! Cache Ports.
//!
//! Each cache has a CPU-side port facing its requesters and a memory-side
//! port facing the next level. A port owns three events:
//!
//! * a **request event** that sends the next bus request (memory side) or
//!   coherence request (CPU side), re-arming itself one tick later while
//!   more are pending;
//! * a **response event** that delivers the front of the transmit list;
//! * a **retry event** that tells the peer to resend a request refused
//!   while the port was blocked.
//!
//! Responses the peer refuses move to the port's drain list and are resent
//! before anything else once the peer retries.

use super::base::BaseCache;
use crate::common::{SimError, SimResult, Tick};
use crate::mem::packet::{flags, PacketPtr, PacketResult};
use crate::mem::port::{DeviceRanges, PeerLink, Port, Status};
use crate::mem::transmit::{TransmitList, Wakeup};
use crate::sim::{priority, EventId, EventQueue, FnEvent};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

/// A port of a [`BaseCache`].
pub struct CachePort {
    name: String,
    is_cpu_side: bool,
    cache: Weak<BaseCache>,
    queue: Rc<EventQueue>,
    link: PeerLink,
    blocked: Cell<bool>,
    must_send_retry: Cell<bool>,
    waiting_on_retry: Cell<bool>,
    drain_list: RefCell<VecDeque<PacketPtr>>,
    transmit: RefCell<TransmitList>,
    request_event: EventId,
    response_event: EventId,
    retry_event: EventId,
}

impl CachePort {
    pub(super) fn new(
        name: String,
        is_cpu_side: bool,
        cache: Weak<BaseCache>,
        queue: Rc<EventQueue>,
    ) -> Rc<Self> {
        Rc::new_cyclic(|me: &Weak<CachePort>| {
            let event = |suffix: &str, description: &'static str, f: fn(&CachePort) -> SimResult<()>| {
                let me = me.clone();
                queue.create_event(
                    format!("{name}.{suffix}"),
                    priority::DEFAULT,
                    Box::new(FnEvent::with_description(description, move |_q: &EventQueue| {
                        match me.upgrade() {
                            Some(port) => f(&port),
                            None => Ok(()),
                        }
                    })),
                )
            };
            let request_event = event("request_event", "cache request", CachePort::process_request);
            let response_event = event("response_event", "cache response", CachePort::process_response);
            let retry_event = event("retry_event", "cache retry", CachePort::process_retry);

            Self {
                name,
                is_cpu_side,
                cache,
                queue: queue.clone(),
                link: PeerLink::new(),
                blocked: Cell::new(false),
                must_send_retry: Cell::new(false),
                waiting_on_retry: Cell::new(false),
                drain_list: RefCell::new(VecDeque::new()),
                transmit: RefCell::new(TransmitList::new()),
                request_event,
                response_event,
                retry_event,
            }
        })
    }

    fn cache(&self) -> SimResult<Rc<BaseCache>> {
        self.cache
            .upgrade()
            .ok_or_else(|| SimError::protocol(&self.name, "cache was dropped"))
    }

    /// Whether this port faces the requesters.
    pub fn is_cpu_side(&self) -> bool {
        self.is_cpu_side
    }

    /// Requests arriving now are refused.
    pub fn is_blocked(&self) -> bool {
        self.blocked.get()
    }

    /// A request was refused while blocked; the peer is owed a retry.
    pub fn must_send_retry(&self) -> bool {
        self.must_send_retry.get()
    }

    /// The peer refused a packet from this port and has not retried yet.
    pub fn waiting_on_retry(&self) -> bool {
        self.waiting_on_retry.get()
    }

    /// Number of refused responses waiting to be resent.
    pub fn drain_len(&self) -> usize {
        self.drain_list.borrow().len()
    }

    /// Delivery ticks of the queued responses, front to back.
    pub fn transmit_ticks(&self) -> Vec<Tick> {
        self.transmit.borrow().ticks()
    }

    /// Sends queued bus or coherence requests.
    pub fn request_event(&self) -> EventId {
        self.request_event
    }

    /// Delivers the front of the transmit list.
    pub fn response_event(&self) -> EventId {
        self.response_event
    }

    /// Tells the peer to resend a refused request.
    pub fn retry_event(&self) -> EventId {
        self.retry_event
    }

    pub(super) fn events(&self) -> [EventId; 3] {
        [self.request_event, self.response_event, self.retry_event]
    }

    pub(super) fn set_blocked(&self) {
        tracing::debug!(target: "cache_port", "{}: blocking", self.name);
        self.blocked.set(true);
    }

    /// Unblocks the port. A requester refused while blocked is sent its
    /// retry from an event at the current tick.
    pub(super) fn clear_blocked(&self) -> SimResult<()> {
        tracing::debug!(target: "cache_port", "{}: unblocking", self.name);
        self.blocked.set(false);
        if self.must_send_retry.replace(false) && !self.queue.is_scheduled(self.retry_event) {
            tracing::debug!(target: "cache_port", "{}: sending retry", self.name);
            self.queue.schedule(self.retry_event, self.queue.cur_tick())?;
        }
        Ok(())
    }

    /// Nothing is left to deliver through this port.
    pub fn can_drain(&self) -> bool {
        self.drain_list.borrow().is_empty() && self.transmit.borrow().is_empty()
    }

    /// Arms the request event for `when`, moving it earlier if it is
    /// already pending for a later tick.
    pub(super) fn arm_request(&self, when: Tick) -> SimResult<()> {
        match self.queue.when(self.request_event) {
            None => self.queue.schedule(self.request_event, when),
            Some(pending) if when < pending => self.queue.reschedule(self.request_event, when),
            Some(_) => Ok(()),
        }
    }

    /// Queues a response for delivery at `time`.
    pub(super) fn queue_response(&self, pkt: PacketPtr, time: Tick) -> SimResult<()> {
        let wakeup = self.transmit.borrow_mut().push(time, pkt);
        match wakeup {
            Wakeup::Schedule(t) => self.queue.schedule(self.response_event, t),
            Wakeup::Reschedule(t) => self.queue.reschedule(self.response_event, t),
            Wakeup::Unchanged => Ok(()),
        }
    }

    fn has_more_requests(&self, cache: &BaseCache) -> bool {
        !self.drain_list.borrow().is_empty()
            || if self.is_cpu_side {
                cache.do_slave_request()
            } else {
                cache.do_master_request()
            }
    }

    /// Sends the head of the drain list. Returns whether it was accepted.
    fn send_drain_head(&self) -> SimResult<bool> {
        let head = self.drain_list.borrow().front().cloned();
        let Some(pkt) = head else {
            return Ok(false);
        };
        tracing::debug!(target: "cache_port", "{}: trying to drain a response", self.name);
        if !self.send_timing(pkt)? {
            return Ok(false);
        }
        self.drain_list.borrow_mut().pop_front();
        Ok(true)
    }

    /// Asks the miss handler for the next request and sends it.
    ///
    /// Returns whether a request was sent and accepted.
    fn send_from_handler(&self, cache: &BaseCache) -> SimResult<bool> {
        let next = if self.is_cpu_side {
            cache.backend().get_coherence_packet()
        } else {
            cache.backend().get_packet()
        };
        let Some((pkt, handle)) = next else {
            // An outstanding request was withdrawn before we got the bus.
            self.waiting_on_retry.set(false);
            return Ok(false);
        };

        tracing::debug!(target: "cache_port", "{}: sending {}", self.name, pkt.borrow());
        let success = self.send_timing(pkt.clone())?;
        self.waiting_on_retry.set(!success);
        if !success {
            tracing::debug!(target: "cache_port", "{}: now waiting on a retry", self.name);
        }
        if self.is_cpu_side {
            cache
                .backend()
                .send_coherence_result(cache, &pkt, handle, success)?;
        } else {
            cache.backend().send_result(cache, &pkt, handle, success)?;
        }
        Ok(success)
    }

    /// Request event: drain refused responses first, then issue requests.
    fn process_request(&self) -> SimResult<()> {
        if self.waiting_on_retry.get() {
            return Ok(());
        }
        let cache = self.cache()?;

        if !self.drain_list.borrow().is_empty() {
            if self.send_drain_head()? {
                tracing::debug!(target: "cache_port", "{}: drained a response", self.name);
                if self.has_more_requests(&cache) {
                    self.arm_request(self.queue.cur_tick() + 1)?;
                }
            } else {
                self.waiting_on_retry.set(true);
                tracing::debug!(target: "cache_port", "{}: now waiting on a retry", self.name);
            }
            return Ok(());
        }

        let pending = if self.is_cpu_side {
            cache.do_slave_request()
        } else {
            cache.do_master_request()
        };
        if !pending {
            return Ok(());
        }
        if self.send_from_handler(&cache)? && self.has_more_requests(&cache) {
            self.arm_request(self.queue.cur_tick() + 1)?;
        }
        Ok(())
    }

    /// Response event: send the front of the transmit list.
    fn process_response(&self) -> SimResult<()> {
        let now = self.queue.cur_tick();
        let (pkt, next) = {
            let mut transmit = self.transmit.borrow_mut();
            let Some((_, pkt)) = transmit.pop_front() else {
                return Ok(());
            };
            (pkt, transmit.front_tick())
        };
        if let Some(t) = next {
            self.queue.reschedule(self.response_event, t.max(now + 1))?;
        }

        {
            let mut p = pkt.borrow_mut();
            p.result = if p.flags & flags::NACKED_LINE != 0 {
                PacketResult::Nacked
            } else if p.result == PacketResult::BadAddress {
                PacketResult::BadAddress
            } else {
                PacketResult::Success
            };
            p.make_timing_response()?;
        }

        tracing::debug!(target: "cache_port", "{}: attempting to send a response", self.name);
        if !self.drain_list.borrow().is_empty() || self.waiting_on_retry.get() {
            tracing::debug!(target: "cache_port", "{}: appending response onto drain list", self.name);
            self.drain_list.borrow_mut().push_back(pkt);
        } else if !self.send_timing(pkt.clone())? {
            tracing::debug!(target: "cache_port", "{}: now waiting for a retry", self.name);
            self.drain_list.borrow_mut().push_back(pkt);
            self.waiting_on_retry.set(true);
        }

        if self.can_drain() {
            self.cache()?.check_drain();
        }
        Ok(())
    }

    fn process_retry(&self) -> SimResult<()> {
        self.send_retry()
    }

    /// Reconciles a functional access with the responses this port still
    /// holds. Returns `false` once the access is fully satisfied.
    pub fn check_functional(&self, pkt: &PacketPtr) -> bool {
        let drain = self.drain_list.borrow();
        let transmit = self.transmit.borrow();
        for target in drain.iter().chain(transmit.packets()) {
            if Rc::ptr_eq(target, pkt) {
                continue;
            }
            let satisfied = pkt.borrow_mut().fix_functional(&mut target.borrow_mut());
            if satisfied {
                return false;
            }
        }
        true
    }

    /// Checks held responses, then forwards the functional access to the
    /// peer if it is not yet satisfied.
    pub fn check_and_send_functional(&self, pkt: &PacketPtr) -> SimResult<()> {
        if self.check_functional(pkt) {
            self.send_functional(pkt)?;
        }
        Ok(())
    }
}

impl Port for CachePort {
    fn name(&self) -> &str {
        &self.name
    }

    fn peer_link(&self) -> &PeerLink {
        &self.link
    }

    fn recv_timing(&self, pkt: PacketPtr) -> SimResult<bool> {
        {
            let mut p = pkt.borrow_mut();
            // Upgrades and invalidates need no response once they get here.
            if self.is_cpu_side
                && !p.req().is_uncacheable()
                && p.is_invalidate()
                && !p.is_read()
                && !p.is_write()
            {
                tracing::debug!(target: "cache", "{}: {} {:#x} satisfied on arrival", self.name, p.cmd, p.addr());
                if p.is_satisfied() {
                    return Err(SimError::protocol(
                        &self.name,
                        format!("{p} was already satisfied"),
                    ));
                }
                p.flags |= flags::SATISFIED;
                return Ok(true);
            }
            if p.is_request() && self.blocked.get() {
                tracing::debug!(target: "cache", "{}: scheduling a retry while blocked", self.name);
                self.must_send_retry.set(true);
                return Ok(false);
            }
        }
        let cache = self.cache()?;
        let accepted = cache
            .backend()
            .do_timing_access(&cache, pkt, self.is_cpu_side)?;
        Ok(accepted)
    }

    fn recv_atomic(&self, pkt: &PacketPtr) -> SimResult<Tick> {
        let cache = self.cache()?;
        let latency = cache
            .backend()
            .do_atomic_access(&cache, pkt, self.is_cpu_side)?;
        Ok(latency)
    }

    fn recv_functional(&self, pkt: &PacketPtr) -> SimResult<()> {
        if !self.check_functional(pkt) {
            return Ok(());
        }
        let cache = self.cache()?;
        cache
            .backend()
            .do_functional_access(&cache, pkt, self.is_cpu_side)?;
        Ok(())
    }

    fn recv_status_change(&self, status: Status) -> SimResult<()> {
        self.cache()?.recv_status_change(status, self.is_cpu_side)
    }

    /// The peer can take the packet it refused: resend the oldest refused
    /// response, or reissue the pending request.
    fn recv_retry(&self) -> SimResult<()> {
        if !self.waiting_on_retry.get() {
            return Err(SimError::protocol(&self.name, "retry while not waiting on one"));
        }
        let cache = self.cache()?;

        if !self.drain_list.borrow().is_empty() {
            tracing::debug!(target: "cache_port", "{}: retrying response ({} waiting)", self.name, self.drain_len());
            if self.send_drain_head()? {
                self.waiting_on_retry.set(false);
                if self.has_more_requests(&cache) {
                    self.arm_request(self.queue.cur_tick() + 1)?;
                }
            }
            if self.drain_list.borrow().is_empty() {
                cache.check_drain();
            }
            return Ok(());
        }

        let pending = if self.is_cpu_side {
            cache.do_slave_request()
        } else {
            cache.do_master_request()
        };
        if !pending {
            // The request was withdrawn while we waited.
            self.waiting_on_retry.set(false);
            return Ok(());
        }
        if self.send_from_handler(&cache)? && self.has_more_requests(&cache) {
            self.arm_request(self.queue.cur_tick() + 1)?;
        }
        Ok(())
    }

    fn device_address_ranges(&self) -> SimResult<DeviceRanges> {
        self.cache()?.address_ranges(self.is_cpu_side)
    }

    fn device_block_size(&self) -> SimResult<usize> {
        Ok(self.cache()?.blk_size())
    }
}

impl Drop for CachePort {
    fn drop(&mut self) {
        for id in self.events() {
            let _ = self.queue.release(id);
        }
    }
}
