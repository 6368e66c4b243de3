//! Cache Admission Control and Response Scheduling.
//!
//! [`BaseCache`] keeps four small bitmasks:
//!
//! * `blocked` / `blocked_snoop`: why the access path (CPU side) or the
//!   snoop path (memory side) currently refuses new requests. A port is
//!   only told about a change of the whole mask between zero and non-zero.
//! * `master_requests` / `slave_requests`: why the cache wants the bus
//!   below or above it. The port's request event is only armed when the
//!   first cause appears.

use super::port::CachePort;
use super::MissHandler;
use crate::common::{Addr, SimError, SimResult, Tick};
use crate::config::CacheConfig;
use crate::mem::packet::PacketPtr;
use crate::mem::port::{connect, DeviceRanges, Port, Status};
use crate::sim::EventQueue;
use crate::stats::CacheStats;
use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell, RefMut};
use std::fmt;
use std::rc::{Rc, Weak};

/// Number of [`BlockedCause`] variants.
pub const NUM_BLOCKED_CAUSES: usize = 4;

/// Reasons for the cache to refuse new requests.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockedCause {
    /// Every MSHR is in use.
    NoMshrs,
    /// An MSHR cannot take another coalesced target.
    NoTargets,
    /// The writeback buffer is full.
    NoWbBuffers,
    /// A coherence transaction is in progress.
    Coherence,
}

impl BlockedCause {
    /// Every cause, in index order.
    pub const ALL: [BlockedCause; NUM_BLOCKED_CAUSES] = [
        BlockedCause::NoMshrs,
        BlockedCause::NoTargets,
        BlockedCause::NoWbBuffers,
        BlockedCause::Coherence,
    ];

    /// Position of the cause in the per-cause statistics.
    pub fn index(self) -> usize {
        self as usize
    }

    #[inline(always)]
    fn bit(self) -> u8 {
        1 << self as u8
    }

    /// Name used in logs and statistics.
    pub fn as_str(self) -> &'static str {
        match self {
            BlockedCause::NoMshrs => "no_mshrs",
            BlockedCause::NoTargets => "no_targets",
            BlockedCause::NoWbBuffers => "no_wb_buffers",
            BlockedCause::Coherence => "coherence",
        }
    }
}

impl fmt::Display for BlockedCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reasons for the cache to request a bus.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RequestCause {
    Mshr,
    Wb,
    Coherence,
    Prefetch,
}

impl RequestCause {
    #[inline(always)]
    fn bit(self) -> u8 {
        1 << self as u8
    }
}

/// Progress of a drain request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DrainState {
    #[default]
    Running,
    Draining,
    Drained,
}

/// What a cache stores in a checkpoint: its statistics and the miss limit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CacheCheckpoint {
    pub name: String,
    pub stats: CacheStats,
    /// Misses left before the loop exit is requested, `None` when unlimited.
    #[serde(default)]
    pub misses_left: Option<u64>,
}

/// The common timing core of a cache.
pub struct BaseCache {
    name: String,
    queue: Rc<EventQueue>,
    cpu_side: Rc<CachePort>,
    mem_side: Rc<CachePort>,
    backend: RefCell<Box<dyn MissHandler>>,
    blocked: Cell<u8>,
    blocked_snoop: Cell<u8>,
    master_requests: Cell<u8>,
    slave_requests: Cell<u8>,
    /// Tick at which the access path last became blocked.
    blocked_cycle: Cell<Tick>,
    blk_size: usize,
    hit_latency: Tick,
    /// Misses left before the simulation loop is asked to exit.
    miss_count: Cell<Option<u64>>,
    drain_event: RefCell<Option<Box<dyn FnOnce()>>>,
    drain_state: Cell<DrainState>,
    stats: RefCell<CacheStats>,
}

impl BaseCache {
    /// Creates a cache with the given miss handler.
    ///
    /// The ports are named `<name>-cpu_side_port` and
    /// `<name>-mem_side_port`.
    ///
    /// # Arguments
    ///
    /// * `name` - Name of the cache
    /// * `queue` - The simulation's event queue
    /// * `config` - Block size, hit latency and miss limit
    /// * `backend` - The miss handler deciding what accesses do
    pub fn new(
        name: impl Into<String>,
        queue: Rc<EventQueue>,
        config: &CacheConfig,
        backend: Box<dyn MissHandler>,
    ) -> Rc<Self> {
        let name = name.into();
        Rc::new_cyclic(|me: &Weak<BaseCache>| Self {
            cpu_side: CachePort::new(
                format!("{name}-cpu_side_port"),
                true,
                me.clone(),
                queue.clone(),
            ),
            mem_side: CachePort::new(
                format!("{name}-mem_side_port"),
                false,
                me.clone(),
                queue.clone(),
            ),
            name,
            queue,
            backend: RefCell::new(backend),
            blocked: Cell::new(0),
            blocked_snoop: Cell::new(0),
            master_requests: Cell::new(0),
            slave_requests: Cell::new(0),
            blocked_cycle: Cell::new(0),
            blk_size: config.blk_size,
            hit_latency: config.hit_latency,
            miss_count: Cell::new((config.max_misses > 0).then_some(config.max_misses)),
            drain_event: RefCell::new(None),
            drain_state: Cell::new(DrainState::Running),
            stats: RefCell::new(CacheStats::default()),
        })
    }

    /// Cache name, also the prefix of its port names.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The event queue the cache schedules on.
    pub fn queue(&self) -> &Rc<EventQueue> {
        &self.queue
    }

    /// The port facing the requesters.
    pub fn cpu_side(&self) -> &Rc<CachePort> {
        &self.cpu_side
    }

    /// The port facing the next memory level.
    pub fn mem_side(&self) -> &Rc<CachePort> {
        &self.mem_side
    }

    /// Block size in bytes.
    pub fn blk_size(&self) -> usize {
        self.blk_size
    }

    /// Ticks from accepting an access to its first response or bus request.
    pub fn hit_latency(&self) -> Tick {
        self.hit_latency
    }

    pub(super) fn backend(&self) -> RefMut<'_, Box<dyn MissHandler>> {
        self.backend.borrow_mut()
    }

    /// Connects the CPU-side port to `upstream`.
    pub fn connect_cpu_side<P: Port + 'static>(&self, upstream: &Rc<P>) -> SimResult<()> {
        connect(&self.cpu_side, upstream)
    }

    /// Connects the memory-side port to `downstream`.
    pub fn connect_mem_side<P: Port + 'static>(&self, downstream: &Rc<P>) -> SimResult<()> {
        connect(&self.mem_side, downstream)
    }

    /// Returns `true` if the block holding `addr` is present.
    pub fn in_cache(&self, addr: Addr) -> bool {
        self.backend.borrow().in_cache(addr)
    }

    /// Returns `true` if a miss for the block holding `addr` is outstanding.
    pub fn in_miss_queue(&self, addr: Addr) -> bool {
        self.backend.borrow().in_miss_queue(addr)
    }

    /// Marks the access path blocked for `cause`.
    ///
    /// The CPU-side port is told only when the path goes from unblocked to
    /// blocked. The blocked event and its start tick are attributed to the
    /// cause that made that transition.
    pub fn set_blocked(&self, cause: BlockedCause) {
        let flag = cause.bit();
        let old = self.blocked.get();
        if old == 0 {
            self.stats.borrow_mut().blocked_causes[cause.index()] += 1;
            self.blocked_cycle.set(self.queue.cur_tick());
        }
        if old & flag == 0 {
            self.blocked.set(old | flag);
            tracing::debug!(target: "cache", "{}: blocking for cause {}", self.name, cause);
            if old == 0 {
                self.cpu_side.set_blocked();
            }
        }
    }

    /// Marks the snoop path blocked for `cause`.
    pub fn set_blocked_for_snoop(&self, cause: BlockedCause) {
        let flag = cause.bit();
        let old = self.blocked_snoop.get();
        if old & flag == 0 {
            self.blocked_snoop.set(old | flag);
            if old == 0 {
                self.mem_side.set_blocked();
            }
        }
    }

    /// Clears `cause` on both paths.
    ///
    /// A port is unblocked only when its last cause clears; the whole
    /// blocked duration is credited to the cause clearing it.
    pub fn clear_blocked(&self, cause: BlockedCause) -> SimResult<()> {
        let flag = cause.bit();
        tracing::debug!(target: "cache", "{}: unblocking for cause {}, causes left={:#x}", self.name, cause, self.blocked.get());

        let blocked = self.blocked.get();
        if blocked & flag != 0 {
            self.blocked.set(blocked & !flag);
            if !self.is_blocked() {
                let cycles = self.queue.cur_tick() - self.blocked_cycle.get();
                self.stats.borrow_mut().blocked_cycles[cause.index()] += cycles;
                tracing::debug!(target: "cache", "{}: unblocking from all causes", self.name);
                self.cpu_side.clear_blocked()?;
            }
        }

        let snoop = self.blocked_snoop.get();
        if snoop & flag != 0 {
            self.blocked_snoop.set(snoop & !flag);
            if !self.is_blocked_for_snoop() {
                self.mem_side.clear_blocked()?;
            }
        }
        Ok(())
    }

    /// Returns `true` while any access-path cause is set.
    pub fn is_blocked(&self) -> bool {
        self.blocked.get() != 0
    }

    /// Returns `true` while any snoop-path cause is set.
    pub fn is_blocked_for_snoop(&self) -> bool {
        self.blocked_snoop.get() != 0
    }

    /// The raw access-path mask.
    pub fn blocked_mask(&self) -> u8 {
        self.blocked.get()
    }

    /// Requests the memory-side bus for `cause`, from `time` on.
    pub fn set_master_request(&self, cause: RequestCause, time: Tick) -> SimResult<()> {
        if !self.do_master_request() && !self.mem_side.waiting_on_retry() {
            self.mem_side.arm_request(time)?;
        }
        self.master_requests
            .set(self.master_requests.get() | cause.bit());
        Ok(())
    }

    /// Withdraws a memory-side bus request cause.
    pub fn clear_master_request(&self, cause: RequestCause) {
        self.master_requests
            .set(self.master_requests.get() & !cause.bit());
        self.check_drain();
    }

    /// Returns `true` while any memory-side request cause is set.
    pub fn do_master_request(&self) -> bool {
        self.master_requests.get() != 0
    }

    /// Requests the CPU-side bus for `cause`, from `time` on.
    pub fn set_slave_request(&self, cause: RequestCause, time: Tick) -> SimResult<()> {
        if !self.do_slave_request() && !self.cpu_side.waiting_on_retry() {
            self.cpu_side.arm_request(time)?;
        }
        self.slave_requests
            .set(self.slave_requests.get() | cause.bit());
        Ok(())
    }

    /// Withdraws a CPU-side bus request cause.
    pub fn clear_slave_request(&self, cause: RequestCause) {
        self.slave_requests
            .set(self.slave_requests.get() & !cause.bit());
        self.check_drain();
    }

    /// Returns `true` while any CPU-side request cause is set.
    pub fn do_slave_request(&self) -> bool {
        self.slave_requests.get() != 0
    }

    /// Queues the response to `pkt` on the CPU side for delivery at `time`.
    ///
    /// A packet that is owed no response is dropped.
    pub fn respond(&self, pkt: PacketPtr, time: Tick) -> SimResult<()> {
        self.check_time("respond", time)?;
        if !pkt.borrow().needs_response() {
            return Ok(());
        }
        self.cpu_side.queue_response(pkt, time)
    }

    /// Like [`respond`](Self::respond), also accounting the miss latency of
    /// cacheable requests.
    pub fn respond_to_miss(&self, pkt: PacketPtr, time: Tick) -> SimResult<()> {
        self.check_time("respond_to_miss", time)?;
        {
            let p = pkt.borrow();
            if !p.req().is_uncacheable() {
                self.stats.borrow_mut().miss_latency[p.cmd.index()] += time.saturating_sub(p.time);
            }
        }
        self.respond(pkt, time)
    }

    /// Queues the response to a snoop on the memory side.
    pub fn respond_to_snoop(&self, pkt: PacketPtr, time: Tick) -> SimResult<()> {
        self.check_time("respond_to_snoop", time)?;
        if !pkt.borrow().needs_response() {
            return Err(SimError::protocol(
                &self.name,
                format!("snoop response for {} which is owed none", pkt.borrow()),
            ));
        }
        self.mem_side.queue_response(pkt, time)
    }

    fn check_time(&self, what: &str, time: Tick) -> SimResult<()> {
        let now = self.queue.cur_tick();
        if time < now {
            return Err(SimError::ScheduleInPast {
                name: format!("{}.{what}", self.name),
                when: time,
                now,
            });
        }
        Ok(())
    }

    /// Counts a miss toward the configured limit, requesting an exit of the
    /// simulation loop when it is reached.
    pub fn missed(&self) -> SimResult<()> {
        if let Some(left) = self.miss_count.get() {
            let left = left.saturating_sub(1);
            self.miss_count.set(Some(left));
            if left == 0 {
                self.miss_count.set(None);
                self.queue.exit_sim_loop(
                    self.queue.cur_tick(),
                    "A cache reached the maximum miss count",
                )?;
            }
        }
        Ok(())
    }

    /// Returns `true` when no bus request is pending and both ports have
    /// delivered everything they hold.
    pub fn can_drain(&self) -> bool {
        !self.do_master_request()
            && !self.do_slave_request()
            && self.mem_side.can_drain()
            && self.cpu_side.can_drain()
    }

    /// Fires the registered drain callback once the cache can drain.
    pub fn check_drain(&self) {
        if self.drain_event.borrow().is_none() || !self.can_drain() {
            return;
        }
        let callback = self.drain_event.borrow_mut().take();
        self.drain_state.set(DrainState::Drained);
        tracing::debug!(target: "cache", "{}: drained", self.name);
        if let Some(callback) = callback {
            callback();
        }
    }

    /// Starts draining.
    ///
    /// Returns 0 if the cache is already drained; otherwise `on_drained` is
    /// kept and called once the last pending work completes, and 1 is
    /// returned.
    pub fn drain(&self, on_drained: Box<dyn FnOnce()>) -> usize {
        if !self.can_drain() {
            *self.drain_event.borrow_mut() = Some(on_drained);
            self.drain_state.set(DrainState::Draining);
            return 1;
        }
        self.drain_state.set(DrainState::Drained);
        0
    }

    /// Returns to normal operation after a drain.
    pub fn resume(&self) {
        self.drain_event.borrow_mut().take();
        self.drain_state.set(DrainState::Running);
    }

    /// Where the cache stands in the drain protocol.
    pub fn drain_state(&self) -> DrainState {
        self.drain_state.get()
    }

    /// Ranges reachable through one of the ports.
    ///
    /// The CPU side offers what lies below the memory side; the memory side
    /// announces the snoop ranges of whatever is above the CPU side.
    pub fn address_ranges(&self, is_cpu_side: bool) -> SimResult<DeviceRanges> {
        if is_cpu_side {
            let below = self.mem_side.peer_address_ranges()?;
            Ok(DeviceRanges {
                resp: below.resp,
                snoop: Vec::new(),
            })
        } else {
            let above = self.cpu_side.peer_address_ranges()?;
            Ok(DeviceRanges {
                resp: Vec::new(),
                snoop: above.snoop,
            })
        }
    }

    /// Relays a range change to the opposite port.
    pub fn recv_status_change(&self, status: Status, is_cpu_side: bool) -> SimResult<()> {
        match status {
            Status::RangeChange if is_cpu_side => self.mem_side.send_status_change(status),
            Status::RangeChange => self.cpu_side.send_status_change(status),
        }
    }

    /// A copy of the statistics.
    pub fn stats(&self) -> CacheStats {
        self.stats.borrow().clone()
    }

    /// Updates the statistics in place.
    pub fn update_stats(&self, f: impl FnOnce(&mut CacheStats)) {
        f(&mut self.stats.borrow_mut());
    }

    /// Checkpoints the statistics. The cache must be drained.
    pub fn serialize(&self) -> SimResult<CacheCheckpoint> {
        if self.drain_state.get() != DrainState::Drained {
            return Err(SimError::Checkpoint(format!(
                "{} must be drained before checkpointing",
                self.name
            )));
        }
        Ok(CacheCheckpoint {
            name: self.name.clone(),
            stats: self.stats(),
            misses_left: self.miss_count.get(),
        })
    }

    /// Restores statistics and the miss limit from a checkpoint.
    pub fn unserialize(&self, cp: &CacheCheckpoint) -> SimResult<()> {
        if cp.name != self.name {
            return Err(SimError::Checkpoint(format!(
                "checkpoint of {} cannot restore {}",
                cp.name, self.name
            )));
        }
        *self.stats.borrow_mut() = cp.stats.clone();
        self.miss_count.set(cp.misses_left);
        Ok(())
    }
}
