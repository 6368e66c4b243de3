//! Integration tests for the cache timing engine and its miss queue.

mod common;

use common::TestPort;
use memsim::cache::{
    BaseCache, BlockedCause, DrainState, MissHandle, MissHandler, MissQueue, RequestCause,
};
use memsim::common::{Addr, AddrRange, SimError, SimResult, Tick, MAX_TICK};
use memsim::config::CacheConfig;
use memsim::mem::packet::{flags, req_flags};
use memsim::mem::{Dest, MemCmd, Packet, PacketPtr, PacketResult, Port, Request};
use memsim::sim::{priority, EventQueue, ExitCause, FnEvent};
use memsim::soc::memory::controller::SimpleController;
use memsim::soc::PhysicalMemory;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

const MEM_LATENCY: Tick = 30;

/// A cache between a scripted requester and a 64 KiB memory.
struct Rig {
    queue: Rc<EventQueue>,
    cache: Rc<BaseCache>,
    cpu: Rc<TestPort>,
    mem: Rc<PhysicalMemory>,
}

fn small_cache() -> CacheConfig {
    CacheConfig {
        mshrs: 2,
        targets_per_mshr: 2,
        ..CacheConfig::default()
    }
}

fn rig(config: &CacheConfig) -> Rig {
    let queue = Rc::new(EventQueue::new("MainEventQueue"));
    let cache = BaseCache::new(
        "l1",
        queue.clone(),
        config,
        Box::new(MissQueue::new(config)),
    );
    let cpu = TestPort::timed("cpu", &queue);
    cache.connect_cpu_side(&cpu).unwrap();
    let mem = PhysicalMemory::new(
        "mem",
        queue.clone(),
        AddrRange::new(0x0, 0xffff),
        Box::new(SimpleController::new(MEM_LATENCY)),
        None,
    );
    cache.connect_mem_side(&mem.port()).unwrap();
    Rig {
        queue,
        cache,
        cpu,
        mem,
    }
}

fn read(addr: u64, time: Tick) -> PacketPtr {
    Packet::request(MemCmd::ReadReq, addr, 8, time)
}

fn write(addr: u64, data: [u8; 8], time: Tick) -> PacketPtr {
    let pkt = Packet::request(MemCmd::WriteReq, addr, 8, time);
    pkt.borrow_mut().set_data(data.to_vec());
    pkt
}

/// Moves simulated time forward with an empty event.
fn advance(queue: &EventQueue, to: Tick) {
    queue
        .schedule_once(
            "advance",
            priority::DEFAULT,
            to,
            Box::new(FnEvent::new(|_q: &EventQueue| Ok(()))),
        )
        .unwrap();
    queue.simulate(MAX_TICK).unwrap();
}

/// Tests cache port naming.
#[test]
fn test_cache_ports() {
    let r = rig(&small_cache());
    assert_eq!(r.cache.cpu_side().name(), "l1-cpu_side_port");
    assert_eq!(r.cache.mem_side().name(), "l1-mem_side_port");
    assert!(r.cache.cpu_side().is_cpu_side());
    assert_eq!(r.cache.blk_size(), 64);
}

/// Tests that a block stays in the miss queue after its fill is sent, until
/// memory answers.
#[test]
fn test_fill_in_flight_stays_in_miss_queue() {
    let r = rig(&small_cache());
    assert!(r.cpu.send_timing(read(0x40, 0)).unwrap());
    assert_eq!(r.queue.simulate(5).unwrap(), ExitCause::MaxTick);

    assert_eq!(r.mem.outstanding(), 1);
    assert!(r.cache.in_miss_queue(0x40));
    assert!(!r.cache.in_cache(0x40));
    assert!(!r.cache.do_master_request());

    // A second read of the block joins the fill instead of fetching again.
    assert!(r.cpu.send_timing(read(0x48, 5)).unwrap());
    assert_eq!(r.cache.stats().mshr_hits, 1);

    r.queue.simulate(MAX_TICK).unwrap();
    assert!(!r.cache.in_miss_queue(0x40));
    assert!(r.cache.in_cache(0x40));
    assert_eq!(r.mem.stats().reads, 1);
    assert_eq!(r.cpu.received_addrs(), vec![0x40, 0x48]);
}

/// Tests a read miss filling the block and a following hit.
#[test]
fn test_read_miss_then_hit() {
    let r = rig(&small_cache());
    assert!(r.cpu.send_timing(read(0x40, 0)).unwrap());
    assert!(r.cache.in_miss_queue(0x40));
    assert!(!r.cache.in_cache(0x40));

    r.queue.simulate(MAX_TICK).unwrap();
    // Request at 2, memory answers at 32, the cache responds at 34.
    assert_eq!(*r.cpu.arrivals.borrow(), vec![34]);
    assert!(r.cache.in_cache(0x40));
    assert!(!r.cache.in_miss_queue(0x40));

    let resp = r.cpu.last().unwrap();
    {
        let p = resp.borrow();
        assert_eq!(p.cmd, MemCmd::ReadResp);
        assert_eq!(p.result, PacketResult::Success);
        assert_eq!(p.data(), Some(&[0u8; 8][..]));
    }

    assert!(r.cpu.send_timing(read(0x48, 34)).unwrap());
    r.queue.simulate(MAX_TICK).unwrap();
    assert_eq!(*r.cpu.arrivals.borrow(), vec![34, 36]);

    let stats = r.cache.stats();
    let i = MemCmd::ReadReq.index();
    assert_eq!(stats.hits[i], 1);
    assert_eq!(stats.misses[i], 1);
    assert_eq!(stats.miss_latency[i], 34);
    assert_eq!(stats.avg_miss_latency(MemCmd::ReadReq), 34.0);
    assert_eq!(r.mem.stats().reads, 1);
    assert_eq!(r.mem.stats().bytes_read, 64);
}

/// Tests that reads of a block already being fetched share its MSHR, and
/// that a full MSHR blocks the cache with a single retry on release.
#[test]
fn test_mshr_coalescing_blocks_for_targets() {
    let r = rig(&small_cache());
    assert!(r.cpu.send_timing(read(0x80, 0)).unwrap());
    assert!(r.cpu.send_timing(read(0x88, 0)).unwrap());
    assert!(r.cache.is_blocked());
    assert!(r.cache.cpu_side().is_blocked());

    assert!(!r.cpu.send_timing(read(0x90, 0)).unwrap());
    assert!(!r.cpu.send_timing(read(0x98, 0)).unwrap());
    assert!(r.cache.cpu_side().must_send_retry());

    r.queue.simulate(MAX_TICK).unwrap();
    assert_eq!(r.cpu.retries.get(), 1);
    // Both targets complete at 34; the port delivers one response per tick.
    assert_eq!(*r.cpu.arrivals.borrow(), vec![34, 35]);
    assert!(!r.cache.is_blocked());

    let stats = r.cache.stats();
    assert_eq!(stats.mshr_hits, 1);
    assert_eq!(stats.misses[MemCmd::ReadReq.index()], 2);
    assert_eq!(stats.blocked_causes[BlockedCause::NoTargets.index()], 1);
    assert_eq!(stats.blocked_cycles[BlockedCause::NoTargets.index()], 32);
    assert_eq!(r.mem.stats().reads, 1);
}

/// Tests blocking on MSHR exhaustion and the requester's resend after the
/// retry.
#[test]
fn test_mshr_exhaustion_and_retry() {
    let r = rig(&small_cache());
    r.cpu.send_timing(read(0x0, 0)).unwrap();
    r.cpu.send_timing(read(0x1000, 0)).unwrap();
    assert!(r.cache.is_blocked());

    let held = read(0x2000, 0);
    *r.cpu.resend.borrow_mut() = Some(held.clone());
    assert!(!r.cpu.send_timing(held).unwrap());

    r.queue.simulate(MAX_TICK).unwrap();
    assert_eq!(r.cpu.retries.get(), 1);
    assert_eq!(*r.cpu.arrivals.borrow(), vec![34, 35, 66]);
    assert_eq!(
        r.cache.stats().blocked_causes[BlockedCause::NoMshrs.index()],
        2
    );
    assert!(!r.cache.is_blocked());
}

/// Tests that only the first blocking cause is counted and that the whole
/// blocked period is credited to the cause that clears last.
#[test]
fn test_blocked_accounting() {
    let r = rig(&small_cache());
    advance(&r.queue, 10);
    r.cache.set_blocked(BlockedCause::NoMshrs);
    advance(&r.queue, 25);
    r.cache.set_blocked(BlockedCause::NoTargets);
    r.cache.set_blocked(BlockedCause::NoTargets);
    assert_eq!(r.cache.blocked_mask(), 0b11);

    advance(&r.queue, 40);
    r.cache.clear_blocked(BlockedCause::NoMshrs).unwrap();
    assert!(r.cache.cpu_side().is_blocked());
    r.cache.clear_blocked(BlockedCause::NoTargets).unwrap();
    assert!(!r.cache.cpu_side().is_blocked());

    let stats = r.cache.stats();
    assert_eq!(stats.blocked_causes, [1, 0, 0, 0]);
    assert_eq!(stats.blocked_cycles[BlockedCause::NoMshrs.index()], 0);
    assert_eq!(stats.blocked_cycles[BlockedCause::NoTargets.index()], 30);

    // Clearing a cause that is not set changes nothing.
    r.cache.clear_blocked(BlockedCause::Coherence).unwrap();
    assert_eq!(r.cache.stats(), stats);
}

/// Tests that unblocking with no refused requester schedules no retry.
#[test]
fn test_unblock_without_refusal() {
    let r = rig(&small_cache());
    r.cache.set_blocked(BlockedCause::NoWbBuffers);
    r.cache.clear_blocked(BlockedCause::NoWbBuffers).unwrap();
    assert!(!r.queue.is_scheduled(r.cache.cpu_side().retry_event()));
    assert!(r.queue.is_empty());
}

/// Tests response queueing on the CPU side.
#[test]
fn test_respond_queues_in_time_order() {
    let r = rig(&small_cache());
    let no_ack = Packet::request(MemCmd::WriteReqNoAck, 0x0, 8, 0);
    no_ack.borrow_mut().set_data(vec![0; 8]);
    r.cache.respond(no_ack, 0).unwrap();
    assert!(r.cache.cpu_side().transmit_ticks().is_empty());

    r.cache.respond(read(0x100, 0), 5).unwrap();
    r.cache.respond(read(0x200, 0), 3).unwrap();
    assert_eq!(r.cache.cpu_side().transmit_ticks(), vec![3, 5]);
    assert_eq!(
        r.queue.when(r.cache.cpu_side().response_event()),
        Some(3)
    );

    r.queue.simulate(MAX_TICK).unwrap();
    assert_eq!(r.cpu.received_addrs(), vec![0x200, 0x100]);
    assert_eq!(*r.cpu.arrivals.borrow(), vec![3, 5]);

    let err = r.cache.respond(read(0x300, 0), 4).unwrap_err();
    assert!(matches!(err, SimError::ScheduleInPast { when: 4, now: 5, .. }));
}

/// Tests that a refused response is resent once the requester retries.
#[test]
fn test_refused_response_resent_on_retry() {
    let r = rig(&small_cache());
    r.cpu.accept.set(false);
    r.cache.respond(read(0x100, 0), 2).unwrap();
    r.cache.respond(read(0x108, 0), 3).unwrap();
    r.queue.simulate(MAX_TICK).unwrap();

    assert!(r.cache.cpu_side().waiting_on_retry());
    assert_eq!(r.cache.cpu_side().drain_len(), 2);
    assert!(!r.cache.can_drain());

    r.cpu.accept.set(true);
    r.cpu.send_retry().unwrap();
    r.queue.simulate(MAX_TICK).unwrap();
    assert_eq!(r.cpu.received_addrs(), vec![0x100, 0x108]);
    assert_eq!(r.cache.cpu_side().drain_len(), 0);
    assert!(r.cache.can_drain());
}

/// Tests that writes go through to memory and invalidate the cached block.
#[test]
fn test_write_through_invalidates() {
    let r = rig(&small_cache());
    r.cpu.send_timing(read(0x40, 0)).unwrap();
    r.queue.simulate(MAX_TICK).unwrap();
    assert!(r.cache.in_cache(0x40));

    let data = [1, 2, 3, 4, 5, 6, 7, 8];
    assert!(r.cpu.send_timing(write(0x40, data, 34)).unwrap());
    assert!(!r.cache.in_cache(0x40));
    r.queue.simulate(MAX_TICK).unwrap();

    let resp = r.cpu.last().unwrap();
    assert_eq!(resp.borrow().cmd, MemCmd::WriteResp);
    assert_eq!(r.mem.stats().writes, 1);
    assert_eq!(r.cache.stats().hits[MemCmd::WriteReq.index()], 1);

    let check = read(0x40, 0);
    r.cpu.send_functional(&check).unwrap();
    assert_eq!(check.borrow().data(), Some(&data[..]));
}

/// Tests that a fill overtaken by a write to its block is not installed.
#[test]
fn test_write_marks_fill_stale() {
    let r = rig(&small_cache());
    r.cpu.send_timing(read(0x100, 0)).unwrap();
    r.cpu.send_timing(write(0x100, [9; 8], 0)).unwrap();
    r.queue.simulate(MAX_TICK).unwrap();

    assert_eq!(r.cpu.received.borrow().len(), 2);
    assert!(!r.cache.in_cache(0x100));
    assert!(!r.cache.in_miss_queue(0x100));
}

/// Tests that upgrades are satisfied when they reach a cache.
#[test]
fn test_upgrade_satisfied_on_arrival() {
    let r = rig(&small_cache());
    let upgrade = Packet::request(MemCmd::UpgradeReq, 0x40, 8, 0);
    assert!(r.cpu.send_timing(upgrade.clone()).unwrap());
    assert_ne!(upgrade.borrow().flags & flags::SATISFIED, 0);
    assert!(r.queue.is_empty());

    assert!(matches!(
        r.cpu.send_timing(upgrade),
        Err(SimError::Protocol { .. })
    ));
}

/// Tests that an access spanning two blocks is rejected.
#[test]
fn test_block_crossing_access() {
    let r = rig(&small_cache());
    assert!(matches!(
        r.cpu.send_timing(read(0x3c, 0)),
        Err(SimError::Protocol { .. })
    ));
}

/// Tests the drain barrier.
#[test]
fn test_drain() {
    let r = rig(&small_cache());
    assert_eq!(r.cache.drain(Box::new(|| {})), 0);
    assert_eq!(r.cache.drain_state(), DrainState::Drained);
    r.cache.resume();
    assert_eq!(r.cache.drain_state(), DrainState::Running);

    r.cache.respond(read(0x100, 0), 5).unwrap();
    let drained = Rc::new(Cell::new(false));
    let flag = drained.clone();
    assert_eq!(r.cache.drain(Box::new(move || flag.set(true))), 1);
    assert_eq!(r.cache.drain_state(), DrainState::Draining);

    r.queue.simulate(MAX_TICK).unwrap();
    assert!(drained.get());
    assert_eq!(r.cache.drain_state(), DrainState::Drained);
    assert!(r.cache.serialize().is_ok());
}

/// Tests that checkpointing an undrained cache fails.
#[test]
fn test_serialize_requires_drain() {
    let r = rig(&small_cache());
    assert!(matches!(r.cache.serialize(), Err(SimError::Checkpoint(_))));
}

/// Tests atomic accesses through the cache.
#[test]
fn test_atomic_accesses() {
    let r = rig(&small_cache());
    let first = read(0x40, 0);
    assert_eq!(r.cpu.send_atomic(&first).unwrap(), 2 + MEM_LATENCY);
    assert_eq!(first.borrow().cmd, MemCmd::ReadResp);
    assert_eq!(r.cpu.send_atomic(&read(0x48, 0)).unwrap(), 2);

    let data = [7, 6, 5, 4, 3, 2, 1, 0];
    assert_eq!(r.cpu.send_atomic(&write(0x40, data, 0)).unwrap(), 2 + MEM_LATENCY);
    let again = read(0x40, 0);
    assert_eq!(r.cpu.send_atomic(&again).unwrap(), 2);
    assert_eq!(again.borrow().data(), Some(&data[..]));

    let stats = r.cache.stats();
    assert_eq!(stats.hits[MemCmd::ReadReq.index()], 2);
    assert_eq!(stats.misses[MemCmd::ReadReq.index()], 1);
    assert_eq!(stats.hits[MemCmd::WriteReq.index()], 1);
    assert_eq!(r.mem.stats().writes, 1);
    assert!(r.queue.is_empty());
}

/// Tests that an atomic read outside memory comes back as a bad address.
#[test]
fn test_atomic_bad_address() {
    let r = rig(&small_cache());
    let pkt = read(0x2_0000, 0);
    r.cpu.send_atomic(&pkt).unwrap();
    assert_eq!(pkt.borrow().result, PacketResult::BadAddress);
    assert!(!r.cache.in_cache(0x2_0000));
}

/// Tests that reaching the miss limit ends the simulation loop.
#[test]
fn test_max_misses_exits() {
    let config = CacheConfig {
        max_misses: 2,
        ..small_cache()
    };
    let r = rig(&config);
    r.cpu.send_timing(read(0x0, 0)).unwrap();
    r.cpu.send_timing(read(0x1000, 0)).unwrap();

    let cause = r.queue.simulate(MAX_TICK).unwrap();
    assert_eq!(
        cause,
        ExitCause::Requested("A cache reached the maximum miss count".to_string())
    );
    assert_eq!(r.queue.cur_tick(), 0);

    assert_eq!(r.queue.simulate(MAX_TICK).unwrap(), ExitCause::QueueEmpty);
    assert_eq!(r.cpu.received.borrow().len(), 2);
}

/// Tests that responses queued out of order leave in tick order.
#[test]
fn test_respond_orders_by_tick() {
    let r = rig(&small_cache());
    r.cache.respond(read(0x500, 0), 50).unwrap();
    r.cache.respond(read(0x300, 0), 30).unwrap();
    r.cache.respond(read(0x400, 0), 40).unwrap();

    assert_eq!(r.cache.cpu_side().transmit_ticks(), vec![30, 40, 50]);
    assert_eq!(r.queue.when(r.cache.cpu_side().response_event()), Some(30));

    r.queue.simulate(MAX_TICK).unwrap();
    assert_eq!(*r.cpu.arrivals.borrow(), vec![30, 40, 50]);
    assert_eq!(r.cpu.received_addrs(), vec![0x300, 0x400, 0x500]);
}

/// Tests that miss latency is only accounted for cacheable requests.
#[test]
fn test_respond_to_miss_skips_uncacheable_latency() {
    let r = rig(&small_cache());
    advance(&r.queue, 10);

    r.cache.respond_to_miss(read(0x100, 2), 20).unwrap();
    let uncacheable = Packet::new_ptr(
        Rc::new(Request::new(0x200, 8, req_flags::UNCACHEABLE, 2)),
        MemCmd::ReadReq,
        Dest::Broadcast,
    );
    r.cache.respond_to_miss(uncacheable, 25).unwrap();

    assert_eq!(r.cache.stats().miss_latency[MemCmd::ReadReq.index()], 18);
    r.queue.simulate(MAX_TICK).unwrap();
    assert_eq!(*r.cpu.arrivals.borrow(), vec![20, 25]);
    assert_eq!(r.cpu.received_addrs(), vec![0x100, 0x200]);
}

/// Requests a scripted handler hands to the cache, and what it was told.
#[derive(Default)]
struct Script {
    requests: VecDeque<PacketPtr>,
    coherence: VecDeque<PacketPtr>,
    /// `(cpu side, address, accepted)` for every send reported back.
    results: Vec<(bool, Addr, bool)>,
}

/// A miss handler replaying scripted requests and accepting every access.
struct ScriptedHandler(Rc<RefCell<Script>>);

impl ScriptedHandler {
    fn record(
        &self,
        cache: &BaseCache,
        pkt: &PacketPtr,
        success: bool,
        cpu_side: bool,
    ) {
        let mut script = self.0.borrow_mut();
        script.results.push((cpu_side, pkt.borrow().addr(), success));
        if !success {
            return;
        }
        if cpu_side {
            script.coherence.pop_front();
            if script.coherence.is_empty() {
                cache.clear_slave_request(RequestCause::Coherence);
            }
        } else {
            script.requests.pop_front();
            if script.requests.is_empty() {
                cache.clear_master_request(RequestCause::Mshr);
            }
        }
    }
}

impl MissHandler for ScriptedHandler {
    fn in_cache(&self, _addr: Addr) -> bool {
        false
    }

    fn in_miss_queue(&self, _addr: Addr) -> bool {
        false
    }

    fn get_packet(&mut self) -> Option<(PacketPtr, MissHandle)> {
        let front = self.0.borrow().requests.front().cloned();
        front.map(|pkt| (pkt, MissHandle(0)))
    }

    fn get_coherence_packet(&mut self) -> Option<(PacketPtr, MissHandle)> {
        let front = self.0.borrow().coherence.front().cloned();
        front.map(|pkt| (pkt, MissHandle(1)))
    }

    fn send_result(
        &mut self,
        cache: &BaseCache,
        pkt: &PacketPtr,
        _handle: MissHandle,
        success: bool,
    ) -> SimResult<()> {
        self.record(cache, pkt, success, false);
        Ok(())
    }

    fn send_coherence_result(
        &mut self,
        cache: &BaseCache,
        pkt: &PacketPtr,
        _handle: MissHandle,
        success: bool,
    ) -> SimResult<()> {
        self.record(cache, pkt, success, true);
        Ok(())
    }

    fn do_timing_access(
        &mut self,
        _cache: &BaseCache,
        _pkt: PacketPtr,
        _is_cpu_side: bool,
    ) -> SimResult<bool> {
        Ok(true)
    }

    fn do_atomic_access(
        &mut self,
        _cache: &BaseCache,
        _pkt: &PacketPtr,
        _is_cpu_side: bool,
    ) -> SimResult<Tick> {
        Ok(0)
    }

    fn do_functional_access(
        &mut self,
        _cache: &BaseCache,
        _pkt: &PacketPtr,
        _is_cpu_side: bool,
    ) -> SimResult<()> {
        Ok(())
    }
}

/// A cache driven by a [`ScriptedHandler`], between two recording ports.
struct Scripted {
    queue: Rc<EventQueue>,
    cache: Rc<BaseCache>,
    cpu: Rc<TestPort>,
    mem: Rc<TestPort>,
    script: Rc<RefCell<Script>>,
}

fn scripted() -> Scripted {
    let queue = Rc::new(EventQueue::new("MainEventQueue"));
    let script = Rc::new(RefCell::new(Script::default()));
    let cache = BaseCache::new(
        "l1",
        queue.clone(),
        &small_cache(),
        Box::new(ScriptedHandler(script.clone())),
    );
    let cpu = TestPort::timed("cpu", &queue);
    let mem = TestPort::timed("mem", &queue);
    cache.connect_cpu_side(&cpu).unwrap();
    cache.connect_mem_side(&mem).unwrap();
    Scripted {
        queue,
        cache,
        cpu,
        mem,
        script,
    }
}

/// Tests that several request causes share one request event, which sends
/// one request per tick and idles once the causes are withdrawn.
#[test]
fn test_master_request_causes_share_one_event() {
    let s = scripted();
    s.script
        .borrow_mut()
        .requests
        .extend([read(0x0, 0), read(0x40, 0)]);

    s.cache.set_master_request(RequestCause::Mshr, 5).unwrap();
    s.cache.set_master_request(RequestCause::Wb, 3).unwrap();
    assert_eq!(s.queue.when(s.cache.mem_side().request_event()), Some(5));
    assert_eq!(s.queue.pending().len(), 1);

    s.queue.simulate(MAX_TICK).unwrap();
    assert_eq!(*s.mem.arrivals.borrow(), vec![5, 6]);
    assert_eq!(s.mem.received_addrs(), vec![0x0, 0x40]);
    // The write-back cause is still raised but has nothing to send.
    assert!(s.cache.do_master_request());
    assert!(!s.cache.mem_side().waiting_on_retry());
    assert!(s.queue.is_empty());

    s.cache.clear_master_request(RequestCause::Wb);
    assert!(s.cache.can_drain());
}

/// Tests that no request event is armed while waiting on a retry, and that
/// the retry itself resends the refused request.
#[test]
fn test_master_request_waits_for_retry() {
    let s = scripted();
    s.mem.accept.set(false);
    s.script.borrow_mut().requests.push_back(read(0x80, 0));
    s.cache.set_master_request(RequestCause::Mshr, 0).unwrap();
    s.queue.simulate(MAX_TICK).unwrap();
    assert!(s.cache.mem_side().waiting_on_retry());
    assert_eq!(s.script.borrow().results, vec![(false, 0x80, false)]);

    s.cache.clear_master_request(RequestCause::Mshr);
    s.cache.set_master_request(RequestCause::Mshr, 10).unwrap();
    assert!(!s.queue.is_scheduled(s.cache.mem_side().request_event()));

    s.mem.accept.set(true);
    s.mem.send_retry().unwrap();
    assert!(!s.cache.mem_side().waiting_on_retry());
    assert_eq!(s.mem.received_addrs(), vec![0x80]);
    assert_eq!(
        s.script.borrow().results,
        vec![(false, 0x80, false), (false, 0x80, true)]
    );
    assert!(!s.cache.do_master_request());

    assert!(matches!(
        s.mem.send_retry(),
        Err(SimError::Protocol { .. })
    ));
}

/// Tests snoop-originated requests sent upstream through the CPU-side port.
#[test]
fn test_coherence_requests_sent_upstream() {
    let s = scripted();
    s.script.borrow_mut().coherence.extend([
        Packet::request(MemCmd::InvalidateReq, 0x40, 64, 0),
        Packet::request(MemCmd::InvalidateReq, 0x80, 64, 0),
    ]);
    s.cache.set_slave_request(RequestCause::Coherence, 10).unwrap();
    assert_eq!(s.queue.when(s.cache.cpu_side().request_event()), Some(10));

    s.queue.simulate(MAX_TICK).unwrap();
    assert_eq!(*s.cpu.arrivals.borrow(), vec![10, 11]);
    assert_eq!(s.cpu.received_addrs(), vec![0x40, 0x80]);
    assert_eq!(
        s.script.borrow().results,
        vec![(true, 0x40, true), (true, 0x80, true)]
    );
    assert!(!s.cache.do_slave_request());
    assert!(s.mem.received.borrow().is_empty());
}

/// Tests that blocking the snoop path refuses snoops on the memory side
/// only, and retries them once unblocked.
#[test]
fn test_snoop_blocking() {
    let s = scripted();
    s.cache.set_blocked_for_snoop(BlockedCause::Coherence);
    s.cache.set_blocked_for_snoop(BlockedCause::NoWbBuffers);
    s.cache.set_blocked_for_snoop(BlockedCause::Coherence);
    assert!(s.cache.is_blocked_for_snoop());
    assert!(s.cache.mem_side().is_blocked());
    assert!(!s.cache.is_blocked());
    assert!(!s.cache.cpu_side().is_blocked());

    assert!(!s.mem.send_timing(read(0x40, 0)).unwrap());
    assert!(s.cache.mem_side().must_send_retry());
    assert!(s.cpu.send_timing(read(0x40, 0)).unwrap());

    s.cache.clear_blocked(BlockedCause::Coherence).unwrap();
    assert!(s.cache.is_blocked_for_snoop());
    assert!(s.cache.mem_side().is_blocked());
    assert!(s.queue.is_empty());

    s.cache.clear_blocked(BlockedCause::NoWbBuffers).unwrap();
    assert!(!s.cache.is_blocked_for_snoop());
    assert!(!s.cache.mem_side().is_blocked());
    s.queue.simulate(MAX_TICK).unwrap();
    assert_eq!(s.mem.retries.get(), 1);
    assert_eq!(s.cpu.retries.get(), 0);

    // Snoop blocking is not access blocking.
    assert_eq!(s.cache.stats().blocked_causes, [0, 0, 0, 0]);
}

/// Tests that snoop responses leave through the memory-side port.
#[test]
fn test_respond_to_snoop() {
    let s = scripted();
    s.cache.respond_to_snoop(read(0x40, 0), 4).unwrap();
    assert_eq!(s.cache.mem_side().transmit_ticks(), vec![4]);
    assert!(s.cache.cpu_side().transmit_ticks().is_empty());

    let no_ack = Packet::request(MemCmd::WriteReqNoAck, 0x80, 8, 0);
    no_ack.borrow_mut().set_data(vec![0; 8]);
    assert!(matches!(
        s.cache.respond_to_snoop(no_ack, 4),
        Err(SimError::Protocol { .. })
    ));

    s.queue.simulate(MAX_TICK).unwrap();
    assert_eq!(*s.mem.arrivals.borrow(), vec![4]);
    let resp = s.mem.last().unwrap();
    assert_eq!(resp.borrow().cmd, MemCmd::ReadResp);
    assert_eq!(resp.borrow().result, PacketResult::Success);
    assert!(s.cpu.received.borrow().is_empty());
}
