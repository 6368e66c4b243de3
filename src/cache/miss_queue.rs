//! MSHR-Based Miss Handler.
//!
//! `MissQueue` keeps whole blocks in an unbounded store (there is no
//! replacement) and tracks outstanding misses in a fixed pool of MSHRs:
//!
//! * Reads that miss allocate an MSHR fetching the whole block. Later reads
//!   of the same block are coalesced onto it as extra targets.
//! * Writes and uncacheable accesses get an MSHR of their own which
//!   forwards a copy of the access (write-through). A cacheable write
//!   invalidates the local copy of its block; a fill already in flight for
//!   that block still answers its targets but is not installed.
//! * When the last MSHR is taken the cache blocks for `NoMshrs`; when an
//!   MSHR reaches its target limit it blocks for `NoTargets`.

use super::base::{BaseCache, BlockedCause, RequestCause};
use super::{MissHandle, MissHandler};
use crate::common::{Addr, SimError, SimResult, Tick};
use crate::config::CacheConfig;
use crate::mem::packet::{flags, Dest, MemCmd, Packet, PacketPtr, PacketResult, Request};
use crate::mem::port::Port;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

/// What an MSHR is doing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MshrKind {
    /// Fetching a whole block for one or more reads.
    Fill,
    /// Forwarding a single write or uncacheable access.
    Forward,
}

struct Mshr {
    kind: MshrKind,
    blk_addr: Addr,
    /// The request sent downstream.
    pkt: PacketPtr,
    /// Whether `pkt` is owed a response. The receiver may turn the packet
    /// into its response in place, so this is recorded at allocation.
    owes_response: bool,
    /// Upstream requests waiting on this miss.
    targets: Vec<PacketPtr>,
    in_service: bool,
    /// A write overtook this fill; its data must not be installed.
    stale: bool,
}

/// A blocking, write-through miss handler.
pub struct MissQueue {
    blk_size: usize,
    hit_latency: Tick,
    targets_per_mshr: usize,
    blocks: HashMap<Addr, Vec<u8>>,
    mshrs: Vec<Option<Mshr>>,
    /// MSHRs waiting to be sent, oldest first.
    pending: VecDeque<usize>,
    /// MSHRs at their target limit.
    full_mshrs: usize,
}

impl MissQueue {
    /// Creates a miss handler sized by the cache configuration.
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            blk_size: config.blk_size,
            hit_latency: config.hit_latency,
            targets_per_mshr: config.targets_per_mshr,
            blocks: HashMap::new(),
            mshrs: (0..config.mshrs).map(|_| None).collect(),
            pending: VecDeque::new(),
            full_mshrs: 0,
        }
    }

    #[inline(always)]
    fn blk_align(&self, addr: Addr) -> Addr {
        addr & !(self.blk_size as Addr - 1)
    }

    /// Number of MSHRs in use.
    pub fn allocated(&self) -> usize {
        self.mshrs.iter().filter(|m| m.is_some()).count()
    }

    fn find_fill(&self, blk_addr: Addr) -> Option<usize> {
        self.mshrs.iter().position(|m| {
            m.as_ref().is_some_and(|m| {
                m.kind == MshrKind::Fill && !m.stale && m.blk_addr == blk_addr
            })
        })
    }

    /// Takes a free MSHR, blocking the cache if it was the last one.
    fn allocate(&mut self, cache: &BaseCache, mshr: Mshr) -> SimResult<usize> {
        let idx = self
            .mshrs
            .iter()
            .position(Option::is_none)
            .ok_or_else(|| SimError::protocol(cache.name(), "access admitted with no free MSHR"))?;
        mshr.pkt.borrow_mut().sender_state = Some(idx);
        self.mshrs[idx] = Some(mshr);
        self.pending.push_back(idx);
        if self.mshrs.iter().all(Option::is_some) {
            cache.set_blocked(BlockedCause::NoMshrs);
        }
        cache.set_master_request(RequestCause::Mshr, cache.queue().cur_tick() + self.hit_latency)?;
        Ok(idx)
    }

    /// Frees an MSHR, unblocking the cache as resources come back.
    fn deallocate(&mut self, cache: &BaseCache, idx: usize) -> SimResult<Option<Mshr>> {
        let was_full = self.mshrs.iter().all(Option::is_some);
        let Some(mshr) = self.mshrs.get_mut(idx).and_then(Option::take) else {
            return Ok(None);
        };
        if mshr.kind == MshrKind::Fill && mshr.targets.len() >= self.targets_per_mshr {
            self.full_mshrs = self.full_mshrs.saturating_sub(1);
            if self.full_mshrs == 0 {
                cache.clear_blocked(BlockedCause::NoTargets)?;
            }
        }
        if was_full {
            cache.clear_blocked(BlockedCause::NoMshrs)?;
        }
        Ok(Some(mshr))
    }

    /// Copies the bytes `pkt` asks for out of a block.
    fn fill_target(&self, pkt: &PacketPtr, blk_addr: Addr, blk: &[u8]) {
        let mut p = pkt.borrow_mut();
        if !p.is_read() {
            return;
        }
        let start = (p.addr() - blk_addr) as usize;
        let end = start + p.size();
        if end <= blk.len() {
            let chunk = blk[start..end].to_vec();
            p.set_data(chunk);
        }
    }

    /// Builds the packet an MSHR forwards for a write or uncacheable access.
    fn forward_copy(pkt: &Packet) -> PacketPtr {
        let copy = Packet::new_ptr(pkt.req().clone(), pkt.cmd, Dest::Broadcast);
        if let Some(data) = pkt.data() {
            copy.borrow_mut().set_data(data.to_vec());
        }
        copy
    }

    fn handle_request(&mut self, cache: &BaseCache, pkt: PacketPtr) -> SimResult<()> {
        let now = cache.queue().cur_tick();
        let (addr, cmd, uncacheable, is_write, size) = {
            let p = pkt.borrow();
            (p.addr(), p.cmd, p.req().is_uncacheable(), p.is_write(), p.size())
        };
        let blk_addr = self.blk_align(addr);
        if !uncacheable && self.blk_align(addr + size.max(1) as Addr - 1) != blk_addr {
            return Err(SimError::protocol(
                cache.name(),
                format!("{} crosses a block boundary", pkt.borrow()),
            ));
        }

        if uncacheable || is_write {
            if uncacheable {
                cache.update_stats(|s| s.uncacheable_accesses += 1);
            } else {
                let present = self.blocks.remove(&blk_addr).is_some();
                for m in self.mshrs.iter_mut().flatten() {
                    if m.kind == MshrKind::Fill && m.blk_addr == blk_addr {
                        m.stale = true;
                    }
                }
                cache.update_stats(|s| {
                    if present {
                        s.hits[cmd.index()] += 1;
                    } else {
                        s.misses[cmd.index()] += 1;
                    }
                });
            }
            tracing::debug!(target: "cache", "{}: forwarding {}", cache.name(), pkt.borrow());
            let copy = Self::forward_copy(&pkt.borrow());
            self.allocate(
                cache,
                Mshr {
                    kind: MshrKind::Forward,
                    blk_addr,
                    owes_response: cmd.needs_response(),
                    pkt: copy,
                    targets: vec![pkt],
                    in_service: false,
                    stale: false,
                },
            )?;
            return Ok(());
        }

        if let Some(blk) = self.blocks.get(&blk_addr) {
            tracing::debug!(target: "cache", "{}: {} {:#x} hit", cache.name(), cmd, addr);
            self.fill_target(&pkt, blk_addr, blk);
            cache.update_stats(|s| s.hits[cmd.index()] += 1);
            return cache.respond(pkt, now + self.hit_latency);
        }

        cache.update_stats(|s| s.misses[cmd.index()] += 1);
        cache.missed()?;

        if let Some(idx) = self.find_fill(blk_addr) {
            let limit = self.targets_per_mshr;
            let Some(mshr) = self.mshrs[idx].as_mut() else {
                return Ok(());
            };
            if mshr.targets.len() >= limit {
                return Err(SimError::protocol(
                    cache.name(),
                    format!("MSHR {idx} is out of targets"),
                ));
            }
            tracing::debug!(target: "cache", "{}: {} {:#x} coalesced into MSHR {}", cache.name(), cmd, addr, idx);
            mshr.targets.push(pkt);
            let now_full = mshr.targets.len() >= limit;
            cache.update_stats(|s| s.mshr_hits += 1);
            if now_full {
                self.full_mshrs += 1;
                cache.set_blocked(BlockedCause::NoTargets);
            }
            return Ok(());
        }

        tracing::debug!(target: "cache", "{}: {} {:#x} miss, fetching block {:#x}", cache.name(), cmd, addr, blk_addr);
        let fill_cmd = if cmd == MemCmd::ReadExReq {
            MemCmd::ReadExReq
        } else {
            MemCmd::ReadReq
        };
        let req = Rc::new(Request::new(blk_addr, self.blk_size, 0, now));
        let fill = Packet::new_ptr(req, fill_cmd, Dest::Broadcast);
        let idx = self.allocate(
            cache,
            Mshr {
                kind: MshrKind::Fill,
                blk_addr,
                owes_response: true,
                pkt: fill,
                targets: vec![pkt],
                in_service: false,
                stale: false,
            },
        )?;
        if self.targets_per_mshr <= 1 {
            self.full_mshrs += 1;
            cache.set_blocked(BlockedCause::NoTargets);
        }
        tracing::trace!(target: "cache", "{}: allocated MSHR {}", cache.name(), idx);
        Ok(())
    }

    fn handle_response(&mut self, cache: &BaseCache, pkt: PacketPtr) -> SimResult<()> {
        let now = cache.queue().cur_tick();
        let idx = pkt.borrow().sender_state.ok_or_else(|| {
            SimError::protocol(cache.name(), format!("response {} has no MSHR", pkt.borrow()))
        })?;
        let Some(mshr) = self.deallocate(cache, idx)? else {
            return Err(SimError::protocol(
                cache.name(),
                format!("response {} for free MSHR {idx}", pkt.borrow()),
            ));
        };
        tracing::debug!(target: "cache", "{}: MSHR {} completed with {}", cache.name(), idx, pkt.borrow());

        let (result, data) = {
            let p = pkt.borrow();
            (p.result, p.data().map(<[u8]>::to_vec))
        };
        let completion = now + self.hit_latency;

        match mshr.kind {
            MshrKind::Fill => {
                let blk = data.unwrap_or_else(|| vec![0; self.blk_size]);
                if result == PacketResult::Success && !mshr.stale {
                    self.blocks.insert(mshr.blk_addr, blk.clone());
                }
                for target in mshr.targets {
                    self.fill_target(&target, mshr.blk_addr, &blk);
                    mark_result(&target, result);
                    cache.respond_to_miss(target, completion)?;
                }
            }
            MshrKind::Forward => {
                for target in mshr.targets {
                    if let Some(data) = data.as_ref() {
                        if target.borrow().is_read() {
                            target.borrow_mut().set_data(data.clone());
                        }
                    }
                    mark_result(&target, result);
                    cache.respond_to_miss(target, completion)?;
                }
            }
        }
        Ok(())
    }
}

fn mark_result(target: &PacketPtr, result: PacketResult) {
    let mut t = target.borrow_mut();
    match result {
        PacketResult::Nacked => t.flags |= flags::NACKED_LINE,
        PacketResult::BadAddress => t.result = PacketResult::BadAddress,
        _ => {}
    }
}

impl MissHandler for MissQueue {
    fn in_cache(&self, addr: Addr) -> bool {
        self.blocks.contains_key(&self.blk_align(addr))
    }

    fn in_miss_queue(&self, addr: Addr) -> bool {
        let blk_addr = self.blk_align(addr);
        self.mshrs
            .iter()
            .flatten()
            .any(|m| m.blk_addr == blk_addr)
    }

    fn get_packet(&mut self) -> Option<(PacketPtr, MissHandle)> {
        let idx = *self.pending.front()?;
        let mshr = self.mshrs.get(idx)?.as_ref()?;
        Some((mshr.pkt.clone(), MissHandle(idx)))
    }

    fn send_result(
        &mut self,
        cache: &BaseCache,
        pkt: &PacketPtr,
        handle: MissHandle,
        success: bool,
    ) -> SimResult<()> {
        if !success {
            return Ok(());
        }
        if self.pending.front() != Some(&handle.0) {
            return Err(SimError::protocol(
                cache.name(),
                format!("sent MSHR {} out of order", handle.0),
            ));
        }
        self.pending.pop_front();
        let owes_response = match self.mshrs.get_mut(handle.0).and_then(Option::as_mut) {
            Some(mshr) => {
                mshr.in_service = true;
                mshr.owes_response
            }
            None => {
                return Err(SimError::protocol(
                    cache.name(),
                    format!("sent {} from free MSHR {}", pkt.borrow(), handle.0),
                ))
            }
        };
        // Nothing comes back for a packet owed no response.
        if !owes_response {
            if let Some(mshr) = self.deallocate(cache, handle.0)? {
                for target in mshr.targets {
                    cache.respond(target, cache.queue().cur_tick())?;
                }
            }
        }
        if self.pending.is_empty() {
            cache.clear_master_request(RequestCause::Mshr);
        }
        Ok(())
    }

    fn do_timing_access(
        &mut self,
        cache: &BaseCache,
        pkt: PacketPtr,
        is_cpu_side: bool,
    ) -> SimResult<bool> {
        let is_response = pkt.borrow().is_response();
        match (is_cpu_side, is_response) {
            (true, false) => self.handle_request(cache, pkt)?,
            (false, true) => self.handle_response(cache, pkt)?,
            (false, false) => {
                // No coherence protocol: snoops are observed and dropped.
                tracing::trace!(target: "cache", "{}: ignoring snoop {}", cache.name(), pkt.borrow());
            }
            (true, true) => {
                return Err(SimError::protocol(
                    cache.name(),
                    format!("response {} on the CPU side", pkt.borrow()),
                ))
            }
        }
        Ok(true)
    }

    fn do_atomic_access(
        &mut self,
        cache: &BaseCache,
        pkt: &PacketPtr,
        is_cpu_side: bool,
    ) -> SimResult<Tick> {
        if !is_cpu_side {
            return Ok(0);
        }
        let (addr, cmd, uncacheable, is_write, needs_response) = {
            let p = pkt.borrow();
            (p.addr(), p.cmd, p.req().is_uncacheable(), p.is_write(), p.needs_response())
        };
        let blk_addr = self.blk_align(addr);

        if uncacheable {
            cache.update_stats(|s| s.uncacheable_accesses += 1);
            return Ok(self.hit_latency + cache.mem_side().send_atomic(pkt)?);
        }

        if is_write {
            let offset = (addr - blk_addr) as usize;
            let present = match (self.blocks.get_mut(&blk_addr), pkt.borrow().data()) {
                (Some(blk), Some(data)) => {
                    if let Some(dst) = blk.get_mut(offset..offset + data.len()) {
                        dst.copy_from_slice(data);
                    }
                    true
                }
                (blk, _) => blk.is_some(),
            };
            cache.update_stats(|s| {
                if present {
                    s.hits[cmd.index()] += 1;
                } else {
                    s.misses[cmd.index()] += 1;
                }
            });
            return Ok(self.hit_latency + cache.mem_side().send_atomic(pkt)?);
        }

        let mut latency = self.hit_latency;
        if !self.blocks.contains_key(&blk_addr) {
            cache.update_stats(|s| s.misses[cmd.index()] += 1);
            cache.missed()?;
            let req = Rc::new(Request::new(blk_addr, self.blk_size, 0, cache.queue().cur_tick()));
            let fill = Packet::new_ptr(req, MemCmd::ReadReq, Dest::Broadcast);
            latency += cache.mem_side().send_atomic(&fill)?;
            let (result, data) = {
                let f = fill.borrow();
                (f.result, f.data().map(<[u8]>::to_vec))
            };
            if result != PacketResult::Success {
                let mut p = pkt.borrow_mut();
                p.result = result;
                if needs_response {
                    p.make_atomic_response()?;
                }
                return Ok(latency);
            }
            self.blocks
                .insert(blk_addr, data.unwrap_or_else(|| vec![0; self.blk_size]));
        } else {
            cache.update_stats(|s| s.hits[cmd.index()] += 1);
        }

        if let Some(blk) = self.blocks.get(&blk_addr) {
            self.fill_target(pkt, blk_addr, blk);
        }
        if needs_response {
            pkt.borrow_mut().make_atomic_response()?;
        }
        Ok(latency)
    }

    fn do_functional_access(
        &mut self,
        cache: &BaseCache,
        pkt: &PacketPtr,
        is_cpu_side: bool,
    ) -> SimResult<()> {
        let (addr, is_read, is_write) = {
            let p = pkt.borrow();
            (p.addr(), p.is_read(), p.is_write())
        };
        let blk_addr = self.blk_align(addr);

        if is_write {
            let offset = (addr - blk_addr) as usize;
            if let (Some(blk), Some(data)) = (self.blocks.get_mut(&blk_addr), pkt.borrow().data()) {
                if let Some(dst) = blk.get_mut(offset..offset + data.len()) {
                    dst.copy_from_slice(data);
                }
            }
        }
        if !is_cpu_side {
            return Ok(());
        }

        if is_read {
            if let Some(blk) = self.blocks.get(&blk_addr) {
                self.fill_target(pkt, blk_addr, blk);
                pkt.borrow_mut().flags |= flags::SATISFIED;
                return Ok(());
            }
        }

        // Writes still waiting in an MSHR are newer than memory.
        for mshr in self.mshrs.iter().flatten() {
            if mshr.kind == MshrKind::Forward && !mshr.in_service {
                let satisfied = pkt.borrow_mut().fix_functional(&mut mshr.pkt.borrow_mut());
                if satisfied {
                    return Ok(());
                }
            }
        }

        cache.mem_side().check_and_send_functional(pkt)
    }
}
