//! System Builder.
//!
//! This module defines the `System` structure, which owns every component of
//! a simulated memory system and the event queue driving them. It handles
//! construction and wiring from a [`Config`], running, draining and
//! checkpointing.

use crate::cache::{BaseCache, CacheCheckpoint, MissQueue};
use crate::common::{SimError, SimResult, Tick};
use crate::config::Config;
use crate::cpu::TrafficGen;
use crate::mem::port::connect;
use crate::sim::{EventId, EventQueue, ExitCause, QueueCheckpoint};
use crate::soc::interconnect::Bus;
use crate::soc::memory::controller;
use crate::soc::memory::{MemoryCheckpoint, PhysicalMemory};
use crate::stats::{SimStats, TrafficStats};
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::rc::Rc;

/// Everything needed to resume a drained system.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SystemCheckpoint {
    pub queue: QueueCheckpoint,
    pub cache: CacheCheckpoint,
    pub memories: Vec<MemoryCheckpoint>,
    pub traffic_issued: u64,
    pub traffic_stats: TrafficStats,
}

impl SystemCheckpoint {
    /// Writes the checkpoint as JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> SimResult<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| SimError::Checkpoint(e.to_string()))?;
        fs::write(path.as_ref(), json)
            .map_err(|e| SimError::Checkpoint(format!("{}: {e}", path.as_ref().display())))
    }

    /// Reads a checkpoint written by [`save`](Self::save).
    pub fn load(path: impl AsRef<Path>) -> SimResult<Self> {
        let json = fs::read_to_string(path.as_ref())
            .map_err(|e| SimError::Checkpoint(format!("{}: {e}", path.as_ref().display())))?;
        serde_json::from_str(&json).map_err(|e| SimError::Checkpoint(e.to_string()))
    }
}

/// A complete memory system.
///
/// The reference topology is one traffic generator in front of one cache,
/// whose memory side sits on a bus shared with every configured memory:
///
/// ```text
/// traffic.port <-> cache.cpu_side
/// cache.mem_side <-> bus-p0
/// bus-p1..N <-> memory[0..N-1].port
/// ```
pub struct System {
    queue: Rc<EventQueue>,
    traffic: Rc<TrafficGen>,
    cache: Rc<BaseCache>,
    bus: Rc<Bus>,
    memories: Vec<Rc<PhysicalMemory>>,
}

impl System {
    /// Builds, wires and initializes a system, then starts its traffic.
    ///
    /// # Arguments
    ///
    /// * `config` - Validated system configuration
    ///
    /// # Returns
    ///
    /// The system, positioned at tick 0 with the first access scheduled.
    pub fn new(config: &Config) -> SimResult<Self> {
        let queue = Rc::new(EventQueue::new(config.sim.name.clone()));

        let traffic = TrafficGen::new("traffic", queue.clone(), &config.traffic);
        let cache = BaseCache::new(
            config.cache.name.clone(),
            queue.clone(),
            &config.cache,
            Box::new(MissQueue::new(&config.cache)),
        );
        let bus = Bus::new(config.bus.name.clone(), config.bus.bus_id);

        cache.connect_cpu_side(&traffic.port())?;
        cache.connect_mem_side(&bus.get_port())?;

        let mut memories = Vec::with_capacity(config.memory.len());
        for (i, m) in config.memory.iter().enumerate() {
            let name = m.name.clone().unwrap_or_else(|| format!("physmem{i}"));
            let range = m
                .range()
                .map_err(|e| SimError::protocol(&name, e.to_string()))?;
            let memory = PhysicalMemory::new(
                name,
                queue.clone(),
                range,
                controller::from_config(m),
                (m.max_outstanding > 0).then_some(m.max_outstanding),
            );
            connect(&memory.port(), &bus.get_port())?;
            memories.push(memory);
        }

        bus.init()?;
        for memory in &memories {
            memory.init()?;
        }
        traffic.start()?;

        tracing::info!(target: "bus_ranges", "{}: {} ranges mapped over {} ports", bus.name(), bus.port_list().len(), bus.num_ports());
        Ok(Self {
            queue,
            traffic,
            cache,
            bus,
            memories,
        })
    }

    /// Rebuilds a system from `config` and resumes it from a checkpoint.
    pub fn restore(config: &Config, cp: &SystemCheckpoint) -> SimResult<Self> {
        let system = Self::new(config)?;
        system.traffic.stop()?;

        if cp.memories.len() != system.memories.len() {
            return Err(SimError::Checkpoint(format!(
                "checkpoint holds {} memories, system has {}",
                cp.memories.len(),
                system.memories.len()
            )));
        }
        for (memory, mcp) in system.memories.iter().zip(&cp.memories) {
            memory.unserialize(mcp)?;
        }
        system.cache.unserialize(&cp.cache)?;

        let events = system.event_names();
        system
            .queue
            .unserialize(&cp.queue, |name| events.get(name).copied())?;

        system.traffic.set_issued(cp.traffic_issued);
        system.traffic.set_stats(cp.traffic_stats);
        system.resume()?;
        tracing::info!(target: "eventq", "restored at tick {}", system.queue.cur_tick());
        Ok(system)
    }

    pub fn queue(&self) -> &Rc<EventQueue> {
        &self.queue
    }

    pub fn traffic(&self) -> &Rc<TrafficGen> {
        &self.traffic
    }

    pub fn cache(&self) -> &Rc<BaseCache> {
        &self.cache
    }

    pub fn bus(&self) -> &Rc<Bus> {
        &self.bus
    }

    pub fn memories(&self) -> &[Rc<PhysicalMemory>] {
        &self.memories
    }

    pub fn cur_tick(&self) -> Tick {
        self.queue.cur_tick()
    }

    /// Runs the event loop up to `max_tick`.
    pub fn run(&self, max_tick: Tick) -> SimResult<ExitCause> {
        self.queue.simulate(max_tick)
    }

    /// Owned events of every component, by name.
    fn event_names(&self) -> HashMap<String, EventId> {
        let mut ids = vec![self.traffic.issue_event()];
        for port in [self.cache.cpu_side(), self.cache.mem_side()] {
            ids.extend([port.request_event(), port.response_event(), port.retry_event()]);
        }
        ids.extend(self.memories.iter().map(|m| m.send_event()));
        ids.into_iter()
            .filter_map(|id| self.queue.event_name(id).map(|name| (name, id)))
            .collect()
    }

    /// Looks up a component event by name.
    pub fn event_by_name(&self, name: &str) -> Option<EventId> {
        self.event_names().get(name).copied()
    }

    /// Stops the traffic and services events until nothing is in flight.
    ///
    /// A loop exit requested meanwhile is left raised, so the next
    /// [`run`](Self::run) returns it and a checkpoint records it.
    /// Returns the tick at which the system became quiet.
    pub fn drain(&self) -> SimResult<Tick> {
        self.traffic.stop()?;

        let drained = Rc::new(Cell::new(false));
        let flag = drained.clone();
        if self.cache.drain(Box::new(move || flag.set(true))) == 0 {
            drained.set(true);
        }

        while !(drained.get() && self.is_quiet()) || self.queue.exit_scheduled() {
            if self.queue.is_empty() {
                return Err(SimError::Checkpoint(format!(
                    "event queue ran dry at tick {} before the system drained",
                    self.queue.cur_tick()
                )));
            }
            self.queue.service_one()?;
        }
        tracing::info!(target: "cache", "{}: system drained at tick {}", self.cache.name(), self.queue.cur_tick());
        Ok(self.queue.cur_tick())
    }

    fn is_quiet(&self) -> bool {
        self.traffic.outstanding() == 0
            && !self.traffic.is_waiting_for_retry()
            && self.memories.iter().all(|m| m.outstanding() == 0)
    }

    /// Returns to normal operation after [`drain`](Self::drain).
    pub fn resume(&self) -> SimResult<()> {
        self.cache.resume();
        self.traffic.start()
    }

    /// Drains the system and captures its state.
    pub fn checkpoint(&self) -> SimResult<SystemCheckpoint> {
        self.drain()?;
        let memories = self
            .memories
            .iter()
            .map(|m| m.serialize())
            .collect::<SimResult<Vec<_>>>()?;
        Ok(SystemCheckpoint {
            queue: self.queue.serialize(),
            cache: self.cache.serialize()?,
            memories,
            traffic_issued: self.traffic.issued(),
            traffic_stats: self.traffic.stats(),
        })
    }

    /// Gathers the statistics of every component.
    pub fn collect_stats(&self, stats: &mut SimStats) {
        stats.sim_ticks = self.queue.cur_tick();
        stats.traffic = self.traffic.stats();
        stats.cache_name = self.cache.name().to_string();
        stats.cache = self.cache.stats();
        stats.bus_name = self.bus.name().to_string();
        stats.bus = self.bus.stats();
        stats.memories = self
            .memories
            .iter()
            .map(|m| (m.name().to_string(), m.stats()))
            .collect();
    }
}
