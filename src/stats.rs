//! Simulation statistics collection and reporting.
//!
//! Each component keeps its own counters; [`SimStats`] gathers them at the
//! end of a run and prints a fixed-width report.

use crate::cache::base::NUM_BLOCKED_CAUSES;
use crate::cache::BlockedCause;
use crate::common::Tick;
use crate::mem::packet::{MemCmd, NUM_MEM_CMDS};
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Counters of a cache.
///
/// Per-command arrays are indexed by [`MemCmd::index`], per-cause arrays by
/// [`BlockedCause::index`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: [u64; NUM_MEM_CMDS],
    pub misses: [u64; NUM_MEM_CMDS],
    /// Ticks from request to response, summed over cacheable misses.
    pub miss_latency: [Tick; NUM_MEM_CMDS],
    /// Misses coalesced onto an outstanding MSHR.
    pub mshr_hits: u64,
    pub uncacheable_accesses: u64,
    /// Times the cache became blocked, by the cause that blocked it.
    pub blocked_causes: [u64; NUM_BLOCKED_CAUSES],
    /// Ticks spent blocked, by the cause that unblocked it.
    pub blocked_cycles: [Tick; NUM_BLOCKED_CAUSES],
}

impl CacheStats {
    pub fn accesses(&self, cmd: MemCmd) -> u64 {
        self.hits[cmd.index()] + self.misses[cmd.index()]
    }

    /// Fraction of accesses with `cmd` that missed.
    pub fn miss_rate(&self, cmd: MemCmd) -> f64 {
        ratio(self.misses[cmd.index()], self.accesses(cmd))
    }

    /// Average ticks per miss with `cmd`.
    pub fn avg_miss_latency(&self, cmd: MemCmd) -> f64 {
        ratio(self.miss_latency[cmd.index()], self.misses[cmd.index()])
    }

    pub fn demand_hits(&self) -> u64 {
        MemCmd::ALL
            .iter()
            .filter(|c| c.is_demand())
            .map(|c| self.hits[c.index()])
            .sum()
    }

    pub fn demand_misses(&self) -> u64 {
        MemCmd::ALL
            .iter()
            .filter(|c| c.is_demand())
            .map(|c| self.misses[c.index()])
            .sum()
    }

    pub fn demand_miss_rate(&self) -> f64 {
        let misses = self.demand_misses();
        ratio(misses, self.demand_hits() + misses)
    }

    /// Average length of a blocked period ending with `cause`.
    pub fn avg_blocked_cycles(&self, cause: BlockedCause) -> f64 {
        ratio(
            self.blocked_cycles[cause.index()],
            self.blocked_causes[cause.index()],
        )
    }
}

/// Counters of a bus.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusStats {
    /// Timing packets forwarded and accepted.
    pub timing_packets: u64,
    /// Timing packets refused by their destination.
    pub rejections: u64,
    /// Retries handed back to originating ports.
    pub retries: u64,
    pub atomic_accesses: u64,
    pub functional_accesses: u64,
}

/// Counters of a memory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub reads: u64,
    pub writes: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    /// Requests refused because too many responses were queued.
    pub refused: u64,
}

/// Counters of a traffic generator.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficStats {
    pub issued: u64,
    pub reads: u64,
    pub writes: u64,
    pub completed: u64,
    /// Responses that came back with an error.
    pub errors: u64,
    pub refused: u64,
    pub retries: u64,
    pub total_latency: Tick,
    pub max_latency: Tick,
}

impl TrafficStats {
    pub fn avg_latency(&self) -> f64 {
        ratio(self.total_latency, self.completed)
    }
}

fn ratio(num: u64, den: u64) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

/// End-of-run statistics of a whole system.
#[derive(Clone, Debug, Serialize)]
pub struct SimStats {
    #[serde(skip)]
    start_time: Option<Instant>,
    pub sim_ticks: Tick,
    pub exit_cause: String,
    pub traffic: TrafficStats,
    pub cache_name: String,
    pub cache: CacheStats,
    pub bus_name: String,
    pub bus: BusStats,
    pub memories: Vec<(String, MemoryStats)>,
}

impl SimStats {
    /// Starts timing host execution.
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            sim_ticks: 0,
            exit_cause: String::new(),
            traffic: TrafficStats::default(),
            cache_name: String::new(),
            cache: CacheStats::default(),
            bus_name: String::new(),
            bus: BusStats::default(),
            memories: Vec::new(),
        }
    }

    /// Prints a formatted summary of the run.
    pub fn print(&self) {
        let seconds = self
            .start_time
            .map_or(0.0, |t| t.elapsed().as_secs_f64());
        let tick_rate = if seconds > 0.0 {
            (self.sim_ticks as f64 / seconds) / 1000.0
        } else {
            0.0
        };

        println!("\n==========================================================");
        println!("MEMORY SYSTEM SIMULATION STATISTICS");
        println!("==========================================================");
        println!("host_seconds             {:.4} s", seconds);
        println!("sim_ticks                {}", self.sim_ticks);
        println!("sim_tick_rate            {:.2} kTicks/s", tick_rate);
        println!("exit_cause               {}", self.exit_cause);
        println!("----------------------------------------------------------");
        println!("TRAFFIC");
        let t = &self.traffic;
        println!("  issued                 {}", t.issued);
        println!("  reads                  {}", t.reads);
        println!("  writes                 {}", t.writes);
        println!("  completed              {}", t.completed);
        println!("  errors                 {}", t.errors);
        println!("  refused                {}", t.refused);
        println!("  retries                {}", t.retries);
        println!("  avg_latency            {:.2}", t.avg_latency());
        println!("  max_latency            {}", t.max_latency);
        println!("----------------------------------------------------------");
        println!("CACHE {}", self.cache_name);
        let c = &self.cache;
        for cmd in MemCmd::ALL {
            let accesses = c.accesses(cmd);
            if accesses == 0 {
                continue;
            }
            println!(
                "  {:<14} accesses: {:<10} | hits: {:<10} | miss_rate: {:.2}% | avg_miss_latency: {:.2}",
                cmd.as_str(),
                accesses,
                c.hits[cmd.index()],
                c.miss_rate(cmd) * 100.0,
                c.avg_miss_latency(cmd)
            );
        }
        println!("  demand_hits            {}", c.demand_hits());
        println!("  demand_misses          {}", c.demand_misses());
        println!("  demand_miss_rate       {:.2}%", c.demand_miss_rate() * 100.0);
        println!("  mshr_hits              {}", c.mshr_hits);
        println!("  uncacheable            {}", c.uncacheable_accesses);
        for cause in BlockedCause::ALL {
            println!(
                "  blocked.{:<14} {:<10} | cycles: {:<10} | avg: {:.2}",
                cause.as_str(),
                c.blocked_causes[cause.index()],
                c.blocked_cycles[cause.index()],
                c.avg_blocked_cycles(cause)
            );
        }
        println!("----------------------------------------------------------");
        println!("BUS {}", self.bus_name);
        let b = &self.bus;
        println!("  timing_packets         {}", b.timing_packets);
        println!("  rejections             {}", b.rejections);
        println!("  retries                {}", b.retries);
        println!("  atomic_accesses        {}", b.atomic_accesses);
        println!("  functional_accesses    {}", b.functional_accesses);
        println!("----------------------------------------------------------");
        println!("MEMORY");
        for (name, m) in &self.memories {
            println!(
                "  {:<10} reads: {:<10} | writes: {:<10} | bytes: {}/{} | refused: {}",
                name, m.reads, m.writes, m.bytes_read, m.bytes_written, m.refused
            );
        }
        println!("==========================================================");
    }
}

impl Default for SimStats {
    fn default() -> Self {
        Self::new()
    }
}
