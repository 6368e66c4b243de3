//! Simulation configuration.
//!
//! Configurations are TOML documents. Every field has a default, so an
//! empty document describes the reference system: one traffic generator
//! feeding one cache, a bus, and a single memory.
//!
//! ```toml
//! [sim]
//! max_tick = 1_000_000
//!
//! [traffic]
//! stride = 64
//! count = 1000
//!
//! [cache]
//! mshrs = 4
//!
//! [[memory]]
//! base = 0x0
//! size = 0x1000_0000
//! controller = "dram"
//! ```

use crate::common::{AddrRange, ConfigError, Tick, MAX_TICK};
use serde::Deserialize;
use std::fs;
use std::path::Path;

const DEFAULT_BLK_SIZE: usize = 64;
const DEFAULT_HIT_LATENCY: Tick = 2;
const DEFAULT_MSHRS: usize = 4;
const DEFAULT_TARGETS: usize = 4;

const DEFAULT_MEM_BASE: u64 = 0x0;
const DEFAULT_MEM_SIZE: u64 = 0x1000_0000;
const DEFAULT_MEM_LATENCY: Tick = 30;

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub sim: SimConfig,
    #[serde(default)]
    pub traffic: TrafficConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default = "default_memories")]
    pub memory: Vec<MemoryConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sim: SimConfig::default(),
            traffic: TrafficConfig::default(),
            cache: CacheConfig::default(),
            bus: BusConfig::default(),
            memory: default_memories(),
        }
    }
}

impl Config {
    /// Reads and validates a configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&text)
    }

    /// Parses and validates a configuration document.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks values serde cannot: sizes, counts and the memory map.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.cache;
        if !c.blk_size.is_power_of_two() {
            return Err(invalid("cache.blk_size", format!("{} is not a power of two", c.blk_size)));
        }
        if c.mshrs == 0 {
            return Err(invalid("cache.mshrs", "at least one MSHR is required"));
        }
        if c.targets_per_mshr == 0 {
            return Err(invalid("cache.targets_per_mshr", "at least one target is required"));
        }

        let t = &self.traffic;
        if t.size == 0 || t.size > c.blk_size {
            return Err(invalid(
                "traffic.size",
                format!("{} must be between 1 and the block size {}", t.size, c.blk_size),
            ));
        }
        if !t.size.is_power_of_two() {
            return Err(invalid("traffic.size", format!("{} is not a power of two", t.size)));
        }
        let size = t.size as u64;
        if t.start_addr % size != 0 || t.stride % size != 0 || t.span % size != 0 {
            return Err(invalid(
                "traffic",
                format!("start_addr, stride and span must be multiples of the access size {size}"),
            ));
        }
        if t.max_outstanding == 0 {
            return Err(invalid("traffic.max_outstanding", "must be at least 1"));
        }

        if self.memory.is_empty() {
            return Err(invalid("memory", "at least one memory is required"));
        }
        let ranges = self
            .memory
            .iter()
            .map(MemoryConfig::range)
            .collect::<Result<Vec<_>, _>>()?;
        for (i, a) in ranges.iter().enumerate() {
            if let Some(b) = ranges[i + 1..].iter().find(|b| a.intersects(b)) {
                return Err(invalid("memory", format!("range {a} overlaps {b}")));
            }
        }
        for m in &self.memory {
            if m.controller == ControllerKind::Dram && !m.row_size.is_power_of_two() {
                return Err(invalid("memory.row_size", format!("{} is not a power of two", m.row_size)));
            }
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct SimConfig {
    /// Name of the event queue.
    #[serde(default = "default_queue_name")]
    pub name: String,

    /// Stop once the next event lies beyond this tick.
    #[serde(default = "default_max_tick")]
    pub max_tick: Tick,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            name: default_queue_name(),
            max_tick: default_max_tick(),
        }
    }
}

fn default_queue_name() -> String {
    "MainEventQueue".to_string()
}

fn default_max_tick() -> Tick {
    MAX_TICK
}

/// How the traffic generator talks to memory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    #[default]
    Timing,
    Atomic,
}

#[derive(Clone, Debug, Deserialize)]
pub struct TrafficConfig {
    #[serde(default)]
    pub mode: AccessMode,

    #[serde(default)]
    pub start_addr: u64,

    #[serde(default = "default_stride")]
    pub stride: u64,

    /// Addresses wrap around after this many bytes.
    #[serde(default = "default_span")]
    pub span: u64,

    /// Total accesses to issue.
    #[serde(default = "default_count")]
    pub count: u64,

    /// Bytes per access.
    #[serde(default = "default_access_size")]
    pub size: usize,

    /// Every n-th access is a write; 0 disables writes.
    #[serde(default = "default_write_interval")]
    pub write_interval: u64,

    /// Ticks between accesses.
    #[serde(default = "default_interval")]
    pub interval: Tick,

    #[serde(default = "default_max_outstanding")]
    pub max_outstanding: usize,
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            mode: AccessMode::default(),
            start_addr: 0,
            stride: default_stride(),
            span: default_span(),
            count: default_count(),
            size: default_access_size(),
            write_interval: default_write_interval(),
            interval: default_interval(),
            max_outstanding: default_max_outstanding(),
        }
    }
}

fn default_stride() -> u64 {
    64
}

fn default_span() -> u64 {
    0x10_0000
}

fn default_count() -> u64 {
    1000
}

fn default_access_size() -> usize {
    8
}

fn default_write_interval() -> u64 {
    4
}

fn default_interval() -> Tick {
    1
}

fn default_max_outstanding() -> usize {
    8
}

#[derive(Clone, Debug, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_name")]
    pub name: String,

    #[serde(default = "default_blk_size")]
    pub blk_size: usize,

    #[serde(default = "default_hit_latency")]
    pub hit_latency: Tick,

    #[serde(default = "default_mshrs")]
    pub mshrs: usize,

    #[serde(default = "default_targets")]
    pub targets_per_mshr: usize,

    /// Exit the simulation after this many misses; 0 disables the limit.
    #[serde(default)]
    pub max_misses: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            name: default_cache_name(),
            blk_size: DEFAULT_BLK_SIZE,
            hit_latency: DEFAULT_HIT_LATENCY,
            mshrs: DEFAULT_MSHRS,
            targets_per_mshr: DEFAULT_TARGETS,
            max_misses: 0,
        }
    }
}

fn default_cache_name() -> String {
    "l1".to_string()
}

fn default_blk_size() -> usize {
    DEFAULT_BLK_SIZE
}

fn default_hit_latency() -> Tick {
    DEFAULT_HIT_LATENCY
}

fn default_mshrs() -> usize {
    DEFAULT_MSHRS
}

fn default_targets() -> usize {
    DEFAULT_TARGETS
}

#[derive(Clone, Debug, Deserialize)]
pub struct BusConfig {
    #[serde(default = "default_bus_name")]
    pub name: String,

    #[serde(default)]
    pub bus_id: u32,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            name: default_bus_name(),
            bus_id: 0,
        }
    }
}

fn default_bus_name() -> String {
    "membus".to_string()
}

/// Latency model of a memory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControllerKind {
    #[default]
    Simple,
    Dram,
}

#[derive(Clone, Debug, Deserialize)]
pub struct MemoryConfig {
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default = "default_mem_base")]
    pub base: u64,

    #[serde(default = "default_mem_size")]
    pub size: u64,

    #[serde(default)]
    pub controller: ControllerKind,

    /// Fixed latency of the simple controller.
    #[serde(default = "default_mem_latency")]
    pub latency: Tick,

    #[serde(default = "default_t_cas")]
    pub t_cas: Tick,

    #[serde(default = "default_t_ras")]
    pub t_ras: Tick,

    #[serde(default = "default_t_pre")]
    pub t_pre: Tick,

    #[serde(default = "default_row_size")]
    pub row_size: u64,

    /// Refuse requests while this many responses are queued; 0 never refuses.
    #[serde(default)]
    pub max_outstanding: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            name: None,
            base: DEFAULT_MEM_BASE,
            size: DEFAULT_MEM_SIZE,
            controller: ControllerKind::default(),
            latency: DEFAULT_MEM_LATENCY,
            t_cas: default_t_cas(),
            t_ras: default_t_ras(),
            t_pre: default_t_pre(),
            row_size: default_row_size(),
            max_outstanding: 0,
        }
    }
}

impl MemoryConfig {
    /// The address range the memory answers for.
    pub fn range(&self) -> Result<AddrRange, ConfigError> {
        if self.size == 0 {
            return Err(invalid("memory.size", "must not be zero"));
        }
        let end = self
            .base
            .checked_add(self.size - 1)
            .ok_or_else(|| invalid("memory.size", format!("{:#x} + {:#x} overflows", self.base, self.size)))?;
        Ok(AddrRange::new(self.base, end))
    }
}

fn default_memories() -> Vec<MemoryConfig> {
    vec![MemoryConfig::default()]
}

fn default_mem_base() -> u64 {
    DEFAULT_MEM_BASE
}

fn default_mem_size() -> u64 {
    DEFAULT_MEM_SIZE
}

fn default_mem_latency() -> Tick {
    DEFAULT_MEM_LATENCY
}

fn default_t_cas() -> Tick {
    14
}

fn default_t_ras() -> Tick {
    14
}

fn default_t_pre() -> Tick {
    14
}

fn default_row_size() -> u64 {
    2048
}
