//! Access latency models for physical memory.
//!
//! [`PhysicalMemory`](super::PhysicalMemory) asks its controller how long
//! every atomic or timing access takes. The flat model charges the same
//! number of ticks for everything; the DRAM model keeps one bank's row
//! buffer and charges activation and precharge when the row changes.

use crate::common::{Addr, Tick};
use crate::config::{ControllerKind, MemoryConfig};

/// Decides how many ticks a memory access costs.
pub trait MemoryController {
    /// Ticks spent servicing an access to `addr`. May update internal
    /// state such as the open row.
    fn access_latency(&mut self, addr: Addr) -> Tick;
}

/// Selects and builds the latency model named by `config.controller`.
pub fn from_config(config: &MemoryConfig) -> Box<dyn MemoryController> {
    match config.controller {
        ControllerKind::Simple => Box::new(SimpleController::new(config.latency)),
        ControllerKind::Dram => Box::new(DramController::new(
            config.t_cas,
            config.t_ras,
            config.t_pre,
            config.row_size,
        )),
    }
}

/// Flat latency, independent of the address.
pub struct SimpleController {
    ticks: Tick,
}

impl SimpleController {
    pub fn new(latency: Tick) -> Self {
        Self { ticks: latency }
    }
}

impl MemoryController for SimpleController {
    fn access_latency(&mut self, _addr: Addr) -> Tick {
        self.ticks
    }
}

/// Row buffer of the modelled bank.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RowBuffer {
    Closed,
    Open(Addr),
}

/// Single-bank DRAM with an open-page policy.
///
/// | state of the row buffer | cost                      |
/// |-------------------------|---------------------------|
/// | holds the wanted row    | `t_cas`                   |
/// | empty                   | `t_ras + t_cas`           |
/// | holds another row       | `t_pre + t_ras + t_cas`   |
pub struct DramController {
    buffer: RowBuffer,
    row_shift: u32,
    hit: Tick,
    activate: Tick,
    conflict: Tick,
}

impl DramController {
    /// `row_size` is the number of bytes sharing one row and is expected to
    /// be a power of two; configuration validation enforces this.
    pub fn new(t_cas: Tick, t_ras: Tick, t_pre: Tick, row_size: u64) -> Self {
        let activate = t_ras + t_cas;
        Self {
            buffer: RowBuffer::Closed,
            row_shift: row_size.max(1).trailing_zeros(),
            hit: t_cas,
            activate,
            conflict: t_pre + activate,
        }
    }

    fn row_of(&self, addr: Addr) -> Addr {
        addr >> self.row_shift
    }
}

impl MemoryController for DramController {
    fn access_latency(&mut self, addr: Addr) -> Tick {
        let row = self.row_of(addr);
        let cost = match self.buffer {
            RowBuffer::Open(open) if open == row => return self.hit,
            RowBuffer::Open(_) => self.conflict,
            RowBuffer::Closed => self.activate,
        };
        self.buffer = RowBuffer::Open(row);
        cost
    }
}
