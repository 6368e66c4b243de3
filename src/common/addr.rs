//! Physical Address Ranges.
//!
//! Devices announce the address ranges they respond to as lists of
//! inclusive `[start, end]` ranges. The interconnect builds its routing
//! table from these lists.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Physical address type.
pub type Addr = u64;

/// A list of address ranges, as returned by a device range query.
pub type AddrRangeList = Vec<AddrRange>;

/// An inclusive physical address range `[start, end]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AddrRange {
    /// First address of the range.
    pub start: Addr,
    /// Last address of the range (inclusive).
    pub end: Addr,
}

impl AddrRange {
    /// Creates a range covering `start..=end`.
    ///
    /// # Panics
    ///
    /// Panics if `end < start`.
    pub fn new(start: Addr, end: Addr) -> Self {
        assert!(end >= start, "inverted address range {start:#x}:{end:#x}");
        Self { start, end }
    }

    /// Creates a range of `size` bytes starting at `base`.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero.
    pub fn with_size(base: Addr, size: u64) -> Self {
        assert!(size > 0, "empty address range at {base:#x}");
        Self::new(base, base + (size - 1))
    }

    /// Returns `true` if `addr` falls inside the range.
    #[inline(always)]
    pub fn contains(&self, addr: Addr) -> bool {
        addr >= self.start && addr <= self.end
    }

    /// Returns `true` if the two ranges share at least one address.
    pub fn intersects(&self, other: &AddrRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// Number of bytes covered by the range.
    pub fn size(&self) -> u64 {
        self.end - self.start + 1
    }
}

impl fmt::Display for AddrRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x} : {:#x}", self.start, self.end)
    }
}
