//! Time-Ordered Transmit Lists.
//!
//! Responses may be computed out of order: a hit computed now can be ready
//! before a miss computed earlier. Each responding port keeps its pending
//! responses in a list sorted by delivery tick, driven by a single wake-up
//! event that always targets the front entry. [`TransmitList::push`] tells
//! the owner what to do with that event.

use super::packet::PacketPtr;
use crate::common::Tick;
use std::collections::VecDeque;

/// What the owner must do with its wake-up event after a push.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Wakeup {
    /// The list was empty: schedule the wake-up for this tick.
    Schedule(Tick),
    /// A new front was inserted: move the wake-up to this earlier tick.
    Reschedule(Tick),
    /// The front is unchanged.
    Unchanged,
}

/// Pending `(delivery tick, packet)` entries in non-decreasing tick order.
#[derive(Default)]
pub struct TransmitList {
    entries: VecDeque<(Tick, PacketPtr)>,
}

impl TransmitList {
    /// Creates an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a packet due at `when`.
    ///
    /// Entries with equal ticks keep their insertion order.
    pub fn push(&mut self, when: Tick, pkt: PacketPtr) -> Wakeup {
        let Some(&(last, _)) = self.entries.back() else {
            self.entries.push_back((when, pkt));
            return Wakeup::Schedule(when);
        };
        if when >= last {
            self.entries.push_back((when, pkt));
            return Wakeup::Unchanged;
        }
        let pos = self.entries.partition_point(|&(t, _)| t <= when);
        self.entries.insert(pos, (when, pkt));
        if pos == 0 {
            Wakeup::Reschedule(when)
        } else {
            Wakeup::Unchanged
        }
    }

    /// Removes the front entry.
    pub fn pop_front(&mut self) -> Option<(Tick, PacketPtr)> {
        self.entries.pop_front()
    }

    /// The front entry's packet, left in place.
    pub fn front(&self) -> Option<PacketPtr> {
        self.entries.front().map(|(_, p)| p.clone())
    }

    /// Delivery tick of the front entry.
    pub fn front_tick(&self) -> Option<Tick> {
        self.entries.front().map(|&(t, _)| t)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Delivery ticks, front to back.
    pub fn ticks(&self) -> Vec<Tick> {
        self.entries.iter().map(|&(t, _)| t).collect()
    }

    /// Iterates over the queued packets, front to back.
    pub fn packets(&self) -> impl Iterator<Item = &PacketPtr> {
        self.entries.iter().map(|(_, p)| p)
    }
}
