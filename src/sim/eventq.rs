//! Discrete-Event Queue.
//!
//! The event queue is the only source of time advancement in the simulator.
//! Pending events are kept ordered by `(when, priority)`; among events with
//! the same `when` and `priority`, the one scheduled most recently fires
//! first. Components rely on this last-scheduled-fires-first rule for the
//! relative order of work at identical ticks, so it is part of the contract.
//!
//! Events live in an arena owned by the queue and are referred to through
//! [`EventId`] handles. A creator-owned event stays allocated until its
//! creator calls [`EventQueue::release`]; auto-delete events are freed by the
//! queue once they have fired.
//!
//! Cancellation is lazy: [`EventQueue::squash`] only flags the event. It is
//! still dequeued at its tick, but its action is skipped.

use crate::common::{SimError, SimResult, Tick};
use std::cell::{Cell, RefCell};
use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::fmt;

/// Tie-break priority between events scheduled for the same tick.
///
/// Lower values fire first.
pub type Priority = i32;

/// Well-known event priorities.
pub mod priority {
    use super::Priority;

    /// Fires before anything else at a tick.
    pub const MINIMUM: Priority = i32::MIN;
    /// Debugger breakpoints.
    pub const DEBUG_BREAK: Priority = -100;
    /// Model switch-over of a simulated CPU.
    pub const CPU_SWITCH: Priority = -31;
    /// Delayed writebacks must happen before anything reads the result.
    pub const DELAYED_WRITEBACK: Priority = -1;
    /// Default priority for component events.
    pub const DEFAULT: Priority = 0;
    /// Checkpoint serialization.
    pub const SERIALIZE: Priority = 32;
    /// Clock ticks of simulated CPUs.
    pub const CPU_TICK: Priority = 50;
    /// Statistics dumps and resets.
    pub const STAT_EVENT: Priority = 90;
    /// Simulation loop exit.
    pub const SIM_EXIT: Priority = 100;
    /// Fires after everything else at a tick.
    pub const MAXIMUM: Priority = i32::MAX;
}

/// Handle to an event allocated in an [`EventQueue`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId {
    index: usize,
    generation: u32,
}

impl EventId {
    /// Arena slot of the event.
    pub fn index(self) -> usize {
        self.index
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.index)
    }
}

/// Event state flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EventFlags(u8);

impl EventFlags {
    /// The event is in the pending set.
    pub const SCHEDULED: EventFlags = EventFlags(0x01);
    /// The event will be dequeued without running its action.
    pub const SQUASHED: EventFlags = EventFlags(0x02);
    /// The queue frees the event after it fires.
    pub const AUTO_DELETE: EventFlags = EventFlags(0x04);

    /// Returns `true` if every bit of `other` is set.
    #[inline(always)]
    pub fn contains(self, other: EventFlags) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline(always)]
    fn insert(&mut self, other: EventFlags) {
        self.0 |= other.0;
    }

    #[inline(always)]
    fn remove(&mut self, other: EventFlags) {
        self.0 &= !other.0;
    }
}

/// The action performed when an event fires.
pub trait Process {
    /// Runs the event's action. The queue's current tick is the event's tick.
    ///
    /// An error is fatal to the simulation.
    fn process(&mut self, queue: &EventQueue) -> SimResult<()>;

    /// Short description used in traces and queue dumps.
    fn description(&self) -> &str {
        "generic"
    }
}

/// Adapts a closure into an event action.
pub struct FnEvent<F> {
    description: &'static str,
    f: F,
}

impl<F> FnEvent<F>
where
    F: FnMut(&EventQueue) -> SimResult<()>,
{
    /// Wraps `f` with a `"generic"` description.
    pub fn new(f: F) -> Self {
        Self {
            description: "generic",
            f,
        }
    }

    /// Wraps `f` with the given description.
    pub fn with_description(description: &'static str, f: F) -> Self {
        Self { description, f }
    }
}

impl<F> Process for FnEvent<F>
where
    F: FnMut(&EventQueue) -> SimResult<()>,
{
    fn process(&mut self, queue: &EventQueue) -> SimResult<()> {
        (self.f)(queue)
    }

    fn description(&self) -> &str {
        self.description
    }
}

/// Snapshot of a pending event, in firing order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingEvent {
    /// Handle of the event.
    pub id: EventId,
    /// Event name.
    pub name: String,
    /// Tick the event is scheduled for.
    pub when: Tick,
    /// Tie-break priority.
    pub priority: Priority,
    /// Whether the event has been squashed.
    pub squashed: bool,
}

/// Ordering key of a pending event. The reversed insertion counter makes the
/// newest event sort first among equal `(when, priority)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct EventKey {
    when: Tick,
    priority: Priority,
    order: Reverse<u64>,
}

struct EventSlot {
    name: String,
    when: Tick,
    priority: Priority,
    flags: EventFlags,
    key: Option<EventKey>,
    action: Option<Box<dyn Process>>,
    description: String,
}

#[derive(Default)]
struct SlotEntry {
    generation: u32,
    slot: Option<EventSlot>,
}

#[derive(Default)]
struct QueueState {
    slots: Vec<SlotEntry>,
    free: Vec<usize>,
    pending: BTreeMap<EventKey, EventId>,
    next_order: u64,
}

impl QueueState {
    fn alloc(&mut self, slot: EventSlot) -> EventId {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(SlotEntry::default());
                self.slots.len() - 1
            }
        };
        let entry = &mut self.slots[index];
        entry.slot = Some(slot);
        EventId {
            index,
            generation: entry.generation,
        }
    }

    fn free_slot(&mut self, id: EventId) {
        if let Some(entry) = self.slots.get_mut(id.index) {
            if entry.generation == id.generation && entry.slot.take().is_some() {
                entry.generation = entry.generation.wrapping_add(1);
                self.free.push(id.index);
            }
        }
    }

    fn slot(&self, id: EventId) -> SimResult<&EventSlot> {
        self.slots
            .get(id.index)
            .filter(|e| e.generation == id.generation)
            .and_then(|e| e.slot.as_ref())
            .ok_or(SimError::UnknownEvent(id.index))
    }

    fn slot_mut(&mut self, id: EventId) -> SimResult<&mut EventSlot> {
        self.slots
            .get_mut(id.index)
            .filter(|e| e.generation == id.generation)
            .and_then(|e| e.slot.as_mut())
            .ok_or(SimError::UnknownEvent(id.index))
    }

    fn insert(&mut self, id: EventId) -> SimResult<()> {
        let order = Reverse(self.next_order);
        self.next_order += 1;
        let slot = self.slot_mut(id)?;
        let key = EventKey {
            when: slot.when,
            priority: slot.priority,
            order,
        };
        slot.key = Some(key);
        slot.flags.insert(EventFlags::SCHEDULED);
        self.pending.insert(key, id);
        Ok(())
    }

    fn remove(&mut self, id: EventId) -> SimResult<()> {
        let slot = self.slot_mut(id)?;
        slot.flags.remove(EventFlags::SCHEDULED);
        slot.flags.remove(EventFlags::SQUASHED);
        if let Some(key) = slot.key.take() {
            self.pending.remove(&key);
        }
        Ok(())
    }
}

/// An ordered queue of pending events driving simulated time.
///
/// The queue is shared by every component of a simulation through an
/// `Rc<EventQueue>` handed out at construction. All methods take `&self`;
/// event actions run while the queue is not borrowed, so they may freely
/// schedule, squash or release events, including themselves.
pub struct EventQueue {
    name: String,
    cur_tick: Cell<Tick>,
    state: RefCell<QueueState>,
    pub(super) exit_request: RefCell<Option<String>>,
}

impl EventQueue {
    /// Creates an empty queue at tick 0.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cur_tick: Cell::new(0),
            state: RefCell::new(QueueState::default()),
            exit_request: RefCell::new(None),
        }
    }

    /// Name of the queue.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The current simulated tick.
    #[inline(always)]
    pub fn cur_tick(&self) -> Tick {
        self.cur_tick.get()
    }

    pub(super) fn set_cur_tick(&self, tick: Tick) {
        self.cur_tick.set(tick);
    }

    /// Allocates a creator-owned event. It is not scheduled yet.
    pub fn create_event(
        &self,
        name: impl Into<String>,
        priority: Priority,
        action: Box<dyn Process>,
    ) -> EventId {
        self.alloc(name.into(), priority, action, EventFlags::default())
    }

    /// Allocates an auto-delete event and schedules it for `when`.
    ///
    /// The queue frees the event after it fires (or is dequeued squashed).
    pub fn schedule_once(
        &self,
        name: impl Into<String>,
        priority: Priority,
        when: Tick,
        action: Box<dyn Process>,
    ) -> SimResult<EventId> {
        let id = self.alloc(name.into(), priority, action, EventFlags::AUTO_DELETE);
        if let Err(e) = self.schedule(id, when) {
            self.state.borrow_mut().free_slot(id);
            return Err(e);
        }
        Ok(id)
    }

    fn alloc(
        &self,
        name: String,
        priority: Priority,
        action: Box<dyn Process>,
        flags: EventFlags,
    ) -> EventId {
        let description = action.description().to_string();
        self.state.borrow_mut().alloc(EventSlot {
            name,
            when: 0,
            priority,
            flags,
            key: None,
            action: Some(action),
            description,
        })
    }

    /// Schedules an idle event for `when`.
    pub fn schedule(&self, id: EventId, when: Tick) -> SimResult<()> {
        let now = self.cur_tick();
        let mut state = self.state.borrow_mut();
        let slot = state.slot_mut(id)?;
        if slot.flags.contains(EventFlags::SCHEDULED) {
            return Err(SimError::AlreadyScheduled {
                name: slot.name.clone(),
                when: slot.when,
            });
        }
        if when < now {
            return Err(SimError::ScheduleInPast {
                name: slot.name.clone(),
                when,
                now,
            });
        }
        slot.when = when;
        tracing::trace!(target: "eventq", "{} event {} scheduled @ {}", slot.description, slot.name, when);
        state.insert(id)
    }

    /// Removes a pending event from the queue.
    pub fn deschedule(&self, id: EventId) -> SimResult<()> {
        let mut state = self.state.borrow_mut();
        let slot = state.slot(id)?;
        if !slot.flags.contains(EventFlags::SCHEDULED) {
            return Err(SimError::protocol(
                &self.name,
                format!("cannot deschedule idle event {}", slot.name),
            ));
        }
        tracing::trace!(target: "eventq", "{} event {} descheduled", slot.description, slot.name);
        state.remove(id)
    }

    /// Moves an event to `when`, scheduling it if it was idle.
    ///
    /// Rescheduling clears a pending squash.
    pub fn reschedule(&self, id: EventId, when: Tick) -> SimResult<()> {
        let now = self.cur_tick();
        let mut state = self.state.borrow_mut();
        let slot = state.slot(id)?;
        if when < now {
            return Err(SimError::ScheduleInPast {
                name: slot.name.clone(),
                when,
                now,
            });
        }
        state.remove(id)?;
        let slot = state.slot_mut(id)?;
        slot.when = when;
        tracing::trace!(target: "eventq", "{} event {} rescheduled @ {}", slot.description, slot.name, when);
        state.insert(id)
    }

    /// Squashes a pending event: it stays queued but its action will not run.
    ///
    /// Squashing an idle event has no effect.
    pub fn squash(&self, id: EventId) -> SimResult<()> {
        let mut state = self.state.borrow_mut();
        let slot = state.slot_mut(id)?;
        if slot.flags.contains(EventFlags::SCHEDULED) {
            slot.flags.insert(EventFlags::SQUASHED);
            tracing::trace!(target: "eventq", "{} event {} squashed", slot.description, slot.name);
        }
        Ok(())
    }

    /// Returns `true` if the event is pending.
    pub fn is_scheduled(&self, id: EventId) -> bool {
        self.flags(id)
            .is_some_and(|f| f.contains(EventFlags::SCHEDULED))
    }

    /// Returns `true` if the event is pending and squashed.
    pub fn is_squashed(&self, id: EventId) -> bool {
        self.flags(id).is_some_and(|f| f.contains(EventFlags::SQUASHED))
    }

    /// Current flags of the event, or `None` for a stale handle.
    pub fn flags(&self, id: EventId) -> Option<EventFlags> {
        self.state.borrow().slot(id).ok().map(|s| s.flags)
    }

    /// Tick the event is scheduled for, if it is pending.
    pub fn when(&self, id: EventId) -> Option<Tick> {
        let state = self.state.borrow();
        let slot = state.slot(id).ok()?;
        slot.flags
            .contains(EventFlags::SCHEDULED)
            .then_some(slot.when)
    }

    /// Name of the event, or `None` for a stale handle.
    pub fn event_name(&self, id: EventId) -> Option<String> {
        self.state.borrow().slot(id).ok().map(|s| s.name.clone())
    }

    /// Tie-break priority of the event, or `None` for a stale handle.
    pub fn event_priority(&self, id: EventId) -> Option<Priority> {
        self.state.borrow().slot(id).ok().map(|s| s.priority)
    }

    /// Renames an event.
    pub fn set_event_name(&self, id: EventId, name: impl Into<String>) -> SimResult<()> {
        self.state.borrow_mut().slot_mut(id)?.name = name.into();
        Ok(())
    }

    /// Gives up a creator-owned event, descheduling it if it is pending.
    pub fn release(&self, id: EventId) -> SimResult<()> {
        let mut state = self.state.borrow_mut();
        state.remove(id)?;
        state.free_slot(id);
        Ok(())
    }

    /// Returns `true` if no event is pending.
    pub fn is_empty(&self) -> bool {
        self.state.borrow().pending.is_empty()
    }

    /// Number of pending events.
    pub fn len(&self) -> usize {
        self.state.borrow().pending.len()
    }

    /// Tick of the earliest pending event.
    pub fn next_tick(&self) -> Option<Tick> {
        self.state
            .borrow()
            .pending
            .first_key_value()
            .map(|(k, _)| k.when)
    }

    /// Services the earliest pending event.
    ///
    /// The current tick advances to the event's tick and its Scheduled flag
    /// is cleared. A squashed event only has its Squashed flag cleared;
    /// otherwise its action runs. Auto-delete events that did not schedule
    /// themselves again are freed afterwards.
    pub fn service_one(&self) -> SimResult<()> {
        let (id, when, name, action) = {
            let mut state = self.state.borrow_mut();
            let (key, id) = state
                .pending
                .pop_first()
                .ok_or_else(|| SimError::EmptyQueue(self.name.clone()))?;
            let slot = state.slot_mut(id)?;
            slot.key = None;
            slot.flags.remove(EventFlags::SCHEDULED);
            let action = if slot.flags.contains(EventFlags::SQUASHED) {
                slot.flags.remove(EventFlags::SQUASHED);
                tracing::trace!(target: "eventq", "{} event {} skipped (squashed) @ {}", slot.description, slot.name, key.when);
                None
            } else {
                tracing::trace!(target: "eventq", "{} event {} processed @ {}", slot.description, slot.name, key.when);
                slot.action.take()
            };
            (id, key.when, slot.name.clone(), action)
        };

        self.cur_tick.set(when);

        let mut result = Ok(());
        let mut action = action;
        if let Some(a) = action.as_mut() {
            result = a.process(self);
        }

        {
            let mut state = self.state.borrow_mut();
            let free = match state.slot_mut(id) {
                Ok(slot) => {
                    if slot.action.is_none() {
                        slot.action = action;
                    }
                    slot.flags.contains(EventFlags::AUTO_DELETE)
                        && !slot.flags.contains(EventFlags::SCHEDULED)
                }
                Err(_) => false,
            };
            if free {
                state.free_slot(id);
            }
        }

        result.map_err(|source| SimError::EventFailed {
            tick: when,
            event: name,
            source: Box::new(source),
        })
    }

    /// Pending events in firing order.
    pub fn pending(&self) -> Vec<PendingEvent> {
        let state = self.state.borrow();
        state
            .pending
            .values()
            .filter_map(|&id| {
                let slot = state.slot(id).ok()?;
                Some(PendingEvent {
                    id,
                    name: slot.name.clone(),
                    when: slot.when,
                    priority: slot.priority,
                    squashed: slot.flags.contains(EventFlags::SQUASHED),
                })
            })
            .collect()
    }

    /// Names every pending event `<queue>.event<N>` in firing order.
    pub fn name_children(&self) {
        let ids: Vec<EventId> = self.state.borrow().pending.values().copied().collect();
        let mut state = self.state.borrow_mut();
        for (j, id) in ids.into_iter().enumerate() {
            if let Ok(slot) = state.slot_mut(id) {
                slot.name = format!("{}.event{}", self.name, j);
            }
        }
    }

    /// Renders the pending events as a human-readable listing.
    pub fn dump(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for EventQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", "=".repeat(60))?;
        writeln!(f, "EventQueue Dump  (cycle {})", self.cur_tick())?;
        writeln!(f, "{}", "-".repeat(60))?;
        let state = self.state.borrow();
        if state.pending.is_empty() {
            writeln!(f, "<No Events>")?;
        }
        for &id in state.pending.values() {
            if let Ok(slot) = state.slot(id) {
                writeln!(f, "{} ({})", slot.name, slot.description)?;
                write!(f, "   Scheduled for {}, priority {}", slot.when, slot.priority)?;
                if slot.flags.contains(EventFlags::SQUASHED) {
                    write!(f, " [squashed]")?;
                }
                writeln!(f)?;
            }
        }
        write!(f, "{}", "=".repeat(60))
    }
}
