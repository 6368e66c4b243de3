//! Simulation Loop.
//!
//! Runs the event queue until it runs dry, reaches a tick limit, or a
//! component asks for the loop to stop.

use super::eventq::{priority, EventId, EventQueue, FnEvent};
use crate::common::{SimResult, Tick};
use serde::Serialize;
use std::fmt;

const EXIT_EVENT: &str = "sim_loop_exit";

/// Why [`EventQueue::simulate`] returned.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum ExitCause {
    /// No event was left to service.
    QueueEmpty,
    /// The next event lies beyond the tick limit.
    MaxTick,
    /// A component requested the exit, with its reason.
    Requested(String),
}

impl fmt::Display for ExitCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitCause::QueueEmpty => write!(f, "event queue empty"),
            ExitCause::MaxTick => write!(f, "simulate() limit reached"),
            ExitCause::Requested(cause) => write!(f, "{cause}"),
        }
    }
}

impl EventQueue {
    /// Schedules an exit of the simulation loop at `when`.
    ///
    /// The exit event runs at [`priority::SIM_EXIT`], after ordinary work of
    /// the same tick.
    pub fn exit_sim_loop(&self, when: Tick, cause: impl Into<String>) -> SimResult<EventId> {
        let cause = cause.into();
        self.schedule_once(
            EXIT_EVENT,
            priority::SIM_EXIT,
            when,
            Box::new(FnEvent::with_description(
                "simulation loop exit",
                move |q: &EventQueue| {
                    *q.exit_request.borrow_mut() = Some(cause.clone());
                    Ok(())
                },
            )),
        )
    }

    /// Whether an exit event is still waiting in the queue.
    ///
    /// Such an event has no owner to resolve it by name on restore, so a
    /// checkpoint is only taken once it has fired.
    pub fn exit_scheduled(&self) -> bool {
        self.pending().iter().any(|p| p.name == EXIT_EVENT)
    }

    /// The exit request raised but not yet returned by [`simulate`](Self::simulate).
    pub fn exit_request(&self) -> Option<String> {
        self.exit_request.borrow().clone()
    }

    /// Services events in order until the queue is empty, the next event
    /// lies beyond `max_tick`, or an exit is requested.
    ///
    /// When the limit is hit the current tick is advanced to `max_tick`.
    pub fn simulate(&self, max_tick: Tick) -> SimResult<ExitCause> {
        tracing::info!(target: "eventq", "{}: simulating from tick {} to {}", self.name(), self.cur_tick(), max_tick);
        loop {
            if let Some(cause) = self.exit_request.borrow_mut().take() {
                return Ok(ExitCause::Requested(cause));
            }
            match self.next_tick() {
                None => return Ok(ExitCause::QueueEmpty),
                Some(when) if when > max_tick => {
                    self.set_cur_tick(max_tick.max(self.cur_tick()));
                    return Ok(ExitCause::MaxTick);
                }
                Some(_) => self.service_one()?,
            }
        }
    }
}
