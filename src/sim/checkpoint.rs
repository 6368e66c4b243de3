//! Event Queue Checkpoints.
//!
//! A checkpoint records the current tick and every pending event by name,
//! tick, priority and squash state. Restoring resolves each name back to an
//! event owned by the rebuilt system and schedules it again.

use super::eventq::{EventId, EventQueue, Priority};
use crate::common::{SimError, SimResult, Tick};
use serde::{Deserialize, Serialize};

/// A pending event as stored in a checkpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventCheckpoint {
    /// Event name, used to find the event again on restore.
    pub name: String,
    /// Tick the event was scheduled for.
    pub when: Tick,
    /// Tie-break priority.
    pub priority: Priority,
    /// Whether the event was squashed.
    #[serde(default)]
    pub squashed: bool,
}

/// Serialized state of an [`EventQueue`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCheckpoint {
    /// Name of the queue.
    pub name: String,
    /// Tick at which the checkpoint was taken.
    pub cur_tick: Tick,
    /// Pending events, in firing order.
    pub events: Vec<EventCheckpoint>,
    /// Exit request raised but not yet returned by `simulate`.
    #[serde(default)]
    pub exit_request: Option<String>,
}

impl QueueCheckpoint {
    /// Encodes the checkpoint as pretty-printed JSON.
    pub fn to_json(&self) -> SimResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| SimError::Checkpoint(e.to_string()))
    }

    /// Decodes a checkpoint from JSON.
    pub fn from_json(json: &str) -> SimResult<Self> {
        serde_json::from_str(json).map_err(|e| SimError::Checkpoint(e.to_string()))
    }
}

impl EventQueue {
    /// Captures the current tick and all pending events.
    pub fn serialize(&self) -> QueueCheckpoint {
        let events = self
            .pending()
            .into_iter()
            .map(|p| EventCheckpoint {
                name: p.name,
                when: p.when,
                priority: p.priority,
                squashed: p.squashed,
            })
            .collect();
        QueueCheckpoint {
            name: self.name().to_string(),
            cur_tick: self.cur_tick(),
            events,
            exit_request: self.exit_request.borrow().clone(),
        }
    }

    /// Restores the tick, re-schedules the checkpointed events and raises
    /// any exit request that was pending.
    ///
    /// `resolve` maps an event name to the handle of the matching event in
    /// the rebuilt system. Events are re-inserted back to front so that
    /// events tied on `(when, priority)` keep their firing order.
    pub fn unserialize<F>(&self, checkpoint: &QueueCheckpoint, mut resolve: F) -> SimResult<()>
    where
        F: FnMut(&str) -> Option<EventId>,
    {
        self.set_cur_tick(checkpoint.cur_tick);
        *self.exit_request.borrow_mut() = checkpoint.exit_request.clone();
        for ev in checkpoint.events.iter().rev() {
            let id = resolve(&ev.name)
                .ok_or_else(|| SimError::Checkpoint(format!("no event named {}", ev.name)))?;
            let priority = self
                .event_priority(id)
                .ok_or(SimError::UnknownEvent(id.index()))?;
            if priority != ev.priority {
                return Err(SimError::Checkpoint(format!(
                    "event {} has priority {}, checkpoint says {}",
                    ev.name, priority, ev.priority
                )));
            }
            self.reschedule(id, ev.when)?;
            if ev.squashed {
                self.squash(id)?;
            }
        }
        tracing::debug!(target: "eventq", "{}: restored {} events at tick {}", self.name(), checkpoint.events.len(), checkpoint.cur_tick);
        Ok(())
    }
}
