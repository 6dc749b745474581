//! The internal event bus.
//!
//! Components never call across each other directly for lifecycle
//! notifications; they enqueue an [`Event`] and the owning loop drains the
//! queue between I/O readiness notifications. Events on a single schedule
//! are enqueued in non-decreasing timestamp order with ties preserved by
//! insertion order, which the queue's FIFO discipline keeps intact.

use crate::{BlockId, StubId};
use sep2::types::DerModes;
use std::collections::VecDeque;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    /// A control event block became active.
    EventStart { sfdi: u64, block: BlockId },
    /// A control event block left the active state.
    EventEnd { sfdi: u64, block: BlockId },
    /// A device's schedule was recomputed.
    ScheduleUpdate { sfdi: u64 },
    DeviceSchedule { sfdi: u64 },
    DeviceMetering { sfdi: u64 },
    /// A default control began supplying the given modes.
    DefaultStart { sfdi: u64, modes: DerModes },
    DefaultEnd { sfdi: u64, modes: DerModes },
    /// The server deleted a subscribed resource.
    ResourceRemove { stub: StubId },
}

#[derive(Default)]
pub struct EventQueue {
    queue: VecDeque<Event>,
}

impl EventQueue {
    pub fn new() -> EventQueue {
        EventQueue::default()
    }

    pub fn push(&mut self, event: Event) {
        self.queue.push_back(event);
    }

    pub fn pop(&mut self) -> Option<Event> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Drain in insertion order.
    pub fn drain(&mut self) -> impl Iterator<Item = Event> + '_ {
        self.queue.drain(..)
    }
}
