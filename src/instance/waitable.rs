use crate::{Awaitable, Event};
use std::collections::{BTreeSet, VecDeque};

/// A set of waitables a task can wait on or poll.
#[derive(Default)]
pub(crate) struct WaitableSet {
    /// Number of tasks currently blocked in `wait_for_event` on this set.
    pub(crate) num_waiting: u32,
    /// Handles of every waitable joined to this set.
    pub(crate) members: BTreeSet<u32>,
    /// Handles of joined waitables holding an undelivered event, oldest
    /// first.
    pub(crate) ready: VecDeque<u32>,
    /// Awaitables handed out to waiters, resolved on the next event.
    pub(crate) pending: Vec<Awaitable>,
}

impl WaitableSet {
    pub(crate) fn mark_ready(&mut self, waitable: u32) {
        if !self.ready.contains(&waitable) {
            self.ready.push_back(waitable);
        }
    }

    pub(crate) fn forget(&mut self, waitable: u32) {
        self.members.remove(&waitable);
        self.ready.retain(|w| *w != waitable);
    }
}

/// Something which can produce an event: a subtask or one end of a stream or
/// future.
#[derive(Default)]
pub(crate) struct Waitable {
    pub(crate) event: Option<Event>,
    pub(crate) set: Option<u32>,
}
