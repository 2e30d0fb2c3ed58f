use crate::Awaitable;
use std::collections::BTreeMap;

/// A ticket handed out by
/// [`InstanceScheduler::exclusive_lock`](crate::InstanceScheduler::exclusive_lock).
///
/// The lock is held by `ticket` once `awaitable` is ready.
#[derive(Clone, Debug)]
pub struct LockTicket {
    pub ticket: u64,
    pub awaitable: Awaitable,
}

/// First-in first-out mutual exclusion over strictly increasing tickets.
///
/// The lock is handed directly from the releasing ticket to the oldest waiting
/// one, so a later ticket can never acquire the lock ahead of an earlier one.
#[derive(Default)]
pub(crate) struct TicketLock {
    last_ticket: u64,
    holder: Option<u64>,
    waiting: BTreeMap<u64, Awaitable>,
}

impl TicketLock {
    pub(crate) fn take_ticket(&mut self) -> u64 {
        self.last_ticket += 1;
        self.last_ticket
    }

    /// Acquires the lock for `ticket` if nobody holds it, otherwise queues
    /// `awaitable` to be resolved when the ticket's turn comes.
    pub(crate) fn acquire_or_wait(&mut self, ticket: u64, awaitable: Awaitable) -> bool {
        if self.holder.is_none() {
            debug_assert!(self.waiting.is_empty());
            self.holder = Some(ticket);
            true
        } else {
            self.waiting.insert(ticket, awaitable);
            false
        }
    }

    /// Releases the current holder, returning the next ticket in line (which
    /// now holds the lock) along with the awaitable that must be resolved to
    /// tell it so.
    pub(crate) fn release(&mut self) -> Option<(u64, Awaitable)> {
        self.holder.take()?;
        let (ticket, awaitable) = self.waiting.pop_first()?;
        self.holder = Some(ticket);
        Some((ticket, awaitable))
    }

    pub(crate) fn holder(&self) -> Option<u64> {
        self.holder
    }
}
