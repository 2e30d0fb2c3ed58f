//! Per-component-instance scheduling state.
//!
//! Each component instance gets one [`InstanceScheduler`], created lazily by
//! the [`SchedulerContext`](crate::SchedulerContext) the first time the
//! instance is referenced. It owns:
//!
//! * the backpressure flag and the "in a sync import/export call" flags which
//!   together decide whether a new task may enter the instance,
//! * the queue of pending tasks which were refused entry,
//! * the map from awaitables to the tasks parked on them,
//! * the ticket lock giving one task at a time exclusive use of the instance,
//! * the waitable-set, waitable and resource handle tables.
//!
//! Everything here runs on a single thread, so state lives in `Cell`s and
//! `RefCell`s. No borrow is ever held across a call which may wake a task.

use crate::table::{HandleTable, Removed};
use crate::{Awaitable, AwaitableId, BlockResult, Config, Error, Event, Result, Task, TaskId};
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::mem;
use std::rc::Rc;

pub use lock::LockTicket;

use lock::TicketLock;
use waitable::{Waitable, WaitableSet};

mod lock;
mod waitable;

/// Identity of a component instance.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentInstanceId(u32);

impl ComponentInstanceId {
    pub fn new(id: u32) -> Self {
        ComponentInstanceId(id)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for ComponentInstanceId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "instance {}", self.0)
    }
}

/// Identity of a resource type; each gets its own handle table per instance.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceTypeId(u32);

impl ResourceTypeId {
    pub fn new(id: u32) -> Self {
        ResourceTypeId(id)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

struct PendingTask {
    task: TaskId,
    is_async: bool,
    turn: Awaitable,
}

/// Scheduling state for a single component instance.
pub struct InstanceScheduler {
    id: ComponentInstanceId,
    config: Config,
    next_awaitable: Cell<u64>,

    backpressure: Cell<bool>,
    calling_sync_import: Cell<bool>,
    calling_sync_export: Cell<bool>,
    starting_pending_task: Cell<bool>,
    sync_import_end: RefCell<Awaitable>,
    pending: RefCell<VecDeque<PendingTask>>,

    parked: RefCell<HashMap<AwaitableId, VecDeque<Rc<Task>>>>,
    lock: RefCell<TicketLock>,
    yielding: RefCell<Vec<Awaitable>>,

    waitable_sets: RefCell<HandleTable<WaitableSet>>,
    waitables: RefCell<HandleTable<Waitable>>,
    resources: RefCell<HashMap<ResourceTypeId, HandleTable<u32>>>,
}

impl InstanceScheduler {
    pub(crate) fn new(id: ComponentInstanceId, config: &Config) -> Self {
        InstanceScheduler {
            id,
            config: config.clone(),
            next_awaitable: Cell::new(1),
            backpressure: Cell::new(false),
            calling_sync_import: Cell::new(false),
            calling_sync_export: Cell::new(false),
            starting_pending_task: Cell::new(false),
            sync_import_end: RefCell::new(Awaitable::new(AwaitableId::new(0))),
            pending: RefCell::new(VecDeque::new()),
            parked: RefCell::new(HashMap::new()),
            lock: RefCell::new(TicketLock::default()),
            yielding: RefCell::new(Vec::new()),
            waitable_sets: RefCell::new(HandleTable::with_max_handle(config.max_table_handle)),
            waitables: RefCell::new(HandleTable::with_max_handle(config.max_table_handle)),
            resources: RefCell::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> ComponentInstanceId {
        self.id
    }

    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    /// Creates a fresh, pending awaitable scoped to this instance.
    pub fn new_awaitable(&self) -> Awaitable {
        let id = self.next_awaitable.get();
        self.next_awaitable.set(id + 1);
        Awaitable::new(AwaitableId::new(id))
    }

    fn new_ready_awaitable(&self) -> Awaitable {
        let id = self.next_awaitable.get();
        self.next_awaitable.set(id + 1);
        Awaitable::new_ready(AwaitableId::new(id))
    }

    // -------------------------------------------------------------------------
    // Entry gating

    pub fn backpressure(&self) -> bool {
        self.backpressure.get()
    }

    /// Enables or disables backpressure. While enabled no new task may enter
    /// this instance.
    ///
    /// Turning backpressure off notifies anything waiting for the end of a
    /// sync import call and lets a pending task try to enter again.
    pub fn set_backpressure(&self, enabled: bool) -> Result<()> {
        let old = self.backpressure.replace(enabled);
        log::trace!("{} backpressure {old} -> {enabled}", self.id);
        if old && !enabled {
            self.notify_sync_import_end()?;
            self.maybe_start_pending_task()?;
        }
        Ok(())
    }

    pub fn calling_sync_import(&self) -> bool {
        self.calling_sync_import.get()
    }

    /// Records whether this instance is blocked in a synchronous call to an
    /// import.
    pub fn set_calling_sync_import(&self, calling: bool) -> Result<()> {
        let old = self.calling_sync_import.replace(calling);
        if old && !calling {
            self.notify_sync_import_end()?;
            self.maybe_start_pending_task()?;
        }
        Ok(())
    }

    /// Returns an awaitable which becomes ready the next time a sync import
    /// call ends.
    pub fn wait_for_sync_import_call_end(&self) -> Awaitable {
        self.sync_import_end.borrow().clone()
    }

    fn notify_sync_import_end(&self) -> Result<()> {
        let fresh = self.new_awaitable();
        let existing = self.sync_import_end.replace(fresh);
        existing.resolve();
        while self.num_parked(&existing) > 0 {
            self.wake_next_task_for_awaitable(&existing)?;
        }
        Ok(())
    }

    pub fn calling_sync_export(&self) -> bool {
        self.calling_sync_export.get()
    }

    pub(crate) fn set_calling_sync_export(&self, calling: bool) {
        self.calling_sync_export.set(calling);
    }

    /// Returns whether a task with the given mode may start executing in this
    /// instance right now.
    pub fn may_enter(&self, is_async: bool) -> bool {
        if self.backpressure.get() {
            log::trace!("{} refuses entry due to backpressure", self.id);
            return false;
        }
        if self.calling_sync_import.get() {
            log::trace!("{} refuses entry during a sync import call", self.id);
            return false;
        }
        if self.calling_sync_export.get() && !is_async {
            log::trace!("{} refuses sync entry during a sync export call", self.id);
            return false;
        }
        true
    }

    pub fn num_pending_tasks(&self) -> usize {
        self.pending.borrow().len()
    }

    pub(crate) fn push_pending(&self, task: TaskId, is_async: bool, turn: Awaitable) {
        self.pending.borrow_mut().push_back(PendingTask {
            task,
            is_async,
            turn,
        });
    }

    pub(crate) fn remove_pending(&self, task: TaskId) -> bool {
        let mut pending = self.pending.borrow_mut();
        let before = pending.len();
        pending.retain(|p| p.task != task);
        pending.len() != before
    }

    pub(crate) fn is_starting_pending_task(&self) -> bool {
        self.starting_pending_task.get()
    }

    pub(crate) fn take_starting_pending_task(&self) -> bool {
        self.starting_pending_task.replace(false)
    }

    /// Lets the oldest pending task which may now enter this instance resume.
    ///
    /// At most one pending task is started at a time: the next one is only
    /// considered once the previous one has observed its turn.
    pub fn maybe_start_pending_task(&self) -> Result<()> {
        if self.starting_pending_task.get() {
            return Ok(());
        }
        let next = {
            let mut pending = self.pending.borrow_mut();
            pending
                .iter()
                .position(|p| self.may_enter(p.is_async))
                .and_then(|i| pending.remove(i))
        };
        if let Some(next) = next {
            log::debug!("{} starting pending {}", self.id, next.task);
            self.starting_pending_task.set(true);
            self.resolve_awaitable(&next.turn)?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Parking

    /// Parks `task` on `awaitable`, waking the head of the parked list right
    /// away if the awaitable has already settled.
    pub fn park_task_on_awaitable(&self, awaitable: &Awaitable, task: &Rc<Task>) -> Result<()> {
        log::trace!("{} parking {} on {}", self.id, task.id(), awaitable.id());
        self.parked
            .borrow_mut()
            .entry(awaitable.id())
            .or_default()
            .push_back(task.clone());
        if awaitable.resolved() {
            self.wake_next_task_for_awaitable(awaitable)?;
        }
        Ok(())
    }

    /// Resumes the task which parked on `awaitable` first.
    ///
    /// If the awaitable was cancelled the task observes the cancellation, and
    /// the awaitable goes back to pending since the cancellation has now been
    /// delivered. A parked task whose wait was dropped can't be resumed, so
    /// the wake passes to the task parked after it.
    pub fn wake_next_task_for_awaitable(&self, awaitable: &Awaitable) -> Result<()> {
        loop {
            let Some(task) = self.pop_parked(awaitable.id()) else {
                log::trace!("{} no tasks waiting for {}", self.id, awaitable.id());
                return Ok(());
            };
            let cancelled = awaitable.state() == crate::AwaitableState::Cancelled;
            let result = if cancelled {
                BlockResult::Cancelled
            } else {
                BlockResult::NotCancelled
            };
            if task.wake(awaitable.id(), result)? {
                if cancelled {
                    awaitable.rearm();
                }
                return Ok(());
            }
            log::debug!("{} is gone, waking the next task on {}", task.id(), awaitable.id());
        }
    }

    fn pop_parked(&self, awaitable: AwaitableId) -> Option<Rc<Task>> {
        let mut parked = self.parked.borrow_mut();
        let list = parked.get_mut(&awaitable)?;
        let task = list.pop_front();
        if list.is_empty() {
            parked.remove(&awaitable);
        }
        task
    }

    /// Removes `task` from the tasks parked on `awaitable`.
    pub(crate) fn remove_parked(&self, awaitable: AwaitableId, task: TaskId) -> Option<Rc<Task>> {
        let mut parked = self.parked.borrow_mut();
        let list = parked.get_mut(&awaitable)?;
        let found = list
            .iter()
            .position(|t| t.id() == task)
            .and_then(|i| list.remove(i));
        if list.is_empty() {
            parked.remove(&awaitable);
        }
        found
    }

    /// Returns the number of tasks parked on `awaitable`.
    pub fn num_parked(&self, awaitable: &Awaitable) -> usize {
        self.parked
            .borrow()
            .get(&awaitable.id())
            .map_or(0, |list| list.len())
    }

    /// Resolves `awaitable` (if it is still pending) and wakes the next task
    /// parked on it.
    pub fn resolve_awaitable(&self, awaitable: &Awaitable) -> Result<()> {
        awaitable.resolve();
        self.wake_next_task_for_awaitable(awaitable)
    }

    /// Cancels `awaitable` (if it is still pending) and delivers the
    /// cancellation to the next task parked on it.
    pub fn cancel_awaitable(&self, awaitable: &Awaitable) -> Result<()> {
        awaitable.cancel();
        self.wake_next_task_for_awaitable(awaitable)
    }

    /// Delivers a cancellation to `task` if it is currently parked, returning
    /// whether it was.
    pub(crate) fn cancel_parked_task(&self, task: &Task) -> Result<bool> {
        let Some(awaitable) = task.parked_on() else {
            return Ok(false);
        };
        match self.remove_parked(awaitable, task.id()) {
            Some(task) => task.wake(awaitable, BlockResult::Cancelled),
            None => Ok(false),
        }
    }

    // -------------------------------------------------------------------------
    // Exclusive lock

    /// Takes the next ticket for this instance's exclusive lock.
    ///
    /// The returned awaitable is ready once the ticket holds the lock, which
    /// happens immediately if the lock is free.
    pub fn exclusive_lock(&self) -> LockTicket {
        let awaitable = self.new_awaitable();
        let mut lock = self.lock.borrow_mut();
        let ticket = lock.take_ticket();
        if lock.acquire_or_wait(ticket, awaitable.clone()) {
            awaitable.resolve();
        }
        log::trace!(
            "{} exclusive lock ticket {ticket} (acquired: {})",
            self.id,
            awaitable.resolved()
        );
        LockTicket { ticket, awaitable }
    }

    /// Acquires the exclusive lock from host code which isn't a task,
    /// returning the ticket now holding it.
    pub async fn acquire_exclusive(&self) -> u64 {
        let LockTicket { ticket, awaitable } = self.exclusive_lock();
        awaitable.settled().await;
        ticket
    }

    /// Releases the exclusive lock, handing it to the next ticket in line.
    /// Does nothing if the lock isn't held.
    pub fn exclusive_release(&self) -> Result<()> {
        let next = self.lock.borrow_mut().release();
        if let Some((ticket, awaitable)) = next {
            log::trace!("{} exclusive lock handed to ticket {ticket}", self.id);
            self.resolve_awaitable(&awaitable)?;
        }
        Ok(())
    }

    pub fn is_exclusively_locked(&self) -> bool {
        self.lock.borrow().holder().is_some()
    }

    /// Returns the ticket currently holding the exclusive lock.
    pub fn exclusive_holder(&self) -> Option<u64> {
        self.lock.borrow().holder()
    }

    // -------------------------------------------------------------------------
    // Yielding

    pub(crate) fn yield_awaitable(&self) -> Awaitable {
        let awaitable = self.new_awaitable();
        self.yielding.borrow_mut().push(awaitable.clone());
        awaitable
    }

    /// Drops a yield whose task was cancelled before the round ran.
    pub(crate) fn forget_yield(&self, awaitable: &Awaitable) {
        self.yielding
            .borrow_mut()
            .retain(|a| a.id() != awaitable.id());
    }

    /// Runs one scheduling round: every task which yielded before this call is
    /// woken. Returns the number of yields settled.
    pub fn run_yielded(&self) -> Result<usize> {
        let yielding = mem::take(&mut *self.yielding.borrow_mut());
        for awaitable in yielding.iter() {
            self.resolve_awaitable(awaitable)?;
        }
        Ok(yielding.len())
    }

    // -------------------------------------------------------------------------
    // Waitables

    pub fn waitable_set_new(&self) -> Result<u32> {
        let handle = self
            .waitable_sets
            .borrow_mut()
            .create_own(WaitableSet::default())?;
        log::trace!("{} new waitable set {handle}", self.id);
        Ok(handle)
    }

    /// Drops a waitable set. Its members are left unjoined.
    pub fn waitable_set_drop(&self, set: u32) -> Result<()> {
        let mut sets = self.waitable_sets.borrow_mut();
        if sets.get(set)?.num_waiting > 0 {
            return Err(Error::WaitableSetBusy(set));
        }
        let removed = sets.remove(set)?;
        let mut waitables = self.waitables.borrow_mut();
        for member in removed.value.members {
            waitables.get_mut(member)?.set = None;
        }
        Ok(())
    }

    pub fn waitable_new(&self) -> Result<u32> {
        self.waitables.borrow_mut().create_own(Waitable::default())
    }

    pub fn waitable_drop(&self, waitable: u32) -> Result<()> {
        let removed = self.waitables.borrow_mut().remove(waitable)?;
        if let Some(set) = removed.value.set {
            self.waitable_sets.borrow_mut().get_mut(set)?.forget(waitable);
        }
        Ok(())
    }

    /// Moves `waitable` into `set`, or out of any set if `set` is `None`.
    ///
    /// A waitable already holding an event makes its new set ready.
    pub fn waitable_join(&self, waitable: u32, set: Option<u32>) -> Result<()> {
        if let Some(set) = set {
            self.waitable_sets.borrow().get(set)?;
        }
        let (old, has_event) = {
            let mut waitables = self.waitables.borrow_mut();
            let w = waitables.get_mut(waitable)?;
            (mem::replace(&mut w.set, set), w.event.is_some())
        };
        {
            let mut sets = self.waitable_sets.borrow_mut();
            if let Some(old) = old {
                sets.get_mut(old)?.forget(waitable);
            }
            if let Some(set) = set {
                let s = sets.get_mut(set)?;
                s.members.insert(waitable);
                if has_event {
                    s.mark_ready(waitable);
                }
            }
        }
        match set {
            Some(set) if has_event => self.notify_waitable_set(set),
            _ => Ok(()),
        }
    }

    /// Records `event` on `waitable`, replacing any undelivered one, and wakes
    /// the waiters of the set it is joined to.
    pub fn deliver_event(&self, waitable: u32, event: Event) -> Result<()> {
        let set = {
            let mut waitables = self.waitables.borrow_mut();
            let w = waitables.get_mut(waitable)?;
            w.event = Some(event);
            w.set
        };
        log::trace!("{} delivering {event:?} to waitable {waitable}", self.id);
        if let Some(set) = set {
            self.waitable_sets.borrow_mut().get_mut(set)?.mark_ready(waitable);
            self.notify_waitable_set(set)?;
        }
        Ok(())
    }

    fn notify_waitable_set(&self, set: u32) -> Result<()> {
        let pending = mem::take(&mut self.waitable_sets.borrow_mut().get_mut(set)?.pending);
        for awaitable in pending.iter() {
            self.resolve_awaitable(awaitable)?;
        }
        Ok(())
    }

    /// Takes the oldest undelivered event from `set`, if any.
    pub fn poll_waitable_set(&self, set: u32) -> Result<Option<Event>> {
        let mut sets = self.waitable_sets.borrow_mut();
        let mut waitables = self.waitables.borrow_mut();
        let s = sets.get_mut(set)?;
        while let Some(waitable) = s.ready.pop_front() {
            if let Some(event) = waitables.get_mut(waitable)?.event.take() {
                return Ok(Some(event));
            }
        }
        Ok(None)
    }

    /// Returns an awaitable which is ready once `set` has an event to deliver.
    pub fn waitable_set_pending_event(&self, set: u32) -> Result<Awaitable> {
        let has_event = !self.waitable_sets.borrow().get(set)?.ready.is_empty();
        if has_event {
            return Ok(self.new_ready_awaitable());
        }
        let awaitable = self.new_awaitable();
        self.waitable_sets
            .borrow_mut()
            .get_mut(set)?
            .pending
            .push(awaitable.clone());
        Ok(awaitable)
    }

    /// Drops an awaitable handed out by [`Self::waitable_set_pending_event`]
    /// whose waiter has gone away.
    pub(crate) fn waitable_set_forget_pending(&self, set: u32, awaitable: &Awaitable) -> Result<()> {
        self.waitable_sets
            .borrow_mut()
            .get_mut(set)?
            .pending
            .retain(|a| a.id() != awaitable.id());
        Ok(())
    }

    /// Returns the number of tasks waiting on `set`.
    pub fn waitable_set_num_waiting(&self, set: u32) -> Result<u32> {
        Ok(self.waitable_sets.borrow().get(set)?.num_waiting)
    }

    pub(crate) fn waitable_set_begin_wait(&self, set: u32) -> Result<()> {
        self.waitable_sets.borrow_mut().get_mut(set)?.num_waiting += 1;
        Ok(())
    }

    pub(crate) fn waitable_set_end_wait(&self, set: u32) -> Result<()> {
        let mut sets = self.waitable_sets.borrow_mut();
        let s = sets.get_mut(set)?;
        s.num_waiting = s.num_waiting.saturating_sub(1);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Resources

    fn with_resource_table<R>(
        &self,
        ty: ResourceTypeId,
        f: impl FnOnce(&mut HandleTable<u32>) -> R,
    ) -> R {
        let mut resources = self.resources.borrow_mut();
        let table = resources
            .entry(ty)
            .or_insert_with(|| HandleTable::with_max_handle(self.config.max_table_handle));
        f(table)
    }

    /// Implementation of the `resource.new` canonical intrinsic.
    pub fn resource_new(&self, ty: ResourceTypeId, rep: u32) -> Result<u32> {
        self.with_resource_table(ty, |t| t.create_own(rep))
    }

    /// Implementation of the `resource.rep` canonical intrinsic.
    pub fn resource_rep(&self, ty: ResourceTypeId, handle: u32) -> Result<u32> {
        self.with_resource_table(ty, |t| t.get(handle).copied())
    }

    pub(crate) fn resource_lower_borrow(
        &self,
        ty: ResourceTypeId,
        rep: u32,
        scope: TaskId,
    ) -> Result<u32> {
        self.with_resource_table(ty, |t| t.create_borrow(rep, scope))
    }

    /// Removes `handle` from the table for `ty`, without running any
    /// destructor.
    pub fn resource_drop(&self, ty: ResourceTypeId, handle: u32) -> Result<Removed<u32>> {
        self.with_resource_table(ty, |t| t.remove(handle))
    }
}
