//! Tasks: one in-flight invocation of an export.
//!
//! A [`Task`] is created by [`SchedulerContext::start_task`] for every call
//! into a component instance. It tracks the lifecycle of that call:
//!
//! ```text
//! Initial --(cancelled at a cancellable wait)-----> Cancelled
//! Initial --(cancelled at an uncancellable wait)--> CancelPending
//! CancelPending --(next cancellable wait point)---> CancelDelivered
//! CancelDelivered --(cancel)----------------------> Resolved
//! Initial --(resolve)-----------------------------> Resolved
//! ```
//!
//! All suspension funnels through [`Task::block_on`], which parks the task on
//! an [`Awaitable`] with its instance scheduler. The scheduler resumes the
//! task through a one-shot channel installed while it is parked, telling it
//! whether the wait completed or was cancelled.
//!
//! [`SchedulerContext::start_task`]: crate::SchedulerContext::start_task

use crate::event::{CallbackCode, unpack_callback_result};
use crate::{
    Awaitable, AwaitableId, ComponentInstanceId, Error, Event, InstanceScheduler,
    ResourceTypeId, Result,
};
use futures::channel::oneshot;
use std::cell::{Cell, RefCell};
use std::collections::BTreeSet;
use std::fmt;
use std::rc::Rc;

/// Identity of a [`Task`], unique for the lifetime of a
/// [`SchedulerContext`](crate::SchedulerContext).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    pub(crate) fn new(id: u64) -> Self {
        TaskId(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "task {}", self.0)
    }
}

/// Lifecycle state of a [`Task`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TaskState {
    Initial,
    /// Cancelled while blocked at a cancellable wait.
    Cancelled,
    /// Cancelled while blocked at an uncancellable wait; delivered at the
    /// next cancellable wait point.
    CancelPending,
    /// A deferred cancellation has been reported to the task, which must now
    /// acknowledge it with [`Task::cancel`].
    CancelDelivered,
    Resolved,
}

/// Outcome of [`Task::block_on`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BlockResult {
    Cancelled,
    NotCancelled,
}

/// Core values produced by a task.
pub type TaskResults = Vec<i64>;

/// One in-flight invocation of an export of a component instance.
pub struct Task {
    id: TaskId,
    instance: Rc<InstanceScheduler>,
    is_async: bool,
    entry_name: Option<String>,
    state: Cell<TaskState>,
    entered: Cell<bool>,

    /// Installed while parked; the scheduler sends the wait's outcome here.
    resume: RefCell<Option<oneshot::Sender<BlockResult>>>,
    parked_on: Cell<Option<AwaitableId>>,
    /// Set when a cancellation arrives while the task isn't parked.
    cancel_requested: Cell<bool>,

    borrows: RefCell<BTreeSet<(ResourceTypeId, u32)>>,
    results: RefCell<Option<TaskResults>>,
}

impl Task {
    pub(crate) fn new(
        id: TaskId,
        instance: Rc<InstanceScheduler>,
        is_async: bool,
        entry_name: Option<String>,
    ) -> Rc<Task> {
        Rc::new(Task {
            id,
            instance,
            is_async,
            entry_name,
            state: Cell::new(TaskState::Initial),
            entered: Cell::new(false),
            resume: RefCell::new(None),
            parked_on: Cell::new(None),
            cancel_requested: Cell::new(false),
            borrows: RefCell::new(BTreeSet::new()),
            results: RefCell::new(None),
        })
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn instance_id(&self) -> ComponentInstanceId {
        self.instance.id()
    }

    pub fn instance(&self) -> &Rc<InstanceScheduler> {
        &self.instance
    }

    pub fn is_async(&self) -> bool {
        self.is_async
    }

    pub fn entry_name(&self) -> Option<&str> {
        self.entry_name.as_deref()
    }

    pub fn state(&self) -> TaskState {
        self.state.get()
    }

    /// Returns the awaitable this task is parked on, if any.
    pub fn parked_on(&self) -> Option<AwaitableId> {
        self.parked_on.get()
    }

    /// Waits until this task may start executing in its instance.
    ///
    /// A task which may not enter right away, or which would jump ahead of
    /// tasks already queued, joins the instance's pending queue and blocks
    /// until [`InstanceScheduler::maybe_start_pending_task`] gives it its
    /// turn. Returns `false` only if the task was cancelled while queued, in
    /// which case it has been resolved with an empty result.
    ///
    /// Once this task is in, the next queued task which may also enter gets
    /// its turn. Dropping the returned future takes the task back out of the
    /// queue.
    pub async fn enter(self: &Rc<Self>) -> Result<bool> {
        let instance = &self.instance;
        if !instance.may_enter(self.is_async)
            || instance.num_pending_tasks() > 0
            || instance.is_starting_pending_task()
        {
            let turn = instance.new_awaitable();
            instance.push_pending(self.id, self.is_async, turn.clone());
            log::debug!("{} pending on {}", self.id, instance.id());
            let mut queued = PendingEntry {
                task: self,
                armed: true,
            };

            let result = self.block_on(&turn, true, false).await?;
            queued.armed = false;
            if result == BlockResult::Cancelled {
                log::debug!("{} cancelled while pending", self.id);
                instance.remove_pending(self.id);
                self.resolve(Vec::new())?;
                return Ok(false);
            }
            if !instance.take_starting_pending_task() || !instance.may_enter(self.is_async) {
                return Err(Error::PendingTaskRefused(self.id));
            }
        }
        if !self.is_async {
            instance.set_calling_sync_export(true);
        }
        self.entered.set(true);
        log::trace!("{} entered {}", self.id, instance.id());
        instance.maybe_start_pending_task()?;
        Ok(true)
    }

    /// The primitive suspension point: parks this task on `awaitable` until
    /// it settles.
    ///
    /// With `for_callback` set the instance's exclusive lock is released while
    /// waiting and reacquired afterwards. A cancellation arriving at an
    /// uncancellable wait is deferred: the task moves to
    /// [`TaskState::CancelPending`], keeps waiting, and this returns
    /// [`BlockResult::NotCancelled`].
    ///
    /// A task which has entered its instance lets the next eligible pending
    /// task in before suspending.
    pub async fn block_on(
        self: &Rc<Self>,
        awaitable: &Awaitable,
        is_cancellable: bool,
        for_callback: bool,
    ) -> Result<BlockResult> {
        if self.instance.config().resolved_fast_path
            && awaitable.state() == crate::AwaitableState::Ready
            && !self.cancel_requested.get()
        {
            return Ok(BlockResult::NotCancelled);
        }

        if for_callback {
            self.instance.exclusive_release()?;
        }
        if self.entered.get() {
            self.instance.maybe_start_pending_task()?;
        }

        let mut cancelled = self.wait_uncancelled_twice(awaitable, is_cancellable).await?;

        if for_callback {
            let ticket = self.instance.exclusive_lock();
            // The lock must be held again before returning, whatever happens.
            cancelled |= self.wait_uncancelled_twice(&ticket.awaitable, false).await?;
        }

        if !cancelled {
            return Ok(BlockResult::NotCancelled);
        }
        let state = self.state.get();
        if state != TaskState::Initial {
            return Err(Error::InvalidTaskState {
                task: self.id,
                state,
                op: "block_on",
            });
        }
        if is_cancellable {
            self.state.set(TaskState::Cancelled);
            Ok(BlockResult::Cancelled)
        } else {
            self.state.set(TaskState::CancelPending);
            Ok(BlockResult::NotCancelled)
        }
    }

    /// Waits on `awaitable` once, and once more if that wait was cancelled but
    /// `is_cancellable` is false. Returns whether a cancellation was seen.
    async fn wait_uncancelled_twice(
        self: &Rc<Self>,
        awaitable: &Awaitable,
        is_cancellable: bool,
    ) -> Result<bool> {
        match self.on_block(awaitable).await? {
            BlockResult::NotCancelled => Ok(false),
            BlockResult::Cancelled if is_cancellable => Ok(true),
            BlockResult::Cancelled => match self.on_block(awaitable).await? {
                BlockResult::NotCancelled => Ok(true),
                BlockResult::Cancelled => Err(Error::CancelledTwice(self.id)),
            },
        }
    }

    async fn on_block(self: &Rc<Self>, awaitable: &Awaitable) -> Result<BlockResult> {
        if self.cancel_requested.replace(false) {
            return Ok(BlockResult::Cancelled);
        }
        let (tx, rx) = oneshot::channel();
        *self.resume.borrow_mut() = Some(tx);
        self.parked_on.set(Some(awaitable.id()));
        let _parked = Parked {
            task: self,
            awaitable: awaitable.id(),
        };
        self.instance.park_task_on_awaitable(awaitable, self)?;
        rx.await.map_err(|_| Error::Abandoned(self.id))
    }

    /// Called by the scheduler to resume this task after it was popped from
    /// the parked list of `awaitable`.
    ///
    /// Returns `false` if the future which parked the task has since been
    /// dropped, so there was nobody to resume.
    pub(crate) fn wake(&self, awaitable: AwaitableId, result: BlockResult) -> Result<bool> {
        let resume = self.resume.borrow_mut().take();
        let Some(resume) = resume else {
            return Err(Error::MissingResume {
                task: self.id,
                awaitable,
            });
        };
        log::trace!("waking {} from {awaitable} ({result:?})", self.id);
        self.parked_on.set(None);
        Ok(resume.send(result).is_ok())
    }

    /// Requests cancellation of this task.
    ///
    /// A parked task is woken immediately with a cancellation. Otherwise the
    /// request is recorded and observed by the task's next wait. Tasks which
    /// were already cancelled or resolved are left alone.
    pub fn request_cancel(&self) -> Result<()> {
        if self.state.get() != TaskState::Initial {
            return Ok(());
        }
        log::debug!("cancellation requested for {}", self.id);
        if !self.instance.cancel_parked_task(self)? {
            self.cancel_requested.set(true);
        }
        Ok(())
    }

    fn check_async(&self, is_async: bool) -> Result<()> {
        if self.is_async != is_async {
            return Err(Error::AsyncMismatch {
                task: self.id,
                task_async: self.is_async,
                requested: is_async,
            });
        }
        Ok(())
    }

    /// Delivers a deferred cancellation, if there is one.
    fn deliver_pending_cancel(&self) -> bool {
        if self.state.get() == TaskState::CancelPending {
            self.state.set(TaskState::CancelDelivered);
            true
        } else {
            false
        }
    }

    /// Blocks until an event is available on `waitable_set` and returns it.
    pub async fn wait_for_event(self: &Rc<Self>, waitable_set: u32, is_async: bool) -> Result<Event> {
        self.check_async(is_async)?;
        self.wait_on_set(waitable_set, false).await
    }

    async fn wait_on_set(self: &Rc<Self>, waitable_set: u32, for_callback: bool) -> Result<Event> {
        if self.deliver_pending_cancel() {
            return Ok(Event::TaskCancelled);
        }
        self.instance.waitable_set_begin_wait(waitable_set)?;
        let event = self.wait_on_set_loop(waitable_set, for_callback).await;
        self.instance.waitable_set_end_wait(waitable_set)?;
        event
    }

    async fn wait_on_set_loop(self: &Rc<Self>, waitable_set: u32, for_callback: bool) -> Result<Event> {
        loop {
            let ready = self.instance.waitable_set_pending_event(waitable_set)?;
            if self.block_on(&ready, true, for_callback).await? == BlockResult::Cancelled {
                self.instance
                    .waitable_set_forget_pending(waitable_set, &ready)?;
                return Ok(Event::TaskCancelled);
            }
            if let Some(event) = self.instance.poll_waitable_set(waitable_set)? {
                return Ok(event);
            }
        }
    }

    /// Returns the next event on `waitable_set` without suspending, or
    /// [`Event::None`] if there isn't one.
    pub fn poll_for_event(&self, waitable_set: u32, is_async: bool) -> Result<Event> {
        self.check_async(is_async)?;
        if self.deliver_pending_cancel() {
            return Ok(Event::TaskCancelled);
        }
        Ok(self
            .instance
            .poll_waitable_set(waitable_set)?
            .unwrap_or(Event::None))
    }

    /// Gives up control until the next scheduling round.
    ///
    /// Returns [`Event::TaskCancelled`] if a cancellation was delivered,
    /// otherwise [`Event::None`].
    pub async fn yield_(self: &Rc<Self>, is_cancellable: bool, for_callback: bool) -> Result<Event> {
        if is_cancellable && self.deliver_pending_cancel() {
            return Ok(Event::TaskCancelled);
        }
        let round = self.instance.yield_awaitable();
        Ok(match self.block_on(&round, is_cancellable, for_callback).await? {
            BlockResult::Cancelled => {
                self.instance.forget_yield(&round);
                Event::TaskCancelled
            }
            BlockResult::NotCancelled => Event::None,
        })
    }

    /// Runs the event loop of a callback-lifted export.
    ///
    /// `result` is the packed value returned by the export's entry point;
    /// each subsequent one comes from `callback`, which is handed the event
    /// produced by the previous step. Returns once the callback asks to exit.
    /// The caller must hold the instance's exclusive lock.
    pub async fn drive_callback<F>(self: &Rc<Self>, mut result: i64, mut callback: F) -> Result<()>
    where
        F: FnMut(Event) -> i64,
    {
        loop {
            let (code, set) = unpack_callback_result(result)?;
            log::trace!("{} callback code {code:?} set {set}", self.id);
            let event = match code {
                CallbackCode::Exit => return Ok(()),
                CallbackCode::Yield => self.yield_(true, true).await?,
                CallbackCode::Wait => self.wait_on_set(set, true).await?,
                CallbackCode::Poll => match self.yield_(true, true).await? {
                    Event::TaskCancelled => Event::TaskCancelled,
                    _ => self
                        .instance
                        .poll_waitable_set(set)?
                        .unwrap_or(Event::None),
                },
            };
            result = callback(event);
        }
    }

    fn check_no_borrows(&self) -> Result<()> {
        let count = self.borrows.borrow().len();
        if count > 0 {
            return Err(Error::BorrowsOutstanding {
                task: self.id,
                count,
            });
        }
        Ok(())
    }

    /// Acknowledges a delivered cancellation, resolving this task with an
    /// empty result.
    pub fn cancel(&self) -> Result<()> {
        self.check_no_borrows()?;
        let state = self.state.get();
        if state != TaskState::CancelDelivered {
            return Err(Error::InvalidTaskState {
                task: self.id,
                state,
                op: "cancel",
            });
        }
        *self.results.borrow_mut() = Some(Vec::new());
        self.state.set(TaskState::Resolved);
        Ok(())
    }

    pub fn resolve(&self, results: TaskResults) -> Result<()> {
        self.check_no_borrows()?;
        if self.state.get() == TaskState::Resolved {
            return Err(Error::AlreadyResolved(self.id));
        }
        log::trace!("{} resolved with {results:?}", self.id);
        *self.results.borrow_mut() = Some(results);
        self.state.set(TaskState::Resolved);
        Ok(())
    }

    /// Takes the results of a resolved task. Returns `None` if the task
    /// hasn't resolved or its results were already taken.
    pub fn take_results(&self) -> Option<TaskResults> {
        self.results.borrow_mut().take()
    }

    /// Finishes this task after it has resolved.
    ///
    /// A synchronous task which entered its instance ends the instance's
    /// synchronous export call. Either way a queued task gets a chance to
    /// enter.
    pub fn exit(&self) -> Result<()> {
        let state = self.state.get();
        if state != TaskState::Resolved {
            return Err(Error::InvalidTaskState {
                task: self.id,
                state,
                op: "exit",
            });
        }
        self.check_no_borrows()?;
        if !self.is_async && self.entered.get() {
            if !self.instance.calling_sync_export() {
                return Err(Error::NotInSyncExport(self.id));
            }
            self.instance.set_calling_sync_export(false);
        }
        log::trace!("{} exited {}", self.id, self.instance.id());
        self.instance.maybe_start_pending_task()
    }

    /// Creates a borrowed handle to resource `rep` of type `ty`, scoped to
    /// this task.
    pub fn lower_borrow(&self, ty: ResourceTypeId, rep: u32) -> Result<u32> {
        let handle = self.instance.resource_lower_borrow(ty, rep, self.id)?;
        self.borrows.borrow_mut().insert((ty, handle));
        Ok(handle)
    }

    /// Forgets a borrowed handle. Returns whether this task held it.
    pub fn release_borrow(&self, ty: ResourceTypeId, handle: u32) -> bool {
        self.borrows.borrow_mut().remove(&(ty, handle))
    }

    pub fn borrowed_handles(&self) -> Vec<(ResourceTypeId, u32)> {
        self.borrows.borrow().iter().copied().collect()
    }
}

/// Unparks a task whose wait is dropped before it is woken.
struct Parked<'a> {
    task: &'a Task,
    awaitable: AwaitableId,
}

impl Drop for Parked<'_> {
    fn drop(&mut self) {
        if self.task.parked_on.get() != Some(self.awaitable) {
            return;
        }
        log::trace!("{} dropped while parked on {}", self.task.id, self.awaitable);
        self.task.instance.remove_parked(self.awaitable, self.task.id);
        self.task.parked_on.set(None);
        self.task.resume.borrow_mut().take();
    }
}

/// Takes a task back out of its instance's pending queue if `enter` is
/// dropped before the task observes its turn.
struct PendingEntry<'a> {
    task: &'a Task,
    armed: bool,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let instance = &self.task.instance;
        log::debug!("{} dropped while pending on {}", self.task.id, instance.id());
        if instance.remove_pending(self.task.id) {
            return;
        }
        // The task had already been handed its turn, so pass it on.
        if instance.take_starting_pending_task() {
            if let Err(e) = instance.maybe_start_pending_task() {
                log::warn!("failed to start a pending task on {}: {e}", instance.id());
            }
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("instance", &self.instance.id())
            .field("is_async", &self.is_async)
            .field("entry_name", &self.entry_name)
            .field("state", &self.state.get())
            .field("parked_on", &self.parked_on.get())
            .finish_non_exhaustive()
    }
}
