//! Single-settlement suspension points.
//!
//! An [`Awaitable`] is the only thing a task ever suspends on. It starts out
//! [`AwaitableState::Pending`] and is settled by whoever produces the value it
//! stands for: either resolved to [`AwaitableState::Ready`] or cancelled by the
//! scheduler. Tasks don't poll awaitables themselves; they park on them with
//! their instance scheduler, which resumes them one at a time as settlement
//! events arrive. Host code that isn't a task can instead wait on
//! [`Awaitable::settled`].

use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

/// Identity of an [`Awaitable`], unique within its component instance.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AwaitableId(u64);

impl AwaitableId {
    pub(crate) fn new(id: u64) -> Self {
        AwaitableId(id)
    }

    /// Returns the raw id.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for AwaitableId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "awaitable {}", self.0)
    }
}

/// Settlement state of an [`Awaitable`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AwaitableState {
    Pending,
    Ready,
    Cancelled,
}

/// A shared handle to a single suspension point.
///
/// Cloning an `Awaitable` yields another handle to the same suspension point.
#[derive(Clone)]
pub struct Awaitable {
    inner: Rc<Inner>,
}

struct Inner {
    id: AwaitableId,
    state: Cell<AwaitableState>,
    wakers: RefCell<Vec<Waker>>,
    /// Bumped each time `wakers` is drained, invalidating [`Settled`] slots.
    settlements: Cell<u64>,
}

impl Awaitable {
    pub(crate) fn new(id: AwaitableId) -> Self {
        Awaitable {
            inner: Rc::new(Inner {
                id,
                state: Cell::new(AwaitableState::Pending),
                wakers: RefCell::new(Vec::new()),
                settlements: Cell::new(0),
            }),
        }
    }

    pub(crate) fn new_ready(id: AwaitableId) -> Self {
        let ret = Awaitable::new(id);
        ret.inner.state.set(AwaitableState::Ready);
        ret
    }

    pub fn id(&self) -> AwaitableId {
        self.inner.id
    }

    pub fn state(&self) -> AwaitableState {
        self.inner.state.get()
    }

    /// Returns whether this awaitable has settled, either way.
    pub fn resolved(&self) -> bool {
        self.state() != AwaitableState::Pending
    }

    /// Marks this awaitable as ready. Returns `false` if it had already
    /// settled.
    pub(crate) fn resolve(&self) -> bool {
        self.settle(AwaitableState::Ready)
    }

    /// Marks this awaitable as cancelled. Returns `false` if it had already
    /// settled.
    pub(crate) fn cancel(&self) -> bool {
        self.settle(AwaitableState::Cancelled)
    }

    /// Returns a cancelled awaitable to `Pending` once its cancellation has
    /// been handed to a parked task.
    pub(crate) fn rearm(&self) {
        debug_assert_eq!(self.state(), AwaitableState::Cancelled);
        self.inner.state.set(AwaitableState::Pending);
    }

    fn settle(&self, state: AwaitableState) -> bool {
        if self.resolved() {
            return false;
        }
        self.inner.state.set(state);
        let wakers = std::mem::take(&mut *self.inner.wakers.borrow_mut());
        self.inner.settlements.set(self.inner.settlements.get() + 1);
        for waker in wakers {
            waker.wake();
        }
        true
    }

    /// Returns a future which completes with the settled state of this
    /// awaitable.
    pub fn settled(&self) -> Settled {
        Settled {
            awaitable: self.clone(),
            slot: None,
        }
    }
}

impl fmt::Debug for Awaitable {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Awaitable")
            .field("id", &self.inner.id)
            .field("state", &self.inner.state.get())
            .finish()
    }
}

/// Future returned by [`Awaitable::settled`].
pub struct Settled {
    awaitable: Awaitable,
    /// Where this future's waker sits in the awaitable's list, tagged with
    /// the settlement count it was registered under.
    slot: Option<(u64, usize)>,
}

impl Future for Settled {
    type Output = AwaitableState;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<AwaitableState> {
        let this = self.get_mut();
        let inner = &this.awaitable.inner;
        match inner.state.get() {
            AwaitableState::Pending => {
                let mut wakers = inner.wakers.borrow_mut();
                let settlements = inner.settlements.get();
                match this.slot {
                    Some((n, i)) if n == settlements && i < wakers.len() => {
                        wakers[i].clone_from(cx.waker());
                    }
                    _ => {
                        this.slot = Some((settlements, wakers.len()));
                        wakers.push(cx.waker().clone());
                    }
                }
                Poll::Pending
            }
            state => Poll::Ready(state),
        }
    }
}
