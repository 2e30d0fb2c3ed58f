//! Runtime support for component-model tasks on a single-threaded,
//! cooperative host.
//!
//! Calls into a component instance may overlap: a caller can start an export
//! while earlier calls into the same instance are still suspended. This crate
//! decides which of those calls may run, queues the ones which may not yet,
//! suspends and resumes them, and delivers cancellation without corrupting
//! the instance's handle tables.
//!
//! The main types are:
//!
//! * [`SchedulerContext`]: the explicitly owned root holding every instance
//!   scheduler and each instance's stack of active tasks.
//! * [`InstanceScheduler`]: per-instance backpressure, pending-task queue,
//!   exclusive ticket lock, parked tasks and handle tables.
//! * [`Task`]: one in-flight call, with its cancellation and resolution
//!   lifecycle.
//! * [`Awaitable`]: the single-settlement point every suspension waits on.
//! * [`HandleTable`]: a slab handing out stable `u32` handles.
//!
//! Suspending operations are `async fn`s which may be driven by any
//! single-threaded executor.

mod awaitable;
mod config;
mod error;
mod event;
mod instance;
mod registry;
mod table;
mod task;

pub use crate::awaitable::{Awaitable, AwaitableId, AwaitableState, Settled};
pub use crate::config::Config;
pub use crate::error::{Error, Result};
pub use crate::event::{
    CallbackCode, Event, EventCode, pack_callback_result, unpack_callback_result,
};
pub use crate::instance::{ComponentInstanceId, InstanceScheduler, LockTicket, ResourceTypeId};
pub use crate::registry::SchedulerContext;
pub use crate::table::{HandleTable, MAX_HANDLE, Removed};
pub use crate::task::{BlockResult, Task, TaskId, TaskResults, TaskState};
