use crate::{AwaitableId, ComponentInstanceId, TaskId, TaskState};

/// Fatal misuse of the task runtime.
///
/// Each of these indicates a broken caller: the operation that produced it was
/// aborted and should not be retried. Ordinary control flow such as a
/// cancelled wait or a refused entry is reported through return values
/// instead.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("invalid handle {0}")]
    InvalidHandle(u32),
    #[error("cannot allocate another handle: index overflow")]
    HandleOverflow,
    #[error("no tasks on the stack of {0}")]
    EmptyTaskStack(ComponentInstanceId),
    #[error("current task {found} does not match expected task {expected}")]
    TaskMismatch { expected: TaskId, found: TaskId },
    #[error("no task is currently executing")]
    NoCurrentTask,
    #[error("{0} not found on the stack of {1}")]
    UnknownTask(TaskId, ComponentInstanceId),
    #[error("{0} is already resolved")]
    AlreadyResolved(TaskId),
    #[error("{task} is in state {state:?} which does not permit `{op}`")]
    InvalidTaskState {
        task: TaskId,
        state: TaskState,
        op: &'static str,
    },
    #[error("{task} still has {count} borrowed handle(s)")]
    BorrowsOutstanding { task: TaskId, count: usize },
    #[error("{task} woken from {awaitable} has no resume callback installed")]
    MissingResume { task: TaskId, awaitable: AwaitableId },
    #[error("uncancellable wait of {0} was cancelled twice")]
    CancelledTwice(TaskId),
    #[error("pending {0} was woken but still may not enter its instance")]
    PendingTaskRefused(TaskId),
    #[error("{task} has async = {task_async} but the wait requested async = {requested}")]
    AsyncMismatch {
        task: TaskId,
        task_async: bool,
        requested: bool,
    },
    #[error("sync {0} exited while its instance was not in a sync export call")]
    NotInSyncExport(TaskId),
    #[error("{0} was dropped by the scheduler while parked")]
    Abandoned(TaskId),
    #[error("invalid callback result {0}, not a valid u32")]
    InvalidCallbackResult(i64),
    #[error("invalid callback code {0}, outside callback code range")]
    InvalidCallbackCode(u32),
    #[error("waitable set index {0} does not fit in 28 bits")]
    WaitableSetIndexOutOfRange(u32),
    #[error("waitable set {0} still has waiting tasks")]
    WaitableSetBusy(u32),
}

/// A convenience alias for results produced by this crate.
pub type Result<T, E = Error> = core::result::Result<T, E>;
