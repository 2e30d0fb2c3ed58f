use crate::Harness;
use component_task_runtime::{BlockResult, Error, Event, TaskState};
use futures::FutureExt;

#[test]
fn uncancellable_wait_defers_cancellation() -> anyhow::Result<()> {
    let mut h = Harness::new();
    let instance = h.cx.instance(h.instance);
    let task = h.task(true)?;
    let awaitable = instance.new_awaitable();

    let blocked = h.spawn({
        let task = task.clone();
        let awaitable = awaitable.clone();
        async move { task.block_on(&awaitable, false, false).await }
    })?;

    h.cx.request_cancel(h.instance, task.id())?;
    h.run();
    // The task went straight back to waiting for the real result.
    assert_eq!(task.state(), TaskState::Initial);
    assert_eq!(task.parked_on(), Some(awaitable.id()));

    instance.resolve_awaitable(&awaitable)?;
    h.run();
    assert_eq!(blocked.now_or_never(), Some(Ok(BlockResult::NotCancelled)));
    assert_eq!(task.state(), TaskState::CancelPending);

    // The next cancellable wait point sees the cancellation without blocking.
    let set = instance.waitable_set_new()?;
    assert_eq!(
        task.wait_for_event(set, true).now_or_never(),
        Some(Ok(Event::TaskCancelled))
    );
    assert_eq!(task.state(), TaskState::CancelDelivered);
    assert_eq!(instance.waitable_set_num_waiting(set)?, 0);

    task.cancel()?;
    assert_eq!(task.state(), TaskState::Resolved);
    assert_eq!(task.take_results(), Some(vec![]));
    assert_eq!(
        task.cancel(),
        Err(Error::InvalidTaskState {
            task: task.id(),
            state: TaskState::Resolved,
            op: "cancel",
        })
    );
    task.exit()?;
    Ok(())
}

#[test]
fn yield_delivers_deferred_cancellation() -> anyhow::Result<()> {
    let mut h = Harness::new();
    let instance = h.cx.instance(h.instance);
    let task = h.task(true)?;
    let awaitable = instance.new_awaitable();

    let blocked = h.spawn({
        let task = task.clone();
        let awaitable = awaitable.clone();
        async move { task.block_on(&awaitable, false, false).await }
    })?;
    instance.cancel_awaitable(&awaitable)?;
    h.run();
    instance.resolve_awaitable(&awaitable)?;
    h.run();
    assert_eq!(blocked.now_or_never(), Some(Ok(BlockResult::NotCancelled)));

    // An uncancellable yield leaves the cancellation pending.
    let yielded = h.spawn({
        let task = task.clone();
        async move { task.yield_(false, false).await }
    })?;
    assert_eq!(h.cx.tick()?, 1);
    h.run();
    assert_eq!(yielded.now_or_never(), Some(Ok(Event::None)));
    assert_eq!(task.state(), TaskState::CancelPending);

    assert_eq!(
        task.yield_(true, false).now_or_never(),
        Some(Ok(Event::TaskCancelled))
    );
    assert_eq!(task.state(), TaskState::CancelDelivered);
    Ok(())
}

#[test]
fn uncancellable_wait_cancelled_twice() -> anyhow::Result<()> {
    let mut h = Harness::new();
    let instance = h.cx.instance(h.instance);
    let task = h.task(true)?;
    let awaitable = instance.new_awaitable();

    let blocked = h.spawn({
        let task = task.clone();
        let awaitable = awaitable.clone();
        async move { task.block_on(&awaitable, false, false).await }
    })?;
    instance.cancel_awaitable(&awaitable)?;
    h.run();
    instance.cancel_awaitable(&awaitable)?;
    h.run();
    assert_eq!(
        blocked.now_or_never(),
        Some(Err(Error::CancelledTwice(task.id())))
    );
    Ok(())
}

#[test]
fn cancellable_wait_is_cancelled() -> anyhow::Result<()> {
    let mut h = Harness::new();
    let instance = h.cx.instance(h.instance);
    let task = h.task(true)?;
    let set = instance.waitable_set_new()?;

    let waiting = h.spawn({
        let task = task.clone();
        async move { task.wait_for_event(set, true).await }
    })?;
    assert_eq!(instance.waitable_set_num_waiting(set)?, 1);

    task.request_cancel()?;
    h.run();
    assert_eq!(waiting.now_or_never(), Some(Ok(Event::TaskCancelled)));
    assert_eq!(task.state(), TaskState::Cancelled);
    assert_eq!(instance.waitable_set_num_waiting(set)?, 0);

    // Only a deferred cancellation is acknowledged with `cancel`.
    assert!(task.cancel().is_err());
    task.resolve(vec![])?;
    task.exit()?;
    Ok(())
}

#[test]
fn cancelled_pending_task_never_enters() -> anyhow::Result<()> {
    let mut h = Harness::new();
    let instance = h.cx.instance(h.instance);
    instance.set_backpressure(true)?;

    let task = h.task(false)?;
    let entered = h.spawn({
        let task = task.clone();
        async move { task.enter().await }
    })?;
    assert_eq!(instance.num_pending_tasks(), 1);

    h.cx.request_cancel(h.instance, task.id())?;
    h.run();
    assert_eq!(entered.now_or_never(), Some(Ok(false)));
    assert_eq!(instance.num_pending_tasks(), 0);
    assert_eq!(task.state(), TaskState::Resolved);
    assert_eq!(task.take_results(), Some(vec![]));

    // It never entered, so exiting leaves the sync export flag alone.
    task.exit()?;
    assert!(!instance.calling_sync_export());
    Ok(())
}

#[test]
fn cancelled_yield_leaves_the_round() -> anyhow::Result<()> {
    let h = Harness::new();
    let task = h.task(true)?;
    h.cx.request_cancel(h.instance, task.id())?;
    assert_eq!(
        task.yield_(true, false).now_or_never(),
        Some(Ok(Event::TaskCancelled))
    );
    assert_eq!(task.state(), TaskState::Cancelled);
    assert_eq!(h.cx.tick()?, 0);
    Ok(())
}

#[test]
fn async_mismatch_is_rejected() -> anyhow::Result<()> {
    let h = Harness::new();
    let task = h.task(false)?;
    let set = h.cx.instance(h.instance).waitable_set_new()?;
    assert_eq!(
        task.wait_for_event(set, true).now_or_never(),
        Some(Err(Error::AsyncMismatch {
            task: task.id(),
            task_async: false,
            requested: true,
        }))
    );
    Ok(())
}
