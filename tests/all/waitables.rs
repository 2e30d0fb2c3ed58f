use crate::Harness;
use component_task_runtime::{Error, Event};
use futures::FutureExt;

#[test]
fn wait_returns_delivered_event() -> anyhow::Result<()> {
    let mut h = Harness::new();
    let instance = h.cx.instance(h.instance);
    let task = h.task(true)?;
    let set = instance.waitable_set_new()?;
    let subtask = instance.waitable_new()?;
    instance.waitable_join(subtask, Some(set))?;

    let waiting = h.spawn({
        let task = task.clone();
        async move { task.wait_for_event(set, true).await }
    })?;
    assert_eq!(instance.waitable_set_num_waiting(set)?, 1);
    assert_eq!(
        instance.waitable_set_drop(set),
        Err(Error::WaitableSetBusy(set))
    );

    let event = Event::Subtask {
        handle: subtask,
        status: 2,
    };
    instance.deliver_event(subtask, event)?;
    h.run();
    assert_eq!(waiting.now_or_never(), Some(Ok(event)));
    assert_eq!(instance.waitable_set_num_waiting(set)?, 0);
    instance.waitable_set_drop(set)?;
    Ok(())
}

#[test]
fn two_waiters_share_one_event() -> anyhow::Result<()> {
    let mut h = Harness::new();
    let instance = h.cx.instance(h.instance);
    let set = instance.waitable_set_new()?;
    let stream = instance.waitable_new()?;
    instance.waitable_join(stream, Some(set))?;

    let a = h.task(true)?;
    let b = h.task(true)?;
    let a_waiting = h.spawn({
        let a = a.clone();
        async move { a.wait_for_event(set, true).await }
    })?;
    let b_waiting = h.spawn({
        let b = b.clone();
        async move { b.wait_for_event(set, true).await }
    })?;
    assert_eq!(instance.waitable_set_num_waiting(set)?, 2);

    let first = Event::Transmit {
        handle: stream,
        code: 0x10,
    };
    instance.deliver_event(stream, first)?;
    h.run();

    // Exactly one of the two waiters got the event; the other went back to
    // waiting.
    let (a_done, b_done) = (a.parked_on().is_none(), b.parked_on().is_none());
    assert!(a_done ^ b_done);
    assert_eq!(instance.waitable_set_num_waiting(set)?, 1);

    let second = Event::Transmit {
        handle: stream,
        code: 0x20,
    };
    instance.deliver_event(stream, second)?;
    h.run();
    let mut events = vec![
        a_waiting.now_or_never().transpose()?,
        b_waiting.now_or_never().transpose()?,
    ];
    events.sort_by_key(|e| e.map(|e| e.parts().2));
    assert_eq!(events, vec![Some(first), Some(second)]);
    Ok(())
}

#[test]
fn poll_does_not_block() -> anyhow::Result<()> {
    let h = Harness::new();
    let instance = h.cx.instance(h.instance);
    let task = h.task(false)?;
    let set = instance.waitable_set_new()?;
    let w = instance.waitable_new()?;
    instance.waitable_join(w, Some(set))?;

    assert_eq!(task.poll_for_event(set, false)?, Event::None);
    instance.deliver_event(w, Event::Subtask { handle: w, status: 1 })?;
    // A newer event replaces an undelivered one.
    instance.deliver_event(w, Event::Subtask { handle: w, status: 3 })?;
    assert_eq!(
        task.poll_for_event(set, false)?,
        Event::Subtask { handle: w, status: 3 }
    );
    assert_eq!(task.poll_for_event(set, false)?, Event::None);

    // Leaving the set takes undelivered events along.
    instance.deliver_event(w, Event::Subtask { handle: w, status: 4 })?;
    instance.waitable_join(w, None)?;
    assert_eq!(task.poll_for_event(set, false)?, Event::None);
    Ok(())
}

#[test]
fn handles_are_checked() -> anyhow::Result<()> {
    let h = Harness::new();
    let instance = h.cx.instance(h.instance);
    assert_eq!(instance.waitable_set_drop(1), Err(Error::InvalidHandle(1)));
    let w = instance.waitable_new()?;
    assert_eq!(
        instance.waitable_join(w, Some(7)),
        Err(Error::InvalidHandle(7))
    );
    instance.waitable_drop(w)?;
    assert_eq!(instance.waitable_drop(w), Err(Error::InvalidHandle(w)));
    Ok(())
}
