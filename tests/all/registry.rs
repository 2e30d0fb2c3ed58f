use component_task_runtime::{
    ComponentInstanceId, Config, Error, ResourceTypeId, SchedulerContext,
};

#[test]
fn start_and_end_bracket_calls() -> anyhow::Result<()> {
    let _ = env_logger::try_init();
    let cx = SchedulerContext::default();
    let outer = ComponentInstanceId::new(1);
    let inner = ComponentInstanceId::new(2);
    assert_eq!(cx.current_task_id(), None);

    let a = cx.start_task(outer, false, Some("run"));
    let b = cx.start_task(inner, true, Some("[async]fetch"));
    assert_eq!(cx.current_task_id(), Some(b));
    assert_eq!(cx.current_instance_id(), Some(inner));
    let current = cx.current_task().expect("current task");
    assert_eq!(current.entry_name(), Some("[async]fetch"));
    assert!(current.is_async());
    assert_eq!(current.instance_id(), inner);

    assert_eq!(
        cx.end_task(outer, b).err(),
        Some(Error::TaskMismatch {
            expected: b,
            found: a
        })
    );
    assert_eq!(cx.end_task(inner, b)?.id(), b);
    assert_eq!(cx.current_task_id(), Some(a));
    assert_eq!(cx.task(inner, b).err(), Some(Error::UnknownTask(b, inner)));

    cx.end_current_task()?;
    assert_eq!(cx.current_task_id(), None);
    assert_eq!(
        cx.end_task(outer, a).err(),
        Some(Error::EmptyTaskStack(outer))
    );

    // Ids are never reused.
    let c = cx.start_task(outer, false, None);
    assert!(c > b);
    Ok(())
}

#[test]
fn resources_drop_through_context() -> anyhow::Result<()> {
    let cx = SchedulerContext::default();
    let instance = ComponentInstanceId::new(0);
    let ty = ResourceTypeId::new(1);
    let scheduler = cx.instance(instance);

    let own = scheduler.resource_new(ty, 0xabc)?;
    assert_eq!(scheduler.resource_rep(ty, own)?, 0xabc);

    let task = cx.task(instance, cx.start_task(instance, true, None))?;
    let borrow = task.lower_borrow(ty, 0xabc)?;
    assert_eq!(cx.resource_drop(instance, ty, borrow)?, None);
    assert!(task.borrowed_handles().is_empty());

    assert_eq!(cx.resource_drop(instance, ty, own)?, Some(0xabc));
    assert_eq!(
        cx.resource_drop(instance, ty, own),
        Err(Error::InvalidHandle(own))
    );
    Ok(())
}

#[test]
fn configured_handle_limit() -> anyhow::Result<()> {
    let mut config = Config::new();
    config.max_table_handle(3);
    let cx = SchedulerContext::new(&config);
    let scheduler = cx.instance(ComponentInstanceId::new(0));

    assert_eq!(scheduler.waitable_new()?, 1);
    assert_eq!(scheduler.waitable_new()?, 2);
    assert_eq!(scheduler.waitable_new(), Err(Error::HandleOverflow));
    scheduler.waitable_drop(1)?;
    assert_eq!(scheduler.waitable_new()?, 1);
    Ok(())
}

#[test]
fn tick_with_nothing_yielded() -> anyhow::Result<()> {
    let cx = SchedulerContext::new(&Config::default());
    cx.instance(ComponentInstanceId::new(0));
    assert_eq!(cx.tick()?, 0);
    Ok(())
}
