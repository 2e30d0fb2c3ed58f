use crate::Harness;
use std::cell::RefCell;
use std::rc::Rc;

#[test]
fn tickets_acquire_in_call_order() -> anyhow::Result<()> {
    let mut h = Harness::new();
    let instance = h.cx.instance(h.instance);
    let acquired = Rc::new(RefCell::new(Vec::new()));

    for _ in 0..8 {
        let instance = instance.clone();
        let acquired = acquired.clone();
        h.spawn(async move {
            let ticket = instance.acquire_exclusive().await;
            acquired.borrow_mut().push(ticket);
        })?
        .forget();
    }
    assert!(instance.is_exclusively_locked());
    assert_eq!(acquired.borrow().len(), 1);

    for held in 1..8 {
        assert_eq!(acquired.borrow().len(), held);
        instance.exclusive_release()?;
        h.run();
    }
    let acquired = acquired.borrow();
    assert_eq!(*acquired, (1..=8).collect::<Vec<u64>>());

    instance.exclusive_release()?;
    assert!(!instance.is_exclusively_locked());
    // Releasing an unlocked lock is fine.
    instance.exclusive_release()?;
    Ok(())
}

#[test]
fn late_ticket_cannot_jump_queue() -> anyhow::Result<()> {
    let h = Harness::new();
    let instance = h.cx.instance(h.instance);
    let first = instance.exclusive_lock();
    let second = instance.exclusive_lock();
    let third = instance.exclusive_lock();
    assert!(first.awaitable.resolved());
    assert!(!second.awaitable.resolved());

    instance.exclusive_release()?;
    assert!(second.awaitable.resolved());
    assert!(!third.awaitable.resolved());
    assert_eq!(instance.exclusive_holder(), Some(second.ticket));

    // A newcomer queues behind `third` even though it asks while the lock is
    // being handed over.
    let fourth = instance.exclusive_lock();
    instance.exclusive_release()?;
    assert!(third.awaitable.resolved());
    assert!(!fourth.awaitable.resolved());
    Ok(())
}
