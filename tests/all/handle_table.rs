use component_task_runtime::{Error, HandleTable};
use proptest::prelude::*;
use std::collections::HashMap;

#[derive(Debug, Clone)]
enum Op {
    Insert(u32),
    /// Removes the n-th live handle, modulo the number of live handles.
    Remove(usize),
    /// Removes a handle that was already removed, if there is one.
    RemoveStale,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => any::<u32>().prop_map(Op::Insert),
        2 => any::<usize>().prop_map(Op::Remove),
        1 => Just(Op::RemoveStale),
    ]
}

proptest! {
    #[test]
    fn table_matches_model(ops in prop::collection::vec(op(), 0..200)) {
        let mut table = HandleTable::new();
        let mut live = HashMap::new();
        let mut stale = Vec::new();

        for op in ops {
            match op {
                Op::Insert(value) => {
                    let handle = table.create_own(value).unwrap();
                    prop_assert_ne!(handle, 0);
                    prop_assert!(live.insert(handle, value).is_none());
                    stale.retain(|h| *h != handle);
                }
                Op::Remove(n) => {
                    if live.is_empty() {
                        continue;
                    }
                    let mut handles: Vec<_> = live.keys().copied().collect();
                    handles.sort();
                    let handle = handles[n % handles.len()];
                    let removed = table.remove(handle).unwrap();
                    prop_assert!(removed.owned);
                    prop_assert_eq!(Some(removed.value), live.remove(&handle));
                    stale.push(handle);
                }
                Op::RemoveStale => {
                    if let Some(handle) = stale.last().copied() {
                        prop_assert_eq!(table.remove(handle), Err(Error::InvalidHandle(handle)));
                    }
                }
            }
            prop_assert_eq!(table.len(), live.len());
            for (handle, value) in live.iter() {
                prop_assert_eq!(table.get(*handle), Ok(value));
            }
        }
        prop_assert_eq!(table.remove(0), Err(Error::InvalidHandle(0)));
    }
}

#[test]
fn recycles_most_recently_freed_slot() -> anyhow::Result<()> {
    let mut table = HandleTable::new();
    let a = table.create_own("a")?;
    let b = table.create_own("b")?;
    let c = table.create_own("c")?;
    table.remove(a)?;
    table.remove(c)?;
    assert_eq!(table.create_own("d")?, c);
    assert_eq!(table.create_own("e")?, a);
    assert_eq!(table.create_own("f")?, c + 1);
    assert_eq!(table.get(b)?, &"b");
    Ok(())
}
