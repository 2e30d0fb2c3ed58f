//! Handle tables mapping small integers to host-side representations.
//!
//! A [`HandleTable`] is basically "just a slab": a vector of slots where free
//! slots form an intrusive singly-linked list whose head is tracked
//! separately. Handles are 1-based since the component model reserves index 0
//! as never allocatable.

use crate::{Error, Result, TaskId};
use core::mem;

/// The maximum handle value is specified in
/// <https://github.com/WebAssembly/component-model/blob/main/design/mvp/CanonicalABI.md>
/// currently and keeps the upper bit free for use in the component.
pub const MAX_HANDLE: u32 = 1 << 30;

/// An individual slab of entries used for a single category of handles within
/// a component instance.
pub struct HandleTable<T> {
    /// Next slot to allocate, or `self.slots.len()` if they're all full.
    next: u32,
    /// Runtime state of all slots.
    slots: Vec<Slot<T>>,
    /// Exclusive upper bound on handles handed out by this table.
    max: u32,
    live: usize,
}

enum Slot<T> {
    /// This slot is free and points to the next free slot, forming a linked
    /// list of free slots.
    Free { next: u32 },

    /// This slot contains a value the runtime owns and may destroy once it is
    /// removed.
    Own(T),

    /// This slot contains a value lent to the task `scope`. Removing it must
    /// not destroy the value.
    Borrow { value: T, scope: TaskId },
}

/// The previous contents of a slot removed from a [`HandleTable`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Removed<T> {
    /// The value stored under the handle.
    pub value: T,
    /// The task a borrowed entry was scoped to, `None` for owned entries.
    pub scope: Option<TaskId>,
    /// Whether the runtime owned `value`.
    pub owned: bool,
}

impl<T> HandleTable<T> {
    /// Creates an empty table handing out handles below [`MAX_HANDLE`].
    pub fn new() -> Self {
        Self::with_max_handle(MAX_HANDLE)
    }

    /// Creates an empty table handing out handles strictly below `max`.
    pub fn with_max_handle(max: u32) -> Self {
        HandleTable {
            next: 0,
            slots: Vec::new(),
            max: max.min(MAX_HANDLE),
            live: 0,
        }
    }

    /// Inserts `value` as an owned entry, returning its handle.
    ///
    /// Freed slots are reused most recent first, not smallest first: the free
    /// list is a stack threaded through slot 0. With no freed slot the table
    /// grows by one slot.
    pub fn create_own(&mut self, value: T) -> Result<u32> {
        self.insert(Slot::Own(value))
    }

    /// Inserts `value` as an entry borrowed by the task `scope`, returning its
    /// handle.
    pub fn create_borrow(&mut self, value: T, scope: TaskId) -> Result<u32> {
        self.insert(Slot::Borrow { value, scope })
    }

    fn insert(&mut self, new: Slot<T>) -> Result<u32> {
        let next = self.next as usize;
        if next == self.slots.len() {
            // The component model reserves index 0 as never allocatable so the
            // handle is one more than the slot index.
            if self.next.checked_add(1).map_or(true, |h| h >= self.max) {
                return Err(Error::HandleOverflow);
            }
            self.slots.push(Slot::Free {
                next: self.next + 1,
            });
        }
        let ret = self.next;
        self.next = match mem::replace(&mut self.slots[next], new) {
            Slot::Free { next } => next,
            // The free list only ever threads through free slots.
            Slot::Own(_) | Slot::Borrow { .. } => unreachable!(),
        };
        self.live += 1;
        Ok(ret + 1)
    }

    fn handle_to_slot(&self, handle: u32) -> Option<usize> {
        // NB: `handle` is decremented by one to account for the `+1` above
        // during allocation.
        let idx = handle.checked_sub(1)?;
        usize::try_from(idx).ok()
    }

    /// Returns the value stored under `handle`.
    pub fn get(&self, handle: u32) -> Result<&T> {
        let slot = self.handle_to_slot(handle).and_then(|i| self.slots.get(i));
        match slot {
            None | Some(Slot::Free { .. }) => Err(Error::InvalidHandle(handle)),
            Some(Slot::Own(value) | Slot::Borrow { value, .. }) => Ok(value),
        }
    }

    /// Returns the value stored under `handle` mutably.
    pub fn get_mut(&mut self, handle: u32) -> Result<&mut T> {
        let slot = self
            .handle_to_slot(handle)
            .and_then(|i| self.slots.get_mut(i));
        match slot {
            None | Some(Slot::Free { .. }) => Err(Error::InvalidHandle(handle)),
            Some(Slot::Own(value) | Slot::Borrow { value, .. }) => Ok(value),
        }
    }

    /// Returns whether `handle` is an owned entry.
    pub fn is_owned(&self, handle: u32) -> Result<bool> {
        let slot = self.handle_to_slot(handle).and_then(|i| self.slots.get(i));
        match slot {
            None | Some(Slot::Free { .. }) => Err(Error::InvalidHandle(handle)),
            Some(Slot::Own(_)) => Ok(true),
            Some(Slot::Borrow { .. }) => Ok(false),
        }
    }

    /// Removes the entry under `handle` and pushes its slot onto the free
    /// list.
    ///
    /// Fails with [`Error::InvalidHandle`] if `handle` is 0, out of bounds, or
    /// already free.
    pub fn remove(&mut self, handle: u32) -> Result<Removed<T>> {
        let idx = self
            .handle_to_slot(handle)
            .filter(|i| matches!(self.slots.get(*i), Some(Slot::Own(_) | Slot::Borrow { .. })))
            .ok_or(Error::InvalidHandle(handle))?;
        let to_fill = Slot::Free { next: self.next };
        let ret = mem::replace(&mut self.slots[idx], to_fill);
        self.next = handle - 1;
        self.live -= 1;
        Ok(match ret {
            Slot::Own(value) => Removed {
                value,
                scope: None,
                owned: true,
            },
            Slot::Borrow { value, scope } => Removed {
                value,
                scope: Some(scope),
                owned: false,
            },
            Slot::Free { .. } => unreachable!(),
        })
    }

    /// Returns the number of live entries in this table.
    pub fn len(&self) -> usize {
        self.live
    }

    /// Returns whether this table has no live entries.
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        HandleTable::new()
    }
}
