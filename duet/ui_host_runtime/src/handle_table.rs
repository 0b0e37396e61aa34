//! Small-integer handles for objects referenced across the thread boundary.
//!
//! The peer thread only ever sees the integer. Lookups of released handles
//! return `None`; callers treat that as "already disposed", never as fatal.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

pub type Handle = u32;

/// Handle 0 is never issued; it names the tree root on both sides.
pub const FIRST_HANDLE: Handle = 1;

#[derive(Debug, Clone)]
pub struct HandleTable<T> {
    slots: Vec<Option<T>>,
    free: BinaryHeap<Reverse<Handle>>,
    live: usize,
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: BinaryHeap::new(),
            live: 0,
        }
    }
}

impl<T> HandleTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value` under the smallest handle not currently live.
    pub fn add(&mut self, value: T) -> Handle {
        self.live += 1;

        if let Some(Reverse(handle)) = self.free.pop() {
            self.slots[slot_index(handle)] = Some(value);
            return handle;
        }

        self.slots.push(Some(value));
        FIRST_HANDLE + (self.slots.len() as Handle - 1)
    }

    pub fn get(&self, handle: Handle) -> Option<&T> {
        self.slot(handle).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        if handle < FIRST_HANDLE {
            return None;
        }
        self.slots
            .get_mut(slot_index(handle))
            .and_then(Option::as_mut)
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.get(handle).is_some()
    }

    /// Releases `handle` for reuse. Removing an unknown handle is a no-op.
    pub fn remove(&mut self, handle: Handle) -> Option<T> {
        if handle < FIRST_HANDLE {
            return None;
        }
        let value = self.slots.get_mut(slot_index(handle))?.take()?;
        self.free.push(Reverse(handle));
        self.live -= 1;
        Some(value)
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.as_ref()
                .map(|value| (FIRST_HANDLE + index as Handle, value))
        })
    }

    fn slot(&self, handle: Handle) -> Option<&Option<T>> {
        if handle < FIRST_HANDLE {
            return None;
        }
        self.slots.get(slot_index(handle))
    }
}

fn slot_index(handle: Handle) -> usize {
    (handle - FIRST_HANDLE) as usize
}
