//! Handle Arena
//!
//! Objects that reference each other (surfaces and their context, windows
//! and their parent) are stored here and addressed by stable integer
//! handles. A handle is never reused, so a stale handle simply misses.

use std::collections::HashMap;

/// Stable reference to an arena slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(u64);

impl Handle {
    pub fn raw(self) -> u64 {
        self.0
    }
}

#[derive(Debug)]
pub struct Arena<T> {
    next: u64,
    slots: HashMap<Handle, T>,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self {
            next: 1,
            slots: HashMap::new(),
        }
    }
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, value: T) -> Handle {
        let handle = Handle(self.next);
        self.next += 1;
        self.slots.insert(handle, value);
        handle
    }

    pub fn get(&self, handle: Handle) -> Option<&T> {
        self.slots.get(&handle)
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        self.slots.get_mut(&handle)
    }

    pub fn remove(&mut self, handle: Handle) -> Option<T> {
        self.slots.remove(&handle)
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.slots.contains_key(&handle)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle, &T)> {
        self.slots.iter().map(|(h, v)| (*h, v))
    }
}
