// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Generational arena backing the per-context object tables
//!
//! An index carries the slot position, the slot generation at insertion time
//! and the tag of the arena that issued it. Lookups with a stale generation or
//! a foreign tag miss instead of aliasing a newer object.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

static NEXT_TAG: AtomicU32 = AtomicU32::new(1);

/// Allocate a tag unique within this process
pub(crate) fn next_tag() -> u32 {
    NEXT_TAG.fetch_add(1, Ordering::Relaxed)
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArenaIndex {
    tag: u32,
    index: u32,
    generation: u32,
}

impl ArenaIndex {
    pub const fn new(tag: u32, index: u32, generation: u32) -> Self {
        Self {
            tag,
            index,
            generation,
        }
    }

    pub const fn index(self) -> u32 {
        self.index
    }

    pub const fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for ArenaIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@{}", self.index(), self.generation(), self.tag)
    }
}

enum Slot<T> {
    Occupied { generation: u32, value: T },
    Vacant { generation: u32 },
}

pub struct Arena<T> {
    tag: u32,
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Arena<T> {
    pub fn with_tag(tag: u32) -> Self {
        Self {
            tag,
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn insert(&mut self, value: T) -> ArenaIndex {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            let generation = match slot {
                Slot::Vacant { generation } => generation.wrapping_add(1),
                Slot::Occupied { .. } => unreachable!("free list points at an occupied slot"),
            };
            *slot = Slot::Occupied { generation, value };
            return ArenaIndex::new(self.tag, index, generation);
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot::Occupied {
            generation: 0,
            value,
        });
        ArenaIndex::new(self.tag, index, 0)
    }

    pub fn contains(&self, idx: ArenaIndex) -> bool {
        self.get(idx).is_some()
    }

    pub fn get(&self, idx: ArenaIndex) -> Option<&T> {
        if idx.tag != self.tag {
            return None;
        }
        match self.slots.get(idx.index as usize)? {
            Slot::Occupied { generation, value } if *generation == idx.generation => Some(value),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, idx: ArenaIndex) -> Option<&mut T> {
        if idx.tag != self.tag {
            return None;
        }
        match self.slots.get_mut(idx.index as usize)? {
            Slot::Occupied { generation, value } if *generation == idx.generation => Some(value),
            _ => None,
        }
    }

    pub fn remove(&mut self, idx: ArenaIndex) -> Option<T> {
        if !self.contains(idx) {
            return None;
        }
        let slot = &mut self.slots[idx.index as usize];
        let old = std::mem::replace(
            slot,
            Slot::Vacant {
                generation: idx.generation,
            },
        );
        self.free.push(idx.index);
        self.len -= 1;
        match old {
            Slot::Occupied { value, .. } => Some(value),
            Slot::Vacant { .. } => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (ArenaIndex, &T)> {
        let tag = self.tag;
        self.slots
            .iter()
            .enumerate()
            .filter_map(move |(i, slot)| match slot {
                Slot::Occupied { generation, value } => {
                    Some((ArenaIndex::new(tag, i as u32, *generation), value))
                }
                Slot::Vacant { .. } => None,
            })
    }
}
