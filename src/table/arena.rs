//! Slot arena: the heap-object addressing mode.
//!
//! Records live in a `Vec` of slots and are named by [`SlotId`]. Freed slots
//! are recycled through a free list, so identities stay small and stable for
//! the lifetime of a record.

use std::collections::TryReserveError;
use std::fmt;

use thiserror::Error;

use super::link::Addressing;

#[derive(Error, Debug)]
pub enum ArenaError {
    #[error("Arena index space exhausted")]
    Exhausted,

    #[error("Arena allocation failed: {0}")]
    Allocation(#[from] TryReserveError),
}

/// Identity of a record stored in an [`Arena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(u32);

impl SlotId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Slot storage for records indexed by one or more intrusive structures.
#[derive(Debug)]
pub struct Arena<R> {
    slots: Vec<Option<R>>,
    free_list: Vec<u32>,
    len: usize,
}

impl<R> Arena<R> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_list: Vec::new(),
            len: 0,
        }
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Store a record and return its identity.
    ///
    /// Fails without side effects if memory for the slot cannot be reserved.
    pub fn try_insert(&mut self, record: R) -> Result<SlotId, ArenaError> {
        if let Some(index) = self.free_list.pop() {
            self.slots[index as usize] = Some(record);
            self.len += 1;
            return Ok(SlotId(index));
        }

        let index = u32::try_from(self.slots.len()).map_err(|_| ArenaError::Exhausted)?;
        // The free list is empty here; size it for every slot so `remove` never allocates.
        self.free_list.try_reserve(self.slots.len() + 1)?;
        self.slots.try_reserve(1)?;
        self.slots.push(Some(record));
        self.len += 1;
        Ok(SlotId(index))
    }

    /// Take a record out of the arena, freeing its slot.
    pub fn remove(&mut self, id: SlotId) -> Option<R> {
        let record = self.slots.get_mut(id.index())?.take()?;
        self.free_list.push(id.0);
        self.len -= 1;
        Some(record)
    }

    pub fn get(&self, id: SlotId) -> Option<&R> {
        self.slots.get(id.index()).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: SlotId) -> Option<&mut R> {
        self.slots.get_mut(id.index()).and_then(Option::as_mut)
    }
}

impl<R> Default for Arena<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> Addressing for Arena<R> {
    type Record = R;
    type Id = SlotId;

    fn record(&self, id: SlotId) -> &R {
        match self.get(id) {
            Some(record) => record,
            None => panic!("arena slot {id} is not occupied"),
        }
    }

    fn record_mut(&mut self, id: SlotId) -> &mut R {
        match self.get_mut(id) {
            Some(record) => record,
            None => panic!("arena slot {id} is not occupied"),
        }
    }
}
