use std::collections::VecDeque;
use bytes::Bytes;

#[derive(Debug, Clone, Eq, PartialEq)]
enum Slot {
    Free,
    Pending,
    Filled(Bytes),
}

/// Result of looking for data in a slot
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Lookup {
    /// the id is not in use
    Unknown,
    Pending,
    /// the data was taken out, and the id is free again
    Taken(Bytes),
}

/// A fixed set of ids `first_id..first_id+capacity`, each with a mailbox slot. Free ids are
///  kept in a queue, so acquiring and releasing are O(1) and recently released ids are reused
///  last.
pub struct SlotPool {
    first_id: u32,
    slots: Vec<Slot>,
    free: VecDeque<usize>,
}

impl SlotPool {
    pub fn new(first_id: u32, capacity: usize) -> SlotPool {
        SlotPool {
            first_id,
            slots: vec![Slot::Free; capacity],
            free: (0..capacity).collect(),
        }
    }

    pub fn contains_id(&self, id: u32) -> bool {
        self.index_of(id).is_some()
    }

    fn index_of(&self, id: u32) -> Option<usize> {
        let index = id.checked_sub(self.first_id)? as usize;
        (index < self.slots.len()).then_some(index)
    }

    fn id_of(&self, index: usize) -> u32 {
        self.first_id + index as u32
    }

    pub fn num_in_use(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.num_in_use() == 0
    }

    /// Allocates a free id, its slot waiting for data
    pub fn try_acquire(&mut self) -> Option<u32> {
        let index = self.free.pop_front()?;
        self.slots[index] = Slot::Pending;
        Some(self.id_of(index))
    }

    /// Frees an id, returning its data if it had arrived
    pub fn release(&mut self, id: u32) -> Option<Bytes> {
        let index = self.index_of(id)?;
        match std::mem::replace(&mut self.slots[index], Slot::Free) {
            Slot::Free => None,
            Slot::Pending => {
                self.free.push_back(index);
                None
            }
            Slot::Filled(data) => {
                self.free.push_back(index);
                Some(data)
            }
        }
    }

    /// Stores data for a pending id. Returns `false` if the id is not waiting for data.
    pub fn fill(&mut self, id: u32, data: Bytes) -> bool {
        match self.index_of(id) {
            Some(index) if self.slots[index] == Slot::Pending => {
                self.slots[index] = Slot::Filled(data);
                true
            }
            _ => false,
        }
    }

    /// Takes the data out of a slot if it has arrived, freeing the id
    pub fn take(&mut self, id: u32) -> Lookup {
        let Some(index) = self.index_of(id) else {
            return Lookup::Unknown;
        };
        match &self.slots[index] {
            Slot::Free => Lookup::Unknown,
            Slot::Pending => Lookup::Pending,
            Slot::Filled(_) => match self.release(id) {
                Some(data) => Lookup::Taken(data),
                None => Lookup::Unknown,
            }
        }
    }

    pub fn clear(&mut self) {
        self.free.clear();
        for (index, slot) in self.slots.iter_mut().enumerate() {
            *slot = Slot::Free;
            self.free.push_back(index);
        }
    }
}
