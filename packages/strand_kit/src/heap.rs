//! Mutable-key binary min-heap
//!
//! Values live in an arena of slots. Each slot remembers where its value
//! currently sits in the heap array, so any node can be adjusted or removed
//! in O(log n) through its [`NodeHandle`], not just the root.

use crate::error::HeapError;

/// Handle to one live node of a [`BinaryHeap`]
///
/// Handles are invalidated by removal. A slot freed by removal may be reused
/// by a later insert, but the generation stamp keeps the old handle from
/// reaching the new occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeHandle {
    slot: usize,
    generation: u64,
}

#[derive(Debug)]
struct Item<T> {
    slot: usize,
    value: T,
}

#[derive(Debug)]
struct Slot {
    generation: u64,
    /// Position in `items`, `None` while the slot is free
    index: Option<usize>,
}

/// Min-heap over `T` whose nodes may be mutated in place
#[derive(Debug)]
pub struct BinaryHeap<T> {
    items: Vec<Item<T>>,
    slots: Vec<Slot>,
    free: Vec<usize>,
}

impl<T> Default for BinaryHeap<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            slots: Vec::new(),
            free: Vec::new(),
        }
    }
}

impl<T: Ord> BinaryHeap<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Whether `handle` still refers to a live node
    pub fn contains(&self, handle: NodeHandle) -> bool {
        self.index_of(handle).is_some()
    }

    pub fn insert(&mut self, value: T) -> NodeHandle {
        let index = self.items.len();
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot].index = Some(index);
                slot
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    index: Some(index),
                });
                self.slots.len() - 1
            }
        };
        self.items.push(Item { slot, value });
        self.sift_up(index);
        NodeHandle {
            slot,
            generation: self.slots[slot].generation,
        }
    }

    /// Handle of the minimum node
    pub fn peek(&self) -> Result<NodeHandle, HeapError> {
        let item = self.items.first().ok_or(HeapError::Empty)?;
        Ok(NodeHandle {
            slot: item.slot,
            generation: self.slots[item.slot].generation,
        })
    }

    /// Remove and return the minimum value
    pub fn pop(&mut self) -> Result<T, HeapError> {
        if self.items.is_empty() {
            return Err(HeapError::Empty);
        }
        Ok(self.remove_at(0))
    }

    pub fn remove_min(&mut self) -> Result<(), HeapError> {
        self.pop().map(|_| ())
    }

    /// Remove an arbitrary node. Returns `None` for a stale handle.
    pub fn remove(&mut self, handle: NodeHandle) -> Option<T> {
        let index = self.index_of(handle)?;
        Some(self.remove_at(index))
    }

    /// Restore heap order around a node whose key was changed through
    /// [`BinaryHeap::get_mut`]. Returns `false` for a stale handle.
    pub fn adjust(&mut self, handle: NodeHandle) -> bool {
        match self.index_of(handle) {
            Some(index) => {
                self.restore(index);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, handle: NodeHandle) -> Option<&T> {
        let index = self.index_of(handle)?;
        Some(&self.items[index].value)
    }

    /// Mutable access to a node's value; call [`BinaryHeap::adjust`] after
    /// changing anything that affects ordering.
    pub fn get_mut(&mut self, handle: NodeHandle) -> Option<&mut T> {
        let index = self.index_of(handle)?;
        Some(&mut self.items[index].value)
    }

    /// Replace a node's value and re-heapify in one step
    pub fn set(&mut self, handle: NodeHandle, value: T) -> bool {
        match self.index_of(handle) {
            Some(index) => {
                self.items[index].value = value;
                self.restore(index);
                true
            }
            None => false,
        }
    }

    fn index_of(&self, handle: NodeHandle) -> Option<usize> {
        let slot = self.slots.get(handle.slot)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.index
    }

    fn remove_at(&mut self, index: usize) -> T {
        let item = self.items.swap_remove(index);
        if index < self.items.len() {
            let moved = self.items[index].slot;
            self.slots[moved].index = Some(index);
            self.restore(index);
        }

        let slot = &mut self.slots[item.slot];
        slot.index = None;
        slot.generation += 1;
        self.free.push(item.slot);
        item.value
    }

    fn restore(&mut self, index: usize) {
        let index = self.sift_up(index);
        self.sift_down(index);
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.items.swap(a, b);
        let slot_a = self.items[a].slot;
        let slot_b = self.items[b].slot;
        self.slots[slot_a].index = Some(a);
        self.slots[slot_b].index = Some(b);
    }

    fn sift_up(&mut self, mut index: usize) -> usize {
        while index > 0 {
            let parent = (index - 1) / 2;
            if self.items[index].value >= self.items[parent].value {
                break;
            }
            self.swap(index, parent);
            index = parent;
        }
        index
    }

    fn sift_down(&mut self, mut index: usize) {
        let len = self.items.len();
        loop {
            let left = 2 * index + 1;
            let right = left + 1;
            let mut smallest = index;
            if left < len && self.items[left].value < self.items[smallest].value {
                smallest = left;
            }
            if right < len && self.items[right].value < self.items[smallest].value {
                smallest = right;
            }
            if smallest == index {
                break;
            }
            self.swap(index, smallest);
            index = smallest;
        }
    }
}
