//! Binary min-heap over arena ids with position tracking.
//!
//! Elements live in an external arena; the heap stores only their ids and
//! writes each element's current position back into the arena on every move.
//! This allows O(log n) removal and re-prioritisation of arbitrary elements,
//! which `std::collections::BinaryHeap` does not offer.

/// Storage backing an [`IndexedHeap`].
pub trait HeapArena<Id> {
    type Key: Ord;

    /// Ordering key of `id`. Must not change while `id` is queued unless
    /// [`IndexedHeap::fix`] is called afterwards.
    fn heap_key(&self, id: Id) -> Self::Key;

    /// Records the position of `id`, `None` once it leaves the heap.
    fn set_heap_index(&mut self, id: Id, index: Option<usize>);
}

#[derive(Debug, Clone)]
pub struct IndexedHeap<Id> {
    items: Vec<Id>,
}

impl<Id> Default for IndexedHeap<Id> {
    fn default() -> Self {
        Self { items: Vec::new() }
    }
}

impl<Id: Copy> IndexedHeap<Id> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Smallest element without removing it.
    pub fn peek(&self) -> Option<Id> {
        self.items.first().copied()
    }

    pub fn get(&self, index: usize) -> Option<Id> {
        self.items.get(index).copied()
    }

    /// Elements in heap order (not sorted).
    pub fn iter(&self) -> impl Iterator<Item = Id> + '_ {
        self.items.iter().copied()
    }

    pub fn push<A: HeapArena<Id>>(&mut self, arena: &mut A, id: Id) {
        let index = self.items.len();
        self.items.push(id);
        arena.set_heap_index(id, Some(index));
        self.sift_up(arena, index);
    }

    pub fn pop<A: HeapArena<Id>>(&mut self, arena: &mut A) -> Option<Id> {
        self.remove(arena, 0)
    }

    /// Removes the element at `index`.
    pub fn remove<A: HeapArena<Id>>(&mut self, arena: &mut A, index: usize) -> Option<Id> {
        let last = self.items.len().checked_sub(1)?;
        if index > last {
            return None;
        }
        if index != last {
            self.swap(arena, index, last);
        }

        let id = self.items.pop()?;
        arena.set_heap_index(id, None);

        if index < self.items.len() {
            self.fix(arena, index);
        }
        Some(id)
    }

    /// Restores heap order after the key of the element at `index` changed.
    pub fn fix<A: HeapArena<Id>>(&mut self, arena: &mut A, index: usize) {
        if index >= self.items.len() {
            return;
        }
        if !self.sift_down(arena, index) {
            self.sift_up(arena, index);
        }
    }

    /// Empties the heap, returning the removed ids in heap order.
    pub fn clear<A: HeapArena<Id>>(&mut self, arena: &mut A) -> Vec<Id> {
        let items = std::mem::take(&mut self.items);
        for &id in &items {
            arena.set_heap_index(id, None);
        }
        items
    }

    fn less<A: HeapArena<Id>>(&self, arena: &A, i: usize, j: usize) -> bool {
        arena.heap_key(self.items[i]) < arena.heap_key(self.items[j])
    }

    fn swap<A: HeapArena<Id>>(&mut self, arena: &mut A, i: usize, j: usize) {
        self.items.swap(i, j);
        arena.set_heap_index(self.items[i], Some(i));
        arena.set_heap_index(self.items[j], Some(j));
    }

    fn sift_up<A: HeapArena<Id>>(&mut self, arena: &mut A, mut j: usize) {
        while j > 0 {
            let parent = (j - 1) / 2;
            if !self.less(arena, j, parent) {
                break;
            }
            self.swap(arena, parent, j);
            j = parent;
        }
    }

    /// Returns true when the element moved.
    fn sift_down<A: HeapArena<Id>>(&mut self, arena: &mut A, start: usize) -> bool {
        let n = self.items.len();
        let mut i = start;
        loop {
            let left = 2 * i + 1;
            if left >= n {
                break;
            }
            let right = left + 1;
            let child = if right < n && self.less(arena, right, left) {
                right
            } else {
                left
            };
            if !self.less(arena, child, i) {
                break;
            }
            self.swap(arena, i, child);
            i = child;
        }
        i > start
    }
}
