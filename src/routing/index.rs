use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Hands out handler indices. Fresh indices come from a counter starting at
/// 1; released indices are recycled lowest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexAllocator {
    next_index: u32,
    free_indices: BTreeSet<u32>,
}

impl Default for IndexAllocator {
    fn default() -> Self {
        Self {
            next_index: 1,
            free_indices: BTreeSet::new(),
        }
    }
}

impl IndexAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&mut self) -> u32 {
        if let Some(index) = self.free_indices.pop_first() {
            return index;
        }
        let index = self.next_index;
        self.next_index += 1;
        index
    }

    /// Return an index to the free list. Only call once nothing refers to it.
    pub fn release(&mut self, index: u32) {
        if index != 0 && index < self.next_index {
            self.free_indices.insert(index);
        }
    }

    pub fn is_free(&self, index: u32) -> bool {
        index >= self.next_index || self.free_indices.contains(&index)
    }

    pub fn next_index(&self) -> u32 {
        self.next_index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recycles_lowest_first() {
        let mut alloc = IndexAllocator::new();
        let ids: Vec<_> = (0..5).map(|_| alloc.allocate()).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);

        alloc.release(4);
        alloc.release(2);
        assert!(alloc.is_free(2));
        assert_eq!(alloc.allocate(), 2);
        assert_eq!(alloc.allocate(), 4);
        assert_eq!(alloc.allocate(), 6);
    }

    #[test]
    fn test_release_of_unissued_index_is_ignored() {
        let mut alloc = IndexAllocator::new();
        alloc.release(7);
        alloc.release(0);
        assert_eq!(alloc.allocate(), 1);
    }
}
