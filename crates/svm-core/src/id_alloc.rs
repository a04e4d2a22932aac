//! Logical object id allocation.
//!
//! Hands out `LogicalObjectId`s from an atomic counter. Ids are never
//! reused, which trivially keeps an id unique while any replica is live.
//! Lock-free and safe to share across threads.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::types::LogicalObjectId;

/// Monotonic allocator for `LogicalObjectId`s.
pub struct LogicalObjectIdAllocator {
    next: AtomicU64,
}

impl LogicalObjectIdAllocator {
    /// Create an allocator whose first id is `1`.
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Create an allocator whose first id is `first`.
    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    /// Allocate a fresh id, or `None` once the id space is exhausted.
    ///
    /// `u64::MAX` is never handed out; a counter sitting at it means every
    /// id has been allocated or reserved.
    pub fn allocate(&self) -> Option<LogicalObjectId> {
        self.next
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                (n != u64::MAX).then(|| n + 1)
            })
            .ok()
            .map(LogicalObjectId::new)
    }

    /// Mark an externally chosen id (e.g. from a topology file) as taken so
    /// later allocations never collide with it.
    pub fn reserve(&self, id: LogicalObjectId) {
        self.next
            .fetch_max(id.as_u64().saturating_add(1), Ordering::Relaxed);
    }

    /// The id the next `allocate` call will return.
    pub fn peek(&self) -> LogicalObjectId {
        LogicalObjectId::new(self.next.load(Ordering::Relaxed))
    }
}

impl Default for LogicalObjectIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_increasing_ids() {
        let alloc = LogicalObjectIdAllocator::new();
        assert_eq!(alloc.allocate(), Some(LogicalObjectId::new(1)));
        assert_eq!(alloc.allocate(), Some(LogicalObjectId::new(2)));
        assert_eq!(alloc.peek(), LogicalObjectId::new(3));
    }

    #[test]
    fn reserve_skips_past_configured_ids() {
        let alloc = LogicalObjectIdAllocator::new();
        alloc.reserve(LogicalObjectId::new(42));
        assert_eq!(alloc.allocate(), Some(LogicalObjectId::new(43)));
    }

    #[test]
    fn reserve_below_counter_is_noop() {
        let alloc = LogicalObjectIdAllocator::starting_at(100);
        alloc.reserve(LogicalObjectId::new(5));
        assert_eq!(alloc.allocate(), Some(LogicalObjectId::new(100)));
    }

    #[test]
    fn concurrent_allocation_never_repeats() {
        use std::collections::HashSet;
        use std::sync::Arc;
        use std::thread;

        let alloc = Arc::new(LogicalObjectIdAllocator::new());
        let mut handles = vec![];

        for _ in 0..4 {
            let alloc = alloc.clone();
            handles.push(thread::spawn(move || {
                (0..100).map(|_| alloc.allocate().unwrap()).collect::<Vec<_>>()
            }));
        }

        let mut seen = HashSet::new();
        for h in handles {
            for id in h.join().unwrap() {
                assert!(seen.insert(id), "id {id} handed out twice");
            }
        }
        assert_eq!(seen.len(), 400);
        assert_eq!(alloc.peek(), LogicalObjectId::new(401));
    }

    #[test]
    fn reserving_the_largest_id_exhausts_the_allocator() {
        let alloc = LogicalObjectIdAllocator::new();
        alloc.reserve(LogicalObjectId::new(u64::MAX));
        assert_eq!(alloc.allocate(), None);
        // Reserving again stays saturated.
        alloc.reserve(LogicalObjectId::new(u64::MAX));
        assert_eq!(alloc.peek(), LogicalObjectId::new(u64::MAX));
    }

    #[test]
    fn last_allocatable_id_is_one_below_max() {
        let alloc = LogicalObjectIdAllocator::starting_at(u64::MAX - 1);
        assert_eq!(alloc.allocate(), Some(LogicalObjectId::new(u64::MAX - 1)));
        assert_eq!(alloc.allocate(), None);
        assert_eq!(alloc.allocate(), None);
    }
}
