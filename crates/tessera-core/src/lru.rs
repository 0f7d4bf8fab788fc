//! LRU Ordering
//!
//! Usage order over a fixed pool of physical tile ids.
//!
//! Ids `0..capacity` are members for the lifetime of the cache. Nothing is
//! ever removed: "eviction" means the caller reuses the oldest id. The list
//! is doubly linked through two index arrays so `touch` and `peek_oldest`
//! are O(1) without per-entry allocation.

const NIL: u32 = u32::MAX;

/// Least-recently-used ordering of a fixed id pool
#[derive(Debug, Clone)]
pub struct LruCache {
    /// Previous (older) neighbour per id
    prev: Vec<u32>,
    /// Next (newer) neighbour per id
    next: Vec<u32>,
    /// Least recently used id
    head: u32,
    /// Most recently used id
    tail: u32,
}

impl LruCache {
    /// Create a cache over ids `0..capacity`, id 0 being the oldest
    pub fn new(capacity: u32) -> Self {
        assert!(capacity < NIL, "LRU capacity exceeds the id range");

        let prev = (0..capacity)
            .map(|id| if id == 0 { NIL } else { id - 1 })
            .collect();
        let next = (0..capacity)
            .map(|id| if id + 1 == capacity { NIL } else { id + 1 })
            .collect();

        let (head, tail) = if capacity == 0 { (NIL, NIL) } else { (0, capacity - 1) };

        Self { prev, next, head, tail }
    }

    /// Number of ids in the pool
    pub fn capacity(&self) -> u32 {
        self.prev.len() as u32
    }

    /// Check whether an id belongs to the pool
    pub fn contains(&self, id: u32) -> bool {
        (id as usize) < self.prev.len()
    }

    /// Mark an id as most recently used
    ///
    /// Returns `false` without changing anything if the id is unknown.
    pub fn touch(&mut self, id: u32) -> bool {
        if !self.contains(id) {
            return false;
        }
        if id == self.tail {
            return true;
        }

        self.unlink(id);
        self.push_back(id);
        true
    }

    /// Least recently used id, left in place
    pub fn peek_oldest(&self) -> Option<u32> {
        (self.head != NIL).then_some(self.head)
    }

    /// Most recently used id
    pub fn peek_newest(&self) -> Option<u32> {
        (self.tail != NIL).then_some(self.tail)
    }

    /// Iterate ids from least to most recently used
    pub fn iter_oldest_first(&self) -> impl Iterator<Item = u32> + '_ {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            if cursor == NIL {
                return None;
            }
            let id = cursor;
            cursor = self.next[id as usize];
            Some(id)
        })
    }

    fn unlink(&mut self, id: u32) {
        let prev = self.prev[id as usize];
        let next = self.next[id as usize];

        if prev == NIL {
            self.head = next;
        } else {
            self.next[prev as usize] = next;
        }

        if next == NIL {
            self.tail = prev;
        } else {
            self.prev[next as usize] = prev;
        }
    }

    fn push_back(&mut self, id: u32) {
        self.prev[id as usize] = self.tail;
        self.next[id as usize] = NIL;

        if self.tail == NIL {
            self.head = id;
        } else {
            self.next[self.tail as usize] = id;
        }
        self.tail = id;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_order() {
        let lru = LruCache::new(4);
        assert_eq!(lru.capacity(), 4);
        assert_eq!(lru.peek_oldest(), Some(0));
        assert_eq!(lru.peek_newest(), Some(3));
        assert_eq!(lru.iter_oldest_first().collect::<Vec<_>>(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_touch_moves_to_newest() {
        let mut lru = LruCache::new(4);

        assert!(lru.touch(0));
        assert_eq!(lru.peek_oldest(), Some(1));
        assert_eq!(lru.peek_newest(), Some(0));

        assert!(lru.touch(2));
        assert_eq!(lru.iter_oldest_first().collect::<Vec<_>>(), vec![1, 3, 0, 2]);
    }

    #[test]
    fn test_touch_newest_is_noop() {
        let mut lru = LruCache::new(3);
        assert!(lru.touch(2));
        assert_eq!(lru.iter_oldest_first().collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[test]
    fn test_touch_unknown_id() {
        let mut lru = LruCache::new(2);
        assert!(!lru.touch(2));
        assert!(!lru.touch(u32::MAX));
        assert_eq!(lru.iter_oldest_first().collect::<Vec<_>>(), vec![0, 1]);
    }

    #[test]
    fn test_empty_cache() {
        let mut lru = LruCache::new(0);
        assert_eq!(lru.peek_oldest(), None);
        assert!(!lru.touch(0));
        assert_eq!(lru.iter_oldest_first().count(), 0);
    }

    #[test]
    fn test_single_entry() {
        let mut lru = LruCache::new(1);
        assert!(lru.touch(0));
        assert_eq!(lru.peek_oldest(), Some(0));
        assert_eq!(lru.peek_newest(), Some(0));
    }

    #[test]
    fn test_oldest_is_least_recently_touched() {
        // Touch every id in a scrambled order; the first one touched is the
        // one handed out next.
        let mut lru = LruCache::new(5);
        for id in [3, 1, 4, 0, 2] {
            lru.touch(id);
        }
        assert_eq!(lru.peek_oldest(), Some(3));

        lru.touch(3);
        assert_eq!(lru.peek_oldest(), Some(1));
    }

    #[test]
    fn test_list_stays_consistent() {
        let mut lru = LruCache::new(8);
        let sequence = [5, 5, 0, 7, 3, 0, 1, 7, 6, 2, 4, 5];
        for id in sequence {
            lru.touch(id);
        }

        let order: Vec<_> = lru.iter_oldest_first().collect();
        assert_eq!(order.len(), 8);
        assert_eq!(order, vec![3, 0, 1, 7, 6, 2, 4, 5]);
    }
}
