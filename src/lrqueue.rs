//! Recency index over destinations with pending data.
//!
//! An array-backed doubly-linked queue between two sentinels. Keys are
//! destination indices; an entry is present iff that destination's buffer
//! holds unflushed data. All operations are O(1).
//!
//! NB: `update_or_insert` does NOT refresh the priority of a key that is
//! already present. Re-touching a destination keeps its original insertion
//! timestamp, so the head is always ordered by first-touch. Flush ordering
//! depends on this; do not "fix" it.

/// Sentinel priority reported for an empty queue.
pub const EMPTY_PRIORITY: i64 = 0;

#[derive(Debug, Clone, Copy)]
struct Entry {
    prev: usize,
    next: usize,
    priority: i64,
    present: bool,
}

/// Array-backed recency queue keyed by destination index.
#[derive(Debug)]
pub struct LrQueue {
    /// `entries[0..n]` are keys; `entries[n]` is the oldest sentinel and
    /// `entries[n + 1]` the newest sentinel.
    entries: Vec<Entry>,
    len: usize,
}

impl LrQueue {
    /// Create a queue able to hold keys `0..keys`.
    pub fn new(keys: usize) -> Self {
        let oldest = keys;
        let newest = keys + 1;
        let mut entries = vec![
            Entry { prev: usize::MAX, next: usize::MAX, priority: 0, present: false };
            keys + 2
        ];
        entries[oldest].next = newest;
        entries[newest].prev = oldest;
        Self { entries, len: 0 }
    }

    #[inline]
    fn oldest(&self) -> usize {
        self.entries.len() - 2
    }

    #[inline]
    fn newest(&self) -> usize {
        self.entries.len() - 1
    }

    #[inline]
    pub fn empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn contains(&self, key: usize) -> bool {
        self.entries[key].present
    }

    /// Insert `key` at the newest end if absent; no-op when present.
    ///
    /// The priority of an already-present key is deliberately left alone
    /// (see module docs).
    pub fn update_or_insert(&mut self, key: usize, priority: i64) {
        debug_assert!(key < self.oldest(), "key {} out of range", key);
        if self.entries[key].present {
            return;
        }
        let newest = self.newest();
        let tail = self.entries[newest].prev;
        self.entries[key] = Entry { prev: tail, next: newest, priority, present: true };
        self.entries[tail].next = key;
        self.entries[newest].prev = key;
        self.len += 1;
    }

    /// Unlink `key`; no-op if absent.
    pub fn remove_key(&mut self, key: usize) {
        if !self.entries[key].present {
            return;
        }
        let Entry { prev, next, .. } = self.entries[key];
        self.entries[prev].next = next;
        self.entries[next].prev = prev;
        self.entries[key].present = false;
        self.len -= 1;
    }

    /// Oldest (first-touched) key, without removing it.
    pub fn top_key(&self) -> Option<usize> {
        let head = self.entries[self.oldest()].next;
        if head == self.newest() {
            None
        } else {
            Some(head)
        }
    }

    /// Priority of the oldest key, or [`EMPTY_PRIORITY`] when empty.
    pub fn top_priority(&self) -> i64 {
        match self.top_key() {
            Some(key) => self.entries[key].priority,
            None => EMPTY_PRIORITY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(q: &mut LrQueue) -> Vec<usize> {
        let mut keys = Vec::new();
        while let Some(k) = q.top_key() {
            keys.push(k);
            q.remove_key(k);
        }
        keys
    }

    #[test]
    fn test_empty_queue() {
        let q = LrQueue::new(4);
        assert!(q.empty());
        assert_eq!(q.top_key(), None);
        assert_eq!(q.top_priority(), EMPTY_PRIORITY);
    }

    #[test]
    fn test_first_touch_order() {
        let mut q = LrQueue::new(8);
        q.update_or_insert(3, -100);
        q.update_or_insert(1, -105);
        q.update_or_insert(6, -110);
        assert_eq!(q.len(), 3);
        assert_eq!(drain(&mut q), vec![3, 1, 6]);
    }

    #[test]
    fn test_reinsert_does_not_refresh_priority() {
        // The documented quirk: the second touch is a no-op.
        let mut q = LrQueue::new(4);
        q.update_or_insert(2, -100);
        q.update_or_insert(2, -999);
        assert_eq!(q.len(), 1);
        assert_eq!(q.top_priority(), -100);
    }

    #[test]
    fn test_reinsert_keeps_position() {
        let mut q = LrQueue::new(4);
        q.update_or_insert(0, -1);
        q.update_or_insert(1, -2);
        q.update_or_insert(0, -3);
        assert_eq!(drain(&mut q), vec![0, 1]);
    }

    #[test]
    fn test_remove_then_insert_refreshes() {
        let mut q = LrQueue::new(4);
        q.update_or_insert(2, -100);
        q.remove_key(2);
        q.update_or_insert(2, -200);
        assert_eq!(q.top_priority(), -200);
    }

    #[test]
    fn test_remove_middle() {
        let mut q = LrQueue::new(4);
        q.update_or_insert(0, -1);
        q.update_or_insert(1, -2);
        q.update_or_insert(2, -3);
        q.remove_key(1);
        assert_eq!(drain(&mut q), vec![0, 2]);
    }

    #[test]
    fn test_remove_absent_is_noop() {
        let mut q = LrQueue::new(4);
        q.update_or_insert(0, -1);
        q.remove_key(3);
        assert_eq!(q.len(), 1);
    }
}
