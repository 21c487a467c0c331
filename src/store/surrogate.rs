//! Surrogate ID interning for in-process stores.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

/// Bidirectional key <-> surrogate ID table.
///
/// IDs start at 1, increase monotonically and are never handed out twice,
/// including after raw inserts with explicit IDs.
#[derive(Debug, Clone)]
pub struct Interner<K> {
    by_key: HashMap<K, i64>,
    by_id: BTreeMap<i64, K>,
    next: i64,
}

impl<K: Eq + Hash + Clone> Interner<K> {
    pub fn new() -> Self {
        Self {
            by_key: HashMap::new(),
            by_id: BTreeMap::new(),
            next: 1,
        }
    }

    /// ID for `key`, allocating one if unseen.
    pub fn intern(&mut self, key: &K) -> i64 {
        if let Some(id) = self.by_key.get(key) {
            return *id;
        }
        let id = self.next;
        self.next += 1;
        self.by_key.insert(key.clone(), id);
        self.by_id.insert(id, key.clone());
        id
    }

    pub fn get(&self, key: &K) -> Option<i64> {
        self.by_key.get(key).copied()
    }

    pub fn key_of(&self, id: i64) -> Option<&K> {
        self.by_id.get(&id)
    }

    /// Insert with an explicit ID, as when restoring a dump.
    ///
    /// A known key keeps its existing ID. A key whose requested ID is
    /// taken by another key gets a freshly allocated ID. Returns the ID the
    /// key ends up with.
    pub fn insert_raw(&mut self, id: i64, key: &K) -> i64 {
        if let Some(existing) = self.by_key.get(key) {
            return *existing;
        }
        if id < 1 || self.by_id.contains_key(&id) {
            return self.intern(key);
        }
        self.by_key.insert(key.clone(), id);
        self.by_id.insert(id, key.clone());
        self.next = self.next.max(id + 1);
        id
    }

    /// Rows ordered by ID, skipping `offset` and returning at most `size`.
    pub fn page(&self, offset: u64, size: usize) -> Vec<(i64, K)> {
        let skip = usize::try_from(offset).unwrap_or(usize::MAX);
        self.by_id
            .iter()
            .skip(skip)
            .take(size)
            .map(|(id, key)| (*id, key.clone()))
            .collect()
    }

    /// Drop every row. IDs already handed out are not reused.
    pub fn clear(&mut self) {
        self.by_key.clear();
        self.by_id.clear();
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

impl<K: Eq + Hash + Clone> Default for Interner<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_is_stable() {
        let mut interner = Interner::new();
        let a = interner.intern(&"1.1.1.1".to_string());
        let b = interner.intern(&"2.2.2.2".to_string());
        assert_eq!(a, 1);
        assert_eq!(b, 2);
        assert_eq!(interner.intern(&"1.1.1.1".to_string()), a);
        assert_eq!(interner.len(), 2);
        assert_eq!(interner.key_of(b).map(String::as_str), Some("2.2.2.2"));
    }

    #[test]
    fn test_insert_raw_advances_counter() {
        let mut interner = Interner::new();
        assert_eq!(interner.insert_raw(10, &"a"), 10);
        assert_eq!(interner.intern(&"b"), 11);
    }

    #[test]
    fn test_insert_raw_conflicts() {
        let mut interner = Interner::new();
        interner.insert_raw(5, &"a");

        // Known key keeps its ID
        assert_eq!(interner.insert_raw(9, &"a"), 5);
        // Taken ID gets reassigned
        let id = interner.insert_raw(5, &"b");
        assert_ne!(id, 5);
        assert_eq!(interner.get(&"b"), Some(id));
    }

    #[test]
    fn test_clear_does_not_reuse_ids() {
        let mut interner = Interner::new();
        interner.intern(&"a");
        interner.intern(&"b");
        interner.clear();
        assert!(interner.is_empty());
        assert_eq!(interner.intern(&"c"), 3);
    }

    #[test]
    fn test_page() {
        let mut interner = Interner::new();
        for key in ["a", "b", "c", "d", "e"] {
            interner.intern(&key);
        }
        let page: Vec<&str> = interner.page(1, 2).into_iter().map(|(_, k)| k).collect();
        assert_eq!(page, vec!["b", "c"]);
        assert!(interner.page(5, 2).is_empty());
    }
}
