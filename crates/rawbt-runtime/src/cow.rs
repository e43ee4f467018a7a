//! Copy-on-write list
//!
//! Readers take an `Arc` snapshot and iterate without holding a lock, writers
//! clone the vector under the write lock and swap it in. A callback may
//! therefore mutate the list it is being dispatched from.

use std::sync::Arc;

use parking_lot::RwLock;

pub struct CowList<T> {
    inner: RwLock<Arc<Vec<T>>>,
}

impl<T> Default for CowList<T> {
    fn default() -> Self {
        Self {
            inner: RwLock::new(Arc::new(Vec::new())),
        }
    }
}

impl<T: Clone> CowList<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Arc<Vec<T>> {
        self.inner.read().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    pub fn push(&self, item: T) {
        let mut guard = self.inner.write();
        let mut next = Vec::with_capacity(guard.len() + 1);
        next.extend(guard.iter().cloned());
        next.push(item);
        *guard = Arc::new(next);
    }

    /// Append unless an equal element exists, returns whether it was added
    pub fn push_unique<F>(&self, item: T, same: F) -> bool
    where
        F: Fn(&T, &T) -> bool,
    {
        let mut guard = self.inner.write();
        if guard.iter().any(|e| same(e, &item)) {
            return false;
        }
        let mut next = Vec::with_capacity(guard.len() + 1);
        next.extend(guard.iter().cloned());
        next.push(item);
        *guard = Arc::new(next);
        true
    }

    pub fn find<F>(&self, pred: F) -> Option<T>
    where
        F: Fn(&T) -> bool,
    {
        self.inner.read().iter().find(|e| pred(e)).cloned()
    }

    pub fn contains<F>(&self, pred: F) -> bool
    where
        F: Fn(&T) -> bool,
    {
        self.inner.read().iter().any(pred)
    }

    /// Remove the first match, the check and the removal are one atomic step
    pub fn remove_first<F>(&self, pred: F) -> Option<T>
    where
        F: Fn(&T) -> bool,
    {
        let mut guard = self.inner.write();
        let pos = guard.iter().position(pred)?;
        let mut next: Vec<T> = guard.as_ref().clone();
        let removed = next.remove(pos);
        *guard = Arc::new(next);
        Some(removed)
    }

    /// Remove every match, returning how many went
    pub fn remove_all<F>(&self, pred: F) -> usize
    where
        F: Fn(&T) -> bool,
    {
        let mut guard = self.inner.write();
        let before = guard.len();
        let next: Vec<T> = guard.iter().filter(|e| !pred(e)).cloned().collect();
        let removed = before - next.len();
        if removed > 0 {
            *guard = Arc::new(next);
        }
        removed
    }

    pub fn clear(&self) -> usize {
        let mut guard = self.inner.write();
        let n = guard.len();
        *guard = Arc::new(Vec::new());
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_survives_mutation() {
        let list = CowList::new();
        list.push(1);
        list.push(2);
        let snap = list.snapshot();
        assert_eq!(list.remove_first(|v| *v == 1), Some(1));
        list.push(3);
        assert_eq!(snap.as_slice(), &[1, 2]);
        assert_eq!(list.snapshot().as_slice(), &[2, 3]);
    }

    #[test]
    fn unique_push_and_single_removal() {
        let list = CowList::new();
        assert!(list.push_unique(7, |a, b| a == b));
        assert!(!list.push_unique(7, |a, b| a == b));
        assert_eq!(list.remove_first(|v| *v == 7), Some(7));
        assert_eq!(list.remove_first(|v| *v == 7), None);
        assert!(list.is_empty());
    }

    #[test]
    fn remove_all_counts() {
        let list = CowList::new();
        for v in [1, 2, 1, 3] {
            list.push(v);
        }
        assert_eq!(list.remove_all(|v| *v == 1), 2);
        assert_eq!(list.len(), 2);
        assert_eq!(list.clear(), 2);
    }
}
