//! Idle connection deadlines.
//!
//! Deadlines are kept in an ordered set keyed by `(deadline, key)`, so the
//! soonest one is always first. A side map from key to deadline lets a
//! connection find and move its own entry.
use std::collections::{BTreeSet, HashMap};
use std::hash::Hash;
use std::time::Instant;

use log::trace;

#[derive(Debug)]
pub struct ExpiryList<K> {
    order: BTreeSet<(Instant, K)>,
    deadlines: HashMap<K, Instant>,
}

impl<K> Default for ExpiryList<K> {
    fn default() -> Self {
        Self {
            order: BTreeSet::new(),
            deadlines: HashMap::new(),
        }
    }
}

impl<K: Copy + Ord + Hash + std::fmt::Debug> ExpiryList<K> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a timer for `key`. A key has at most one timer, so an existing
    /// one is replaced.
    pub fn insert(&mut self, key: K, deadline: Instant) {
        if let Some(old) = self.deadlines.insert(key, deadline) {
            self.order.remove(&(old, key));
        }
        self.order.insert((deadline, key));
    }

    /// Move the timer for `key` to a new deadline. Returns false if there
    /// was no timer to move.
    pub fn reschedule(&mut self, key: K, deadline: Instant) -> bool {
        if !self.deadlines.contains_key(&key) {
            return false;
        }
        self.insert(key, deadline);
        true
    }

    /// Drop the timer for `key` without firing it.
    pub fn remove(&mut self, key: K) -> bool {
        match self.deadlines.remove(&key) {
            Some(deadline) => {
                self.order.remove(&(deadline, key));
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    fn deadline(&self, key: K) -> Option<Instant> {
        self.deadlines.get(&key).copied()
    }

    /// Remove and return every key whose deadline is at or before `now`,
    /// soonest first.
    ///
    /// Stops at the first deadline still in the future. Nothing past it is
    /// looked at.
    pub fn tick(&mut self, now: Instant) -> Vec<K> {
        let mut expired = Vec::new();
        while let Some(&(deadline, key)) = self.order.first() {
            if deadline > now {
                break;
            }
            self.order.pop_first();
            self.deadlines.remove(&key);
            expired.push(key);
        }
        if !expired.is_empty() {
            trace!("Expired {expired:?}, {} left", self.order.len());
        }
        expired
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Keys in deadline order.
    #[cfg(test)]
    fn iter(&self) -> impl Iterator<Item = (Instant, K)> + '_ {
        self.order.iter().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn secs(base: Instant, n: u64) -> Instant {
        base + Duration::from_secs(n)
    }

    fn assert_sorted(l: &ExpiryList<i32>) {
        let v: Vec<_> = l.iter().collect();
        assert!(v.windows(2).all(|w| w[0].0 <= w[1].0), "{v:?}");
        assert_eq!(v.len(), l.deadlines.len());
    }

    #[test]
    fn stays_sorted() {
        let base = Instant::now();
        let mut l = ExpiryList::new();
        for (k, s) in [(5, 50), (1, 10), (3, 30), (2, 10), (4, 40)] {
            l.insert(k, secs(base, s));
            assert_sorted(&l);
        }
        let keys: Vec<_> = l.iter().map(|(_, k)| k).collect();
        assert_eq!(keys, [1, 2, 3, 4, 5]);

        assert!(l.reschedule(1, secs(base, 45)));
        assert!(!l.reschedule(9, secs(base, 1)));
        assert!(l.remove(3));
        assert!(!l.remove(3));
        assert_sorted(&l);
        let keys: Vec<_> = l.iter().map(|(_, k)| k).collect();
        assert_eq!(keys, [2, 4, 1, 5]);
    }

    #[test]
    fn insert_replaces() {
        let base = Instant::now();
        let mut l = ExpiryList::new();
        l.insert(7, secs(base, 10));
        l.insert(7, secs(base, 20));
        assert_eq!(l.len(), 1);
        assert_eq!(l.deadline(7), Some(secs(base, 20)));
    }

    #[test]
    fn tick_takes_expired_prefix() {
        let base = Instant::now();
        let mut l = ExpiryList::new();
        for k in 0..10 {
            l.insert(k, secs(base, u64::try_from(k).unwrap()));
        }
        assert!(l.tick(base - Duration::from_secs(1)).is_empty());
        assert_eq!(l.tick(secs(base, 3)), [0, 1, 2, 3]);
        assert_eq!(l.len(), 6);
        assert_eq!(l.deadline(4), Some(secs(base, 4)));
        assert_eq!(l.deadline(2), None);
        assert_sorted(&l);

        // Equal deadlines expire together.
        l.insert(20, secs(base, 5));
        assert_eq!(l.tick(secs(base, 5)), [4, 5, 20]);
        assert_eq!(l.tick(secs(base, 100)), [6, 7, 8, 9]);
        assert!(l.is_empty());
    }

    #[test]
    fn activity_postpones_expiry() {
        let base = Instant::now();
        let mut l = ExpiryList::new();
        l.insert(1, secs(base, 15));
        l.insert(2, secs(base, 15));
        l.reschedule(1, secs(base, 30));
        assert_eq!(l.tick(secs(base, 20)), [2]);
        assert_eq!(l.tick(secs(base, 30)), [1]);
    }
}
