//! Coarse shared/exclusive set (CGL-BBST baseline): an ordered container
//! behind a single readers-writer lock. Linearizable by construction; the
//! simplest possible reference point for the lock-free cores below.

use parking_lot::RwLock;
use std::collections::BTreeSet;

use crate::set::ConcurrentSet;

/// A `BTreeSet<K>` guarded by one `RwLock`.
///
/// `contains` takes the lock in shared mode; `insert` and `remove` take it
/// exclusively. There is no finer-grained concurrency here at all — this
/// variant exists purely as the baseline every other component is measured
/// against.
pub struct CoarseLockedSet<K> {
    tree: RwLock<BTreeSet<K>>,
}

impl<K> Drop for CoarseLockedSet<K> {
    fn drop(&mut self) {
        tracing::debug!("destroying CoarseLockedSet");
    }
}

impl<K: Ord> ConcurrentSet<K> for CoarseLockedSet<K>
where
    K: Send + Sync,
{
    fn new() -> Self {
        tracing::debug!("constructing CoarseLockedSet");
        Self {
            tree: RwLock::new(BTreeSet::new()),
        }
    }

    fn contains(&self, key: &K) -> bool {
        self.tree.read().contains(key)
    }

    fn insert(&self, key: K) -> bool {
        self.tree.write().insert(key)
    }

    fn remove(&self, key: &K) -> bool {
        self.tree.write().remove(key)
    }
}

#[cfg(test)]
mod tests {
    use super::CoarseLockedSet;
    use crate::set::tests;

    #[test]
    fn sanity() {
        tests::sanity::<CoarseLockedSet<i32>>();
    }

    #[test]
    fn insert_insert_race() {
        tests::insert_insert_race::<CoarseLockedSet<i32>>();
    }

    #[test]
    fn delete_delete_race() {
        tests::delete_delete_race::<CoarseLockedSet<i32>>();
    }

    #[test]
    fn mixed_race() {
        tests::mixed_race::<CoarseLockedSet<i32>>();
    }
}
