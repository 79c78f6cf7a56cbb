//! Coarse-locked internal BST (CGL-BST baseline): a hand-written unbalanced
//! internal BST protected by one readers-writer lock. Deletion of a two-child
//! node is resolved via the in-order predecessor.

use parking_lot::RwLock;

use crate::set::ConcurrentSet;

struct Node<K> {
    key: K,
    left: Option<Box<Node<K>>>,
    right: Option<Box<Node<K>>>,
}

impl<K: Ord> Node<K> {
    fn new(key: K) -> Self {
        Self {
            key,
            left: None,
            right: None,
        }
    }

    fn contains(&self, key: &K) -> bool {
        match key.cmp(&self.key) {
            std::cmp::Ordering::Equal => true,
            std::cmp::Ordering::Less => self.left.as_deref().map_or(false, |n| n.contains(key)),
            std::cmp::Ordering::Greater => self.right.as_deref().map_or(false, |n| n.contains(key)),
        }
    }

    /// Returns `true` iff `key` was newly inserted.
    fn insert(&mut self, key: K) -> bool {
        match key.cmp(&self.key) {
            std::cmp::Ordering::Equal => false,
            std::cmp::Ordering::Less => match &mut self.left {
                Some(n) => n.insert(key),
                None => {
                    self.left = Some(Box::new(Node::new(key)));
                    true
                }
            },
            std::cmp::Ordering::Greater => match &mut self.right {
                Some(n) => n.insert(key),
                None => {
                    self.right = Some(Box::new(Node::new(key)));
                    true
                }
            },
        }
    }

    /// Removes the maximum-keyed node of this subtree, returning its key
    /// and the resulting (possibly unchanged) subtree.
    fn remove_max(mut self: Box<Self>) -> (K, Option<Box<Node<K>>>) {
        match self.right.take() {
            Some(right) => {
                let (max_key, new_right) = right.remove_max();
                self.right = new_right;
                (max_key, Some(self))
            }
            None => (self.key, self.left.take()),
        }
    }
}

/// Removes `key` from the subtree rooted at `*slot`, if present. Returns
/// whether a key was actually removed.
fn remove_from<K: Ord>(slot: &mut Option<Box<Node<K>>>, key: &K) -> bool {
    let Some(node) = slot else { return false };
    match key.cmp(&node.key) {
        std::cmp::Ordering::Less => remove_from(&mut node.left, key),
        std::cmp::Ordering::Greater => remove_from(&mut node.right, key),
        std::cmp::Ordering::Equal => {
            let node = slot.take().unwrap();
            *slot = match (node.left, node.right) {
                (None, right) => right,
                (left, None) => left,
                (Some(left), Some(right)) => {
                    let (pred_key, new_left) = left.remove_max();
                    Some(Box::new(Node {
                        key: pred_key,
                        left: new_left,
                        right: Some(right),
                    }))
                }
            };
            true
        }
    }
}

/// A hand-written unbalanced internal BST under one `RwLock`.
pub struct CoarseLockedBst<K> {
    root: RwLock<Option<Box<Node<K>>>>,
}

impl<K> Drop for CoarseLockedBst<K> {
    fn drop(&mut self) {
        tracing::debug!("destroying CoarseLockedBst");
    }
}

impl<K: Ord> ConcurrentSet<K> for CoarseLockedBst<K>
where
    K: Send + Sync,
{
    fn new() -> Self {
        tracing::debug!("constructing CoarseLockedBst");
        Self {
            root: RwLock::new(None),
        }
    }

    fn contains(&self, key: &K) -> bool {
        self.root.read().as_deref().map_or(false, |n| n.contains(key))
    }

    fn insert(&self, key: K) -> bool {
        let mut root = self.root.write();
        match &mut *root {
            None => {
                *root = Some(Box::new(Node::new(key)));
                true
            }
            Some(n) => n.insert(key),
        }
    }

    fn remove(&self, key: &K) -> bool {
        remove_from(&mut self.root.write(), key)
    }
}

#[cfg(test)]
mod tests {
    use super::CoarseLockedBst;
    use crate::set::tests;
    use crate::set::ConcurrentSet;

    #[test]
    fn sanity() {
        tests::sanity::<CoarseLockedBst<i32>>();
    }

    #[test]
    fn insert_insert_race() {
        tests::insert_insert_race::<CoarseLockedBst<i32>>();
    }

    #[test]
    fn delete_delete_race() {
        tests::delete_delete_race::<CoarseLockedBst<i32>>();
    }

    #[test]
    fn mixed_race() {
        tests::mixed_race::<CoarseLockedBst<i32>>();
    }

    /// Seed scenario 2: structural delete on a two-child node.
    #[test]
    fn structural_delete_two_children() {
        let set = CoarseLockedBst::new();
        for k in [4, 2, 1, 3, 6, 5, 7] {
            assert!(set.insert(k));
        }
        assert!(set.remove(&4));
        assert!(!set.contains(&4));
        for k in [1, 2, 3, 5, 6, 7] {
            assert!(set.contains(&k));
        }
    }
}
