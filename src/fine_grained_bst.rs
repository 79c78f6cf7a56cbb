//! Fine-grained locking BST: an unbalanced internal BST in which every node
//! carries its own readers-writer lock, acquired hand-over-hand (the child's
//! lock is taken before the parent's is released) during every traversal.
//!
//! A dummy root pair is installed at construction, both holding a reserved
//! key strictly greater than any real key, so every operation begins by
//! locking a fixed non-null sentinel instead of special-casing an empty
//! root. Since the key type `K` is a generic `Ord` with no reserved value we
//! can claim, the sentinel is expressed as a closed sum type rather than a
//! magic numeric constant (see `Bound`).

use std::cmp::Ordering;
use std::sync::Arc;

use parking_lot::{RwLock, RwLockWriteGuard};

use crate::set::ConcurrentSet;

#[derive(Clone)]
enum Bound<K> {
    Real(K),
    PosInf,
}

impl<K: Ord> Bound<K> {
    fn cmp_key(&self, rhs: &K) -> Ordering {
        match self {
            Bound::Real(k) => k.cmp(rhs),
            Bound::PosInf => Ordering::Greater,
        }
    }
}

struct NodeInner<K> {
    left: Option<Arc<Node<K>>>,
    right: Option<Arc<Node<K>>>,
}

struct Node<K> {
    key: Bound<K>,
    inner: RwLock<NodeInner<K>>,
}

impl<K> Node<K> {
    fn leaf(key: Bound<K>) -> Arc<Self> {
        Arc::new(Self {
            key,
            inner: RwLock::new(NodeInner {
                left: None,
                right: None,
            }),
        })
    }
}

/// An unbalanced internal BST with a `RwLock` per node, traversed hand-over-hand.
pub struct FineGrainedBst<K> {
    root: Arc<Node<K>>,
}

impl<K> Drop for FineGrainedBst<K> {
    fn drop(&mut self) {
        tracing::debug!("destroying FineGrainedBst");
    }
}

impl<K: Ord> FineGrainedBst<K> {
    fn contains_from(node: &Node<K>, key: &K) -> bool {
        match node.key.cmp_key(key) {
            Ordering::Equal => true,
            Ordering::Less => {
                let guard = node.inner.read();
                match &guard.right {
                    // `child` is kept alive by the tree itself; the guard
                    // stays locked across the recursive call, so the
                    // child's own lock is always acquired before this
                    // node's lock is released.
                    Some(child) => Self::contains_from(child, key),
                    None => false,
                }
            }
            Ordering::Greater => {
                let guard = node.inner.read();
                match &guard.left {
                    Some(child) => Self::contains_from(child, key),
                    None => false,
                }
            }
        }
    }

    /// Returns `true` iff `key` was freshly inserted.
    fn insert_from(node: &Node<K>, key: K) -> bool
    where
        K: Clone,
    {
        match node.key.cmp_key(&key) {
            Ordering::Equal => false,
            Ordering::Less => {
                let mut guard = node.inner.write();
                if let Some(child) = guard.right.clone() {
                    Self::insert_from(&child, key)
                } else {
                    guard.right = Some(Node::leaf(Bound::Real(key)));
                    true
                }
            }
            Ordering::Greater => {
                let mut guard = node.inner.write();
                if let Some(child) = guard.left.clone() {
                    Self::insert_from(&child, key)
                } else {
                    guard.left = Some(Node::leaf(Bound::Real(key)));
                    true
                }
            }
        }
    }

    /// Removes `key` from the subtree rooted at `node`, whose incoming edge
    /// (`side`) is owned by the already write-locked `parent_guard`. Returns
    /// whether a key was actually removed.
    ///
    /// `node`'s own lock is always acquired before `parent_guard` is
    /// dropped, so the traversal never has a gap in which `node` could be
    /// spliced out from under it by a concurrent remove reaching the same
    /// spot from above — the same hand-over-hand discipline `insert_from`
    /// and `contains_from` already follow.
    fn remove_from<'p>(
        node: &Arc<Node<K>>,
        key: &K,
        mut parent_guard: RwLockWriteGuard<'p, NodeInner<K>>,
        side: Side,
    ) -> bool
    where
        K: Clone,
    {
        let node_guard = node.inner.write();
        match node.key.cmp_key(key) {
            Ordering::Less => match node_guard.right.clone() {
                Some(child) => {
                    drop(parent_guard);
                    Self::remove_from(&child, key, node_guard, Side::Right)
                }
                None => false,
            },
            Ordering::Greater => match node_guard.left.clone() {
                Some(child) => {
                    drop(parent_guard);
                    Self::remove_from(&child, key, node_guard, Side::Left)
                }
                None => false,
            },
            Ordering::Equal => {
                let left = node_guard.left.clone();
                let right = node_guard.right.clone();
                let replacement = match (left, right) {
                    (None, right) => right,
                    (Some(left), None) => Some(left),
                    (Some(left), Some(right)) => {
                        // `node` itself stays locked via `node_guard` for the
                        // whole splice, so nothing else can reach into
                        // `left`'s subtree meanwhile; `remove_max` still
                        // hands its own child's lock over before releasing
                        // each ancestor's, matching the rest of this module.
                        let left_guard = left.inner.write();
                        let (pred_key, new_left) = Self::remove_max(left, left_guard);
                        Some(Node::leaf_with_children(Bound::Real(pred_key), new_left, Some(right)))
                    }
                };
                drop(node_guard);
                match side {
                    Side::Left => parent_guard.left = replacement,
                    Side::Right => parent_guard.right = replacement,
                }
                true
            }
        }
    }

    /// Unlinks and returns the key of the maximum (rightmost) node reachable
    /// from `node`, whose own write lock `guard` is already held. Returns the
    /// removed key together with the subtree that should take `node`'s
    /// former place in whatever slot referenced it — `node`'s own left
    /// child, since a maximum node never has a right child.
    fn remove_max(node: Arc<Node<K>>, guard: RwLockWriteGuard<'_, NodeInner<K>>) -> (K, Option<Arc<Node<K>>>)
    where
        K: Clone,
    {
        match guard.right.clone() {
            Some(child) => {
                let child_guard = child.inner.write();
                drop(guard);
                let (max_key, new_right) = Self::remove_max(child, child_guard);
                let mut guard = node.inner.write();
                guard.right = new_right;
                drop(guard);
                (max_key, Some(node))
            }
            None => {
                let new_left = guard.left.clone();
                drop(guard);
                let key = match &node.key {
                    Bound::Real(k) => k.clone(),
                    Bound::PosInf => unreachable!("sentinel cannot be a real predecessor"),
                };
                (key, new_left)
            }
        }
    }
}

enum Side {
    Left,
    Right,
}

impl<K> Node<K> {
    fn leaf_with_children(
        key: Bound<K>,
        left: Option<Arc<Node<K>>>,
        right: Option<Arc<Node<K>>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            key,
            inner: RwLock::new(NodeInner { left, right }),
        })
    }
}

impl<K: Ord + Clone> ConcurrentSet<K> for FineGrainedBst<K>
where
    K: Send + Sync,
{
    fn new() -> Self {
        tracing::debug!("constructing FineGrainedBst");
        Self {
            root: Node::leaf_with_children(Bound::PosInf, Some(Node::leaf(Bound::PosInf)), None),
        }
    }

    fn contains(&self, key: &K) -> bool {
        let guard = self.root.inner.read();
        match &guard.left {
            Some(child) => Self::contains_from(child, key),
            None => false,
        }
    }

    fn insert(&self, key: K) -> bool {
        let mut guard = self.root.inner.write();
        if let Some(child) = guard.left.clone() {
            Self::insert_from(&child, key)
        } else {
            guard.left = Some(Node::leaf(Bound::Real(key)));
            true
        }
    }

    fn remove(&self, key: &K) -> bool {
        let guard = self.root.inner.write();
        let Some(child) = guard.left.clone() else {
            return false;
        };
        Self::remove_from(&child, key, guard, Side::Left)
    }
}

#[cfg(test)]
mod tests {
    use super::FineGrainedBst;
    use crate::set::tests;
    use crate::set::ConcurrentSet;

    #[test]
    fn sanity() {
        tests::sanity::<FineGrainedBst<i32>>();
    }

    #[test]
    fn insert_insert_race() {
        tests::insert_insert_race::<FineGrainedBst<i32>>();
    }

    #[test]
    fn delete_delete_race() {
        tests::delete_delete_race::<FineGrainedBst<i32>>();
    }

    #[test]
    fn mixed_race() {
        tests::mixed_race::<FineGrainedBst<i32>>();
    }

    #[test]
    fn structural_delete_two_children() {
        let set = FineGrainedBst::new();
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
