//! Lock-free external-leaf BST (Natarajan–Mittal): every key lives at a
//! leaf; internal nodes are routing copies holding the maximum key of their
//! left subtree. A removal is a two-phase protocol — flag the (parent, leaf)
//! edge, then physically unlink it — so a concurrent seek can never observe
//! a leaf half-removed. `ancestor`/`successor` track the nearest untagged
//! edge above the search path so an arbitrarily long run of concurrently
//! flagged edges is still unlinked in one CAS.

use std::cmp::Ordering;
use std::sync::atomic::Ordering as AtomicOrdering;

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};

use crate::set::ConcurrentSet;

bitflags::bitflags! {
    /// A pending removal flags the (parent, target) edge and tags the
    /// (parent, sibling) edge, exactly as in the paper.
    struct Marks: usize {
        const TAG  = 0b01;
        const FLAG = 0b10;
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
enum Key<K> {
    Fin(K),
    Inf,
}

impl<K: Ord> Key<K> {
    fn cmp_to(&self, rhs: &K) -> Ordering {
        match self {
            Key::Fin(k) => k.cmp(rhs),
            Key::Inf => Ordering::Greater,
        }
    }

    fn cmp_keys(&self, rhs: &Self) -> Ordering {
        match (self, rhs) {
            (Key::Fin(a), Key::Fin(b)) => a.cmp(b),
            (Key::Fin(_), Key::Inf) => Ordering::Less,
            (Key::Inf, Key::Fin(_)) => Ordering::Greater,
            (Key::Inf, Key::Inf) => Ordering::Equal,
        }
    }
}

struct Node<K> {
    key: Key<K>,
    left: Atomic<Node<K>>,
    right: Atomic<Node<K>>,
}

impl<K> Node<K> {
    fn new_leaf(key: Key<K>) -> Self {
        Self {
            key,
            left: Atomic::null(),
            right: Atomic::null(),
        }
    }

    fn new_internal<'g>(key: Key<K>, left: Shared<'g, Node<K>>, right: Shared<'g, Node<K>>) -> Self {
        Self {
            key,
            left: Atomic::from(left),
            right: Atomic::from(right),
        }
    }
}

/// Retry counts past this many iterations get one diagnostic trace line.
/// Purely informational: it has no bearing on what the caller observes.
const RETRY_LOG_THRESHOLD: u32 = 64;

struct SeekRecord<'g, K> {
    ancestor: Shared<'g, Node<K>>,
    successor: Shared<'g, Node<K>>,
    parent: Shared<'g, Node<K>>,
    leaf: Shared<'g, Node<K>>,
}

/// A lock-free ordered set built from the Natarajan–Mittal external tree.
pub struct NatarajanMittalSet<K> {
    root: Atomic<Node<K>>,
}

impl<K: Ord + Clone + Send + Sync + 'static> NatarajanMittalSet<K> {
    fn seek<'g>(&self, key: &K, guard: &'g Guard) -> SeekRecord<'g, K> {
        let root = self.root.load(AtomicOrdering::Acquire, guard);
        let mut ancestor = root;
        let mut successor = unsafe { root.deref() }.left.load(AtomicOrdering::Acquire, guard);
        let mut parent = successor;
        let mut leaf = unsafe { successor.deref() }
            .left
            .load(AtomicOrdering::Acquire, guard)
            .with_tag(0);

        // Raw snapshots of the edges just walked, tag bits included, so a
        // concurrent remove's marks are visible without re-reading.
        let mut parent_field = unsafe { parent.deref() }.left.load(AtomicOrdering::Acquire, guard);
        let mut current_field = unsafe { leaf.deref() }.left.load(AtomicOrdering::Acquire, guard);

        loop {
            let current = current_field.with_tag(0);
            if current.is_null() {
                break;
            }
            if !Marks::from_bits_truncate(parent_field.tag()).contains(Marks::TAG) {
                ancestor = parent;
                successor = leaf;
            }
            parent = leaf;
            leaf = current;
            parent_field = current_field;

            current_field = if unsafe { current.deref() }.key.cmp_to(key) == Ordering::Greater {
                unsafe { current.deref() }.left.load(AtomicOrdering::Acquire, guard)
            } else {
                unsafe { current.deref() }.right.load(AtomicOrdering::Acquire, guard)
            };
        }

        SeekRecord {
            ancestor,
            successor,
            parent,
            leaf,
        }
    }

    /// Physically unlinks the flagged leaf named by `s`, promoting its
    /// sibling into `s.ancestor`. Returns whether this call won the race to
    /// do so; the winner retires the orphaned successor node and the leaf.
    fn cleanup(&self, key: &K, s: &SeekRecord<K>, guard: &Guard) -> bool {
        let successor_addr = if unsafe { s.ancestor.deref() }.key.cmp_to(key) == Ordering::Greater {
            unsafe { &s.ancestor.deref().left }
        } else {
            unsafe { &s.ancestor.deref().right }
        };

        let (default_child_addr, default_sibling_addr) =
            if unsafe { s.parent.deref() }.key.cmp_to(key) == Ordering::Greater {
                (
                    unsafe { &s.parent.deref().left },
                    unsafe { &s.parent.deref().right },
                )
            } else {
                (
                    unsafe { &s.parent.deref().right },
                    unsafe { &s.parent.deref().left },
                )
            };

        let child_loaded = default_child_addr.load(AtomicOrdering::Acquire, guard);
        let sibling_addr = if Marks::from_bits_truncate(child_loaded.tag()).contains(Marks::FLAG) {
            default_sibling_addr
        } else {
            default_child_addr
        };

        let prev = sibling_addr.fetch_or(Marks::TAG.bits(), AtomicOrdering::AcqRel, guard);
        let sibling_data = prev.with_tag(prev.tag() & !Marks::TAG.bits());

        let expected = s.successor.with_tag(0);
        let won = successor_addr
            .compare_exchange(
                expected,
                sibling_data,
                AtomicOrdering::AcqRel,
                AtomicOrdering::Acquire,
                guard,
            )
            .is_ok();

        if won {
            unsafe {
                guard.defer_destroy(expected);
                guard.defer_destroy(s.leaf.with_tag(0));
            }
        }
        won
    }

    fn insert_inner(&self, key: K, guard: &Guard) -> bool
    where
        K: Clone,
    {
        let new_leaf = Owned::new(Node::new_leaf(Key::Fin(key.clone()))).into_shared(guard);

        let mut retries: u32 = 0;
        loop {
            retries += 1;
            if retries == RETRY_LOG_THRESHOLD {
                tracing::trace!(retries, "insert retry loop exceeded threshold");
            }
            let s = self.seek(&key, guard);
            let leaf = s.leaf;
            if unsafe { leaf.deref() }.key.cmp_to(&key) == Ordering::Equal {
                unsafe { drop(new_leaf.into_owned()) };
                return false;
            }

            let parent = s.parent;
            let child_addr = if unsafe { parent.deref() }.key.cmp_to(&key) == Ordering::Greater {
                unsafe { &parent.deref().left }
            } else {
                unsafe { &parent.deref().right }
            };

            let existing = child_addr.load(AtomicOrdering::Acquire, guard);
            let other = existing.with_tag(0);
            let new_leaf_key = unsafe { new_leaf.deref() }.key.clone();
            let other_key = unsafe { other.deref() }.key.clone();

            let (left, right, internal_key) = if new_leaf_key.cmp_keys(&other_key) == Ordering::Greater
            {
                (other, new_leaf, new_leaf_key)
            } else {
                (new_leaf, other, other_key)
            };
            let new_internal =
                Owned::new(Node::new_internal(internal_key, left, right)).into_shared(guard);

            match child_addr.compare_exchange(
                existing,
                new_internal,
                AtomicOrdering::AcqRel,
                AtomicOrdering::Acquire,
                guard,
            ) {
                Ok(_) => return true,
                Err(_) => {
                    // Never published; safe to reclaim immediately.
                    unsafe { drop(new_internal.into_owned()) };
                    let current = child_addr.load(AtomicOrdering::Acquire, guard);
                    if current.with_tag(0) == leaf && current.tag() != 0 {
                        self.cleanup(&key, &s, guard);
                    }
                }
            }
        }
    }

    fn remove_inner(&self, key: &K, guard: &Guard) -> bool {
        enum Mode {
            Injection,
            Cleanup,
        }

        let mut mode = Mode::Injection;
        let mut target: Shared<Node<K>> = Shared::null();

        let mut retries: u32 = 0;
        loop {
            retries += 1;
            if retries == RETRY_LOG_THRESHOLD {
                tracing::trace!(retries, "remove retry loop exceeded threshold");
            }
            let s = self.seek(key, guard);
            let child_addr = if unsafe { s.parent.deref() }.key.cmp_to(key) == Ordering::Greater {
                unsafe { &s.parent.deref().left }
            } else {
                unsafe { &s.parent.deref().right }
            };

            match mode {
                Mode::Injection => {
                    target = s.leaf;
                    if unsafe { target.deref() }.key.cmp_to(key) != Ordering::Equal {
                        return false;
                    }

                    let desired = target.with_tag(Marks::FLAG.bits());
                    match child_addr.compare_exchange(
                        target,
                        desired,
                        AtomicOrdering::AcqRel,
                        AtomicOrdering::Acquire,
                        guard,
                    ) {
                        Ok(_) => {
                            mode = Mode::Cleanup;
                            if self.cleanup(key, &s, guard) {
                                return true;
                            }
                        }
                        Err(e) => {
                            let current = e.current;
                            if current.with_tag(0) == target && current.tag() != 0 {
                                self.cleanup(key, &s, guard);
                            }
                        }
                    }
                }
                Mode::Cleanup => {
                    if s.leaf != target || self.cleanup(key, &s, guard) {
                        return true;
                    }
                }
            }
        }
    }
}

impl<K> Drop for NatarajanMittalSet<K> {
    fn drop(&mut self) {
        tracing::debug!("destroying NatarajanMittalSet");
        // Exclusive access: no concurrent readers can be pinned against
        // this instance, so a plain post-order walk reclaims everything.
        unsafe {
            let guard = epoch::unprotected();
            let root = self.root.load(AtomicOrdering::Relaxed, guard);
            drop_subtree(root);
        }
    }
}

unsafe fn drop_subtree<K>(node: Shared<Node<K>>) {
    if node.is_null() {
        return;
    }
    let guard = epoch::unprotected();
    let owned = node.into_owned();
    let left = owned.left.load(AtomicOrdering::Relaxed, guard);
    let right = owned.right.load(AtomicOrdering::Relaxed, guard);
    drop_subtree(left);
    drop_subtree(right);
}

impl<K> ConcurrentSet<K> for NatarajanMittalSet<K>
where
    K: Ord + Clone + Send + Sync + 'static,
{
    fn new() -> Self {
        tracing::debug!("constructing NatarajanMittalSet");
        let guard = &epoch::pin();
        // Three dummy infinite-keyed leaves plus two routing internals so
        // every seek starts from a fixed, always-non-null root pair; no
        // special-casing an empty tree.
        let inf0 = Owned::new(Node::new_leaf(Key::Inf)).into_shared(guard);
        let inf1 = Owned::new(Node::new_leaf(Key::Inf)).into_shared(guard);
        let inf2 = Owned::new(Node::new_leaf(Key::Inf)).into_shared(guard);
        let s = Owned::new(Node::new_internal(Key::Inf, inf0, inf1)).into_shared(guard);
        let root = Node::new_internal(Key::Inf, s, inf2);
        Self {
            root: Atomic::new(root),
        }
    }

    fn contains(&self, key: &K) -> bool {
        let guard = &epoch::pin();
        let s = self.seek(key, guard);
        unsafe { s.leaf.deref() }.key.cmp_to(key) == Ordering::Equal
    }

    fn insert(&self, key: K) -> bool {
        let guard = &epoch::pin();
        self.insert_inner(key, guard)
    }

    fn remove(&self, key: &K) -> bool {
        let guard = &epoch::pin();
        self.remove_inner(key, guard)
    }
}

impl<K> NatarajanMittalSet<K> {
    /// Pins the current thread's epoch. Exposed only so the shared test
    /// harness can construct one guard per operation batch rather than
    /// paying `epoch::pin()`'s cost per call, mirroring the teacher's own
    /// `Guard`-threading convention; ordinary callers never need this.
    pub fn pin(&self) -> Guard {
        epoch::pin()
    }
}
