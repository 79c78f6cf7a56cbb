//! Integration suite: the seed scenarios of the testable-properties section,
//! run once per `ConcurrentSet` implementation via one macro so a new variant
//! inherits full coverage just by adding itself to the invocation list below.
//!
//! Self-contained rather than reusing the crate's internal `set::tests`
//! module: that module is `#[cfg(test)]`-gated and so isn't linkable from an
//! external integration test binary, which always builds the library without
//! `cfg(test)`.

use conc_bst_study::{
    CoarseLockedBst, CoarseLockedSet, ConcurrentSet, FineGrainedBst, NatarajanMittalSet, SinghBst,
};
use crossbeam_utils::thread;
use rand::prelude::*;

fn sanity<S: ConcurrentSet<i32>>() {
    let set = S::new();
    for k in 0..100 {
        assert!(!set.contains(&k), "key {k} present before insertion");
        assert!(set.insert(k), "first insert of {k} should succeed");
        assert!(set.contains(&k), "key {k} missing right after insertion");
    }
    assert!(!set.insert(0), "duplicate insert of 0 should fail");
}

fn structural_delete_two_children<S: ConcurrentSet<i32>>() {
    let set = S::new();
    for k in [4, 2, 1, 3, 6, 5, 7] {
        assert!(set.insert(k));
    }
    assert!(set.remove(&4));
    assert!(!set.contains(&4));
    for k in [1, 2, 3, 5, 6, 7] {
        assert!(set.contains(&k));
    }
}

fn insert_insert_race<S: ConcurrentSet<i32>>() {
    const THREADS: i32 = 10;
    const PER_THREAD: i32 = 1000;
    let set = &S::new();

    thread::scope(|scope| {
        for t in 0..THREADS {
            scope.spawn(move |_| {
                let mut rng = rand::thread_rng();
                let mut keys: Vec<i32> = (t * PER_THREAD..(t + 1) * PER_THREAD).collect();
                keys.shuffle(&mut rng);
                for k in keys {
                    assert!(set.insert(k));
                }
            });
        }
    })
    .unwrap();

    for k in 0..(THREADS * PER_THREAD) {
        assert!(set.contains(&k), "key {k} lost under concurrent insert");
    }
}

fn delete_delete_race<S: ConcurrentSet<i32>>() {
    const THREADS: i32 = 50;
    const PER_THREAD: i32 = 400;
    const STRIPE: i32 = 64;
    let set = &S::new();

    let key_space = STRIPE * PER_THREAD;
    for n in 0..key_space {
        assert!(set.insert(n));
    }

    thread::scope(|scope| {
        for t in 0..THREADS {
            scope.spawn(move |_| {
                let mut rng = rand::thread_rng();
                let mut keys: Vec<i32> = (0..PER_THREAD).map(|k| t + STRIPE * k).collect();
                keys.shuffle(&mut rng);
                for k in keys {
                    assert!(set.remove(&k));
                }
            });
        }
    })
    .unwrap();

    for n in 0..key_space {
        let was_deleted = n % STRIPE < THREADS;
        assert_eq!(set.contains(&n), !was_deleted, "key {n} survival mismatch");
    }
}

fn mixed_race<S: ConcurrentSet<i32>>() {
    const DELETE_RANGE: i32 = 5000;
    const INSERT_RANGE: i32 = 5000;
    let set = &S::new();

    for k in 0..DELETE_RANGE {
        assert!(set.insert(k));
    }

    thread::scope(|scope| {
        scope.spawn(move |_| {
            let mut rng = rand::thread_rng();
            let mut keys: Vec<i32> = (0..DELETE_RANGE).collect();
            keys.shuffle(&mut rng);
            for k in keys {
                assert!(set.remove(&k));
            }
        });
        scope.spawn(move |_| {
            let mut rng = rand::thread_rng();
            let mut keys: Vec<i32> = (DELETE_RANGE..DELETE_RANGE + INSERT_RANGE).collect();
            keys.shuffle(&mut rng);
            for k in keys {
                assert!(set.insert(k));
            }
        });
    })
    .unwrap();

    for k in 0..DELETE_RANGE {
        assert!(!set.contains(&k));
    }
    for k in DELETE_RANGE..DELETE_RANGE + INSERT_RANGE {
        assert!(set.contains(&k));
    }
}

macro_rules! instantiate_tests {
    ($modname:ident, $ty:ty) => {
        mod $modname {
            use super::*;

            #[test]
            fn sanity_scenario() {
                sanity::<$ty>();
            }

            #[test]
            fn structural_delete_two_children_scenario() {
                structural_delete_two_children::<$ty>();
            }

            #[test]
            fn insert_insert_race_scenario() {
                insert_insert_race::<$ty>();
            }

            #[test]
            fn delete_delete_race_scenario() {
                delete_delete_race::<$ty>();
            }

            #[test]
            fn mixed_race_scenario() {
                mixed_race::<$ty>();
            }
        }
    };
}

instantiate_tests!(coarse_set, CoarseLockedSet<i32>);
instantiate_tests!(coarse_bst, CoarseLockedBst<i32>);
instantiate_tests!(fine_grained_bst, FineGrainedBst<i32>);
instantiate_tests!(natarajan_mittal, NatarajanMittalSet<i32>);
instantiate_tests!(singh_bst, SinghBst<i32>);

/// Seed scenario 6, run against the lock-free leaf BST specifically: one
/// thread inserts `[0, 100)` in order while another removes the same range
/// in order; the final membership of each key must agree with whichever
/// call (insert or remove) actually won the race for it.
#[test]
fn natarajan_mittal_linearizability_spot_check() {
    const N: i32 = 100;
    let set = NatarajanMittalSet::<i32>::new();
    let removed = std::sync::Mutex::new(vec![false; N as usize]);

    thread::scope(|scope| {
        scope.spawn(|_| {
            for k in 0..N {
                assert!(set.insert(k));
            }
        });
        scope.spawn(|_| {
            for k in 0..N {
                let ok = set.remove(&k);
                removed.lock().unwrap()[k as usize] = ok;
            }
        });
    })
    .unwrap();

    let removed = removed.into_inner().unwrap();
    for k in 0..N {
        assert_eq!(
            set.contains(&k),
            !removed[k as usize],
            "key {k} linearization mismatch"
        );
    }
}
