//! The shared contract every ordered-set variant in this crate implements.

/// A concurrent (or, for the baselines, merely thread-safe) set of `K`.
///
/// Every component in this crate implements this trait so call sites and
/// tests are written once and run unmodified against all five variants.
/// The contract is deliberately total: none of the three operations can
/// fail in a way that's reported to the caller (see `error` module for the
/// narrow set of conditions that *are* fallible, all of which live outside
/// this trait).
pub trait ConcurrentSet<K>: Send + Sync {
    /// Constructs an empty set.
    fn new() -> Self;

    /// Returns `true` iff `key` is present at the linearization point of
    /// this call.
    fn contains(&self, key: &K) -> bool;

    /// Inserts `key`. Returns `true` iff the set did not already contain it.
    fn insert(&self, key: K) -> bool;

    /// Removes `key`. Returns `true` iff the set contained it.
    fn remove(&self, key: &K) -> bool;
}

#[cfg(test)]
pub mod tests {
    //! Generic scenarios shared by every `ConcurrentSet` implementation.
    //! Mirrors the teacher's `concurrent_map::tests::smoke` convention:
    //! one generic driver per property, instantiated per component.

    use super::ConcurrentSet;
    use crossbeam_utils::thread;
    use rand::prelude::*;

    /// Seed scenario 1: sanity over a small serial key range.
    pub fn sanity<S: ConcurrentSet<i32>>() {
        let set = S::new();
        for k in 0..100 {
            assert!(!set.contains(&k), "key {k} present before insertion");
            assert!(set.insert(k), "first insert of {k} should succeed");
            assert!(set.contains(&k), "key {k} missing right after insertion");
        }
        assert!(!set.insert(0), "duplicate insert of 0 should fail");
    }

    /// Seed scenario 3: disjoint concurrent inserts, no lost updates.
    pub fn insert_insert_race<S: ConcurrentSet<i32> + 'static>() {
        const THREADS: i32 = 10;
        const PER_THREAD: i32 = 1000;
        let set = &S::new();

        thread::scope(|scope| {
            for t in 0..THREADS {
                scope.spawn(move |_| {
                    let mut rng = rand::thread_rng();
                    let mut keys: Vec<i32> =
                        (t * PER_THREAD..(t + 1) * PER_THREAD).collect();
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

    /// Seed scenario 4: striped concurrent deletes, no spurious survivors.
    /// Stripe width is 64, independent of thread count, per the seed scenario.
    pub fn delete_delete_race<S: ConcurrentSet<i32> + 'static>() {
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
                    let mut keys: Vec<i32> =
                        (0..PER_THREAD).map(|k| t + STRIPE * k).collect();
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

    /// Mixed race: concurrent disjoint deletes and inserts.
    pub fn mixed_race<S: ConcurrentSet<i32> + 'static>() {
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
                let mut keys: Vec<i32> =
                    (DELETE_RANGE..DELETE_RANGE + INSERT_RANGE).collect();
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
}
