//! A comparative study of concurrent ordered-set data structures.
//!
//! Five interchangeable implementations of the same three-operation
//! contract (`contains` / `insert` / `remove`), ranging from a single
//! coarse readers-writer lock around a sorted container up to two
//! non-blocking designs: a lock-free external-leaf BST (Natarajan–Mittal)
//! and a concurrent internally-balanced BST with cooperative, descriptor-
//! driven rotations (Singh) maintained by a background thread.
//!
//! See [`ConcurrentSet`] for the shared contract and the `*_set`/`*_bst`
//! modules for each variant.

pub mod error;
pub mod set;

pub mod coarse_bst;
pub mod coarse_set;
pub mod fine_grained_bst;
pub mod natarajan_mittal;
pub mod singh_bst;

pub use coarse_bst::CoarseLockedBst;
pub use coarse_set::CoarseLockedSet;
pub use error::SetError;
pub use fine_grained_bst::FineGrainedBst;
pub use natarajan_mittal::NatarajanMittalSet;
pub use set::ConcurrentSet;
pub use singh_bst::SinghBst;
