//! Error surface for the handful of conditions that are genuinely recoverable
//! at the crate's API boundary. `contains`/`insert`/`remove` stay infallible
//! per the set contract; only teardown-adjacent paths can fail.

use std::fmt;

/// Recoverable failure modes surfaced by container construction/teardown.
#[derive(Debug)]
pub enum SetError {
    /// The Singh maintainer thread could not be joined during shutdown,
    /// typically because it panicked.
    MaintainerJoinFailed,
    /// Reserved for a future non-panicking failure mode; never constructed
    /// today, kept so the enum doesn't need to grow on every new variant.
    PoisonedMetadata,
}

impl fmt::Display for SetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SetError::MaintainerJoinFailed => {
                write!(f, "maintainer thread panicked before it could be joined")
            }
            SetError::PoisonedMetadata => write!(f, "poisoned internal metadata"),
        }
    }
}

impl std::error::Error for SetError {}
