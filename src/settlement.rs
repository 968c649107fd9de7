//! PENDING/SETTLED arbitration
//!
//! An operation settles exactly once, either with its source's value or by
//! cancellation. Whoever settles first wins; every later attempt learns the
//! winner instead of overriding it.

use std::sync::{Arc, OnceLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settled {
    /// The source's outcome was observed before any cancellation
    Value,
    /// Cancellation was requested before the source's outcome was observed
    Cancelled,
}

/// Shared settle-once cell
#[derive(Debug, Clone, Default)]
pub(crate) struct Settlement(Arc<OnceLock<Settled>>);

impl Settlement {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Try to settle as `attempt`; returns whichever settlement won
    pub(crate) fn settle(&self, attempt: Settled) -> Settled {
        *self.0.get_or_init(|| attempt)
    }

    pub(crate) fn get(&self) -> Option<Settled> {
        self.0.get().copied()
    }
}
