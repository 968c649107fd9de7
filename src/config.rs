//! Configuration constants for the cancellable-result runtime
//!
//! This module contains tunable parameters for the cooperative scheduler and
//! the default dispatch policy of [`Handlers`](crate::dispatch::Handlers).

/// How a dispatcher treats an error kind nobody registered a handler for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Strictness {
    /// Drop the outcome and log it at debug level
    #[default]
    Lenient,
    /// Log at error level and report [`ResolveError::Unhandled`] through the
    /// resolution
    ///
    /// [`ResolveError::Unhandled`]: crate::error::ResolveError::Unhandled
    Strict,
}

/// Policy used by [`Handlers::new`](crate::dispatch::Handlers::new)
///
/// Lenient matches the best-effort contract: an unmatched error kind is
/// simply not observed.
pub const DEFAULT_STRICTNESS: Strictness = Strictness::Lenient;

/// How long `block_on` parks when neither the root future nor any spawned
/// task is ready (in milliseconds)
///
/// Wakeups from other threads unpark the scheduler immediately; this only
/// bounds the latency of tasks woken through a spawn from another thread.
pub const IDLE_PARK_MS: u64 = 1;

/// Upper bound on turns taken by a single `run_until_stalled` call
///
/// A task that wakes itself on every poll would otherwise keep the loop
/// spinning forever.
pub const MAX_TURNS_UNTIL_STALLED: usize = 10_000;
