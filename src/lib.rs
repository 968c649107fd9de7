//! cancellable-result: typed, cancellable outcomes for asynchronous operations
//!
//! This crate wraps an in-flight computation so that:
//! - its eventual outcome is an explicit [`Outcome`] (success or typed failure)
//! - a caller can cancel it at any point before it settles, after which every
//!   observer sees the reserved `CANCELLED` failure instead of the real result
//! - handlers dispatched on the outcome can start nested operations whose
//!   cancel handles are registered, so cancellation cascades into them
//!
//! ## Building blocks
//!
//! - [`outcome`] - the [`Outcome`] union and its [`ok`], [`err`] and
//!   [`err_with`] constructors
//! - [`cancellation`] - [`CancellationToken`] (flag plus single child slot)
//!   and [`CancelHandle`]
//! - [`result`](mod@result) - [`result()`], [`CancellableResult`] and its
//!   normalized [`Promise`]
//! - [`dispatch`] - [`Handlers`] and the [`Resolution`] returned by `resolve`
//! - [`executor`] - the single-threaded cooperative [`Scheduler`] that
//!   dispatchers run on
//!
//! ## Example
//!
//! ```rust
//! use cancellable_result::{ok, result, Dispatched, Handlers, Scheduler};
//!
//! let scheduler = Scheduler::new();
//! let dispatched = scheduler.block_on(async {
//!     let r = result(async { ok::<_, &str, ()>("foo") });
//!     r.resolve(|value| assert_eq!(value, "foo"), Handlers::new()).await
//! });
//! assert_eq!(dispatched, Ok(Dispatched::Success));
//! ```
//!
//! ## Nested cancellation
//!
//! A handler that starts another operation returns its cancel handle (or
//! the nested [`Resolution`] itself). Cancelling the outer resolution later
//! cancels the nested one, even if the outer handler already ran:
//!
//! ```rust
//! use cancellable_result::{ok, result, Handlers, Scheduler};
//! use std::sync::atomic::{AtomicBool, Ordering};
//! use std::sync::Arc;
//!
//! let scheduler = Scheduler::new();
//! let inner_cancelled = Arc::new(AtomicBool::new(false));
//! let flag = inner_cancelled.clone();
//!
//! let outer = result(async { ok::<_, &str, ()>("foo") }).resolve_in(
//!     &scheduler.handle(),
//!     move |_| {
//!         result(async { ok::<_, &str, ()>("bar") }).resolve(
//!             |_| (),
//!             Handlers::new().on_cancelled(move || flag.store(true, Ordering::SeqCst)),
//!         )
//!     },
//!     Handlers::new(),
//! );
//!
//! scheduler.tick(); // outer dispatches, inner is spawned
//! outer.cancel(); // cascades into the inner resolution
//! scheduler.run_until_stalled();
//! assert!(inner_cancelled.load(Ordering::SeqCst));
//! ```

#![deny(warnings)]

pub mod cancellation;
pub mod completion;
pub mod config;
pub mod dispatch;
pub mod executor;
pub mod outcome;
pub mod result;
mod runtime_context;
pub mod settlement;
pub mod task;
pub mod waker;

// Re-export core types
pub use cancellation::{
    CancelHandle, Cancellable, CancellableFutureExt, CancellationToken, Cancelled,
    IntoCancelHandle,
};
pub use completion::{Abandoned, Completer, Completion};
pub use config::Strictness;
pub use dispatch::{Dispatched, Handlers, Resolution};
pub use executor::{Handle, Scheduler};
pub use outcome::{err, err_with, ok, ErrorKind, Failure, Outcome};
pub use result::{result, CancellableResult, Promise};
pub use settlement::Settled;
pub use task::TaskId;

/// Error types for the dispatcher and scheduler context
pub mod error {
    use thiserror::Error;

    #[derive(Error, Debug, Clone, PartialEq, Eq)]
    pub enum ResolveError {
        #[error("no handler registered for error kind {kind}")]
        Unhandled { kind: String },

        #[error("dispatcher stopped before reporting a branch")]
        Aborted,
    }

    #[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
    pub enum ContextError {
        #[error("no cooperative scheduler is running on this thread")]
        NoScheduler,
    }

    pub type Result<T> = std::result::Result<T, ResolveError>;
}

/// Convenience function to create a new scheduler and run a future on it
pub fn block_on<F>(future: F) -> F::Output
where
    F: std::future::Future,
{
    let scheduler = Scheduler::new();
    scheduler.block_on(future)
}
