//! Resolve dispatcher
//!
//! Every call to [`CancellableResult::resolve`] spawns one dispatcher. It
//! races the shared source against two tokens (its own scope's and the
//! parent result's) and then runs exactly one branch:
//!
//! 1. cancellation won: the `CANCELLED` handler, if registered
//! 2. the source succeeded: the success handler
//! 3. the source failed: the handler registered for the failure's kind
//!
//! Whatever the chosen handler returns through [`IntoCancelHandle`] becomes
//! the child of the dispatcher's scope, so cancelling the [`Resolution`]
//! cascades into work the handler started, even after the handler ran.
//!
//! [`CancellableResult::resolve`]: crate::result::CancellableResult::resolve

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::future::FusedFuture;
use tracing::{debug, error, trace};

use crate::cancellation::{CancelHandle, CancellableFutureExt, CancellationToken, IntoCancelHandle};
use crate::completion::Completion;
use crate::config::{Strictness, DEFAULT_STRICTNESS};
use crate::error::ResolveError;
use crate::executor::Handle;
use crate::outcome::{ErrorKind, Failure, Outcome};
use crate::settlement::{Settled, Settlement};

type ErrorHandler<P> = Box<dyn FnOnce(Option<P>) -> Option<CancelHandle> + Send>;
type CancelledHandler = Box<dyn FnOnce() -> Option<CancelHandle> + Send>;

/// Error handlers keyed by error kind, plus the `CANCELLED` handler
pub struct Handlers<K, P = ()> {
    by_kind: HashMap<K, ErrorHandler<P>>,
    cancelled: Option<CancelledHandler>,
    strictness: Strictness,
}

impl<K: Eq + Hash, P> Handlers<K, P> {
    pub fn new() -> Self {
        Self {
            by_kind: HashMap::new(),
            cancelled: None,
            strictness: DEFAULT_STRICTNESS,
        }
    }

    /// Handle failures of `kind`. The handler receives the failure's payload.
    pub fn on<F, R>(mut self, kind: K, handler: F) -> Self
    where
        F: FnOnce(Option<P>) -> R + Send + 'static,
        R: IntoCancelHandle + 'static,
    {
        self.by_kind
            .insert(kind, Box::new(move |payload| handler(payload).into_cancel_handle()));
        self
    }

    /// Handle cancellation of the resolved operation
    pub fn on_cancelled<F, R>(mut self, handler: F) -> Self
    where
        F: FnOnce() -> R + Send + 'static,
        R: IntoCancelHandle + 'static,
    {
        self.cancelled = Some(Box::new(move || handler().into_cancel_handle()));
        self
    }

    /// Report unmatched error kinds instead of dropping them
    pub fn strict(self) -> Self {
        self.strictness(Strictness::Strict)
    }

    pub fn strictness(mut self, strictness: Strictness) -> Self {
        self.strictness = strictness;
        self
    }

    /// Whether a handler is registered for `kind`
    pub fn handles(&self, kind: &ErrorKind<K>) -> bool {
        match kind {
            ErrorKind::Cancelled => self.cancelled.is_some(),
            ErrorKind::Domain(kind) => self.by_kind.contains_key(kind),
        }
    }
}

impl<K: Eq + Hash, P> Default for Handlers<K, P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: fmt::Debug, P> fmt::Debug for Handlers<K, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handlers")
            .field("kinds", &self.by_kind.keys().collect::<Vec<_>>())
            .field("cancelled", &self.cancelled.is_some())
            .field("strictness", &self.strictness)
            .finish()
    }
}

/// Which branch a dispatcher ran
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    /// The success handler ran
    Success,
    /// The handler for the failure's kind ran
    Failure,
    /// The `CANCELLED` handler ran
    Cancelled,
    /// Nothing was registered for what arrived, and it was dropped
    Dropped,
}

/// The outcome of one `resolve` call
///
/// Cancelling a resolution before its source settles runs the `CANCELLED`
/// branch instead of the success or failure branch. Cancelling it afterwards
/// cancels the child registered by whichever handler ran.
///
/// Awaiting it yields the branch that ran. Dropping it does not cancel
/// anything; the dispatcher keeps running. Polling it again after it
/// returned `Ready` panics; check [`FusedFuture::is_terminated`] first.
pub struct Resolution {
    token: CancellationToken,
    settlement: Settlement,
    report: Completion<Result<Dispatched, ResolveError>>,
}

impl Resolution {
    pub fn cancel(&self) {
        cancel_scope(&self.token, &self.settlement);
    }

    /// A handle that cancels this resolution's scope
    pub fn cancel_handle(&self) -> CancelHandle {
        let token = self.token.clone();
        let settlement = self.settlement.clone();
        CancelHandle::new(move || cancel_scope(&token, &settlement))
    }

    /// Check if the dispatcher has reported a branch, or stopped without
    /// one. Stays `true` after the report was awaited.
    pub fn is_finished(&self) -> bool {
        self.report.is_ready()
    }
}

impl Future for Resolution {
    type Output = Result<Dispatched, ResolveError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.report).poll(cx) {
            Poll::Ready(Ok(report)) => Poll::Ready(report),
            Poll::Ready(Err(_abandoned)) => Poll::Ready(Err(ResolveError::Aborted)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl FusedFuture for Resolution {
    fn is_terminated(&self) -> bool {
        self.report.is_terminated()
    }
}

impl IntoCancelHandle for Resolution {
    fn into_cancel_handle(self) -> Option<CancelHandle> {
        Some(self.cancel_handle())
    }
}

impl From<Resolution> for CancelHandle {
    fn from(resolution: Resolution) -> Self {
        resolution.cancel_handle()
    }
}

impl fmt::Debug for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolution")
            .field("settled", &self.settlement.get())
            .field("finished", &self.is_finished())
            .finish()
    }
}

// Once the scope settled with a value the flag only affects later child
// registrations, which then cancel immediately.
fn cancel_scope(token: &CancellationToken, settlement: &Settlement) {
    if settlement.settle(Settled::Cancelled) == Settled::Cancelled {
        trace!("resolution cancelled before dispatch");
    }
    token.cancel();
}

fn register(token: &CancellationToken, child: Option<CancelHandle>) {
    if let Some(child) = child {
        token.register_child(child);
    }
}

fn dispatch_cancelled<K, P>(
    handlers: &mut Handlers<K, P>,
    token: &CancellationToken,
) -> Result<Dispatched, ResolveError> {
    match handlers.cancelled.take() {
        Some(handler) => {
            debug!(branch = "cancelled", "dispatching");
            register(token, handler());
            Ok(Dispatched::Cancelled)
        }
        None => {
            debug!("no CANCELLED handler registered, dropping cancellation");
            Ok(Dispatched::Dropped)
        }
    }
}

/// Spawn a dispatcher for `source` onto `handle`
pub(crate) fn spawn_dispatcher<F, T, K, P, S, R>(
    handle: &Handle,
    source: F,
    parent_token: CancellationToken,
    parent_settlement: Settlement,
    on_success: S,
    mut handlers: Handlers<K, P>,
) -> Resolution
where
    F: Future<Output = Outcome<T, K, P>> + Send + 'static,
    T: Send + 'static,
    K: Eq + Hash + fmt::Debug + Send + 'static,
    P: Send + 'static,
    S: FnOnce(T) -> R + Send + 'static,
    R: IntoCancelHandle + 'static,
{
    let token = CancellationToken::new();
    let settlement = Settlement::new();
    let (report, completer) = Completion::new();

    let scope_token = token.clone();
    let scope_settlement = settlement.clone();

    let task_id = handle.spawn(async move {
        let raced = source
            .cancellable_by(vec![scope_token.clone(), parent_token])
            .await;

        // The parent settles with the first observed outcome; this scope only
        // takes the value if the parent did.
        let outcome = match raced {
            Ok(outcome) => match parent_settlement.settle(Settled::Value) {
                Settled::Value => match scope_settlement.settle(Settled::Value) {
                    Settled::Value => Some(outcome),
                    Settled::Cancelled => None,
                },
                Settled::Cancelled => {
                    scope_settlement.settle(Settled::Cancelled);
                    None
                }
            },
            Err(_cancelled) => {
                scope_settlement.settle(Settled::Cancelled);
                None
            }
        };

        let report = match outcome {
            None => dispatch_cancelled(&mut handlers, &scope_token),
            Some(Outcome::Ok(value)) => {
                debug!(branch = "success", "dispatching");
                register(&scope_token, on_success(value).into_cancel_handle());
                Ok(Dispatched::Success)
            }
            // A source may itself be another result's cancelled promise
            Some(Outcome::Err(Failure {
                kind: ErrorKind::Cancelled,
                ..
            })) => dispatch_cancelled(&mut handlers, &scope_token),
            Some(Outcome::Err(Failure {
                kind: ErrorKind::Domain(kind),
                payload,
            })) => match handlers.by_kind.remove(&kind) {
                Some(handler) => {
                    debug!(branch = "failure", ?kind, "dispatching");
                    register(&scope_token, handler(payload));
                    Ok(Dispatched::Failure)
                }
                None => match handlers.strictness {
                    Strictness::Lenient => {
                        debug!(?kind, "no handler registered for error kind, dropping");
                        Ok(Dispatched::Dropped)
                    }
                    Strictness::Strict => {
                        error!(?kind, "no handler registered for error kind");
                        Err(ResolveError::Unhandled {
                            kind: format!("{kind:?}"),
                        })
                    }
                },
            },
        };

        completer.complete(report);
    });
    trace!(%task_id, "dispatcher spawned");

    Resolution {
        token,
        settlement,
        report,
    }
}
