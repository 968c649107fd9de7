//! Cancellable results
//!
//! [`result`] wraps an in-flight computation producing an [`Outcome`]. The
//! returned [`CancellableResult`] can be observed through [`promise`] and
//! [`resolve`] any number of times, and cancelled at any point. Whichever
//! happens first, the source's outcome being observed or [`cancel`], settles
//! the result for good:
//!
//! - settled by cancellation, every observer sees the `CANCELLED` failure,
//!   whatever the source eventually produces
//! - settled by value, every observer sees the source's outcome verbatim and
//!   later `cancel` calls only cascade to the registered child
//!
//! [`promise`]: CancellableResult::promise
//! [`resolve`]: CancellableResult::resolve
//! [`cancel`]: CancellableResult::cancel

use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use futures::future::{BoxFuture, FutureExt, Shared};
use pin_project::pin_project;
use tracing::{debug, trace};

use crate::cancellation::{
    CancelHandle, Cancellable, CancellableFutureExt, CancellationToken, IntoCancelHandle,
};
use crate::dispatch::{spawn_dispatcher, Handlers, Resolution};
use crate::error::ContextError;
use crate::executor::Handle;
use crate::outcome::Outcome;
use crate::settlement::{Settled, Settlement};

type SharedSource<T, K, P> = Shared<BoxFuture<'static, Outcome<T, K, P>>>;

/// A computation whose outcome can be cancelled and dispatched on
pub struct CancellableResult<T, K, P = ()> {
    source: SharedSource<T, K, P>,
    token: CancellationToken,
    settlement: Settlement,
}

/// Wrap an in-flight computation
///
/// The source is shared between every observer and only polled through
/// them, so it makes progress once a [`Promise`] is awaited or a dispatcher
/// from [`CancellableResult::resolve`] runs.
pub fn result<F, T, K, P>(source: F) -> CancellableResult<T, K, P>
where
    F: Future<Output = Outcome<T, K, P>> + Send + 'static,
    T: Clone + Send + Sync + 'static,
    K: Clone + Send + Sync + 'static,
    P: Clone + Send + Sync + 'static,
{
    CancellableResult {
        source: source.boxed().shared(),
        token: CancellationToken::new(),
        settlement: Settlement::new(),
    }
}

impl<T, K, P> CancellableResult<T, K, P>
where
    T: Clone + Send + Sync + 'static,
    K: Clone + Send + Sync + 'static,
    P: Clone + Send + Sync + 'static,
{
    /// The normalized outcome: the source's, or `CANCELLED` if cancellation
    /// came first
    pub fn promise(&self) -> Promise<T, K, P> {
        Promise {
            race: self.source.clone().cancellable(self.token.clone()),
            settlement: self.settlement.clone(),
        }
    }

    /// Cancel the result
    ///
    /// Before settlement this makes every observer see `CANCELLED`. After
    /// settlement it only cancels the registered child. Never blocks.
    pub fn cancel(&self) {
        match self.settlement.settle(Settled::Cancelled) {
            Settled::Cancelled => {
                debug!("cancelling result");
                self.token.cancel();
            }
            Settled::Value => {
                trace!("result already settled, cascading to child only");
                self.token.cancel_child();
            }
        }
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        let this = self.clone();
        CancelHandle::new(move || this.cancel())
    }

    /// Tie a nested operation to this result; cancelling the result cancels
    /// it. Replaces any earlier registration.
    pub fn register_child(&self, child: impl IntoCancelHandle) {
        if let Some(child) = child.into_cancel_handle() {
            self.token.register_child(child);
        }
    }

    pub fn is_settled(&self) -> bool {
        self.settlement.get().is_some()
    }

    /// Whether cancellation settled this result
    pub fn is_cancelled(&self) -> bool {
        self.settlement.get() == Some(Settled::Cancelled)
    }

    /// Dispatch the eventual outcome to `on_success` or one of `handlers`
    /// on the current scheduler
    ///
    /// # Panics
    ///
    /// Panics outside of a scheduler context, see [`Handle::current`].
    pub fn resolve<S, R>(&self, on_success: S, handlers: Handlers<K, P>) -> Resolution
    where
        K: Eq + Hash + fmt::Debug,
        S: FnOnce(T) -> R + Send + 'static,
        R: IntoCancelHandle + 'static,
    {
        self.resolve_in(&Handle::current(), on_success, handlers)
    }

    /// Like [`resolve`](Self::resolve), but fails instead of panicking when
    /// no scheduler is running
    pub fn try_resolve<S, R>(
        &self,
        on_success: S,
        handlers: Handlers<K, P>,
    ) -> Result<Resolution, ContextError>
    where
        K: Eq + Hash + fmt::Debug,
        S: FnOnce(T) -> R + Send + 'static,
        R: IntoCancelHandle + 'static,
    {
        let handle = Handle::try_current()?;
        Ok(self.resolve_in(&handle, on_success, handlers))
    }

    /// Like [`resolve`](Self::resolve), spawning the dispatcher onto `handle`
    pub fn resolve_in<S, R>(
        &self,
        handle: &Handle,
        on_success: S,
        handlers: Handlers<K, P>,
    ) -> Resolution
    where
        K: Eq + Hash + fmt::Debug,
        S: FnOnce(T) -> R + Send + 'static,
        R: IntoCancelHandle + 'static,
    {
        spawn_dispatcher(
            handle,
            self.source.clone(),
            self.token.clone(),
            self.settlement.clone(),
            on_success,
            handlers,
        )
    }
}

impl<T, K, P> Clone for CancellableResult<T, K, P> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            token: self.token.clone(),
            settlement: self.settlement.clone(),
        }
    }
}

impl<T, K, P> fmt::Debug for CancellableResult<T, K, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellableResult")
            .field("settled", &self.settlement.get())
            .field("token", &self.token)
            .finish()
    }
}

/// The normalized outcome of a [`CancellableResult`]
#[pin_project]
pub struct Promise<T, K, P = ()> {
    #[pin]
    race: Cancellable<SharedSource<T, K, P>>,
    settlement: Settlement,
}

impl<T: Clone, K: Clone, P: Clone> Future for Promise<T, K, P> {
    type Output = Outcome<T, K, P>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        match ready!(this.race.poll(cx)) {
            Ok(outcome) => match this.settlement.settle(Settled::Value) {
                Settled::Value => Poll::Ready(outcome),
                Settled::Cancelled => Poll::Ready(Outcome::cancelled()),
            },
            Err(_cancelled) => Poll::Ready(Outcome::cancelled()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::{err_with, ok};
    use futures::executor::block_on;
    use futures::task::noop_waker_ref;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    type Out = Outcome<&'static str, &'static str, i32>;

    #[test]
    fn test_promise_yields_source_outcome() {
        let r = result(async { ok::<_, &str, ()>("foo") });
        assert_eq!(block_on(r.promise()), ok("foo"));
        assert!(r.is_settled());
        assert!(!r.is_cancelled());
    }

    #[test]
    fn test_cancel_before_settlement_wins() {
        let r = result(async { err_with::<&str, _, _>("foo", 123) });
        r.cancel();

        let outcome: Out = block_on(r.promise());
        assert!(outcome.is_cancelled());
        assert!(r.is_cancelled());
    }

    #[test]
    fn test_cancel_wakes_pending_promise() {
        let (completion, completer) = crate::completion::Completion::<()>::new();
        let r = result(async move {
            let _ = completion.await;
            ok::<_, &str, ()>(1)
        });

        let mut promise = Box::pin(r.promise());
        let mut cx = Context::from_waker(noop_waker_ref());
        assert!(promise.as_mut().poll(&mut cx).is_pending());

        r.cancel();
        completer.complete(());
        assert_eq!(promise.as_mut().poll(&mut cx), Poll::Ready(Outcome::cancelled()));
    }

    #[test]
    fn test_cancel_after_settlement_keeps_value() {
        let r = result(async { ok::<_, &str, ()>("foo") });
        assert_eq!(block_on(r.promise()), ok("foo"));

        r.cancel();
        assert!(!r.is_cancelled());
        assert_eq!(block_on(r.promise()), ok("foo"));
    }

    #[test]
    fn test_cancel_after_settlement_cascades_to_child() {
        let r = result(async { ok::<_, &str, ()>("foo") });
        let cancels = Arc::new(AtomicUsize::new(0));
        let cancels_clone = cancels.clone();
        r.register_child(CancelHandle::new(move || {
            cancels_clone.fetch_add(1, Ordering::SeqCst);
        }));

        block_on(r.promise());
        r.cancel();
        r.cancel();

        assert_eq!(cancels.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_many_observers_share_one_source() {
        let polls = Arc::new(AtomicUsize::new(0));
        let polls_clone = polls.clone();
        let r = result(async move {
            polls_clone.fetch_add(1, Ordering::SeqCst);
            ok::<_, &str, ()>(5)
        });

        assert_eq!(block_on(r.promise()), ok(5));
        assert_eq!(block_on(r.clone().promise()), ok(5));
        assert_eq!(polls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancel_handle_cancels_result() {
        let r = result(async { ok::<_, &str, ()>(5) });
        r.cancel_handle().cancel();
        assert!(block_on(r.promise()).is_cancelled());
    }

    #[test]
    fn test_try_resolve_without_scheduler() {
        let r = result(async { ok::<_, &str, ()>(5) });
        let resolution = r.try_resolve(|_| (), Handlers::new());
        assert_eq!(resolution.err(), Some(ContextError::NoScheduler));
    }
}
