//! Cancellation tokens and cancel handles
//!
//! A [`CancellationToken`] is a monotonic flag plus a single slot holding the
//! [`CancelHandle`] of the most recently spawned nested operation. Cancelling
//! the token cancels that child too, so cancellation cascades down a chain of
//! nested operations one link at a time.
//!
//! [`Cancellable`] races a future against one or more tokens. The flag is
//! checked again after the future reports ready, so a cancellation observed
//! before the value is handed out always wins.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};

use pin_project::pin_project;
use thiserror::Error;
use tracing::trace;

/// A zero-argument cancel function
///
/// Handles are cheap to clone; every clone cancels the same operation.
#[derive(Clone)]
pub struct CancelHandle {
    cancel: Arc<dyn Fn() + Send + Sync>,
}

impl CancelHandle {
    pub fn new<F>(cancel: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            cancel: Arc::new(cancel),
        }
    }

    /// A handle that does nothing when invoked
    pub fn noop() -> Self {
        Self::new(|| {})
    }

    /// Invoke the cancel function. Never blocks.
    pub fn cancel(&self) {
        (self.cancel)()
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelHandle").finish_non_exhaustive()
    }
}

impl From<CancellationToken> for CancelHandle {
    fn from(token: CancellationToken) -> Self {
        CancelHandle::new(move || token.cancel())
    }
}

/// Values a handler may return to register a nested operation
///
/// `()` and `None` register nothing. Anything else becomes the child of the
/// scope whose handler returned it.
pub trait IntoCancelHandle {
    fn into_cancel_handle(self) -> Option<CancelHandle>;
}

impl IntoCancelHandle for () {
    fn into_cancel_handle(self) -> Option<CancelHandle> {
        None
    }
}

impl IntoCancelHandle for CancelHandle {
    fn into_cancel_handle(self) -> Option<CancelHandle> {
        Some(self)
    }
}

impl IntoCancelHandle for Option<CancelHandle> {
    fn into_cancel_handle(self) -> Option<CancelHandle> {
        self
    }
}

impl IntoCancelHandle for CancellationToken {
    fn into_cancel_handle(self) -> Option<CancelHandle> {
        Some(self.into())
    }
}

/// Per-operation cancellation state
#[derive(Clone, Default)]
pub struct CancellationToken {
    state: Arc<Mutex<TokenState>>,
}

#[derive(Default)]
struct TokenState {
    cancelled: bool,
    child: Option<CancelHandle>,
    // One slot per pending `Cancellable`, keyed by its registration
    wakers: HashMap<u64, Waker>,
    next_waker_key: u64,
}

impl CancellationToken {
    /// Create a new, uncancelled token
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if cancellation has been requested
    pub fn is_cancelled(&self) -> bool {
        self.lock().cancelled
    }

    /// Whether a child handle is currently registered
    pub fn has_child(&self) -> bool {
        self.lock().child.is_some()
    }

    /// Cancel the token
    ///
    /// The flag is set and the registered child (if any) is taken in one
    /// critical section, so a child is invoked at most once no matter how many
    /// times or from how many places `cancel` is called. The child and any
    /// waiting futures are notified after the lock is released.
    pub fn cancel(&self) {
        let (first, child, wakers) = {
            let mut state = self.lock();
            let first = !state.cancelled;
            state.cancelled = true;
            (first, state.child.take(), std::mem::take(&mut state.wakers))
        };

        if first {
            trace!(waiters = wakers.len(), "cancellation token cancelled");
        }

        for waker in wakers.into_values() {
            waker.wake();
        }

        if let Some(child) = child {
            trace!("propagating cancellation to child");
            child.cancel();
        }
    }

    /// Cancel the registered child without cancelling this token
    ///
    /// Used once an operation has settled with a real value: cancelling it
    /// afterwards no longer changes its outcome but still cascades downward.
    pub fn cancel_child(&self) {
        let child = self.lock().child.take();
        if let Some(child) = child {
            trace!("propagating cancellation to child of settled operation");
            child.cancel();
        }
    }

    /// Register the cancel handle of a nested operation
    ///
    /// Replaces any previous registration. If the token is already cancelled
    /// the handle is invoked immediately instead of being stored.
    pub fn register_child(&self, child: CancelHandle) {
        let mut state = self.lock();
        if state.cancelled {
            drop(state);
            trace!("token already cancelled, cancelling child immediately");
            child.cancel();
        } else if state.child.replace(child).is_some() {
            trace!("replaced previously registered child");
        }
    }

    /// Store `waker` in the slot identified by `key` to be woken on
    /// cancellation, allocating a slot on first use. Returns `true` if the
    /// token is already cancelled, in which case nothing is stored.
    fn register_waker(&self, key: &mut Option<u64>, waker: &Waker) -> bool {
        let mut state = self.lock();
        if state.cancelled {
            return true;
        }

        let slot_key = match *key {
            Some(slot_key) => slot_key,
            None => {
                let slot_key = state.next_waker_key;
                state.next_waker_key += 1;
                *key = Some(slot_key);
                slot_key
            }
        };

        state
            .wakers
            .entry(slot_key)
            .and_modify(|stored| {
                if !stored.will_wake(waker) {
                    *stored = waker.clone();
                }
            })
            .or_insert_with(|| waker.clone());
        false
    }

    fn deregister_waker(&self, key: u64) {
        self.lock().wakers.remove(&key);
    }

    #[cfg(test)]
    fn waiter_count(&self) -> usize {
        self.lock().wakers.len()
    }

    fn lock(&self) -> MutexGuard<'_, TokenState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("CancellationToken")
            .field("cancelled", &state.cancelled)
            .field("has_child", &state.child.is_some())
            .finish()
    }
}

/// Returned by [`Cancellable`] when a token won the race
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("operation was cancelled")]
pub struct Cancelled;

/// Extension trait for futures that supports cancellation
pub trait CancellableFutureExt: Future + Sized {
    /// Race the future against a single token
    fn cancellable(self, token: CancellationToken) -> Cancellable<Self> {
        Cancellable::new(self, vec![token])
    }

    /// Race the future against several tokens; any of them cancels it
    fn cancellable_by(self, tokens: Vec<CancellationToken>) -> Cancellable<Self> {
        Cancellable::new(self, tokens)
    }
}

impl<F: Future> CancellableFutureExt for F {}

/// A future that resolves to `Err(Cancelled)` if any of its tokens is
/// cancelled before the inner future's value is handed out
#[pin_project]
pub struct Cancellable<F> {
    #[pin]
    future: F,
    registrations: Vec<Registration>,
}

/// A token plus the waker slot this future occupies in it. The slot is
/// released on completion or drop.
struct Registration {
    token: CancellationToken,
    key: Option<u64>,
}

impl Registration {
    fn release(&mut self) {
        if let Some(key) = self.key.take() {
            self.token.deregister_waker(key);
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.release();
    }
}

impl<F> Cancellable<F> {
    pub fn new(future: F, tokens: Vec<CancellationToken>) -> Self {
        let registrations = tokens
            .into_iter()
            .map(|token| Registration { token, key: None })
            .collect();
        Self {
            future,
            registrations,
        }
    }
}

fn any_cancelled(registrations: &[Registration]) -> bool {
    registrations.iter().any(|r| r.token.is_cancelled())
}

fn finish<T>(registrations: &mut [Registration], output: T) -> Poll<T> {
    for registration in registrations.iter_mut() {
        registration.release();
    }
    Poll::Ready(output)
}

impl<F: Future> Future for Cancellable<F> {
    type Output = Result<F::Output, Cancelled>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let registrations = this.registrations;

        if any_cancelled(registrations) {
            return finish(registrations, Err(Cancelled));
        }

        if let Poll::Ready(value) = this.future.poll(cx) {
            // Cancellation raised while the source was producing its value
            // still takes priority.
            if any_cancelled(registrations) {
                return finish(registrations, Err(Cancelled));
            }
            return finish(registrations, Ok(value));
        }

        let mut cancelled = false;
        for registration in registrations.iter_mut() {
            cancelled |= registration
                .token
                .register_waker(&mut registration.key, cx.waker());
        }
        if cancelled {
            finish(registrations, Err(Cancelled))
        } else {
            Poll::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::task::noop_waker_ref;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn counting_handle() -> (CancelHandle, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let handle = CancelHandle::new(move || {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });
        (handle, count)
    }

    #[test]
    fn test_cancel_is_monotonic_and_idempotent() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());

        token.cancel();
        assert!(token.is_cancelled());

        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_child_invoked_exactly_once() {
        let token = CancellationToken::new();
        let (child, count) = counting_handle();

        token.register_child(child);
        assert!(token.has_child());

        token.cancel();
        token.cancel();
        token.cancel();

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!token.has_child());
    }

    #[test]
    fn test_register_after_cancel_invokes_immediately() {
        let token = CancellationToken::new();
        token.cancel();

        let (child, count) = counting_handle();
        token.register_child(child);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!token.has_child());
    }

    #[test]
    fn test_registration_replaces_previous_child() {
        let token = CancellationToken::new();
        let (first, first_count) = counting_handle();
        let (second, second_count) = counting_handle();

        token.register_child(first);
        token.register_child(second);
        token.cancel();

        assert_eq!(first_count.load(Ordering::SeqCst), 0);
        assert_eq!(second_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancel_child_leaves_token_uncancelled() {
        let token = CancellationToken::new();
        let (child, count) = counting_handle();
        token.register_child(child);

        token.cancel_child();
        token.cancel_child();

        assert!(!token.is_cancelled());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_child_may_cancel_back_into_parent() {
        let token = CancellationToken::new();
        let parent = token.clone();
        token.register_child(CancelHandle::new(move || parent.cancel()));

        // Must not deadlock on the token's own lock
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_handle_from_token() {
        let token = CancellationToken::new();
        let handle: CancelHandle = token.clone().into();
        handle.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_race_source_first() {
        let token = CancellationToken::new();
        let mut fut = Box::pin(async { 7 }.cancellable(token.clone()));
        let mut cx = Context::from_waker(noop_waker_ref());

        assert_eq!(fut.as_mut().poll(&mut cx), Poll::Ready(Ok(7)));
    }

    #[test]
    fn test_race_cancel_first() {
        let token = CancellationToken::new();
        let mut fut = Box::pin(async { 7 }.cancellable(token.clone()));
        token.cancel();
        let mut cx = Context::from_waker(noop_waker_ref());

        assert_eq!(fut.as_mut().poll(&mut cx), Poll::Ready(Err(Cancelled)));
    }

    #[test]
    fn test_race_tie_prefers_cancellation() {
        // The source settles in the same turn that cancellation is raised
        let token = CancellationToken::new();
        let token_clone = token.clone();
        let source = futures::future::lazy(move |_| {
            token_clone.cancel();
            7
        });
        let mut fut = Box::pin(source.cancellable(token));
        let mut cx = Context::from_waker(noop_waker_ref());

        assert_eq!(fut.as_mut().poll(&mut cx), Poll::Ready(Err(Cancelled)));
    }

    #[test]
    fn test_pending_race_is_woken_by_cancel() {
        struct Flag(AtomicBool);
        impl futures::task::ArcWake for Flag {
            fn wake_by_ref(arc_self: &Arc<Self>) {
                arc_self.0.store(true, Ordering::SeqCst);
            }
        }

        let flag = Arc::new(Flag(AtomicBool::new(false)));
        let waker = futures::task::waker(flag.clone());
        let mut cx = Context::from_waker(&waker);

        let first = CancellationToken::new();
        let second = CancellationToken::new();
        let mut fut = Box::pin(
            futures::future::pending::<()>().cancellable_by(vec![first, second.clone()]),
        );

        assert!(fut.as_mut().poll(&mut cx).is_pending());
        assert!(!flag.0.load(Ordering::SeqCst));

        second.cancel();
        assert!(flag.0.load(Ordering::SeqCst));
        assert_eq!(fut.as_mut().poll(&mut cx), Poll::Ready(Err(Cancelled)));
    }

    /// Wakes itself `remaining` times before completing
    struct YieldTimes(usize);

    impl Future for YieldTimes {
        type Output = ();

        fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
            if self.0 == 0 {
                return Poll::Ready(());
            }
            self.0 -= 1;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }

    #[test]
    fn test_repolled_race_keeps_one_waker_slot() {
        let scheduler = crate::executor::Scheduler::new();
        let token = CancellationToken::new();
        let race_token = token.clone();
        let peak = Arc::new(AtomicUsize::new(0));
        let peak_clone = peak.clone();
        let observer = token.clone();

        scheduler.spawn(async move {
            let race = YieldTimes(1000).cancellable(race_token);
            futures::pin_mut!(race);
            let _ = futures::future::poll_fn(|cx| {
                let poll = race.as_mut().poll(cx);
                peak_clone.fetch_max(observer.waiter_count(), Ordering::SeqCst);
                poll
            })
            .await;
        });
        scheduler.run_until_stalled();

        assert_eq!(scheduler.task_count(), 0);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(token.waiter_count(), 0);
    }

    #[test]
    fn test_dropped_race_releases_waker_slot() {
        let token = CancellationToken::new();
        let mut cx = Context::from_waker(noop_waker_ref());
        let mut first = Box::pin(futures::future::pending::<()>().cancellable(token.clone()));
        let mut second = Box::pin(futures::future::pending::<()>().cancellable(token.clone()));

        assert!(first.as_mut().poll(&mut cx).is_pending());
        assert!(second.as_mut().poll(&mut cx).is_pending());
        assert_eq!(token.waiter_count(), 2);

        drop(first);
        assert_eq!(token.waiter_count(), 1);
        drop(second);
        assert_eq!(token.waiter_count(), 0);
    }
}
