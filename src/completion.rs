//! One-shot completion slot
//!
//! A [`Completion`] is the awaitable half and a [`Completer`] the writing half
//! of a single value handoff. Dispatchers use it to report which branch ran.
//! If the completer is dropped without a value (for example because the task
//! holding it panicked), the completion resolves to [`Abandoned`] instead of
//! staying pending forever.
//!
//! A completion that already handed out its result is terminated: it reports
//! [`FusedFuture::is_terminated`] and panics if polled again.

use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};

use futures::future::FusedFuture;
use thiserror::Error;

/// The completer went away without producing a value
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("completer dropped without a value")]
pub struct Abandoned;

/// A future that is completed by its corresponding [`Completer`]
pub struct Completion<T> {
    shared: Arc<Mutex<SharedState<T>>>,
}

/// Completes a [`Completion`]
pub struct Completer<T> {
    shared: Arc<Mutex<SharedState<T>>>,
}

struct SharedState<T> {
    slot: Slot<T>,
    waker: Option<Waker>,
}

enum Slot<T> {
    Empty,
    Ready(T),
    Abandoned,
    Taken,
}

fn lock<T>(shared: &Mutex<SharedState<T>>) -> MutexGuard<'_, SharedState<T>> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<T> Completion<T> {
    /// Create a new Completion/Completer pair
    pub fn new() -> (Completion<T>, Completer<T>) {
        let shared = Arc::new(Mutex::new(SharedState {
            slot: Slot::Empty,
            waker: None,
        }));

        let completion = Completion {
            shared: shared.clone(),
        };

        (completion, Completer { shared })
    }

    /// Check without polling whether the completer has finished, either by
    /// completing or by being dropped. Stays `true` once the result was taken.
    pub fn is_ready(&self) -> bool {
        !matches!(lock(&self.shared).slot, Slot::Empty)
    }
}

impl<T> std::future::Future for Completion<T> {
    type Output = Result<T, Abandoned>;

    /// # Panics
    ///
    /// Panics if polled again after returning `Ready`.

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut shared = lock(&self.shared);

        match std::mem::replace(&mut shared.slot, Slot::Taken) {
            Slot::Ready(value) => Poll::Ready(Ok(value)),
            Slot::Abandoned => Poll::Ready(Err(Abandoned)),
            Slot::Taken => panic!("`Completion` polled after completion"),
            Slot::Empty => {
                shared.slot = Slot::Empty;
                shared.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

impl<T> FusedFuture for Completion<T> {
    fn is_terminated(&self) -> bool {
        matches!(lock(&self.shared).slot, Slot::Taken)
    }
}

impl<T> Completer<T> {
    /// Complete the paired [`Completion`] with a value
    pub fn complete(self, value: T) {
        let waker = {
            let mut shared = lock(&self.shared);
            shared.slot = Slot::Ready(value);
            shared.waker.take()
        };

        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        let waker = {
            let mut shared = lock(&self.shared);
            if !matches!(shared.slot, Slot::Empty) {
                return;
            }
            shared.slot = Slot::Abandoned;
            shared.waker.take()
        };

        if let Some(waker) = waker {
            waker.wake();
        }
    }
}
