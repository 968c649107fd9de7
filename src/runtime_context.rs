//! Thread-local scheduler context
//!
//! While a [`Scheduler`](crate::executor::Scheduler) polls, its handle is the
//! current one for the thread. Handlers that start nested operations spawn
//! their dispatchers through it.

use std::cell::RefCell;

use crate::executor::Handle;

thread_local! {
    static CURRENT: RefCell<Option<Handle>> = const { RefCell::new(None) };
}

/// Restores the previously current handle when dropped
pub(crate) struct ContextGuard {
    previous: Option<Handle>,
}

/// Make `handle` current for the calling thread until the guard is dropped
pub(crate) fn enter(handle: Handle) -> ContextGuard {
    let previous = CURRENT.with(|current| current.borrow_mut().replace(handle));
    ContextGuard { previous }
}

pub(crate) fn current() -> Option<Handle> {
    CURRENT.with(|current| current.borrow().clone())
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|current| *current.borrow_mut() = previous);
    }
}
