//! Single-threaded cooperative scheduler with panic isolation
//!
//! Futures in Rust do nothing until polled, so the turn-based event loop that
//! settles sources and runs dispatchers is explicit here. A [`Scheduler`]
//! owns a ready queue of task ids and polls them in turns:
//!
//! - [`Scheduler::tick`] runs one turn. Only tasks that were ready when the
//!   turn began are polled; anything spawned or woken during the turn waits
//!   for the next one.
//! - [`Scheduler::run_until_stalled`] runs turns until nothing is ready.
//! - [`Scheduler::block_on`] drives a root future together with all spawned
//!   tasks.
//!
//! ## Panic Handling
//!
//! Every poll is wrapped with `std::panic::catch_unwind`. A panicking task is
//! logged and dropped; other tasks keep running. Anything the task owned is
//! dropped with it, so a dispatcher that panics inside a handler resolves its
//! [`Resolution`](crate::dispatch::Resolution) to `Aborted`.

use std::collections::HashMap;
use std::future::Future;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use crossbeam_queue::SegQueue;
use tracing::{trace, warn};

use crate::config::{IDLE_PARK_MS, MAX_TURNS_UNTIL_STALLED};
use crate::error::ContextError;
use crate::runtime_context;
use crate::task::{Task, TaskId};
use crate::waker::TaskWaker;

struct Shared {
    tasks: Mutex<HashMap<TaskId, Task>>,
    ready_queue: Arc<SegQueue<TaskId>>,
    next_task_id: AtomicU64,
}

impl Shared {
    fn tasks(&self) -> MutexGuard<'_, HashMap<TaskId, Task>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A cloneable handle used to spawn tasks onto a [`Scheduler`]
#[derive(Clone)]
pub struct Handle {
    shared: Arc<Shared>,
}

impl Handle {
    /// The handle of the scheduler currently polling on this thread
    ///
    /// # Panics
    ///
    /// Panics when called outside of a scheduler turn or `block_on`. Use
    /// [`Handle::try_current`] to handle that case.
    pub fn current() -> Handle {
        match Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => panic!("{e}"),
        }
    }

    pub fn try_current() -> Result<Handle, ContextError> {
        runtime_context::current().ok_or(ContextError::NoScheduler)
    }

    /// Spawn a new task; it is first polled on the next turn
    pub fn spawn<F>(&self, future: F) -> TaskId
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let task_id = TaskId(self.shared.next_task_id.fetch_add(1, Ordering::SeqCst));

        self.shared.tasks().insert(task_id, Task::new(task_id, future));
        self.shared.ready_queue.push(task_id);
        trace!(%task_id, "task spawned");

        task_id
    }
}

/// The cooperative scheduler
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Scheduler {
    /// Create a new scheduler
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                tasks: Mutex::new(HashMap::new()),
                ready_queue: Arc::new(SegQueue::new()),
                next_task_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn handle(&self) -> Handle {
        Handle {
            shared: self.shared.clone(),
        }
    }

    /// Spawn a new task
    pub fn spawn<F>(&self, future: F) -> TaskId
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handle().spawn(future)
    }

    /// Run one turn. Returns `true` if any task was polled.
    pub fn tick(&self) -> bool {
        let _context = runtime_context::enter(self.handle());
        let turn = self.shared.ready_queue.len();
        let mut made_progress = false;

        for _ in 0..turn {
            let Some(task_id) = self.shared.ready_queue.pop() else {
                break;
            };
            // Already completed, or queued twice by repeated wakeups
            let Some(mut task) = self.shared.tasks().remove(&task_id) else {
                continue;
            };

            let waker = TaskWaker::new(task_id, self.shared.ready_queue.clone());
            let mut context = Context::from_waker(&waker);

            let poll_result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                task.poll(&mut context)
            }));
            made_progress = true;

            match poll_result {
                Ok(Poll::Ready(())) => trace!(%task_id, "task completed"),
                Ok(Poll::Pending) => {
                    self.shared.tasks().insert(task_id, task);
                }
                Err(_panic_payload) => {
                    warn!(%task_id, "task panicked, dropping it");
                }
            }
        }

        made_progress
    }

    /// Run turns until no task is ready. Returns the number of turns taken.
    pub fn run_until_stalled(&self) -> usize {
        let mut turns = 0;
        while self.tick() {
            turns += 1;
            if turns >= MAX_TURNS_UNTIL_STALLED {
                warn!(turns, "scheduler did not stall, giving up");
                break;
            }
        }
        turns
    }

    /// Run a future to completion, driving spawned tasks alongside it
    pub fn block_on<F>(&self, future: F) -> F::Output
    where
        F: Future,
    {
        let mut future = pin!(future);

        // Waker that flags the root future and unparks the current thread
        struct Parker {
            thread: std::thread::Thread,
            notified: AtomicBool,
        }
        impl futures::task::ArcWake for Parker {
            fn wake_by_ref(arc_self: &Arc<Self>) {
                arc_self.notified.store(true, Ordering::SeqCst);
                arc_self.thread.unpark();
            }
        }
        let parker = Arc::new(Parker {
            thread: std::thread::current(),
            notified: AtomicBool::new(true),
        });
        let waker = futures::task::waker(parker.clone());
        let mut context = Context::from_waker(&waker);

        loop {
            if parker.notified.swap(false, Ordering::SeqCst) {
                let _context = runtime_context::enter(self.handle());
                if let Poll::Ready(output) = future.as_mut().poll(&mut context) {
                    return output;
                }
            }

            if !self.tick() && !parker.notified.load(Ordering::SeqCst) {
                std::thread::park_timeout(Duration::from_millis(IDLE_PARK_MS));
            }
        }
    }

    /// Get the number of live tasks
    pub fn task_count(&self) -> usize {
        self.shared.tasks().len()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
