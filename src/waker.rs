//! Task waker
//!
//! Waking a task pushes its id back onto the scheduler's ready queue, so it
//! is polled again on the next turn.

use std::sync::Arc;
use std::task::Waker;

use crossbeam_queue::SegQueue;
use futures::task::ArcWake;

use crate::task::TaskId;

/// Waker implementation that can reschedule tasks
pub struct TaskWaker {
    task_id: TaskId,
    queue: Arc<SegQueue<TaskId>>,
}

impl TaskWaker {
    /// Create a new waker for the given task
    pub fn new(task_id: TaskId, queue: Arc<SegQueue<TaskId>>) -> Waker {
        futures::task::waker(Arc::new(TaskWaker { task_id, queue }))
    }
}

impl ArcWake for TaskWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.queue.push(arc_self.task_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> Arc<SegQueue<TaskId>> {
        Arc::new(SegQueue::new())
    }

    #[test]
    fn test_clone_outlives_original() {
        let queue = queue();
        let waker = TaskWaker::new(TaskId(7), queue.clone());
        let clone = waker.clone();
        drop(waker);

        clone.wake();
        assert_eq!(queue.pop(), Some(TaskId(7)));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_will_wake_tracks_allocation() {
        let queue = queue();
        let waker = TaskWaker::new(TaskId(1), queue.clone());
        let other = TaskWaker::new(TaskId(1), queue.clone());

        assert!(waker.will_wake(&waker.clone()));
        // Same task, distinct allocation
        assert!(!waker.will_wake(&other));
    }

    #[test]
    fn test_dropping_wakers_does_not_schedule() {
        let queue = queue();
        let waker = TaskWaker::new(TaskId(3), queue.clone());
        drop(waker.clone());
        drop(waker);

        assert!(queue.is_empty());
        // Only the test's own reference to the queue remains
        assert_eq!(Arc::strong_count(&queue), 1);
    }

    #[test]
    fn test_wakes_from_another_thread() {
        let queue = queue();
        let waker = TaskWaker::new(TaskId(11), queue.clone());

        std::thread::spawn(move || waker.wake())
            .join()
            .unwrap();

        assert_eq!(queue.pop(), Some(TaskId(11)));
    }
}
