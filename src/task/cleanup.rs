//! The task cleanup service.
//!
//! Dropped tasks cannot destroy themselves (their stack is live until the
//! moment they are switched out), so the drop path hands them to a
//! dedicated kernel task through a lock-free inbox. The service destroys a
//! task once two things are true: its state is `Dropped` and its reference
//! count has reached zero. Tasks that are dropped but still referenced
//! wait on an internal list until the last reference goes away, which
//! nudges the service again (single-wake discipline).

use alloc::vec::Vec;

use super::{KernelTaskArgs, Task, TaskRef, TaskState};
use crate::scheduler;
use crate::utils::lifo::AtomicLifo;
use crate::utils::wait_queue::WaitQueue;

static CLEANUP_INBOX: AtomicLifo = AtomicLifo::new();
static CLEANUP_WAIT_QUEUE: WaitQueue = WaitQueue::new();

/// Creates the cleanup service task, parked blocked on its wait queue
/// until the first submission. Stage-1 only.
pub(crate) fn init(current: TaskRef) {
    let task = super::create_kernel(
        current,
        KernelTaskArgs {
            name: "task-cleanup",
            entry: cleanup_main,
            arg1: 0,
            arg2: 0,
        },
    )
    .expect("failed to create the task cleanup service");

    scheduler::lock_scheduler(current);
    unsafe { task.set_state(TaskState::Blocked) };
    CLEANUP_WAIT_QUEUE.enqueue_blocked(current, task);
    scheduler::unlock_scheduler(current);
}

/// Hands a freshly dropped task to the service. Called from the drop
/// deferred action, under the scheduler lock, on the scheduler task.
pub(crate) fn submit(current: TaskRef, task: TaskRef) {
    unsafe {
        CLEANUP_INBOX.push(task.cleanup_link());
    }
    CLEANUP_WAIT_QUEUE.wake_one_locked(current);
}

/// The last reference to `task` went away. If the task is already in the
/// service's custody, nudge it so the destructor finally runs.
pub(crate) fn on_refcount_zero(current: TaskRef, task: TaskRef) {
    scheduler::lock_scheduler(current);
    let in_custody = matches!(
        unsafe { task.state() },
        TaskState::Dropped {
            queued_for_cleanup: true
        }
    );
    if in_custody {
        CLEANUP_WAIT_QUEUE.wake_one_locked(current);
    }
    scheduler::unlock_scheduler(current);
}

extern "C" fn cleanup_main(current: TaskRef, _: usize, _: usize) {
    let mut awaiting: Vec<TaskRef> = Vec::new();

    loop {
        while let Some(link) = CLEANUP_INBOX.pop() {
            let task = Task::from_cleanup_link(link);
            // consume the creation reference now that the task is dead
            if task.refcount_release() == 1 {
                unsafe { super::destroy(current, task) };
            } else {
                awaiting.push(task);
            }
        }

        awaiting.retain(|task| {
            if task.reference_count() == 0 {
                unsafe { super::destroy(current, *task) };
                false
            } else {
                true
            }
        });

        let inbox_empty = || CLEANUP_INBOX.is_empty();
        let nothing_destroyable =
            |list: &Vec<TaskRef>| !list.iter().any(|task| task.reference_count() == 0);
        CLEANUP_WAIT_QUEUE.wait_if(current, || inbox_empty() && nothing_destroyable(&awaiting));
    }
}
