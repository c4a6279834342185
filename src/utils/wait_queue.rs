//! A minimal blocking wait queue.
//!
//! Waiters park themselves with the block-with-lock primitive: the queue's
//! own lock is released only *after* the waiter is fully switched out, so
//! a waker can never observe a half-suspended task. Wakeups are
//! single-wake; a lost wakeup is prevented by evaluating the caller's
//! "should I still block" condition under both locks.
//!
//! Lock order is scheduler lock, then queue lock, on every path.

use core::cell::UnsafeCell;

use crate::scheduler;
use crate::task::{TaskList, TaskRef, TaskState};
use crate::utils::locks::TicketSpinLock;

pub struct WaitQueue {
    lock: TicketSpinLock,
    /// Guarded by `lock`.
    waiters: UnsafeCell<TaskList>,
}

unsafe impl Send for WaitQueue {}
unsafe impl Sync for WaitQueue {}

impl WaitQueue {
    pub const fn new() -> Self {
        Self {
            lock: TicketSpinLock::new(),
            waiters: UnsafeCell::new(TaskList::new()),
        }
    }

    /// Blocks the current task until the next wake.
    pub fn wait(&self, current: TaskRef) {
        self.wait_if(current, || true);
    }

    /// Blocks the current task unless `should_block` says otherwise once
    /// both locks are held. Returns whether the task actually blocked.
    pub fn wait_if(&self, current: TaskRef, should_block: impl FnOnce() -> bool) -> bool {
        scheduler::lock_scheduler(current);
        self.lock.lock(current);

        if !should_block() {
            self.lock.unlock(current);
            scheduler::unlock_scheduler(current);
            return false;
        }

        unsafe {
            (*self.waiters.get()).push_back(current);
        }
        // releases `self.lock` after the switch; resumes holding the
        // scheduler lock
        scheduler::block_current_and_unlock(current, &self.lock);
        scheduler::unlock_scheduler(current);
        true
    }

    /// Wakes the longest-waiting task, if any.
    pub fn wake_one(&self, current: TaskRef) -> bool {
        scheduler::lock_scheduler(current);
        let woke = self.wake_one_locked(current);
        scheduler::unlock_scheduler(current);
        woke
    }

    /// Wakes every waiting task.
    #[allow(unused)]
    pub fn wake_all(&self, current: TaskRef) -> usize {
        scheduler::lock_scheduler(current);
        let mut woken = 0;
        while self.wake_one_locked(current) {
            woken += 1;
        }
        scheduler::unlock_scheduler(current);
        woken
    }

    /// Like [`Self::wake_one`] for callers that already hold the scheduler
    /// lock.
    pub(crate) fn wake_one_locked(&self, current: TaskRef) -> bool {
        self.lock.lock(current);
        let task = unsafe { (*self.waiters.get()).pop_front() };
        self.lock.unlock(current);

        let Some(task) = task else {
            return false;
        };
        unsafe {
            debug_assert!(matches!(task.state(), TaskState::Blocked));
            task.set_state(TaskState::Ready);
        }
        scheduler::queue_task(current, task);
        true
    }

    /// Parks an already-`Blocked` task on the waiter list without switching
    /// anything: bring-up uses this to create a service blocked on its
    /// queue before the service ever ran.
    pub(crate) fn enqueue_blocked(&self, current: TaskRef, task: TaskRef) {
        self.lock.lock(current);
        unsafe {
            debug_assert!(matches!(task.state(), TaskState::Blocked));
            (*self.waiters.get()).push_back(task);
        }
        self.lock.unlock(current);
    }
}
