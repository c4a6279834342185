//! The ready-queue scheduler.
//!
//! One FIFO ready queue is shared by all executors and guarded by one fair
//! ticket lock. Tasks switch between each other directly (`yield_now`),
//! and leave the CPU for good (`drop_current`) or temporarily
//! (`block_current_and_unlock`) by switching onto the executor's scheduler
//! task first: the *deferred action* then finalizes the outgoing task's
//! state on a stack that is guaranteed not to be the outgoing task's own.
//!
//! Lock-ownership bookkeeping across a switch: a task that is switched out
//! while holding the scheduler lock keeps `spinlocks_held == 1` frozen in
//! its record, and every switch-in happens under the scheduler lock, so
//! the books are consistent the moment the task resumes. The live ticket
//! itself is released exactly once per critical section, by whichever
//! context ends it (the resumed task, a fresh task's entry, or the idle
//! loop).

#[cfg(test)]
mod tests;

use core::cell::SyncUnsafeCell;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::arch;
use crate::executor::{self, Executor};
use crate::task::{self, Task, TaskList, TaskRef, TaskState, cleanup};
use crate::utils::locks::TicketSpinLock;

static SCHEDULER_LOCK: TicketSpinLock = TicketSpinLock::new();
/// Guarded by [`SCHEDULER_LOCK`].
static READY_QUEUE: SyncUnsafeCell<TaskList> = SyncUnsafeCell::new(TaskList::new());
/// Queue length mirror for lock-free peeking (idle loop, preemption).
static READY_LEN: AtomicUsize = AtomicUsize::new(0);
/// Whether the scheduler is accepting work (set at the end of stage 3
/// preparation).
static SCHEDULER_ONLINE: AtomicBool = AtomicBool::new(false);

const ACTION_DROP: usize = 0;
const ACTION_BLOCK_AND_UNLOCK: usize = 1;

#[allow(clippy::mut_from_ref)]
fn ready_queue() -> &'static mut TaskList {
    // callers hold SCHEDULER_LOCK
    unsafe { &mut *READY_QUEUE.get() }
}

pub fn lock_scheduler(current: TaskRef) {
    SCHEDULER_LOCK.lock(current);
}

pub fn unlock_scheduler(current: TaskRef) {
    SCHEDULER_LOCK.unlock(current);
}

pub(crate) fn mark_online() {
    SCHEDULER_ONLINE.store(true, Ordering::Release);
}

pub fn is_online() -> bool {
    SCHEDULER_ONLINE.load(Ordering::Acquire)
}

pub fn ready_task_count() -> usize {
    READY_LEN.load(Ordering::Relaxed)
}

/// Appends `task` to the ready queue. The scheduler lock must be held.
pub fn queue_task(current: TaskRef, task: TaskRef) {
    let _ = current;
    debug_assert!(SCHEDULER_LOCK.held_by_current_executor());
    unsafe {
        assert!(
            matches!(task.state(), TaskState::Ready),
            "queued task must be Ready"
        );
        assert!(
            !task.is_scheduler_task(),
            "scheduler tasks are never queued"
        );
        ready_queue().push_back(task);
    }
    READY_LEN.fetch_add(1, Ordering::Relaxed);
}

/// Preemption entry point, callable without the scheduler lock (it takes
/// the lock itself). With preemption disabled this only records that a
/// preemption was asked for.
pub fn maybe_preempt(current: TaskRef) {
    if current.preemption_disable_count() != 0 {
        current.set_preemption_skipped(true);
        return;
    }

    debug_assert_eq!(current.spinlocks_held(), 0);
    lock_scheduler(current);
    current.set_preemption_skipped(false);
    if READY_LEN.load(Ordering::Relaxed) != 0 {
        yield_now(current);
    }
    unlock_scheduler(current);
}

/// Voluntarily gives up the CPU to the next ready task, requeueing
/// `current` behind it. Requires the scheduler lock (and nothing else)
/// held. Returns once `current` is scheduled again; if `current` is a
/// scheduler task the switch never returns.
pub fn yield_now(current: TaskRef) {
    debug_assert!(SCHEDULER_LOCK.held_by_current_executor());
    debug_assert_eq!(
        current.spinlocks_held(),
        1,
        "yield with exactly the scheduler lock held"
    );

    let Some(next) = pop_ready() else {
        return;
    };

    let exec = executor::current();
    if current.is_scheduler_task() {
        // the idle context is abandoned; its stack is reset on next use
        unsafe { switch_from_scheduler(exec, current, next) }
    }

    unsafe {
        current.set_state(TaskState::Ready);
        ready_queue().push_back(current);
        READY_LEN.fetch_add(1, Ordering::Relaxed);

        next.set_state(TaskState::Running(NonNull::from(exec)));
        exec.set_current_task(next);
        exec.bump_context_switches();
        arch::threading::task_switch(current.stack_sp_slot(), next.stack_sp());
        // resumed: we are current again, scheduler lock held for us
    }
}

/// Ends the current task. Its state is finalized as
/// `Dropped { queued_for_cleanup: true }` on the scheduler task's stack and
/// the cleanup service takes over. Scheduler lock must be held.
pub fn drop_current(current: TaskRef) -> ! {
    switch_from_current(current, ACTION_DROP, 0);
    unreachable!("dropped task was scheduled again")
}

/// Blocks the current task, releasing `lock` only after the switch (so a
/// waker that acquires `lock` cannot observe the task before it is fully
/// off-CPU). The scheduler lock must be held on top of `lock`; it is held
/// again when this returns.
pub fn block_current_and_unlock(current: TaskRef, lock: &TicketSpinLock) {
    debug_assert!(
        current.spinlocks_held() == 2,
        "block with the scheduler lock and the lock being released"
    );
    switch_from_current(current, ACTION_BLOCK_AND_UNLOCK, lock as *const _ as usize);
}

/// Best-effort yield used by spin loops that may run before the scheduler
/// exists.
pub fn try_yield_now() {
    if !is_online() {
        return;
    }
    let Some(exec) = executor::try_current() else {
        return;
    };
    let current = exec.current_task();
    if current.spinlocks_held() != 0 || READY_LEN.load(Ordering::Relaxed) == 0 {
        return;
    }
    lock_scheduler(current);
    if READY_LEN.load(Ordering::Relaxed) != 0 {
        yield_now(current);
    }
    unlock_scheduler(current);
}

fn pop_ready() -> Option<TaskRef> {
    let task = unsafe { ready_queue().pop_front() };
    if task.is_some() {
        READY_LEN.fetch_sub(1, Ordering::Relaxed);
    }
    task
}

/// Switches off `current` and runs the deferred action on the scheduler
/// task's stack. Returns when (and if) `current` is scheduled again.
fn switch_from_current(current: TaskRef, action: usize, payload: usize) {
    debug_assert!(SCHEDULER_LOCK.held_by_current_executor());

    let exec = executor::current();
    let scheduler_task = exec.scheduler_task();
    debug_assert!(current != scheduler_task, "scheduler task cannot leave");

    unsafe {
        scheduler_task.set_state(TaskState::Running(NonNull::from(exec)));
        exec.set_current_task(scheduler_task);

        // the scheduler stack is not resumed, it is re-entered fresh
        let scheduler_sp = scheduler_task.stack_mut().top().into_raw();
        arch::threading::task_switch_and_call(
            current.stack_sp_slot(),
            scheduler_sp,
            deferred_entry as usize,
            current.as_ptr() as usize,
            action,
            payload,
        );
    }
}

/// Runs on the scheduler task's stack, with the scheduler lock held, after
/// `old` has been switched out. Finalizes `old`'s state (its own stack is
/// guaranteed unused now) and hands the CPU to the next ready task.
extern "C" fn deferred_entry(old: usize, action: usize, payload: usize) -> ! {
    let old = unsafe { TaskRef::from_raw(NonNull::new_unchecked(old as *mut Task)) };
    let exec = executor::current();
    let scheduler_task = exec.scheduler_task();

    unsafe {
        // scheduler-lock ownership migrates from `old` to the scheduler
        // task for the duration of this trampoline
        scheduler_task.spinlocks_set(1);
        scheduler_task.interrupt_disable_set(1);

        match action {
            ACTION_DROP => {
                old.set_state(TaskState::Dropped {
                    queued_for_cleanup: true,
                });
                old.spinlocks_set(0);
                cleanup::submit(scheduler_task, old);
            }
            ACTION_BLOCK_AND_UNLOCK => {
                old.set_state(TaskState::Blocked);
                let lock = &*(payload as *const TicketSpinLock);
                // release on old's behalf: raw ticket release plus its
                // books, without touching the interrupt flag
                lock.unlock_raw();
                old.spinlocks_dec();
                old.interrupt_disable_set(old.interrupt_disable_count() - 1);
            }
            _ => unreachable!("unknown deferred action"),
        }
    }

    reschedule(exec, scheduler_task)
}

/// The scheduler task's main loop: run the next ready task, or idle.
/// Entered with the scheduler lock held by the scheduler task.
fn reschedule(exec: &'static Executor, scheduler_task: TaskRef) -> ! {
    loop {
        if let Some(next) = pop_ready() {
            unsafe { switch_from_scheduler(exec, scheduler_task, next) }
        }

        exec.note_idle();
        unlock_scheduler(scheduler_task);
        // interrupts are on here: the tick (or a flush IPI) wakes us
        while READY_LEN.load(Ordering::Relaxed) == 0 {
            unsafe { arch::hlt() };
        }
        lock_scheduler(scheduler_task);
    }
}

/// Hands the CPU from the scheduler task to `next`. The scheduler lock is
/// passed along: `next` resumes believing it holds it (its frozen books
/// say so), and the scheduler task's claim is zeroed.
unsafe fn switch_from_scheduler(exec: &'static Executor, scheduler_task: TaskRef, next: TaskRef) -> ! {
    unsafe {
        scheduler_task.set_state(TaskState::Ready);
        scheduler_task.spinlocks_set(0);
        scheduler_task.interrupt_disable_set(0);

        next.set_state(TaskState::Running(NonNull::from(exec)));
        exec.set_current_task(next);
        exec.bump_context_switches();
        arch::threading::jump_to_task(next.stack_sp())
    }
}

/// Landing pad of every fresh task, reached through the frame forged by
/// `prepare_new_task_frame`. Fresh tasks are born holding the scheduler
/// lock; releasing it is their first act.
#[unsafe(no_mangle)]
pub extern "C" fn new_task_entry(task: *const Task, f: usize, a1: usize, a2: usize) -> ! {
    let task = unsafe { TaskRef::from_raw(NonNull::new_unchecked(task as *mut Task)) };

    unlock_scheduler(task);

    let entry: task::TaskEntry = unsafe { core::mem::transmute(f) };
    entry(task, a1, a2);

    // the task body returned: drop ourselves
    lock_scheduler(task);
    drop_current(task)
}
