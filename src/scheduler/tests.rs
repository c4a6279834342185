use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

use super::*;
use crate::executor;
use crate::task::{self, KernelTaskArgs, TaskRef, TaskState};
use crate::utils::wait_queue::WaitQueue;

fn spawn(name: &str, entry: task::TaskEntry, arg1: usize, arg2: usize) -> TaskRef {
    let current = task::current();
    let child = task::create_kernel(
        current,
        KernelTaskArgs {
            name,
            entry,
            arg1,
            arg2,
        },
    )
    .unwrap();
    lock_scheduler(current);
    queue_task(current, child);
    unlock_scheduler(current);
    child
}

/// Yields until `cond` holds, with a generous bound so a broken scheduler
/// fails the test instead of wedging it.
fn yield_until(current: TaskRef, mut cond: impl FnMut() -> bool) {
    let mut spins = 0usize;
    while !cond() {
        lock_scheduler(current);
        yield_now(current);
        unlock_scheduler(current);
        spins += 1;
        assert!(spins < 1_000_000, "condition never became true");
    }
}

fn state_of(current: TaskRef, task: TaskRef) -> TaskState {
    lock_scheduler(current);
    let state = unsafe { task.state() };
    unlock_scheduler(current);
    state
}

#[test_case]
fn current_task_is_running_here() {
    let current = task::current();
    let exec = executor::current();
    assert_eq!(
        state_of(current, current),
        TaskState::Running(NonNull::from(exec))
    );
}

static PING: AtomicUsize = AtomicUsize::new(0);

extern "C" fn ping_main(_task: TaskRef, token: usize, _: usize) {
    PING.store(token, Ordering::Release);
}

#[test_case]
fn spawned_task_runs_and_is_reaped() {
    let current = task::current();
    let tasks_before = task::kernel_task_count();

    spawn("test-ping", ping_main, 42, 0);
    yield_until(current, || PING.load(Ordering::Acquire) == 42);

    // the task returned from its entry: cleanup destroys it
    yield_until(current, || task::kernel_task_count() == tasks_before);
}

#[test_case]
fn preemption_suppressed_while_disabled() {
    let current = task::current();
    let ready_before = ready_task_count();

    current.increment_preemption_disable();
    maybe_preempt(current);

    // no preemption happened: the queue is untouched and the skip is
    // recorded
    assert!(current.preemption_skipped());
    assert_eq!(ready_task_count(), ready_before);
    assert!(matches!(
        state_of(current, current),
        TaskState::Running(_)
    ));

    // re-enabling delivers the skipped preemption
    current.decrement_preemption_disable();
    assert!(!current.preemption_skipped());
    assert_eq!(current.preemption_disable_count(), 0);
}

extern "C" fn exit_immediately_main(_task: TaskRef, _: usize, _: usize) {}

#[test_case]
fn drop_while_referenced_defers_destruction() {
    let current = task::current();
    let tasks_before = task::kernel_task_count();

    let child = spawn("test-held", exit_immediately_main, 0, 0);
    child.increment_reference_count();

    // let the child run to completion
    yield_until(current, || {
        matches!(state_of(current, child), TaskState::Dropped { .. })
    });

    // it is in cleanup custody but must survive while we hold a reference
    for _ in 0..64 {
        lock_scheduler(current);
        yield_now(current);
        unlock_scheduler(current);
    }
    assert_eq!(task::kernel_task_count(), tasks_before + 1);
    assert_eq!(child.reference_count(), 1);

    // dropping the last reference lets the destructor run exactly once
    child.decrement_reference_count(current);
    yield_until(current, || task::kernel_task_count() == tasks_before);
}

static SLEEP_WQ: WaitQueue = WaitQueue::new();
static WOKE: AtomicUsize = AtomicUsize::new(0);

extern "C" fn sleeper_main(task: TaskRef, _: usize, _: usize) {
    SLEEP_WQ.wait(task);
    WOKE.fetch_add(1, Ordering::Release);
}

#[test_case]
fn block_and_wake() {
    let current = task::current();
    let tasks_before = task::kernel_task_count();
    let woke_before = WOKE.load(Ordering::Acquire);

    let child = spawn("test-sleeper", sleeper_main, 0, 0);
    yield_until(current, || {
        matches!(state_of(current, child), TaskState::Blocked)
    });

    assert!(SLEEP_WQ.wake_one(current));
    yield_until(current, || WOKE.load(Ordering::Acquire) == woke_before + 1);
    yield_until(current, || task::kernel_task_count() == tasks_before);
}

#[test_case]
fn yield_with_empty_queue_returns() {
    let current = task::current();
    // with nothing else ready this must simply come back
    lock_scheduler(current);
    if ready_task_count() == 0 {
        yield_now(current);
    }
    unlock_scheduler(current);
}
