//! The schedulable unit.
//!
//! A [`Task`] owns a guard-paged kernel stack, a manual reference count and
//! the interrupt/preemption accounting of §"current task". Task objects
//! come from [`TASK_CACHE`] and go back to it through the cleanup service
//! once dropped and unreferenced.
//!
//! Field access rules (the `UnsafeCell`s below):
//! - `state` and `next_task_node` are read and written under the scheduler
//!   lock only.
//! - the interrupt/preemption counters and `spinlocks_held` belong to the
//!   task itself: only code executing *as* this task (or the scheduler
//!   mid-switch, when the task provably isn't running) touches them.
//! - `stack` is owned by the task; the scheduler pokes the saved stack
//!   pointer during a switch.

pub mod cleanup;
pub mod stack;

use core::cell::UnsafeCell;
use core::fmt::Debug;
use core::mem::{MaybeUninit, offset_of};
use core::ops::Deref;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, Ordering};

use hashbrown::HashSet;
use lazy_static::lazy_static;

use crate::arch;
use crate::executor::Executor;
use crate::memory::cache::{CacheError, ObjectCache};
use crate::utils::Name;
use crate::utils::lifo::LifoLink;
use crate::utils::locks::RwLock;
use stack::Stack;

/// The function a kernel task starts in. Returning from it drops the task.
pub type TaskEntry = extern "C" fn(TaskRef, usize, usize);

/// A shared, unowned reference to a task. Tasks have stable addresses (cache
/// slots or static storage) and kernel-long lifetimes managed by the
/// reference count, so a plain pointer wrapper is the honest representation.
#[derive(Clone, Copy)]
pub struct TaskRef(NonNull<Task>);

unsafe impl Send for TaskRef {}
unsafe impl Sync for TaskRef {}

impl PartialEq for TaskRef {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl Eq for TaskRef {}

impl Deref for TaskRef {
    type Target = Task;
    fn deref(&self) -> &Self::Target {
        unsafe { self.0.as_ref() }
    }
}

impl Debug for TaskRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "TaskRef({:p}, {})", self.0, self.name())
    }
}

impl TaskRef {
    pub fn as_ptr(&self) -> *const Task {
        self.0.as_ptr()
    }

    pub(crate) fn of(task: &Task) -> Self {
        Self(NonNull::from(task))
    }

    pub(crate) unsafe fn from_raw(ptr: NonNull<Task>) -> Self {
        Self(ptr)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Runnable; on the ready queue unless mid-handoff.
    Ready,
    /// Executing on the given executor.
    Running(NonNull<Executor>),
    /// Waiting for an explicit wake.
    Blocked,
    /// Finished; awaiting destruction by the cleanup service.
    Dropped { queued_for_cleanup: bool },
}

/// What kind of thing the task executes. Kernel-only today; the variant
/// leaves room for a user context later.
#[derive(Debug)]
pub enum TaskContext {
    Kernel { name: Name, is_idle: bool },
}

pub struct Task {
    state: UnsafeCell<TaskState>,
    refcount: AtomicU32,
    stack: UnsafeCell<Stack>,

    interrupt_disable_count: UnsafeCell<u32>,
    preemption_disable_count: UnsafeCell<u32>,
    preemption_skipped: UnsafeCell<bool>,
    spinlocks_held: UnsafeCell<u32>,

    /// Intrusive link for the ready queue and wait-queue waiter lists.
    next_task_node: UnsafeCell<Option<TaskRef>>,
    /// Intrusive link for the cleanup inbox.
    cleanup_link: LifoLink,

    context: UnsafeCell<TaskContext>,
}

unsafe impl Send for Task {}
unsafe impl Sync for Task {}

impl Task {
    /// A fresh task record over `stack`. Born `Ready` with one reference,
    /// no spinlocks and interrupts accounted as disabled (boot and fresh
    /// tasks both start that way).
    pub(crate) fn new(name: &str, stack: Stack, is_idle: bool) -> Self {
        Self {
            state: UnsafeCell::new(TaskState::Ready),
            refcount: AtomicU32::new(1),
            stack: UnsafeCell::new(stack),
            interrupt_disable_count: UnsafeCell::new(1),
            preemption_disable_count: UnsafeCell::new(0),
            preemption_skipped: UnsafeCell::new(false),
            spinlocks_held: UnsafeCell::new(0),
            next_task_node: UnsafeCell::new(None),
            cleanup_link: LifoLink::new(),
            context: UnsafeCell::new(TaskContext::Kernel {
                name: Name::try_from(name).expect("task name too long"),
                is_idle,
            }),
        }
    }

    pub fn name(&self) -> Name {
        let TaskContext::Kernel { name, .. } = unsafe { &*self.context.get() };
        name.clone()
    }

    /// Whether this is an executor's scheduler task (the idle/trampoline
    /// context). Scheduler tasks are never queued.
    pub fn is_scheduler_task(&self) -> bool {
        let TaskContext::Kernel { is_idle, .. } = unsafe { &*self.context.get() };
        *is_idle
    }

    // ---- state (scheduler lock) ----

    /// # Safety
    /// Caller must hold the scheduler lock.
    pub(crate) unsafe fn state(&self) -> TaskState {
        unsafe { *self.state.get() }
    }

    /// # Safety
    /// Caller must hold the scheduler lock, and must not mutate the state
    /// of a task whose stack is still in use (that is what deferred
    /// actions are for).
    pub(crate) unsafe fn set_state(&self, state: TaskState) {
        unsafe { *self.state.get() = state }
    }

    // ---- reference counting ----

    pub fn increment_reference_count(&self) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    /// Drops one reference; at zero the cleanup service is nudged so it can
    /// destroy the task once it is also `Dropped`.
    pub fn decrement_reference_count(&self, current: TaskRef) {
        if self.refcount.fetch_sub(1, Ordering::AcqRel) == 1 {
            cleanup::on_refcount_zero(current, TaskRef::of(self));
        }
    }

    pub fn reference_count(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }

    /// Raw decrement for the cleanup service, which must not recurse into
    /// its own wakeup. Returns the previous count.
    pub(crate) fn refcount_release(&self) -> u32 {
        self.refcount.fetch_sub(1, Ordering::AcqRel)
    }

    pub(crate) fn refcount_reset(&self) {
        self.refcount.store(1, Ordering::Release);
    }

    // ---- interrupt accounting (§ spec 4.6) ----

    pub fn increment_interrupt_disable(&self) {
        let count = unsafe { &mut *self.interrupt_disable_count.get() };
        if *count == 0 {
            debug_assert!(
                arch::interrupts_enabled(),
                "interrupt-disable count is 0 but interrupts are off"
            );
            unsafe { arch::disable_interrupts() };
            *count = 1;
        } else {
            debug_assert!(!arch::interrupts_enabled());
            *count += 1;
        }
    }

    pub fn decrement_interrupt_disable(&self) {
        let count = unsafe { &mut *self.interrupt_disable_count.get() };
        debug_assert!(*count > 0, "unbalanced interrupt-disable decrement");
        *count -= 1;
        if *count == 0 {
            unsafe { arch::enable_interrupts() };
        }
    }

    pub(crate) fn interrupt_disable_count(&self) -> u32 {
        unsafe { *self.interrupt_disable_count.get() }
    }

    /// # Safety
    /// Only the scheduler may rewrite the counter, for a task that is not
    /// running.
    pub(crate) unsafe fn interrupt_disable_set(&self, count: u32) {
        unsafe { *self.interrupt_disable_count.get() = count }
    }

    // ---- preemption accounting ----

    pub fn increment_preemption_disable(&self) {
        let count = unsafe { &mut *self.preemption_disable_count.get() };
        *count += 1;
    }

    /// On the 1 -> 0 transition a preemption that was suppressed in the
    /// meantime is delivered.
    pub fn decrement_preemption_disable(&self) {
        let count = unsafe { &mut *self.preemption_disable_count.get() };
        debug_assert!(*count > 0, "unbalanced preemption-disable decrement");
        *count -= 1;
        if *count == 0 && self.preemption_skipped() {
            crate::scheduler::maybe_preempt(TaskRef::of(self));
        }
    }

    pub fn preemption_disable_count(&self) -> u32 {
        unsafe { *self.preemption_disable_count.get() }
    }

    pub fn preemption_skipped(&self) -> bool {
        unsafe { *self.preemption_skipped.get() }
    }

    pub(crate) fn set_preemption_skipped(&self, skipped: bool) {
        unsafe { *self.preemption_skipped.get() = skipped }
    }

    // ---- spinlock accounting ----

    pub fn spinlocks_held(&self) -> u32 {
        unsafe { *self.spinlocks_held.get() }
    }

    /// # Safety
    /// Callers are the lock implementation and the scheduler's ownership
    /// migration; books must stay consistent with actually held locks.
    pub(crate) unsafe fn spinlocks_inc(&self) {
        unsafe { *self.spinlocks_held.get() += 1 }
    }

    /// # Safety
    /// See [`Self::spinlocks_inc`].
    pub(crate) unsafe fn spinlocks_dec(&self) {
        let count = unsafe { &mut *self.spinlocks_held.get() };
        debug_assert!(*count > 0, "unbalanced spinlock release");
        *count -= 1;
    }

    /// # Safety
    /// See [`Self::spinlocks_inc`].
    pub(crate) unsafe fn spinlocks_set(&self, count: u32) {
        unsafe { *self.spinlocks_held.get() = count }
    }

    // ---- interrupt entry ----

    /// Called by the architecture layer on every interrupt entry. Returns
    /// the interrupted task and a restorer that rewinds the accounting on
    /// exit, so handlers observe a consistent "interrupts disabled" context
    /// independent of nesting.
    pub fn on_interrupt_entry() -> (TaskRef, InterruptRestorer) {
        debug_assert!(!arch::interrupts_enabled());
        let current = crate::executor::current().current_task();
        let entered = current.interrupt_disable_count();
        unsafe { current.interrupt_disable_set(entered + 1) };
        (current, InterruptRestorer { entered })
    }

    // ---- stack ----

    /// # Safety
    /// Only the task itself, or the scheduler while the task is not
    /// running.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn stack_mut(&self) -> &mut Stack {
        unsafe { &mut *self.stack.get() }
    }

    pub(crate) fn stack_sp_slot(&self) -> *mut usize {
        unsafe { self.stack_mut().stack_pointer_slot() }
    }

    pub(crate) fn stack_sp(&self) -> usize {
        unsafe { self.stack_mut() }.stack_pointer().into_raw()
    }

    // ---- intrusive links ----

    /// # Safety
    /// Caller must hold the lock of the list the node is on (scheduler
    /// lock for the ready queue, the wait queue's lock for waiter lists).
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn next_task_node(&self) -> &mut Option<TaskRef> {
        unsafe { &mut *self.next_task_node.get() }
    }

    pub(crate) fn cleanup_link(&self) -> NonNull<LifoLink> {
        NonNull::from(&self.cleanup_link)
    }

    /// Recovers the task from its cleanup link.
    pub(crate) fn from_cleanup_link(link: NonNull<LifoLink>) -> TaskRef {
        let addr = link.as_ptr() as usize - offset_of!(Task, cleanup_link);
        unsafe { TaskRef::from_raw(NonNull::new_unchecked(addr as *mut Task)) }
    }
}

impl Debug for Task {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name())
            .field("refcount", &self.reference_count())
            .finish_non_exhaustive()
    }
}

/// Rewinds the interrupt-disable count on interrupt exit.
#[must_use]
pub struct InterruptRestorer {
    entered: u32,
}

impl InterruptRestorer {
    pub fn restore(self, current: TaskRef) {
        unsafe { current.interrupt_disable_set(self.entered) };
    }
}

// ---- creation and destruction ----

pub struct KernelTaskArgs<'a> {
    pub name: &'a str,
    pub entry: TaskEntry,
    pub arg1: usize,
    pub arg2: usize,
}

fn task_ctor(current: TaskRef, slot: &mut MaybeUninit<Task>) -> Result<(), CacheError> {
    let stack = Stack::allocate(current).map_err(|_| CacheError::ObjectConstructionFailed)?;
    slot.write(Task::new("unnamed", stack, false));
    Ok(())
}

fn task_dtor(current: TaskRef, task: &mut Task) {
    let stack = unsafe { task.stack_mut() };
    Stack::free(current, stack);
}

pub(crate) static TASK_CACHE: ObjectCache<Task> = ObjectCache::new("task", task_ctor, task_dtor);

lazy_static! {
    /// Every kernel task that currently exists, by address. Writers only on
    /// create and destroy.
    static ref KERNEL_TASKS: RwLock<HashSet<usize>> = RwLock::new(HashSet::new());
}

pub fn kernel_task_count() -> usize {
    KERNEL_TASKS.read().len()
}

/// Creates a kernel task that will start in `args.entry`. The task is
/// `Ready` with one reference but not queued; hand it to
/// [`crate::scheduler::queue_task`].
pub fn create_kernel(current: TaskRef, args: KernelTaskArgs) -> Result<TaskRef, CacheError> {
    let task = TASK_CACHE.allocate(current)?;
    let task = unsafe { TaskRef::from_raw(task) };

    unsafe {
        task.reinitialize(args.name, false);
        // fresh tasks begin life holding the scheduler lock with
        // interrupts disabled; their first act is to release it
        task.spinlocks_set(1);
        task.interrupt_disable_set(1);

        arch::threading::prepare_new_task_frame(
            task.stack_mut(),
            task,
            args.entry as usize,
            args.arg1,
            args.arg2,
        )
        .expect("a fresh stack cannot overflow on the entry frame");
    }

    KERNEL_TASKS.write().insert(task.as_ptr() as usize);
    Ok(task)
}

/// Creates the per-executor init task: a task record that is entered by
/// jumping onto its stack during bring-up rather than through the
/// scheduler.
pub(crate) fn create_init(current: TaskRef, name: &str) -> Result<TaskRef, CacheError> {
    let task = TASK_CACHE.allocate(current)?;
    let task = unsafe { TaskRef::from_raw(task) };

    unsafe {
        task.reinitialize(name, false);
        task.stack_mut().reset();
    }

    KERNEL_TASKS.write().insert(task.as_ptr() as usize);
    Ok(task)
}

impl Task {
    /// Resets a recycled cache object for a new life.
    ///
    /// # Safety
    /// The task must not be visible to any other subsystem yet.
    unsafe fn reinitialize(&self, name: &str, is_idle: bool) {
        unsafe {
            *self.state.get() = TaskState::Ready;
            self.refcount_reset();
            *self.interrupt_disable_count.get() = 1;
            *self.preemption_disable_count.get() = 0;
            *self.preemption_skipped.get() = false;
            *self.spinlocks_held.get() = 0;
            *self.next_task_node.get() = None;
            *self.context.get() = TaskContext::Kernel {
                name: Name::try_from(name).expect("task name too long"),
                is_idle,
            };
        }
    }
}

/// Final destruction: unregister and give the object (stack and all) back
/// to the cache.
///
/// # Safety
/// `task` must be `Dropped` with a zero reference count, and must not be
/// reachable from any queue.
pub(crate) unsafe fn destroy(current: TaskRef, task: TaskRef) {
    debug_assert_eq!(task.reference_count(), 0);

    KERNEL_TASKS.write().remove(&(task.as_ptr() as usize));
    unsafe {
        TASK_CACHE.deallocate(current, NonNull::new_unchecked(task.as_ptr() as *mut Task));
    }
}

/// The task executing right now on this executor.
pub fn current() -> TaskRef {
    crate::executor::current().current_task()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn interrupt_disable_nests() {
        let current = current();
        assert_eq!(current.interrupt_disable_count(), 0);
        assert!(arch::interrupts_enabled());

        current.increment_interrupt_disable();
        assert_eq!(current.interrupt_disable_count(), 1);
        assert!(!arch::interrupts_enabled());

        current.increment_interrupt_disable();
        assert_eq!(current.interrupt_disable_count(), 2);

        current.decrement_interrupt_disable();
        assert!(!arch::interrupts_enabled());

        // only the last decrement re-enables
        current.decrement_interrupt_disable();
        assert_eq!(current.interrupt_disable_count(), 0);
        assert!(arch::interrupts_enabled());
    }

    #[test_case]
    fn interrupt_entry_restorer_rewinds() {
        let current = current();

        current.increment_interrupt_disable();
        let entered = current.interrupt_disable_count();

        let (observed, restorer) = Task::on_interrupt_entry();
        assert_eq!(observed, current);
        assert_eq!(current.interrupt_disable_count(), entered + 1);

        restorer.restore(current);
        assert_eq!(current.interrupt_disable_count(), entered);

        current.decrement_interrupt_disable();
    }

    #[test_case]
    fn preemption_counter_nests() {
        let current = current();
        assert_eq!(current.preemption_disable_count(), 0);

        current.increment_preemption_disable();
        current.increment_preemption_disable();
        assert_eq!(current.preemption_disable_count(), 2);

        current.decrement_preemption_disable();
        assert_eq!(current.preemption_disable_count(), 1);
        current.decrement_preemption_disable();
        assert_eq!(current.preemption_disable_count(), 0);
    }

    #[test_case]
    fn reference_count_tracks_holders() {
        let current = current();
        assert!(current.reference_count() >= 1);

        let before = current.reference_count();
        current.increment_reference_count();
        assert_eq!(current.reference_count(), before + 1);
        current.decrement_reference_count(current);
        assert_eq!(current.reference_count(), before);
    }

    #[test_case]
    fn current_task_is_registered() {
        let current = current();
        assert!(!current.is_scheduler_task());
        assert!(kernel_task_count() >= 1);
        assert!(current.name().len() > 0);
    }
}

/// Intrusive FIFO of tasks linked through `next_task_node`. The caller
/// provides the locking (scheduler lock or a wait queue's lock).
pub(crate) struct TaskList {
    head: Option<TaskRef>,
    tail: Option<TaskRef>,
}

impl TaskList {
    pub(crate) const fn new() -> Self {
        Self {
            head: None,
            tail: None,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// # Safety
    /// Caller holds the list's lock; `task` must not be on any list.
    pub(crate) unsafe fn push_back(&mut self, task: TaskRef) {
        unsafe {
            debug_assert!(task.next_task_node().is_none());
            match self.tail {
                Some(tail) => *tail.next_task_node() = Some(task),
                None => self.head = Some(task),
            }
        }
        self.tail = Some(task);
    }

    /// # Safety
    /// Caller holds the list's lock.
    pub(crate) unsafe fn pop_front(&mut self) -> Option<TaskRef> {
        let head = self.head?;
        unsafe {
            self.head = head.next_task_node().take();
        }
        if self.head.is_none() {
            self.tail = None;
        }
        Some(head)
    }
}
