//! Per-processor executor records.
//!
//! One [`Executor`] exists per logical CPU for the lifetime of the kernel.
//! The record owns the processor's scheduler task (the trampoline/idle
//! context), tracks which task is running, and carries the inbox for
//! cross-executor TLB-flush requests. The architecture layer keeps a
//! pointer to the current CPU's executor in a per-CPU register.

pub mod flush;

use core::cell::{SyncUnsafeCell, UnsafeCell};
use core::fmt::Write as _;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::arch::threading::{self, ArchExecutor};
use crate::task::{Task, TaskRef, stack::Stack};
use crate::utils::Name;
use crate::utils::lifo::AtomicLifo;

/// Compile-time ceiling on the number of executors.
pub const MAX_EXECUTORS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorId(u32);

impl ExecutorId {
    pub const BOOTSTRAP: Self = Self(0);
    pub const NONE_RAW: u32 = u32::MAX;

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(&self) -> u32 {
        self.0
    }

    pub const fn is_bootstrap(&self) -> bool {
        self.0 == 0
    }
}

impl core::fmt::Display for ExecutorId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.is_bootstrap() {
            write!(f, "bootstrap")
        } else {
            write!(f, "executor-{}", self.0)
        }
    }
}

pub struct Executor {
    arch: ArchExecutor,
    id: ExecutorId,
    /// Local APIC id, the IPI destination for this executor.
    arch_id: u32,

    /// Invariant: whenever this executor executes a task, that task's state
    /// is `Running(self)`. Written only by this executor, under the
    /// scheduler lock.
    current_task: UnsafeCell<Option<TaskRef>>,
    /// The trampoline/idle context. Never queued, never in the task set.
    scheduler_task: Task,
    /// The bring-up task this executor starts on.
    init_task: UnsafeCell<Option<TaskRef>>,

    pub(crate) flush_requests: AtomicLifo,
    /// Set once this executor services IPIs (it has reached the scheduler).
    online: AtomicBool,
    panicked: AtomicBool,

    context_switches: AtomicUsize,
    idle_entries: AtomicUsize,
}

unsafe impl Send for Executor {}
unsafe impl Sync for Executor {}

impl Executor {
    pub(crate) fn new(id: ExecutorId, arch_id: u32, scheduler_stack: Stack) -> Self {
        let mut name = Name::new();
        let _ = write!(name, "scheduler-{}", id.raw());

        Self {
            arch: ArchExecutor::new(),
            id,
            arch_id,
            current_task: UnsafeCell::new(None),
            scheduler_task: Task::new(name.as_str(), scheduler_stack, true),
            init_task: UnsafeCell::new(None),
            flush_requests: AtomicLifo::new(),
            online: AtomicBool::new(false),
            panicked: AtomicBool::new(false),
            context_switches: AtomicUsize::new(0),
            idle_entries: AtomicUsize::new(0),
        }
    }

    pub const fn id(&self) -> ExecutorId {
        self.id
    }

    pub const fn arch_id(&self) -> u32 {
        self.arch_id
    }

    pub(crate) const fn arch(&self) -> &ArchExecutor {
        &self.arch
    }

    /// The task this executor is executing.
    pub fn current_task(&self) -> TaskRef {
        unsafe { *self.current_task.get() }.expect("executor has no current task yet")
    }

    /// # Safety
    /// Scheduler only, under the scheduler lock, on the executing CPU.
    pub(crate) unsafe fn set_current_task(&self, task: TaskRef) {
        unsafe { *self.current_task.get() = Some(task) }
    }

    pub fn scheduler_task(&self) -> TaskRef {
        TaskRef::of(&self.scheduler_task)
    }

    pub(crate) fn set_init_task(&self, task: TaskRef) {
        unsafe { *self.init_task.get() = Some(task) }
    }

    pub(crate) fn init_task(&self) -> TaskRef {
        unsafe { *self.init_task.get() }.expect("executor has no init task")
    }

    pub(crate) fn set_online(&self) {
        self.online.store(true, Ordering::Release);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    pub fn mark_panicked(&self) {
        self.panicked.store(true, Ordering::SeqCst);
    }

    pub fn has_panicked(&self) -> bool {
        self.panicked.load(Ordering::SeqCst)
    }

    pub(crate) fn bump_context_switches(&self) {
        self.context_switches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn context_switches(&self) -> usize {
        self.context_switches.load(Ordering::Relaxed)
    }

    pub(crate) fn note_idle(&self) {
        self.idle_entries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn idle_entries(&self) -> usize {
        self.idle_entries.load(Ordering::Relaxed)
    }
}

impl core::fmt::Debug for Executor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Executor")
            .field("id", &self.id)
            .field("arch_id", &self.arch_id)
            .finish_non_exhaustive()
    }
}

/// All executors, in executor-id order. Installed once during stage 1 and
/// never torn down.
static EXECUTORS: SyncUnsafeCell<&'static [Executor]> = SyncUnsafeCell::new(&[]);

pub(crate) unsafe fn install_all(executors: &'static [Executor]) {
    unsafe { *EXECUTORS.get() = executors }
}

pub fn all() -> &'static [Executor] {
    unsafe { *EXECUTORS.get() }
}

/// The executor of the calling CPU.
#[inline(always)]
pub fn current() -> &'static Executor {
    threading::current_executor()
}

/// Like [`current`], for contexts that may run before the per-CPU register
/// is loaded (early panic paths).
pub fn try_current() -> Option<&'static Executor> {
    threading::try_current_executor()
}
