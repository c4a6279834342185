//! Kernel bring-up.
//!
//! Stage 1 runs once, on the bootstrap CPU: it builds the memory stack
//! (frame list -> core page table -> arenas -> heap -> caches), the
//! executor array and every per-executor init and scheduler task, then
//! releases the secondaries. Stage 2 runs on each secondary as it lands.
//! Stage 3 is the rendezvous after which all work flows through the
//! scheduler; stage 4 is an ordinary queued task doing late
//! initialization.

use core::cell::SyncUnsafeCell;
use core::fmt::Write as _;
use core::mem::MaybeUninit;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use alloc::vec::Vec;
use limine::mp::Cpu;

use crate::arch;
use crate::boot;
use crate::executor::{self, Executor, ExecutorId, MAX_EXECUTORS};
use crate::memory::{frame_list, heap, layout, paging};
use crate::scheduler;
use crate::task::{
    self, KernelTaskArgs, Task, TaskRef, TaskState, cleanup,
    stack::{self, Stack},
};
use crate::utils::Name;
use crate::{VirtAddr, info};
use crate::memory::VirtRange;

/// Period of the per-executor scheduler tick.
pub const SCHEDULER_TICK_MS: u64 = 5;

#[repr(C, align(16))]
struct StaticStack([u8; layout::KERNEL_STACK_SIZE]);

/// The bootstrap executor runs on statically allocated stacks until the
/// real executor array exists; these never get guard pages.
static BOOTSTRAP_STACK: SyncUnsafeCell<StaticStack> =
    SyncUnsafeCell::new(StaticStack([0; layout::KERNEL_STACK_SIZE]));
static BOOTSTRAP_SCHEDULER_STACK: SyncUnsafeCell<StaticStack> =
    SyncUnsafeCell::new(StaticStack([0; layout::KERNEL_STACK_SIZE]));

static BOOTSTRAP_TASK: SyncUnsafeCell<MaybeUninit<Task>> =
    SyncUnsafeCell::new(MaybeUninit::uninit());
static BOOTSTRAP_EXECUTOR: SyncUnsafeCell<MaybeUninit<Executor>> =
    SyncUnsafeCell::new(MaybeUninit::uninit());

// stage-3 rendezvous
static NON_BOOTSTRAP_EXECUTORS_READY: AtomicU32 = AtomicU32::new(0);
static STAGE3_COMPLETE: AtomicBool = AtomicBool::new(false);

/// What each side of the stage-3 barrier observed, kept so the bring-up
/// ordering stays assertable after the fact.
pub(crate) struct BootTrace {
    /// The ready counter as the bootstrap executor saw it when it decided
    /// to complete stage 3.
    pub ready_seen_by_bootstrap: AtomicU32,
    /// Secondaries that saw `STAGE3_COMPLETE` set before dropping into the
    /// scheduler.
    pub secondaries_saw_complete: AtomicU32,
}

pub(crate) static BOOT_TRACE: BootTrace = BootTrace {
    ready_seen_by_bootstrap: AtomicU32::new(0),
    secondaries_saw_complete: AtomicU32::new(0),
};

fn static_stack(storage: &SyncUnsafeCell<StaticStack>) -> Stack {
    let base = VirtAddr::from_ptr(storage.get());
    let range = VirtRange::new(base, layout::KERNEL_STACK_SIZE);
    Stack::from_range(range, range)
}

/// Boot entry, still on the bootloader stack: get onto our own stack and
/// never look back.
pub(crate) fn stage1() -> ! {
    unsafe {
        arch::disable_interrupts();
    }
    arch::serial::init_serial();

    let top = VirtAddr::from_ptr(BOOTSTRAP_STACK.get()) + layout::KERNEL_STACK_SIZE;
    unsafe { arch::threading::call_on_stack(top.into_raw(), stage1_inner as usize, 0) }
}

extern "C" fn stage1_inner(_: usize) -> ! {
    // the static bootstrap task/executor pair carries us until the real
    // executor array exists
    let current = unsafe {
        (*BOOTSTRAP_TASK.get()).write(Task::new(
            "bootstrap",
            static_stack(&BOOTSTRAP_STACK),
            false,
        ));
        (*BOOTSTRAP_EXECUTOR.get()).write(Executor::new(
            ExecutorId::BOOTSTRAP,
            0,
            static_stack(&BOOTSTRAP_SCHEDULER_STACK),
        ));

        let task = TaskRef::of((*BOOTSTRAP_TASK.get()).assume_init_ref());
        let exec: &'static Executor = (*BOOTSTRAP_EXECUTOR.get()).assume_init_ref();

        arch::threading::install_executor(exec);
        exec.set_current_task(task);
        task.set_state(TaskState::Running(NonNull::from(exec)));
        task
    };

    info!("vesper-core booting");

    arch::init_cpu_early();
    arch::init_cpu_features();

    frame_list::init();

    unsafe {
        paging::adopt_core_page_table();
    }
    paging::map_non_cached_direct_map(current)
        .expect("failed to map the non-cached direct map");
    paging::wire_kernel_regions(current).expect("failed to wire the kernel regions");
    unsafe {
        paging::load_core_page_table();
    }
    info!(
        "core page table loaded, direct map spans {} MiB",
        crate::memory::direct_map().size / (1024 * 1024)
    );

    heap::init(current);
    stack::init(current);

    arch::utils::calibrate_time();
    arch::interrupts::init_local_interrupts();

    cleanup::init(current);

    // the executor array, one record per detected CPU, bootstrap first
    let cpus = boot::MP_RESPONSE.cpus();
    assert!(
        cpus.len() <= MAX_EXECUTORS,
        "{} CPUs exceed the compile-time maximum of {MAX_EXECUTORS}",
        cpus.len()
    );
    let bsp_lapic_id = boot::MP_RESPONSE.bsp_lapic_id();

    let mut executors = Vec::with_capacity(cpus.len());
    executors.push(Executor::new(
        ExecutorId::BOOTSTRAP,
        bsp_lapic_id,
        Stack::allocate(current).expect("failed to allocate a scheduler stack"),
    ));
    for cpu in cpus.iter().filter(|cpu| cpu.lapic_id != bsp_lapic_id) {
        executors.push(Executor::new(
            ExecutorId::from_raw(executors.len() as u32),
            cpu.lapic_id,
            Stack::allocate(current).expect("failed to allocate a scheduler stack"),
        ));
    }
    let executors: &'static [Executor] = Vec::leak(executors);
    unsafe { executor::install_all(executors) };

    for (i, exec) in executors.iter().enumerate() {
        let mut name = Name::new();
        let _ = write!(name, "init-{i}");
        let init_task =
            task::create_init(current, name.as_str()).expect("failed to create an init task");
        exec.set_init_task(init_task);
    }

    info!("booting {} secondary executor(s)", executors.len() - 1);
    for cpu in cpus.iter().filter(|cpu| cpu.lapic_id != bsp_lapic_id) {
        cpu.goto_address.write(stage2_entry);
    }

    // the bootstrap executor retires its static record: from here it is
    // executors[0], running on its init task's own stack
    let exec0 = &executors[0];
    let init0 = exec0.init_task();
    unsafe {
        arch::threading::install_executor(exec0);
        init0.set_state(TaskState::Running(NonNull::from(exec0)));
        exec0.set_current_task(init0);
        let top = init0.stack_mut().top().into_raw();
        arch::threading::call_on_stack(
            top,
            stage3_entry as usize,
            exec0 as *const Executor as usize,
        )
    }
}

/// Landing point of every secondary CPU, on the bootloader-provided stack.
/// The executor record (created before the CPU was released) is found by
/// local APIC id.
extern "C" fn stage2_entry(cpu: &Cpu) -> ! {
    unsafe {
        arch::disable_interrupts();
        paging::load_core_page_table();
    }

    let exec = executor::all()
        .iter()
        .find(|exec| exec.arch_id() == cpu.lapic_id)
        .expect("secondary CPU has no executor record");
    unsafe { arch::threading::install_executor(exec) };

    arch::init_cpu_early();
    arch::init_cpu_features();
    arch::interrupts::init_local_interrupts();

    let init_task = exec.init_task();
    unsafe {
        init_task.set_state(TaskState::Running(NonNull::from(exec)));
        exec.set_current_task(init_task);
        let top = init_task.stack_mut().top().into_raw();
        arch::threading::call_on_stack(
            top,
            stage3_entry as usize,
            exec as *const Executor as usize,
        )
    }
}

/// Runs on each executor's init task stack. After the rendezvous every
/// executor drops its init task and all further work goes through the
/// scheduler.
extern "C" fn stage3_entry(exec: usize) -> ! {
    let exec = unsafe { &*(exec as *const Executor) };
    let current = exec.current_task();
    let total = executor::all().len() as u32;

    if exec.id().is_bootstrap() {
        while NON_BOOTSTRAP_EXECUTORS_READY.load(Ordering::Acquire) != total - 1 {
            core::hint::spin_loop();
        }
        BOOT_TRACE.ready_seen_by_bootstrap.store(
            NON_BOOTSTRAP_EXECUTORS_READY.load(Ordering::Acquire),
            Ordering::Relaxed,
        );

        arch::interrupts::enable_scheduler_tick();
        scheduler::mark_online();

        let stage4 = task::create_kernel(
            current,
            KernelTaskArgs {
                name: "init-stage4",
                entry: stage4_main,
                arg1: 0,
                arg2: 0,
            },
        )
        .expect("failed to create the stage-4 task");
        scheduler::lock_scheduler(current);
        scheduler::queue_task(current, stage4);
        scheduler::unlock_scheduler(current);

        STAGE3_COMPLETE.store(true, Ordering::Release);
        info!("stage 3 complete on {} executor(s)", total);
    } else {
        NON_BOOTSTRAP_EXECUTORS_READY.fetch_add(1, Ordering::AcqRel);
        while !STAGE3_COMPLETE.load(Ordering::Acquire) {
            core::hint::spin_loop();
        }
        BOOT_TRACE
            .secondaries_saw_complete
            .fetch_add(1, Ordering::Relaxed);
    }

    exec.set_online();
    scheduler::lock_scheduler(current);
    scheduler::drop_current(current)
}

/// Late initialization, running as an ordinary scheduled task.
extern "C" fn stage4_main(_current: TaskRef, _: usize, _: usize) {
    info!(
        "stage 4: {} free pages, {} reserved, {} reclaimable; {} kernel task(s)",
        frame_list::FRAME_LIST.free_pages(),
        frame_list::FRAME_LIST.reserved_pages(),
        frame_list::FRAME_LIST.reclaimable_pages(),
        task::kernel_task_count(),
    );

    #[cfg(test)]
    crate::kernel_testmain();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spin_until(mut cond: impl FnMut() -> bool) {
        let mut spins = 0u64;
        while !cond() {
            core::hint::spin_loop();
            spins += 1;
            assert!(spins < 1_000_000_000, "condition never became true");
        }
    }

    #[test_case]
    fn bring_up_barrier_ordering() {
        let total = executor::all().len() as u32;
        if total < 2 {
            return;
        }
        // bootstrap observed every secondary ready before completing stage
        // 3, and every secondary observed completion before dropping itself
        // (the last secondaries may still be parking; give them a moment)
        assert_eq!(
            BOOT_TRACE.ready_seen_by_bootstrap.load(Ordering::Relaxed),
            total - 1
        );
        spin_until(|| BOOT_TRACE.secondaries_saw_complete.load(Ordering::Relaxed) == total - 1);
    }

    #[test_case]
    fn bring_up_census() {
        assert_eq!(executor::all().len(), boot::cpu_count());
        // at least the cleanup service and the test-carrying task exist
        assert!(task::kernel_task_count() >= 2);
        assert!(frame_list::FRAME_LIST.free_pages() > 0);
        for exec in executor::all() {
            spin_until(|| exec.is_online());
            assert!(!exec.has_panicked());
        }
    }
}
