#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(crate::test::test_runner)]
#![reexport_test_harness_main = "kernel_testmain"]
#![feature(abi_x86_interrupt)]
#![feature(sync_unsafe_cell)]
#![feature(allocator_api)]

#[cfg(test)]
mod test;

mod arch;
mod boot;
mod executor;
mod init;
mod logging;
mod memory;
mod scheduler;
mod task;
mod utils;

extern crate alloc;

use core::panic::PanicInfo;
use core::sync::atomic::{AtomicU32, AtomicU8, Ordering};

pub use memory::PhysAddr;
pub use memory::VirtAddr;

#[macro_export]
macro_rules! serial {
    ($($arg:tt)*) => {
        $crate::arch::serial::_serial(format_args!($($arg)*))
    };
}

/// Returns the number of milliseconds since the bootstrap executor started
#[macro_export]
macro_rules! time {
    () => {
        $crate::arch::utils::time_ms()
    };
}

#[unsafe(no_mangle)]
pub fn khalt() -> ! {
    loop {
        unsafe { arch::hlt() }
    }
}

/// The executor id that currently owns panic output, [`u32::MAX`] when none does.
/// Every other executor that panics (or observes a panic) parks itself instead
/// of interleaving output.
static PANICKING_EXECUTOR: AtomicU32 = AtomicU32::new(u32::MAX);
/// Nesting depth of the printing executor's panic. 0: full message and
/// backtrace, 1: short raw message, 2+: absorbed.
static PANIC_DEPTH: AtomicU8 = AtomicU8::new(0);

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    unsafe {
        arch::disable_interrupts();
    }

    let id = match executor::try_current() {
        Some(exec) => {
            exec.mark_panicked();
            exec.id().raw()
        }
        // panics before the bootstrap executor is installed claim id 0
        None => 0,
    };

    if let Err(owner) =
        PANICKING_EXECUTOR.compare_exchange(u32::MAX, id, Ordering::SeqCst, Ordering::SeqCst)
        && owner != id
    {
        // another executor is already printing
        khalt()
    }

    match PANIC_DEPTH.fetch_add(1, Ordering::SeqCst) {
        0 => {
            unsafe {
                arch::serial::SERIAL.force_unlock();
            }
            serial!(
                "\x1B[38;2;255;0;0mkernel panic on executor {}:\n{}, at {}\x1B[0m\n",
                id,
                info.message(),
                info.location().unwrap()
            );
            logging::print_stack_trace();

            #[cfg(test)]
            arch::power::shutdown();
        }
        1 => {
            // the first print itself panicked, fall back to the raw path
            arch::serial::raw_write(b"\nnested kernel panic\n");
        }
        _ => {}
    }

    khalt()
}

#[unsafe(no_mangle)]
extern "C" fn kstart() -> ! {
    init::stage1()
}
