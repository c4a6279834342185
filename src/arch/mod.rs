//! Architecture specific code.
//!
//! Everything that differs between architectures lives behind this module:
//! interrupt control, paging primitives, the per-CPU executor register,
//! context switching and early device access. The rest of the kernel only
//! uses the re-exports below.

use cfg_if::cfg_if;

cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub mod x86_64;
        use x86_64 as arch;
    } else {
        compile_error!("unsupported architecture (target_arch unsupported)");
    }
}

pub use arch::{
    disable_interrupts, enable_interrupts, hlt, init_cpu_early, init_cpu_features,
    interrupts_enabled, without_interrupts,
};

/// Context switching and the per-CPU executor register.
pub mod threading {
    pub use super::arch::threading::{
        ArchExecutor, call_on_stack, current_executor, install_executor, jump_to_task,
        prepare_new_task_frame, task_switch, task_switch_and_call, try_current_executor,
    };
}

pub mod serial {
    pub use super::arch::serial::{_serial, SERIAL, init_serial, raw_write};
}

pub mod paging {
    pub use super::arch::paging::{
        PageTable, current_table_phys, invalidate_page, load_table_phys,
    };
}

pub mod interrupts {
    pub use super::arch::interrupts::{
        enable_scheduler_tick, init_idt, init_local_interrupts, send_flush_ipi,
    };
}

pub mod utils {
    pub use super::arch::utils::{calibrate_time, time_ms};
}

pub mod registers {
    pub use super::arch::registers::StackFrame;
}

pub mod power {
    pub use super::arch::power::shutdown;
}
