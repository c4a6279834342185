//! Timestamped serial logging.
//!
//! All diagnostic output goes to the early UART; there is no terminal
//! device in this kernel. The level macros prefix a boot-relative
//! `[hh:mm:ss.mmm]` timestamp and an ANSI-colored tag.

use crate::VirtAddr;
use crate::arch::registers::StackFrame;

pub(crate) fn log_time_from_ms(ms: u64) -> (u32, u8, u8, u16) {
    let seconds = ms / 1000;
    let minutes = seconds / 60;
    let hours = minutes / 60;
    (
        hours as u32,
        (minutes % 60) as u8,
        (seconds % 60) as u8,
        (ms % 1000) as u16,
    )
}

#[macro_export]
macro_rules! serial_log {
    ($($arg:tt)*) => {{
        let log_time = $crate::time!();
        let (hours, minutes, seconds, ms) = $crate::logging::log_time_from_ms(log_time);
        $crate::serial!("[{hours:02}:{minutes:02}:{seconds:02}.{ms:03}] {}\n", format_args!($($arg)*));
    }};
}

pub const MIN_LOG_TYPE_NAME_WIDTH: usize = 5;

#[macro_export]
macro_rules! logln_ext {
    ($name: literal, $name_color: literal, as $kind: expr, $($arg:tt)*) => {
        $crate::serial_log!("[  \x1B[{name_color}m{name:<width$}\x1B[0m  ]\x1b[90m {kind}:\x1B[0m {}", format_args!($($arg)*), name_color = $name_color, name = $name, kind = $kind, width = $crate::logging::MIN_LOG_TYPE_NAME_WIDTH)
    };

    ($name: literal, $name_color: literal, $($arg:tt)*) => {
        $crate::serial_log!("[  \x1B[{name_color}m{name:<width$}\x1B[0m  ]\x1b[90m:\x1B[0m {}", format_args!($($arg)*), name_color = $name_color, name = $name, width = $crate::logging::MIN_LOG_TYPE_NAME_WIDTH)
    };
}

/// debug info, tagged with the type it concerns: `debug!(Scheduler, "...")`
#[macro_export]
macro_rules! debug {
    ($mod: ty, $($arg:tt)*) => {{
        // makes sure $mod is a valid type
        let _ = core::marker::PhantomData::<$mod>;
        $crate::logln_ext!("debug", 91, as stringify!($mod), $($arg)*)
    }};
    ($($arg:tt)*) => {{
        $crate::logln_ext!("debug", 91, $($arg)*)
    }};
}

#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => ($crate::logln_ext!("info", 92, $($arg)*));
}

#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => ($crate::logln_ext!("warn", 93, $($arg)*));
}

#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => ($crate::logln_ext!("error", 91, $($arg)*));
}

/// Prints the raw return-address list of the current stack. Addresses
/// only; symbolization happens offline against the kernel image.
pub fn print_stack_trace() {
    unsafe {
        let mut fp = StackFrame::get_current();
        crate::serial!("\x1B[34mstack trace:\n");
        loop {
            let return_address = VirtAddr::from_ptr(fp.return_ptr());
            crate::serial!("  {:#x}\n", return_address);

            let Some(frame) = fp.prev() else {
                break;
            };
            fp = frame;
        }
        crate::serial!("\x1B[0m");
    }
}
