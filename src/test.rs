use core::any::type_name;

use crate::arch::power::shutdown;
use crate::info;

#[macro_export]
macro_rules! test_log {
    ($($arg:tt)*) => {
        $crate::logln_ext!("test", 92, $($arg)*)
    };
}

pub trait Testable {
    fn run(&self);
    #[inline(always)]
    fn name(&self) -> &'static str {
        type_name::<Self>()
    }
}

impl<T: Fn()> Testable for T {
    fn run(&self) {
        self();
    }
}

/// Runs inside the stage-4 task, with the full scheduler available.
pub fn test_runner(tests: &[&dyn Testable]) -> ! {
    test_log!("running {} tests", tests.len());

    for test in tests {
        test_log!("running \x1B[90m{}\x1B[0m...", test.name());
        let started = crate::time!();
        test.run();
        test_log!("ok ({}ms)", crate::time!() - started);
    }

    info!("all {} tests passed", tests.len());
    shutdown()
}
