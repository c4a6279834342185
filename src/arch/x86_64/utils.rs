//! Boot-relative time from the TSC, calibrated once against the PIT.

use core::sync::atomic::{AtomicU64, Ordering};

use super::interrupts::{apic, pit};
use super::registers::rdtsc;

static BOOT_TSC: AtomicU64 = AtomicU64::new(0);
static TSC_TICKS_PER_MS: AtomicU64 = AtomicU64::new(0);
static APIC_TICKS_PER_MS: AtomicU64 = AtomicU64::new(0);

const CALIBRATION_MS: u64 = 20;

/// Measures TSC and APIC-timer rates against the PIT. Runs once, on the
/// bootstrap executor, before the periodic tick is started anywhere.
pub fn calibrate_time() {
    // the timer only counts on a software-enabled APIC
    apic::init_local_apic();

    let tsc_start = rdtsc();
    apic::start_calibration_run();

    pit::polled_wait_ms(CALIBRATION_MS);

    let tsc_ticks = rdtsc() - tsc_start;
    let apic_ticks = apic::read_calibration_run() as u64;

    BOOT_TSC.store(tsc_start, Ordering::Relaxed);
    TSC_TICKS_PER_MS.store((tsc_ticks / CALIBRATION_MS).max(1), Ordering::Relaxed);
    APIC_TICKS_PER_MS.store((apic_ticks / CALIBRATION_MS).max(1), Ordering::Relaxed);
}

/// Milliseconds since calibration. Returns 0 before [`calibrate_time`].
pub fn time_ms() -> u64 {
    let per_ms = TSC_TICKS_PER_MS.load(Ordering::Relaxed);
    if per_ms == 0 {
        return 0;
    }
    (rdtsc() - BOOT_TSC.load(Ordering::Relaxed)) / per_ms
}

pub(super) fn apic_ticks_per_ms() -> u64 {
    APIC_TICKS_PER_MS.load(Ordering::Relaxed)
}
