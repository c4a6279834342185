//! Local APIC access through the non-cached direct map.

use bitfield_struct::bitfield;
use spin::Lazy;

use super::super::registers::rdmsr;
use crate::memory::{PhysAddr, VirtAddr};

const IA32_APIC_BASE: u32 = 0x1B;

const REG_ID: u16 = 0x20;
const REG_EOI: u16 = 0xB0;
const REG_SPURIOUS: u16 = 0xF0;
const REG_ICR_LOW: u16 = 0x300;
const REG_ICR_HIGH: u16 = 0x310;
const REG_LVT_TIMER: u16 = 0x320;
const REG_TIMER_INITIAL: u16 = 0x380;
const REG_TIMER_CURRENT: u16 = 0x390;
const REG_TIMER_DIVIDE: u16 = 0x3E0;

const LVT_TIMER_PERIODIC: u32 = 1 << 17;
/// Divide-by-16 configuration value.
const TIMER_DIVIDE_BY_16: u32 = 0b11;

static LAPIC_PHYS_ADDR: Lazy<PhysAddr> =
    Lazy::new(|| PhysAddr::from((rdmsr(IA32_APIC_BASE) & 0xFFFF_F000) as usize));

/// MMIO must bypass the cache, so the APIC page is touched through the
/// non-cached direct map.
static LAPIC_ADDR: Lazy<VirtAddr> = Lazy::new(|| LAPIC_PHYS_ADDR.into_virt_noncached());

#[inline(always)]
fn lapic_reg(offset: u16) -> *mut u32 {
    (*LAPIC_ADDR + offset as usize).into_ptr::<u32>()
}

#[inline(always)]
fn read_reg(offset: u16) -> u32 {
    unsafe { lapic_reg(offset).read_volatile() }
}

#[inline(always)]
fn write_reg(offset: u16, value: u32) {
    unsafe { lapic_reg(offset).write_volatile(value) }
}

pub fn local_apic_id() -> u32 {
    read_reg(REG_ID) >> 24
}

#[inline]
pub fn send_eoi() {
    write_reg(REG_EOI, 0);
}

/// Software-enables the local APIC with the spurious vector installed.
pub fn init_local_apic() {
    write_reg(
        REG_SPURIOUS,
        (1 << 8) | super::SPURIOUS_VECTOR as u32,
    );
}

/// Programs the periodic timer to fire `vector` every `period_ms`
/// milliseconds. Requires a prior [`crate::arch::utils::calibrate_time`].
pub fn start_periodic_timer(vector: u8, period_ms: u64) {
    let ticks_per_ms = crate::arch::x86_64::utils::apic_ticks_per_ms();
    debug_assert!(ticks_per_ms != 0, "APIC timer used before calibration");

    write_reg(REG_TIMER_DIVIDE, TIMER_DIVIDE_BY_16);
    write_reg(REG_LVT_TIMER, vector as u32 | LVT_TIMER_PERIODIC);
    write_reg(REG_TIMER_INITIAL, (ticks_per_ms * period_ms) as u32);
}

/// One uncalibrated timer run of `2^32 / 16` bus cycles, used only while
/// measuring the tick rate.
pub(crate) fn start_calibration_run() {
    write_reg(REG_TIMER_DIVIDE, TIMER_DIVIDE_BY_16);
    write_reg(REG_LVT_TIMER, (1 << 16) | super::TIMER_VECTOR as u32); // masked
    write_reg(REG_TIMER_INITIAL, u32::MAX);
}

pub(crate) fn read_calibration_run() -> u32 {
    u32::MAX - read_reg(REG_TIMER_CURRENT)
}

#[derive(Debug, Clone, Copy)]
#[repr(u8)]
pub enum DeliveryMode {
    Fixed = 0,
    Nmi = 0b100,
    Init = 0b101,
    StartUp = 0b110,
}

impl DeliveryMode {
    pub const fn from_bits(bits: u8) -> Self {
        match bits {
            0b100 => Self::Nmi,
            0b101 => Self::Init,
            0b110 => Self::StartUp,
            _ => Self::Fixed,
        }
    }

    pub const fn into_bits(self) -> u8 {
        self as u8
    }
}

#[bitfield(u64)]
pub struct InterruptCommand {
    vector: u8,
    #[bits(3)]
    delivery_mode: DeliveryMode,
    dest_logical: bool,
    delivery_pending: bool,
    #[bits(1)]
    __: (),
    assert: bool,
    level_triggered: bool,
    #[bits(2)]
    __: (),
    #[bits(2)]
    destination_shorthand: u8,
    #[bits(36)]
    __: (),
    destination_field: u8,
}

/// Sends a fixed-delivery IPI to one target APIC.
pub fn send_ipi(lapic_id: u32, vector: u8) {
    let command = InterruptCommand::new()
        .with_vector(vector)
        .with_assert(true)
        .with_destination_field(lapic_id as u8);

    let bits = command.into_bits();
    write_reg(REG_ICR_HIGH, (bits >> 32) as u32);
    // writing the low dword sends the interrupt
    write_reg(REG_ICR_LOW, bits as u32);

    while InterruptCommand::from_bits(read_reg(REG_ICR_LOW) as u64).delivery_pending() {
        core::hint::spin_loop();
    }
}
