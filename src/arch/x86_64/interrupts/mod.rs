pub mod apic;
pub mod pit;

use core::arch::asm;
use core::cell::SyncUnsafeCell;
use core::fmt::Display;
use core::sync::atomic::{AtomicBool, Ordering};

use lazy_static::lazy_static;

use crate::executor::flush;
use crate::memory::VirtAddr;
use crate::scheduler;
use crate::task::Task;

/// Periodic per-executor scheduler tick.
pub const TIMER_VECTOR: u8 = 0x20;
/// Cross-executor TLB shootdown requests.
pub const TLB_FLUSH_VECTOR: u8 = 0x21;
pub const SPURIOUS_VECTOR: u8 = 0xFF;

pub const ATTR_TRAP: u8 = 0xF;
pub const ATTR_INT: u8 = 0xE;

#[allow(clippy::upper_case_acronyms)]
pub type IDTT = [GateDescriptor; 256];

#[repr(C, packed)]
pub struct IDTDescriptor {
    limit: u16,
    base: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C, packed)]
pub struct GateDescriptor {
    offset0: u16,
    selector: u16,
    ist: u8,
    attributes: u8,
    offset1: u16,
    offset2: u32,
    reserved: u32,
}

impl GateDescriptor {
    pub const fn new(handler: usize, attributes: u8) -> Self {
        Self {
            offset0: handler as u16,
            // Limine loads a flat GDT whose kernel code selector is 0x28
            selector: 0x28,
            ist: 0,
            attributes: attributes | 1 << 7,
            offset1: (handler >> 16) as u16,
            offset2: (handler >> 32) as u32,
            reserved: 0,
        }
    }

    pub const fn missing() -> Self {
        Self {
            offset0: 0,
            selector: 0,
            ist: 0,
            attributes: 0,
            offset1: 0,
            offset2: 0,
            reserved: 0,
        }
    }
}

/// The frame the CPU pushes on interrupt entry.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct InterruptFrame {
    pub instruction_pointer: VirtAddr,
    pub code_segment: u64,
    pub flags: u64,
    pub stack_pointer: VirtAddr,
    pub stack_segment: u64,
}

impl Display for InterruptFrame {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        writeln!(f, "rip: {:?}", self.instruction_pointer)?;
        writeln!(f, "rsp: {:?}", self.stack_pointer)?;
        write!(
            f,
            "cs: {:#x}, ss: {:#x}, rflags: {:#x}",
            self.code_segment, self.stack_segment, self.flags
        )
    }
}

macro_rules! create_idt {
    ($(($indx:expr, $handler:expr, $attributes:expr)),*) => {
        {
            let mut table = [GateDescriptor::missing(); 256];
            $(
                table[$indx as usize] = GateDescriptor::new($handler as usize, $attributes);
            )*
            SyncUnsafeCell::new(table)
        }
    };
}

lazy_static! {
    static ref IDT: SyncUnsafeCell<IDTT> = create_idt!(
        (0, divide_by_zero_handler, ATTR_INT),
        (3, breakpoint_handler, ATTR_INT),
        (6, invalid_opcode_handler, ATTR_INT),
        (8, double_fault_handler, ATTR_TRAP),
        (0xC, stack_segment_fault_handler, ATTR_TRAP),
        (13, general_protection_fault_handler, ATTR_TRAP),
        (14, page_fault_handler, ATTR_TRAP),
        (TIMER_VECTOR, timer_handler, ATTR_INT),
        (TLB_FLUSH_VECTOR, tlb_flush_handler, ATTR_INT),
        (SPURIOUS_VECTOR, spurious_handler, ATTR_INT)
    );
    static ref IDT_DESCRIPTOR: IDTDescriptor = IDTDescriptor {
        limit: (size_of::<IDTT>() - 1) as u16,
        base: IDT.get() as usize,
    };
}

/// Loads the interrupt descriptor table on the calling CPU.
pub fn init_idt() {
    unsafe {
        asm!("lidt [{}]", in(reg) &*IDT_DESCRIPTOR as *const IDTDescriptor, options(nostack));
    }
}

/// Configures the calling CPU's local APIC and its periodic scheduler tick.
pub fn init_local_interrupts() {
    apic::init_local_apic();
    apic::start_periodic_timer(TIMER_VECTOR, crate::init::SCHEDULER_TICK_MS);
}

/// The scheduler tick is wired up from boot but inert until stage 3 has
/// queued the first real work.
static SCHEDULER_TICK_ENABLED: AtomicBool = AtomicBool::new(false);

pub fn enable_scheduler_tick() {
    SCHEDULER_TICK_ENABLED.store(true, Ordering::Release);
}

pub fn send_flush_ipi(lapic_id: u32) {
    apic::send_ipi(lapic_id, TLB_FLUSH_VECTOR);
}

extern "x86-interrupt" fn timer_handler(_frame: InterruptFrame) {
    let (current, restorer) = Task::on_interrupt_entry();
    apic::send_eoi();

    if SCHEDULER_TICK_ENABLED.load(Ordering::Acquire) {
        scheduler::maybe_preempt(current);
    }

    restorer.restore(current);
}

extern "x86-interrupt" fn tlb_flush_handler(_frame: InterruptFrame) {
    let (current, restorer) = Task::on_interrupt_entry();
    flush::process_flush_requests(current);
    apic::send_eoi();
    restorer.restore(current);
}

extern "x86-interrupt" fn spurious_handler(_frame: InterruptFrame) {}

extern "x86-interrupt" fn divide_by_zero_handler(frame: InterruptFrame) {
    panic!("---- Divide By Zero Exception ----\n{}", frame);
}

extern "x86-interrupt" fn invalid_opcode_handler(frame: InterruptFrame) {
    panic!("---- Invalid Opcode ----\n{}", frame);
}

extern "x86-interrupt" fn breakpoint_handler(frame: InterruptFrame) {
    crate::serial!("breakpoint!\n{}\n", frame);
}

extern "x86-interrupt" fn double_fault_handler(frame: InterruptFrame, _error: u64) {
    panic!("---- Double Fault ----\n{}", frame);
}

extern "x86-interrupt" fn stack_segment_fault_handler(frame: InterruptFrame, error: u64) {
    panic!("---- Stack-Segment Fault ({error:#x}) ----\n{}", frame);
}

extern "x86-interrupt" fn general_protection_fault_handler(frame: InterruptFrame, error: u64) {
    panic!("---- General Protection Fault ({error:#x}) ----\n{}", frame);
}

extern "x86-interrupt" fn page_fault_handler(frame: InterruptFrame, error: u64) {
    let cr2: u64;
    unsafe { asm!("mov {}, cr2", out(reg) cr2) }

    // a fault in a stack's guard page gets the dedicated diagnosis
    let addr = VirtAddr::from(cr2 as usize);
    if crate::task::stack::is_guard_page_address(addr) {
        panic!(
            "---- Kernel Stack Overflow ----\naddress: {:#x} (guard page)\n{}",
            cr2, frame
        );
    }

    panic!(
        "---- Page Fault ----\naddress: {:#x}, error: {error:#x}\n{}",
        cr2, frame
    )
}
