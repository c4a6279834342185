//! Architecture-independent paging types and the core page table.
//!
//! The core page table is the single address space every executor runs in.
//! It is adopted from the bootloader's higher half during stage 1, extended
//! with the kernel's own regions, and loaded by every executor in stage 2.
//! All edits to it go through this module and are serialized by a ticket
//! lock (`spec`: the heap page-table mutex).

pub const PAGE_SIZE: usize = 4096;

use core::cell::SyncUnsafeCell;
use core::fmt::Debug;

use bitflags::bitflags;
use thiserror::Error;

use super::{PhysAddr, PhysRange, VirtAddr, VirtRange, align_down, frame_list};
use crate::arch::paging::PageTable;
use crate::task::TaskRef;
use crate::utils::locks::TicketSpinLock;

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Page {
    start_address: VirtAddr,
}

impl Debug for Page {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Page({:#x})", self.start_address)
    }
}

impl Page {
    pub const fn containing_address(address: VirtAddr) -> Self {
        Self {
            start_address: VirtAddr::from(align_down(address.into_raw(), PAGE_SIZE)),
        }
    }

    pub const fn virt_addr(&self) -> VirtAddr {
        self.start_address
    }

    /// requires that `start.start_address <= end.start_address`
    pub fn iter_pages(start: Page, end: Page) -> IterPage {
        assert!(start.start_address <= end.start_address);
        IterPage { start, end }
    }

    /// Iterates the pages covering `range`; the range must be page-aligned.
    pub fn iter_range(range: VirtRange) -> IterPage {
        debug_assert!(range.start().is_aligned_to(PAGE_SIZE));
        debug_assert!(range.size() % PAGE_SIZE == 0);
        IterPage {
            start: Page::containing_address(range.start()),
            end: Page::containing_address(range.end()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IterPage {
    start: Page,
    end: Page,
}

impl Iterator for IterPage {
    type Item = Page;
    fn next(&mut self) -> Option<Self::Item> {
        if self.start.start_address < self.end.start_address {
            let page = self.start;
            self.start.start_address += PAGE_SIZE;
            Some(page)
        } else {
            None
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntryFlags: u64 {
        const WRITE = 1;
        const DISABLE_EXEC = 1 << 1;
        const DEVICE_UNCACHEABLE = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MapToError {
    #[error("frame allocator: out of memory")]
    FrameAllocationFailed,
    #[error("page {0:?} is already mapped")]
    AlreadyMapped(Page),
}

impl From<frame_list::OutOfPhysicalMemory> for MapToError {
    fn from(_: frame_list::OutOfPhysicalMemory) -> Self {
        Self::FrameAllocationFailed
    }
}

/// Physical address of the core PML4. Written once in stage 1.
static CORE_TABLE_PHYS: SyncUnsafeCell<PhysAddr> = SyncUnsafeCell::new(PhysAddr::null());

/// Serializes every edit of the core page table (heap import/release, stack
/// mapping, MMIO windows).
static CORE_TABLE_LOCK: TicketSpinLock = TicketSpinLock::new();

/// Adopts the bootloader-built address space as the core page table and
/// returns it for extension. Called exactly once, on the bootstrap
/// executor, before any mapping is made through this module.
pub unsafe fn adopt_core_page_table() -> &'static mut PageTable {
    let phys = crate::arch::paging::current_table_phys();
    unsafe {
        *CORE_TABLE_PHYS.get() = phys;
        &mut *phys.into_virt().into_ptr::<PageTable>()
    }
}

/// Loads the core page table into the executing CPU.
pub unsafe fn load_core_page_table() {
    let phys = unsafe { *CORE_TABLE_PHYS.get() };
    debug_assert!(phys != PhysAddr::null());
    unsafe { crate::arch::paging::load_table_phys(phys) };
}

fn core_table() -> &'static mut PageTable {
    let phys = unsafe { *CORE_TABLE_PHYS.get() };
    debug_assert!(phys != PhysAddr::null());
    unsafe { &mut *phys.into_virt().into_ptr::<PageTable>() }
}

/// Maps `virt` to the caller-supplied physical range. No frame-list
/// interaction; used by the special (MMIO) heap.
pub fn map_range(
    current: TaskRef,
    virt: VirtRange,
    phys: PhysRange,
    flags: EntryFlags,
) -> Result<(), MapToError> {
    debug_assert_eq!(virt.size(), phys.size());

    let _guard = CORE_TABLE_LOCK.guard(current);
    let table = core_table();

    for (i, page) in Page::iter_range(virt).enumerate() {
        let frame = PhysAddr::from(align_down(phys.start().into_raw(), PAGE_SIZE) + i * PAGE_SIZE);
        unsafe { table.map_to(page, frame, flags)? };
    }
    Ok(())
}

/// Maps `virt` to freshly allocated physical frames, zeroing them.
pub fn alloc_map_range(
    current: TaskRef,
    virt: VirtRange,
    flags: EntryFlags,
) -> Result<(), MapToError> {
    let _guard = CORE_TABLE_LOCK.guard(current);
    let table = core_table();

    for page in Page::iter_range(virt) {
        let frame = frame_list::FRAME_LIST.allocate_page()?;
        unsafe {
            core::ptr::write_bytes(frame.start().into_virt().into_ptr::<u8>(), 0, PAGE_SIZE);
            table.map_to(page, frame.start(), flags)?;
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeFrames {
    Yes,
    No,
}

/// Unmaps `virt` from the core page table and invalidates it locally.
/// The caller is responsible for cross-executor invalidation (see
/// `executor::flush`).
pub fn unmap_range(current: TaskRef, virt: VirtRange, free: FreeFrames) {
    let _guard = CORE_TABLE_LOCK.guard(current);
    let table = core_table();

    for page in Page::iter_range(virt) {
        let frame = unsafe { table.unmap(page) };
        if free == FreeFrames::Yes
            && let Some(frame) = frame
        {
            frame_list::deallocate_page(PhysRange::new(frame, PAGE_SIZE));
        }
        crate::arch::paging::invalidate_page(page.virt_addr());
    }
}

/// Maps the non-cached direct map: a second virtual alias of the whole
/// physical span with caching disabled, built from 2 MiB pages. Stage-1
/// only, before the secondaries are up.
pub fn map_non_cached_direct_map(current: TaskRef) -> Result<(), MapToError> {
    const HUGE_PAGE: usize = 2 * 1024 * 1024;

    let nc = super::non_cached_direct_map();
    let _guard = CORE_TABLE_LOCK.guard(current);
    let table = core_table();

    let mut offset = 0;
    while offset < nc.size {
        unsafe {
            table.map_huge_to(
                nc.base + offset,
                PhysAddr::from(offset),
                EntryFlags::WRITE | EntryFlags::DEVICE_UNCACHEABLE | EntryFlags::DISABLE_EXEC,
            )?;
        }
        offset += HUGE_PAGE;
    }
    Ok(())
}

/// Pre-wires the PML4 slots of the kernel heap, stack and special regions
/// so that later edits only touch lower-level tables, which are shared by
/// all executors through the common PML4.
pub fn wire_kernel_regions(current: TaskRef) -> Result<(), MapToError> {
    use super::layout;

    let _guard = CORE_TABLE_LOCK.guard(current);
    let table = core_table();

    for (base, size) in [
        (layout::KERNEL_HEAP_BASE, layout::KERNEL_HEAP_SIZE),
        (layout::KERNEL_STACKS_BASE, layout::KERNEL_STACKS_SIZE),
        (layout::KERNEL_SPECIAL_BASE, layout::KERNEL_SPECIAL_SIZE),
    ] {
        unsafe { table.wire_top_level(base, size)? };
    }
    Ok(())
}
