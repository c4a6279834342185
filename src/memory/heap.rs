//! The kernel byte heap.
//!
//! Two arenas stack up here: `HEAP_ADDRESS_SPACE_ARENA` owns the kernel
//! heap virtual region and hands out address space only; `HEAP_ARENA` sits
//! on top through a source whose `import` backs every span with physical
//! frames mapped into the core page table (and whose `release` unmaps
//! them again). The global allocator is a thin wrapper over `HEAP_ARENA`
//! that stashes the true allocation base below the aligned user pointer.
//!
//! A separate "special" arena reserves virtual windows for MMIO: caller
//! supplied physical ranges, no frame-list interaction.

use core::alloc::{GlobalAlloc, Layout};

use thiserror::Error;

use super::{
    PhysRange, VirtAddr, VirtRange, align_down, align_up,
    arena::{AllocPolicy, Allocation, ArenaError, ResourceArena, SpanSource},
    layout,
    paging::{self, EntryFlags, FreeFrames, MapToError, PAGE_SIZE},
};
use crate::executor::flush;
use crate::task::{self, TaskRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HeapError {
    #[error(transparent)]
    Arena(#[from] ArenaError),
    #[error(transparent)]
    Map(#[from] MapToError),
}

/// Address space of the kernel heap. No source: exhausting the region is
/// final.
static HEAP_ADDRESS_SPACE_ARENA: ResourceArena =
    ResourceArena::new("heap-address-space", PAGE_SIZE, None);

/// Backs imported heap spans with mapped frames.
struct MappedSpanSource;

static HEAP_SOURCE: MappedSpanSource = MappedSpanSource;

impl SpanSource for MappedSpanSource {
    fn import(&self, current: TaskRef, len: usize) -> Result<Allocation, ArenaError> {
        let rounded = align_up(len, PAGE_SIZE);
        let span =
            HEAP_ADDRESS_SPACE_ARENA.allocate(current, rounded, AllocPolicy::InstantFit)?;

        let range = VirtRange::new(VirtAddr::from(span.base), span.len);
        if paging::alloc_map_range(current, range, EntryFlags::WRITE | EntryFlags::DISABLE_EXEC)
            .is_err()
        {
            HEAP_ADDRESS_SPACE_ARENA.deallocate(current, span);
            return Err(ArenaError::RequestedLengthUnavailable);
        }

        Ok(span)
    }

    fn release(&self, current: TaskRef, span: Allocation) {
        let range = VirtRange::new(VirtAddr::from(span.base), span.len);
        paging::unmap_range(current, range, FreeFrames::Yes);
        flush::flush_range(current, range);
        HEAP_ADDRESS_SPACE_ARENA.deallocate(current, span);
    }
}

/// The byte heap every `alloc::` container ends up in.
static HEAP_ARENA: ResourceArena = ResourceArena::new("kernel-heap", 16, Some(&HEAP_SOURCE));

/// Virtual windows for memory-mapped IO.
static SPECIAL_ARENA: ResourceArena = ResourceArena::new("special-address-space", PAGE_SIZE, None);

/// Seeds the heap and special arenas with their regions. Stage-1 only.
pub fn init(current: TaskRef) {
    HEAP_ADDRESS_SPACE_ARENA.add_span(
        current,
        layout::KERNEL_HEAP_BASE.into_raw(),
        layout::KERNEL_HEAP_SIZE,
    );
    SPECIAL_ARENA.add_span(
        current,
        layout::KERNEL_SPECIAL_BASE.into_raw(),
        layout::KERNEL_SPECIAL_SIZE,
    );
}

pub struct KernelHeap;

#[global_allocator]
static GLOBAL_HEAP: KernelHeap = KernelHeap;

unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let current = task::current();
        // room to align forward plus one word to remember the true base
        let size = layout.size() + layout.align() - 1 + size_of::<usize>();

        let Ok(allocation) = HEAP_ARENA.allocate(current, size, AllocPolicy::InstantFit) else {
            return core::ptr::null_mut();
        };

        let user = align_up(allocation.base + size_of::<usize>(), layout.align());
        unsafe {
            *((user - size_of::<usize>()) as *mut usize) = allocation.base;
        }
        user as *mut u8
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        let current = task::current();
        let base = unsafe { *(ptr.sub(size_of::<usize>()) as *const usize) };
        HEAP_ARENA.deallocate_base(current, base);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapType {
    Cached,
    /// MMIO registers; disables caching for the window.
    Uncached,
}

/// Reserves a virtual window and maps it onto a caller-supplied physical
/// range. The returned range starts at the same in-page offset as
/// `phys`.
pub fn allocate_special(
    current: TaskRef,
    size: usize,
    phys: PhysRange,
    map_type: MapType,
) -> Result<VirtRange, HeapError> {
    debug_assert!(size <= phys.size());

    let offset = phys.start().into_raw() % PAGE_SIZE;
    let map_len = align_up(offset + size, PAGE_SIZE);
    let window = SPECIAL_ARENA.allocate(current, map_len, AllocPolicy::InstantFit)?;

    let mut flags = EntryFlags::WRITE | EntryFlags::DISABLE_EXEC;
    if map_type == MapType::Uncached {
        flags |= EntryFlags::DEVICE_UNCACHEABLE;
    }

    let virt = VirtRange::new(VirtAddr::from(window.base), map_len);
    let phys_aligned = PhysRange::new(
        super::PhysAddr::from(align_down(phys.start().into_raw(), PAGE_SIZE)),
        map_len,
    );
    if let Err(e) = paging::map_range(current, virt, phys_aligned, flags) {
        SPECIAL_ARENA.deallocate(current, window);
        return Err(e.into());
    }

    Ok(VirtRange::new(VirtAddr::from(window.base + offset), size))
}

/// Unmaps and releases a window obtained from [`allocate_special`].
pub fn deallocate_special(current: TaskRef, range: VirtRange) {
    let base = align_down(range.start().into_raw(), PAGE_SIZE);
    let offset = range.start().into_raw() - base;
    let map_len = align_up(offset + range.size(), PAGE_SIZE);

    let virt = VirtRange::new(VirtAddr::from(base), map_len);
    paging::unmap_range(current, virt, FreeFrames::No);
    flush::flush_range(current, virt);
    SPECIAL_ARENA.deallocate_base(current, base);
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;
    use alloc::vec::Vec;

    #[test_case]
    fn heap_alignment() {
        let current = task::current();
        let before = HEAP_ARENA.allocated_bytes(current);

        let layout = Layout::from_size_align(100, 64).unwrap();
        let ptr = unsafe { GLOBAL_HEAP.alloc(layout) };
        assert!(!ptr.is_null());
        assert_eq!(ptr as usize % 64, 0);

        // 100 + 63 + pointer width, rounded to the heap quantum
        let expected = align_up(100 + 63 + size_of::<usize>(), HEAP_ARENA.quantum());
        assert_eq!(HEAP_ARENA.allocated_bytes(current), before + expected);

        unsafe { GLOBAL_HEAP.dealloc(ptr, layout) };
        assert_eq!(HEAP_ARENA.allocated_bytes(current), before);
    }

    #[test_case]
    fn special_heap_windows_alias_their_frames() {
        use crate::memory::frame_list;

        let current = task::current();
        // borrow a frame and pretend it is device memory
        let frame = frame_list::allocate_page().unwrap();

        let window = allocate_special(current, 0x100, frame, MapType::Cached).unwrap();
        assert_eq!(window.size(), 0x100);

        unsafe {
            window.start().into_ptr::<u64>().write_volatile(0x1BADB002);
            // the direct map sees the same physical memory
            assert_eq!(
                frame.start().into_virt().into_ptr::<u64>().read_volatile(),
                0x1BADB002
            );
        }

        deallocate_special(current, window);
        frame_list::deallocate_page(frame);
    }

    #[test_case]
    fn heap_smoke() {
        let boxed = Box::new(0xC0FFEEusize);
        assert_eq!(*boxed, 0xC0FFEE);

        let mut v = Vec::new();
        for i in 0..4096usize {
            v.push(i);
        }
        assert_eq!(v.iter().sum::<usize>(), 4096 * 4095 / 2);
    }
}
