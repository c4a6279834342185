//! Lock-free list of free physical page frames.
//!
//! The list is an intrusive LIFO whose nodes live *inside* the free pages:
//! the first machine word of every free page holds the (direct-map) pointer
//! to the next free page. No other subsystem ever walks these nodes; this
//! module is the single writer of free-page memory.

use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use limine::memory_map::EntryType;
use thiserror::Error;

use super::{PhysAddr, PhysRange, paging::PAGE_SIZE};
use crate::boot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("out of physical memory")]
pub struct OutOfPhysicalMemory;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameListError {
    #[error("range {0:?} is not aligned to the standard page size")]
    UnalignedRange(PhysRange),
}

/// Header view of a free page: the link to the next free page.
#[repr(C)]
struct FrameNode {
    next: *mut FrameNode,
}

pub struct PhysicalFrameList {
    /// Direct-map pointer to the most recently freed page.
    head: AtomicPtr<FrameNode>,
    free_pages: AtomicUsize,
    // boot-time accounting, written once by `init`
    usable_pages: AtomicUsize,
    reclaimable_pages: AtomicUsize,
    reserved_pages: AtomicUsize,
    unusable_pages: AtomicUsize,
}

pub static FRAME_LIST: PhysicalFrameList = PhysicalFrameList::new();

impl PhysicalFrameList {
    const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            free_pages: AtomicUsize::new(0),
            usable_pages: AtomicUsize::new(0),
            reclaimable_pages: AtomicUsize::new(0),
            reserved_pages: AtomicUsize::new(0),
            unusable_pages: AtomicUsize::new(0),
        }
    }

    /// Pops one standard-size page off the list.
    pub fn allocate_page(&self) -> Result<PhysRange, OutOfPhysicalMemory> {
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            if head.is_null() {
                return Err(OutOfPhysicalMemory);
            }

            let next = unsafe { (*head).next };
            match self
                .head
                .compare_exchange(head, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(observed) => head = observed,
            }
        }

        self.free_pages.fetch_sub(1, Ordering::Release);

        #[cfg(debug_assertions)]
        unsafe {
            ptr::write_bytes(head.cast::<u8>(), 0xAA, PAGE_SIZE);
        }

        let addr = crate::VirtAddr::from_ptr(head).into_phys();
        debug_assert!(addr.is_aligned_to(PAGE_SIZE));
        Ok(PhysRange::new(addr, PAGE_SIZE))
    }

    /// Pushes one standard-size page back onto the list.
    pub fn deallocate_page(&self, range: PhysRange) {
        debug_assert_eq!(range.size(), PAGE_SIZE);
        debug_assert!(range.start().is_aligned_to(PAGE_SIZE));

        let node = range.start().into_virt().into_ptr::<FrameNode>();
        unsafe { (*node).next = ptr::null_mut() };
        self.push_chain(node, node, 1);
    }

    /// Frees a contiguous multi-page range. The pages are first threaded
    /// into a private chain through the direct map, then the whole chain is
    /// published with a single compare-exchange of the global head.
    pub fn deallocate_range(&self, range: PhysRange) -> Result<(), FrameListError> {
        if !range.start().is_aligned_to(PAGE_SIZE) || range.size() % PAGE_SIZE != 0 {
            return Err(FrameListError::UnalignedRange(range));
        }
        if range.size() == 0 {
            return Ok(());
        }

        let pages = range.size() / PAGE_SIZE;
        let first = range.start().into_virt().into_ptr::<FrameNode>();
        let mut node = first;
        for i in 1..pages {
            let next = (range.start() + i * PAGE_SIZE).into_virt().into_ptr::<FrameNode>();
            unsafe { (*node).next = next };
            node = next;
        }
        unsafe { (*node).next = ptr::null_mut() };

        self.push_chain(first, node, pages);
        Ok(())
    }

    /// Publishes the chain `first..=last` (already linked) as the new list
    /// head.
    fn push_chain(&self, first: *mut FrameNode, last: *mut FrameNode, pages: usize) {
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            unsafe { (*last).next = head };
            match self
                .head
                .compare_exchange(head, first, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(observed) => head = observed,
            }
        }
        self.free_pages.fetch_add(pages, Ordering::Release);
    }

    /// Number of pages currently on the free list. Eventually consistent
    /// with the list itself.
    pub fn free_pages(&self) -> usize {
        self.free_pages.load(Ordering::Acquire)
    }

    pub fn usable_pages(&self) -> usize {
        self.usable_pages.load(Ordering::Relaxed)
    }

    pub fn reclaimable_pages(&self) -> usize {
        self.reclaimable_pages.load(Ordering::Relaxed)
    }

    pub fn reserved_pages(&self) -> usize {
        self.reserved_pages.load(Ordering::Relaxed)
    }

    pub fn unusable_pages(&self) -> usize {
        self.unusable_pages.load(Ordering::Relaxed)
    }

    /// Counts the nodes actually on the list. O(n), test/debug only.
    #[cfg(test)]
    fn count_frames_expensive(&self) -> usize {
        let mut current = self.head.load(Ordering::Acquire);
        let mut n = 0;
        while !current.is_null() {
            n += 1;
            current = unsafe { (*current).next };
        }
        n
    }
}

/// Seeds [`FRAME_LIST`] from the bootloader memory map. Usable entries
/// become free pages; reclaimable entries still hold live bootloader data
/// (the MP descriptors among other things) and are only accounted, never
/// freed during bring-up.
pub fn init() {
    let mmap = boot::mmap_response();

    let mut usable = 0usize;
    let mut reclaimable = 0usize;
    let mut reserved = 0usize;
    let mut unusable = 0usize;

    // walk back to front so that low memory ends up nearest the head
    for entry in mmap.entries().iter().rev() {
        let pages = (entry.length as usize) / PAGE_SIZE;
        if entry.entry_type == EntryType::USABLE {
            let base = PhysAddr::from(entry.base as usize).align_up(PAGE_SIZE);
            let end = (entry.base as usize + entry.length as usize) & !(PAGE_SIZE - 1);
            if end <= base.into_raw() {
                continue;
            }
            let size = end - base.into_raw();
            usable += size / PAGE_SIZE;
            FRAME_LIST
                .deallocate_range(PhysRange::new(base, size))
                .expect("memory map entry not page-granular");
        } else if entry.entry_type == EntryType::BOOTLOADER_RECLAIMABLE
            || entry.entry_type == EntryType::ACPI_RECLAIMABLE
        {
            reclaimable += pages;
        } else if entry.entry_type == EntryType::BAD_MEMORY {
            unusable += pages;
        } else {
            reserved += pages;
        }
    }

    FRAME_LIST.usable_pages.store(usable, Ordering::Relaxed);
    FRAME_LIST
        .reclaimable_pages
        .store(reclaimable, Ordering::Relaxed);
    FRAME_LIST.reserved_pages.store(reserved, Ordering::Relaxed);
    FRAME_LIST.unusable_pages.store(unusable, Ordering::Relaxed);

    crate::info!(
        "frame list: {} usable, {} reclaimable, {} reserved, {} unusable pages",
        usable,
        reclaimable,
        reserved,
        unusable
    );
}

#[inline(always)]
pub fn allocate_page() -> Result<PhysRange, OutOfPhysicalMemory> {
    FRAME_LIST.allocate_page()
}

#[inline(always)]
pub fn deallocate_page(range: PhysRange) {
    FRAME_LIST.deallocate_page(range)
}

#[inline(always)]
pub fn deallocate_range(range: PhysRange) {
    // there is no safe recovery from a bad free in a kernel without a
    // fallback allocator
    FRAME_LIST
        .deallocate_range(range)
        .expect("deallocate_range: bad range");
}

#[test_case]
fn frame_allocate_roundtrip() {
    let free_before = FRAME_LIST.free_pages();

    let range = allocate_page().unwrap();
    assert_eq!(range.size(), PAGE_SIZE);
    assert!(range.start().is_aligned_to(PAGE_SIZE));
    assert_eq!(FRAME_LIST.free_pages(), free_before - 1);

    deallocate_page(range);
    assert_eq!(FRAME_LIST.free_pages(), free_before);

    // LIFO: the page just freed comes back first
    let again = allocate_page().unwrap();
    assert_eq!(again.start(), range.start());
    deallocate_page(again);
}

#[test_case]
fn frame_range_roundtrip() {
    let free_before = FRAME_LIST.free_pages();

    let mut frames = heapless::Vec::<PhysRange, 8>::new();
    for _ in 0..8 {
        frames.push(allocate_page().unwrap()).unwrap();
    }
    assert_eq!(FRAME_LIST.free_pages(), free_before - 8);

    for frame in frames {
        deallocate_page(frame);
    }
    assert_eq!(FRAME_LIST.free_pages(), free_before);
}

#[test_case]
fn frame_count_matches_list() {
    let counted = FRAME_LIST.count_frames_expensive();
    assert_eq!(counted, FRAME_LIST.free_pages());
}
