//! x86_64 four-level page tables.

use core::arch::asm;
use core::fmt::Debug;
use core::ops::{Index, IndexMut};

use bitflags::bitflags;

use crate::memory::{
    PhysAddr, VirtAddr,
    frame_list::FRAME_LIST,
    paging::{EntryFlags, MapToError, PAGE_SIZE, Page},
};

const ENTRY_COUNT: usize = 512;

const fn p4_index(addr: usize) -> usize {
    (addr >> 39) & 0x1FF
}
const fn p3_index(addr: usize) -> usize {
    (addr >> 30) & 0x1FF
}
const fn p2_index(addr: usize) -> usize {
    (addr >> 21) & 0x1FF
}
const fn p1_index(addr: usize) -> usize {
    (addr >> 12) & 0x1FF
}

const fn translate(addr: VirtAddr) -> (usize, usize, usize, usize) {
    let addr = addr.into_raw();
    (
        p1_index(addr),
        p2_index(addr),
        p3_index(addr),
        p4_index(addr),
    )
}

bitflags! {
    #[derive(Debug, Clone, Copy)]
    struct ArchEntryFlags: u64 {
        const PRESENT         = 1;
        const WRITABLE        = 1 << 1;
        const USER_ACCESSIBLE = 1 << 2;
        const PWT             = 1 << 3;
        const PCD             = 1 << 4;
        const ACCESSED        = 1 << 5;
        const DIRTY           = 1 << 6;
        const HUGE_PAGE       = 1 << 7;
        const GLOBAL          = 1 << 8;
        const NO_EXECUTE      = 1 << 63;
    }
}

impl ArchEntryFlags {
    /// Flags for the non-leaf levels: permissive, the leaf decides.
    const fn outer() -> Self {
        Self::PRESENT.union(Self::WRITABLE)
    }

    fn leaf(value: EntryFlags) -> Self {
        let mut this = ArchEntryFlags::PRESENT;
        if value.contains(EntryFlags::WRITE) {
            this |= ArchEntryFlags::WRITABLE;
        }
        if value.contains(EntryFlags::DEVICE_UNCACHEABLE) {
            this |= ArchEntryFlags::PCD;
        }
        if value.contains(EntryFlags::DISABLE_EXEC) {
            this |= ArchEntryFlags::NO_EXECUTE;
        }
        this
    }
}

/// A page table entry.
#[derive(Clone)]
#[repr(transparent)]
pub struct Entry(u64);

impl Debug for Entry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("Entry")
            .field(&format_args!("{:#x}", self.0))
            .field(&self.flags())
            .finish()
    }
}

impl Entry {
    const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

    fn addr(&self) -> Option<PhysAddr> {
        if self.flags().contains(ArchEntryFlags::PRESENT) {
            return Some(PhysAddr::from((self.0 & Self::ADDR_MASK) as usize));
        }
        None
    }

    fn flags(&self) -> ArchEntryFlags {
        ArchEntryFlags::from_bits_truncate(self.0)
    }

    const fn new(flags: ArchEntryFlags, addr: PhysAddr) -> Self {
        Self(addr.into_raw() as u64 | flags.bits())
    }

    const fn clear(&mut self) {
        self.0 = 0;
    }

    /// Returns the next-level table this entry points at, allocating and
    /// zeroing a fresh one if the entry was empty.
    fn next_table(&mut self) -> Result<&'static mut PageTable, MapToError> {
        if let Some(addr) = self.addr() {
            debug_assert!(!self.flags().contains(ArchEntryFlags::HUGE_PAGE));
            return Ok(unsafe { &mut *addr.into_virt().into_ptr::<PageTable>() });
        }

        let frame = FRAME_LIST.allocate_page()?;
        let table_ptr = frame.start().into_virt().into_ptr::<PageTable>();
        unsafe {
            (*table_ptr).zeroize();
        }
        *self = Self::new(ArchEntryFlags::outer(), frame.start());
        Ok(unsafe { &mut *table_ptr })
    }

    /// The next-level table, if one is mapped.
    fn mapped_table(&self) -> Option<&'static mut PageTable> {
        let addr = self.addr()?;
        if self.flags().contains(ArchEntryFlags::HUGE_PAGE) {
            return None;
        }
        Some(unsafe { &mut *addr.into_virt().into_ptr::<PageTable>() })
    }
}

#[derive(Debug)]
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [Entry; ENTRY_COUNT],
}

impl PageTable {
    pub fn zeroize(&mut self) {
        for entry in &mut self.entries {
            entry.clear();
        }
    }

    /// Maps one standard page. Does not invalidate the TLB.
    pub unsafe fn map_to(
        &mut self,
        page: Page,
        frame: PhysAddr,
        flags: EntryFlags,
    ) -> Result<(), MapToError> {
        debug_assert!(frame.is_aligned_to(PAGE_SIZE));
        let (l1, l2, l3, l4) = translate(page.virt_addr());

        let level_3 = self[l4].next_table()?;
        let level_2 = level_3[l3].next_table()?;
        let level_1 = level_2[l2].next_table()?;

        let entry = &mut level_1[l1];
        if entry.addr().is_some() {
            return Err(MapToError::AlreadyMapped(page));
        }

        *entry = Entry::new(ArchEntryFlags::leaf(flags), frame);
        Ok(())
    }

    /// Maps one 2 MiB page. `virt` and `frame` must be 2 MiB aligned.
    pub unsafe fn map_huge_to(
        &mut self,
        virt: VirtAddr,
        frame: PhysAddr,
        flags: EntryFlags,
    ) -> Result<(), MapToError> {
        const HUGE_PAGE: usize = 2 * 1024 * 1024;
        debug_assert!(virt.is_aligned_to(HUGE_PAGE));
        debug_assert!(frame.is_aligned_to(HUGE_PAGE));

        let (_, l2, l3, l4) = translate(virt);
        let level_3 = self[l4].next_table()?;
        let level_2 = level_3[l3].next_table()?;

        let entry = &mut level_2[l2];
        if entry.addr().is_some() {
            return Err(MapToError::AlreadyMapped(Page::containing_address(virt)));
        }

        *entry = Entry::new(
            ArchEntryFlags::leaf(flags).union(ArchEntryFlags::HUGE_PAGE),
            frame,
        );
        Ok(())
    }

    /// Unmaps one standard page and returns the frame it pointed at.
    /// Does not invalidate the TLB.
    pub unsafe fn unmap(&mut self, page: Page) -> Option<PhysAddr> {
        let entry = self.get_entry(page)?;
        let frame = entry.addr();
        entry.clear();
        frame
    }

    /// The frame a page resolves to, if mapped.
    pub fn get_frame(&self, page: Page) -> Option<PhysAddr> {
        let (l1, l2, l3, l4) = translate(page.virt_addr());
        let level_3 = self[l4].mapped_table()?;
        let level_2 = level_3[l3].mapped_table()?;
        let level_1 = level_2[l2].mapped_table()?;
        level_1[l1].addr()
    }

    fn get_entry(&mut self, page: Page) -> Option<&mut Entry> {
        let (l1, l2, l3, l4) = translate(page.virt_addr());
        let level_3 = self[l4].mapped_table()?;
        let level_2 = level_3[l3].mapped_table()?;
        let level_1 = level_2[l2].mapped_table()?;
        Some(&mut level_1[l1])
    }

    /// Populates the top-level entries covering `[base, base + size)` so the
    /// lower-level tables exist and are shared by everyone who loads this
    /// PML4.
    pub unsafe fn wire_top_level(
        &mut self,
        base: VirtAddr,
        size: usize,
    ) -> Result<(), MapToError> {
        let first = p4_index(base.into_raw());
        let last = p4_index((base + (size - 1)).into_raw());
        for index in first..=last {
            self[index].next_table()?;
        }
        Ok(())
    }
}

impl Index<usize> for PageTable {
    type Output = Entry;
    fn index(&self, index: usize) -> &Self::Output {
        &self.entries[index]
    }
}

impl IndexMut<usize> for PageTable {
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.entries[index]
    }
}

/// Physical address of the currently loaded PML4.
pub fn current_table_phys() -> PhysAddr {
    let phys: usize;
    unsafe {
        asm!("mov {}, cr3", out(reg) phys, options(nomem, nostack));
    }
    PhysAddr::from(phys & !(PAGE_SIZE - 1))
}

pub unsafe fn load_table_phys(phys: PhysAddr) {
    unsafe {
        asm!("mov cr3, {}", in(reg) phys.into_raw(), options(nostack));
    }
}

#[inline(always)]
pub fn invalidate_page(addr: VirtAddr) {
    unsafe {
        asm!("invlpg [{}]", in(reg) addr.into_raw(), options(nostack));
    }
}
