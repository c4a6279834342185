//! Guard-paged kernel stacks.
//!
//! Stacks live in their own virtual region so an overflow lands in the
//! unmapped guard page at the low end and faults instead of corrupting a
//! neighbor. The region is managed by a page-quantum arena; only the
//! usable part of each stack is backed by frames.

use core::fmt::Debug;

use thiserror::Error;

use crate::executor::flush;
use crate::memory::{
    VirtAddr, VirtRange, align_down,
    arena::{AllocPolicy, ArenaError, ResourceArena},
    layout,
    paging::{self, EntryFlags, FreeFrames, MapToError, PAGE_SIZE},
};
use crate::task::TaskRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("kernel stack overflow")]
pub struct StackOverflow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StackAllocError {
    #[error(transparent)]
    Arena(#[from] ArenaError),
    #[error(transparent)]
    Map(#[from] MapToError),
}

static STACK_ARENA: ResourceArena = ResourceArena::new("kernel-stacks", PAGE_SIZE, None);

/// Seeds the stack arena with its virtual region. Stage-1 only.
pub(crate) fn init(current: TaskRef) {
    STACK_ARENA.add_span(
        current,
        layout::KERNEL_STACKS_BASE.into_raw(),
        layout::KERNEL_STACKS_SIZE,
    );
}

/// Whether a faulting address lies in the kernel stack region, i.e. in a
/// guard page or an unbacked part of it. Used to diagnose overflows in the
/// page-fault handler.
pub fn is_guard_page_address(addr: VirtAddr) -> bool {
    let region = VirtRange::new(layout::KERNEL_STACKS_BASE, layout::KERNEL_STACKS_SIZE);
    region.contains(addr)
}

pub struct Stack {
    /// The whole reservation, guard page included.
    range: VirtRange,
    /// The mapped part.
    usable_range: VirtRange,
    stack_pointer: VirtAddr,
    top: VirtAddr,
}

impl Stack {
    /// Builds a stack over an existing mapping. Both ranges must be 16-byte
    /// aligned and `usable_range` must lie inside `range`.
    pub fn from_range(range: VirtRange, usable_range: VirtRange) -> Self {
        assert!(range.contains_range(&usable_range));
        assert!(usable_range.start().is_aligned_to(16));
        assert!(usable_range.end().is_aligned_to(16));

        let mut stack = Self {
            range,
            usable_range,
            stack_pointer: usable_range.end(),
            top: usable_range.end(),
        };
        stack.reset();
        stack
    }

    /// Allocates and maps a fresh kernel stack with its guard page.
    pub fn allocate(current: TaskRef) -> Result<Self, StackAllocError> {
        let total = layout::KERNEL_STACK_SIZE + layout::STACK_GUARD_SIZE;
        let span = STACK_ARENA.allocate(current, total, AllocPolicy::InstantFit)?;

        let range = VirtRange::new(VirtAddr::from(span.base), total);
        let usable_range = VirtRange::new(
            VirtAddr::from(span.base + layout::STACK_GUARD_SIZE),
            layout::KERNEL_STACK_SIZE,
        );

        if let Err(e) = paging::alloc_map_range(
            current,
            usable_range,
            EntryFlags::WRITE | EntryFlags::DISABLE_EXEC,
        ) {
            STACK_ARENA.deallocate(current, span);
            return Err(e.into());
        }

        Ok(Self::from_range(range, usable_range))
    }

    /// Unmaps the stack and returns its reservation to the arena.
    pub(crate) fn free(current: TaskRef, stack: &Stack) {
        paging::unmap_range(current, stack.usable_range, FreeFrames::Yes);
        flush::flush_range(current, stack.usable_range);
        STACK_ARENA.deallocate_base(current, stack.range.start().into_raw());
    }

    pub const fn top(&self) -> VirtAddr {
        self.top
    }

    pub const fn stack_pointer(&self) -> VirtAddr {
        self.stack_pointer
    }

    pub const fn usable_range(&self) -> VirtRange {
        self.usable_range
    }

    pub const fn range(&self) -> VirtRange {
        self.range
    }

    /// Empties the stack and pre-pushes the null return address that
    /// terminates backtraces.
    pub fn reset(&mut self) {
        self.stack_pointer = self.top;
        self.push(0usize)
            .expect("an empty stack cannot overflow on one word");
    }

    /// Pushes `value`. On overflow the stack pointer is left untouched.
    pub fn push<T>(&mut self, value: T) -> Result<(), StackOverflow> {
        let new_pointer = self.stack_pointer.into_raw().checked_sub(size_of::<T>());
        let new_pointer = new_pointer.ok_or(StackOverflow)?;
        if new_pointer < self.usable_range.start().into_raw() {
            return Err(StackOverflow);
        }

        let new_pointer = VirtAddr::from(new_pointer);
        unsafe {
            new_pointer.into_ptr::<T>().write(value);
        }
        self.stack_pointer = new_pointer;
        Ok(())
    }

    /// Pops the value most recently pushed. The caller is responsible for
    /// matching the pushed type.
    pub fn pop<T>(&mut self) -> T {
        debug_assert!(self.stack_pointer + size_of::<T>() <= self.top);
        let value = unsafe { self.stack_pointer.into_ptr::<T>().read() };
        self.stack_pointer += size_of::<T>();
        value
    }

    /// Aligns the stack pointer down to `alignment` (a power of two).
    pub fn align_to(&mut self, alignment: usize) -> Result<(), StackOverflow> {
        debug_assert!(alignment.is_power_of_two());
        let aligned = align_down(self.stack_pointer.into_raw(), alignment);
        if aligned < self.usable_range.start().into_raw() {
            return Err(StackOverflow);
        }
        self.stack_pointer = VirtAddr::from(aligned);
        Ok(())
    }

    /// The location the context switch saves the stack pointer into.
    pub(crate) fn stack_pointer_slot(&mut self) -> *mut usize {
        (&raw mut self.stack_pointer).cast()
    }
}

impl Debug for Stack {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Stack")
            .field("range", &self.range)
            .field("usable_range", &self.usable_range)
            .field("stack_pointer", &self.stack_pointer)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task;

    #[test_case]
    fn stack_push_pop_roundtrip() {
        let current = task::current();
        let mut stack = Stack::allocate(current).unwrap();
        let pointer_before = stack.stack_pointer();

        stack.push(0xDEAD_BEEFusize).unwrap();
        assert_eq!(stack.pop::<usize>(), 0xDEAD_BEEF);
        assert_eq!(stack.stack_pointer(), pointer_before);

        Stack::free(current, &stack);
    }

    #[test_case]
    fn stack_overflow_leaves_pointer_untouched() {
        let current = task::current();
        let mut stack = Stack::allocate(current).unwrap();
        assert_eq!(stack.usable_range().size(), 64 * 1024);

        // fill the stack to the brim; the null return address is already
        // pushed so one word is spoken for
        let words = stack.usable_range().size() / size_of::<usize>() - 1;
        for i in 0..words {
            stack.push(i).unwrap();
        }
        assert_eq!(stack.stack_pointer(), stack.usable_range().start());

        // any further push of any size must fail without mutating state
        let pointer_before = stack.stack_pointer();
        assert_eq!(stack.push(0u8), Err(StackOverflow));
        assert_eq!(stack.push([0usize; 4]), Err(StackOverflow));
        assert_eq!(stack.stack_pointer(), pointer_before);

        Stack::free(current, &stack);
    }

    #[test_case]
    fn stack_guard_page_is_unmapped() {
        let current = task::current();
        let stack = Stack::allocate(current).unwrap();

        assert_eq!(
            stack.range().size(),
            stack.usable_range().size() + PAGE_SIZE
        );
        assert_eq!(
            stack.usable_range().start() - stack.range().start(),
            PAGE_SIZE
        );
        assert!(is_guard_page_address(stack.range().start()));

        Stack::free(current, &stack);
    }
}
