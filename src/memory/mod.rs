pub mod arena;
pub mod cache;
pub mod frame_list;
pub mod heap;
pub mod paging;

use core::{
    fmt::{Debug, LowerHex},
    ops::{Add, AddAssign, Sub, SubAssign},
};

use spin::Lazy;
use thiserror::Error;

use crate::boot;
use paging::PAGE_SIZE;

/// A virtual memory address
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
#[repr(transparent)]
pub struct VirtAddr(usize);

/// A physical memory address
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
#[repr(transparent)]
pub struct PhysAddr(usize);

impl Debug for VirtAddr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "VirtAddr({self:#x})")
    }
}

impl Debug for PhysAddr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "PhysAddr({self:#x})")
    }
}

macro_rules! impl_addr_ty {
    ($ty: ty) => {
        impl $ty {
            #[inline(always)]
            pub const fn null() -> Self {
                Self(0)
            }

            #[inline(always)]
            pub const fn from(value: usize) -> Self {
                Self(value)
            }

            #[inline(always)]
            pub const fn into_raw(self) -> usize {
                self.0
            }

            #[inline(always)]
            pub const fn is_aligned_to(self, alignment: usize) -> bool {
                self.0 % alignment == 0
            }

            #[inline(always)]
            pub const fn align_up(self, alignment: usize) -> Self {
                Self(align_up(self.0, alignment))
            }

            #[inline(always)]
            pub const fn align_down(self, alignment: usize) -> Self {
                Self(align_down(self.0, alignment))
            }
        }

        impl LowerHex for $ty {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                LowerHex::fmt(&self.0, f)
            }
        }

        impl From<usize> for $ty {
            #[inline(always)]
            fn from(value: usize) -> Self {
                Self::from(value)
            }
        }

        impl Add<usize> for $ty {
            type Output = $ty;
            #[inline(always)]
            fn add(self, rhs: usize) -> Self::Output {
                Self(self.0 + rhs)
            }
        }

        impl AddAssign<usize> for $ty {
            #[inline(always)]
            fn add_assign(&mut self, rhs: usize) {
                *self = *self + rhs
            }
        }

        impl Sub<$ty> for $ty {
            type Output = usize;
            #[inline(always)]
            fn sub(self, rhs: $ty) -> Self::Output {
                self.0 - rhs.0
            }
        }

        impl Sub<usize> for $ty {
            type Output = Self;
            #[inline(always)]
            fn sub(self, rhs: usize) -> Self::Output {
                Self(self.0 - rhs)
            }
        }

        impl SubAssign<usize> for $ty {
            #[inline(always)]
            fn sub_assign(&mut self, rhs: usize) {
                *self = *self - rhs
            }
        }
    };
}

impl_addr_ty!(VirtAddr);
impl_addr_ty!(PhysAddr);

#[inline(always)]
pub const fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

#[inline(always)]
pub const fn align_down(value: usize, alignment: usize) -> usize {
    value & !(alignment - 1)
}

impl VirtAddr {
    #[inline(always)]
    pub fn from_ptr<T: ?Sized>(value: *const T) -> Self {
        Self(value.addr())
    }

    #[inline(always)]
    pub const fn into_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// Returns the physical address this virtual address aliases, assuming it
    /// lies inside the (cached) direct map. Internal fast path for addresses
    /// obtained from [`PhysAddr::into_virt`].
    #[inline(always)]
    pub fn into_phys(self) -> PhysAddr {
        debug_assert!(direct_map().contains_virt(self));
        PhysAddr(self.0 - direct_map().base.0)
    }

    /// The checked inverse of the direct-map conversions: succeeds when the
    /// address falls inside either the cached or the non-cached direct map.
    pub fn try_into_phys(self) -> Result<PhysAddr, AddressNotInDirectMap> {
        let dm = direct_map();
        if dm.contains_virt(self) {
            return Ok(PhysAddr(self.0 - dm.base.0));
        }
        let nc = non_cached_direct_map();
        if nc.contains_virt(self) {
            return Ok(PhysAddr(self.0 - nc.base.0));
        }
        Err(AddressNotInDirectMap(self))
    }
}

impl PhysAddr {
    /// This physical address as seen through the direct map.
    #[inline(always)]
    pub fn into_virt(self) -> VirtAddr {
        VirtAddr(self.0 + direct_map().base.0)
    }

    /// This physical address as seen through the non-cached direct map.
    /// Used for MMIO that must bypass the cache (e.g. the local APIC).
    #[inline(always)]
    pub fn into_virt_noncached(self) -> VirtAddr {
        VirtAddr(self.0 + non_cached_direct_map().base.0)
    }
}

impl<T> From<*const T> for VirtAddr {
    #[inline(always)]
    fn from(value: *const T) -> Self {
        Self::from_ptr(value)
    }
}

impl<T> From<*mut T> for VirtAddr {
    #[inline(always)]
    fn from(value: *mut T) -> Self {
        Self::from_ptr(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("virtual address {0:?} is not inside a direct map")]
pub struct AddressNotInDirectMap(pub VirtAddr);

/// A contiguous range of physical memory.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PhysRange {
    start: PhysAddr,
    size: usize,
}

/// A contiguous range of virtual memory.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct VirtRange {
    start: VirtAddr,
    size: usize,
}

macro_rules! impl_range_ty {
    ($ty: ty, $addr: ty) => {
        impl $ty {
            #[inline(always)]
            pub const fn new(start: $addr, size: usize) -> Self {
                Self { start, size }
            }

            pub fn from_start_end(start: $addr, end: $addr) -> Self {
                Self {
                    start,
                    size: end - start,
                }
            }

            #[inline(always)]
            pub const fn start(&self) -> $addr {
                self.start
            }

            #[inline(always)]
            pub const fn size(&self) -> usize {
                self.size
            }

            #[inline(always)]
            pub fn end(&self) -> $addr {
                self.start + self.size
            }

            #[inline(always)]
            pub fn contains(&self, addr: $addr) -> bool {
                self.start <= addr && addr < self.end()
            }

            #[inline(always)]
            pub fn contains_range(&self, other: &Self) -> bool {
                self.start <= other.start && other.end() <= self.end()
            }
        }

        impl Debug for $ty {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(
                    f,
                    concat!(stringify!($ty), "({:#x}..{:#x})"),
                    self.start,
                    self.end()
                )
            }
        }
    };
}

impl_range_ty!(PhysRange, PhysAddr);
impl_range_ty!(VirtRange, VirtAddr);

/// A linear virtual alias of all physical memory at a fixed offset.
#[derive(Debug, Clone, Copy)]
pub struct DirectMap {
    pub base: VirtAddr,
    pub size: usize,
}

impl DirectMap {
    #[inline(always)]
    pub fn contains_virt(&self, addr: VirtAddr) -> bool {
        self.base <= addr && addr < self.base + self.size
    }
}

/// The direct-map span covers at least 4 GiB or the highest memory-map
/// entry, whichever is larger, rounded up to the largest page size.
fn direct_map_span() -> usize {
    const MIN_SPAN: usize = 4 * 1024 * 1024 * 1024;

    let mut highest = 0usize;
    for entry in boot::mmap_response().entries() {
        let end = (entry.base + entry.length) as usize;
        if end > highest {
            highest = end;
        }
    }

    align_up(highest.max(MIN_SPAN), layout::LARGEST_PAGE_SIZE)
}

static DIRECT_MAP: Lazy<DirectMap> = Lazy::new(|| DirectMap {
    base: VirtAddr::from(*boot::HHDM),
    size: direct_map_span(),
});

static NON_CACHED_DIRECT_MAP: Lazy<DirectMap> = Lazy::new(|| DirectMap {
    base: layout::NON_CACHED_DIRECT_MAP_BASE,
    size: direct_map_span(),
});

#[inline(always)]
pub fn direct_map() -> &'static DirectMap {
    &DIRECT_MAP
}

#[inline(always)]
pub fn non_cached_direct_map() -> &'static DirectMap {
    &NON_CACHED_DIRECT_MAP
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn alignment_helpers() {
        assert_eq!(align_up(1, 2), 2);
        assert_eq!(align_up(0x1001, 0x1000), 0x2000);
        assert_eq!(align_down(0x1FFF, 0x1000), 0x1000);
        assert_eq!(align_up(0x1000, 0x1000), 0x1000);

        let addr = VirtAddr::from(0x1234);
        assert_eq!(addr.align_up(0x1000).into_raw(), 0x2000);
        assert_eq!(addr.align_down(0x1000).into_raw(), 0x1000);
        assert!(VirtAddr::from(0x2000).is_aligned_to(0x1000));
    }

    #[test_case]
    fn range_containment() {
        let range = VirtRange::new(VirtAddr::from(0x1000), 0x1000);
        assert_eq!(range.end(), VirtAddr::from(0x2000));
        assert!(range.contains(VirtAddr::from(0x1000)));
        assert!(range.contains(VirtAddr::from(0x1FFF)));
        assert!(!range.contains(VirtAddr::from(0x2000)));

        let inner = VirtRange::new(VirtAddr::from(0x1800), 0x800);
        assert!(range.contains_range(&inner));
        assert!(!inner.contains_range(&range));
    }

    #[test_case]
    fn direct_map_conversions_roundtrip() {
        let phys = PhysAddr::from(0x1000);
        let virt = phys.into_virt();
        assert_eq!(virt.into_phys(), phys);
        assert_eq!(virt.try_into_phys(), Ok(phys));

        let nc = phys.into_virt_noncached();
        assert_ne!(nc, virt);
        assert_eq!(nc.try_into_phys(), Ok(phys));

        // the kernel image is in neither direct map
        let code = VirtAddr::from(direct_map_conversions_roundtrip as usize);
        assert_eq!(code.try_into_phys(), Err(AddressNotInDirectMap(code)));
    }

    #[test_case]
    fn direct_map_covers_at_least_four_gib() {
        assert!(direct_map().size >= 4 * 1024 * 1024 * 1024);
        assert_eq!(direct_map().size % layout::LARGEST_PAGE_SIZE, 0);
        assert_eq!(direct_map().size, non_cached_direct_map().size);
    }
}

/// Fixed virtual-memory layout of the kernel address space.
pub mod layout {
    use super::{PAGE_SIZE, VirtAddr};

    pub const LARGEST_PAGE_SIZE: usize = 1024 * 1024 * 1024;

    /// Usable bytes of every kernel stack, excluding the guard page.
    pub const KERNEL_STACK_SIZE: usize = 16 * PAGE_SIZE;
    /// One unmapped page at the low end of each stack.
    pub const STACK_GUARD_SIZE: usize = PAGE_SIZE;

    pub const KERNEL_HEAP_BASE: VirtAddr = VirtAddr::from(0xFFFF_A000_0000_0000);
    pub const KERNEL_HEAP_SIZE: usize = 64 * 1024 * 1024 * 1024;

    pub const KERNEL_STACKS_BASE: VirtAddr = VirtAddr::from(0xFFFF_B000_0000_0000);
    pub const KERNEL_STACKS_SIZE: usize = 64 * 1024 * 1024 * 1024;

    pub const KERNEL_SPECIAL_BASE: VirtAddr = VirtAddr::from(0xFFFF_C000_0000_0000);
    pub const KERNEL_SPECIAL_SIZE: usize = 64 * 1024 * 1024 * 1024;

    pub const NON_CACHED_DIRECT_MAP_BASE: VirtAddr = VirtAddr::from(0xFFFF_D000_0000_0000);
}
