//! Slab-style typed object pools.
//!
//! A cache owns slabs carved out of the kernel heap and recycles fixed-size
//! objects of one type. Allocation runs the cache's constructor on a raw
//! slot, deallocation runs the destructor and returns the slot to the free
//! list. Free slots store the free-list link inside the object memory
//! itself.

use core::alloc::Layout;
use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::ptr::{self, NonNull};

use thiserror::Error;

use super::paging::PAGE_SIZE;
use crate::task::TaskRef;
use crate::utils::locks::TicketSpinLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("object construction failed")]
    ObjectConstructionFailed,
    #[error("failed to grow the cache")]
    SlabAllocationFailed,
}

pub type Ctor<T> = fn(TaskRef, &mut MaybeUninit<T>) -> Result<(), CacheError>;
pub type Dtor<T> = fn(TaskRef, &mut T);

/// Free-slot overlay written into unconstructed object memory.
struct FreeSlot {
    next: *mut FreeSlot,
}

struct CacheInner {
    free: *mut FreeSlot,
    slabs: usize,
    live: usize,
}

pub struct ObjectCache<T> {
    name: &'static str,
    ctor: Ctor<T>,
    dtor: Dtor<T>,
    lock: TicketSpinLock,
    inner: UnsafeCell<CacheInner>,
}

unsafe impl<T> Sync for ObjectCache<T> {}
unsafe impl<T> Send for ObjectCache<T> {}

impl<T> ObjectCache<T> {
    pub const fn new(name: &'static str, ctor: Ctor<T>, dtor: Dtor<T>) -> Self {
        assert!(size_of::<T>() >= size_of::<FreeSlot>());
        assert!(align_of::<T>() >= align_of::<FreeSlot>());
        Self {
            name,
            ctor,
            dtor,
            lock: TicketSpinLock::new(),
            inner: UnsafeCell::new(CacheInner {
                free: ptr::null_mut(),
                slabs: 0,
                live: 0,
            }),
        }
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }

    const fn objects_per_slab() -> usize {
        let per_page = PAGE_SIZE / size_of::<T>();
        if per_page == 0 { 1 } else { per_page }
    }

    /// Pops a slot (growing the cache if needed) and constructs an object
    /// in it. The constructor runs outside the cache lock; it is allowed to
    /// allocate.
    pub fn allocate(&self, current: TaskRef) -> Result<NonNull<T>, CacheError> {
        let slot = self.pop_slot(current)?;

        let uninit = unsafe { &mut *slot.cast::<MaybeUninit<T>>().as_ptr() };
        if let Err(e) = (self.ctor)(current, uninit) {
            self.push_slot(current, slot);
            return Err(e);
        }

        self.lock.lock(current);
        unsafe { &mut *self.inner.get() }.live += 1;
        self.lock.unlock(current);

        Ok(slot.cast())
    }

    /// Destroys the object and returns its slot to the pool.
    ///
    /// # Safety
    /// `object` must have come from this cache's [`Self::allocate`] and must
    /// not be used afterwards.
    pub unsafe fn deallocate(&self, current: TaskRef, object: NonNull<T>) {
        (self.dtor)(current, unsafe { &mut *object.as_ptr() });

        self.lock.lock(current);
        unsafe { &mut *self.inner.get() }.live -= 1;
        self.lock.unlock(current);

        self.push_slot(current, object.cast());
    }

    pub fn live_objects(&self, current: TaskRef) -> usize {
        self.lock.lock(current);
        let v = unsafe { &*self.inner.get() }.live;
        self.lock.unlock(current);
        v
    }

    fn pop_slot(&self, current: TaskRef) -> Result<NonNull<FreeSlot>, CacheError> {
        self.lock.lock(current);
        let inner = unsafe { &mut *self.inner.get() };

        if inner.free.is_null() {
            // grow by one slab; the heap allocation happens without the
            // cache lock so drop it first
            self.lock.unlock(current);
            let slab = self.allocate_slab()?;
            self.lock.lock(current);
            let inner = unsafe { &mut *self.inner.get() };
            for i in 0..Self::objects_per_slab() {
                let slot = unsafe { slab.as_ptr().add(i).cast::<FreeSlot>() };
                unsafe { (*slot).next = inner.free };
                inner.free = slot;
            }
            inner.slabs += 1;
        }

        let inner = unsafe { &mut *self.inner.get() };
        let slot = inner.free;
        debug_assert!(!slot.is_null());
        inner.free = unsafe { (*slot).next };
        self.lock.unlock(current);

        Ok(unsafe { NonNull::new_unchecked(slot) })
    }

    fn push_slot(&self, current: TaskRef, slot: NonNull<FreeSlot>) {
        self.lock.lock(current);
        let inner = unsafe { &mut *self.inner.get() };
        unsafe { slot.as_ptr().write(FreeSlot { next: inner.free }) };
        inner.free = slot.as_ptr();
        self.lock.unlock(current);
    }

    fn allocate_slab(&self) -> Result<NonNull<T>, CacheError> {
        let layout = Layout::array::<T>(Self::objects_per_slab())
            .map_err(|_| CacheError::SlabAllocationFailed)?;
        let ptr = unsafe { alloc::alloc::alloc(layout) };
        NonNull::new(ptr.cast()).ok_or(CacheError::SlabAllocationFailed)
    }
}

impl<T> core::fmt::Debug for ObjectCache<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ObjectCache")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task;
    use core::sync::atomic::{AtomicUsize, Ordering};

    struct Tracked {
        value: usize,
        _pad: [usize; 3],
    }

    static CTOR_RUNS: AtomicUsize = AtomicUsize::new(0);
    static DTOR_RUNS: AtomicUsize = AtomicUsize::new(0);

    fn tracked_ctor(_current: TaskRef, slot: &mut MaybeUninit<Tracked>) -> Result<(), CacheError> {
        CTOR_RUNS.fetch_add(1, Ordering::Relaxed);
        slot.write(Tracked {
            value: 0xDEAD,
            _pad: [0; 3],
        });
        Ok(())
    }

    fn tracked_dtor(_current: TaskRef, obj: &mut Tracked) {
        DTOR_RUNS.fetch_add(1, Ordering::Relaxed);
        obj.value = 0;
    }

    static TRACKED_CACHE: ObjectCache<Tracked> =
        ObjectCache::new("test-tracked", tracked_ctor, tracked_dtor);

    #[test_case]
    fn cache_constructs_and_destroys() {
        let current = task::current();
        let ctors_before = CTOR_RUNS.load(Ordering::Relaxed);
        let dtors_before = DTOR_RUNS.load(Ordering::Relaxed);

        let obj = TRACKED_CACHE.allocate(current).unwrap();
        assert_eq!(unsafe { obj.as_ref() }.value, 0xDEAD);
        assert_eq!(CTOR_RUNS.load(Ordering::Relaxed), ctors_before + 1);
        assert_eq!(TRACKED_CACHE.live_objects(current), 1);

        unsafe { TRACKED_CACHE.deallocate(current, obj) };
        assert_eq!(DTOR_RUNS.load(Ordering::Relaxed), dtors_before + 1);
        assert_eq!(TRACKED_CACHE.live_objects(current), 0);

        // the slot is recycled
        let again = TRACKED_CACHE.allocate(current).unwrap();
        assert_eq!(again, obj);
        unsafe { TRACKED_CACHE.deallocate(current, again) };
    }
}
