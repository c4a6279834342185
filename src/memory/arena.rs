//! Hierarchical resource arena: a range allocator over an integer space.
//!
//! An arena hands out quantum-aligned `[base, base + len)` intervals from
//! the spans it has been seeded with. A source-backed arena grows itself
//! lazily by importing spans from its source and gives a whole imported
//! span back the moment every allocation carved from it has been freed.
//!
//! Bookkeeping is done with boundary tags drawn from a global pool that is
//! refilled straight from the physical frame list, so arena operations
//! never re-enter the kernel heap (which is itself built on an arena).

use core::cell::UnsafeCell;
use core::fmt::Debug;
use core::ptr;

use thiserror::Error;

use super::{align_up, frame_list, paging::PAGE_SIZE};
use crate::task::TaskRef;
use crate::utils::locks::{Mutex, TicketSpinLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub base: usize,
    pub len: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AllocPolicy {
    /// First free segment (in address order) that fits.
    #[default]
    InstantFit,
    /// Smallest free segment that fits.
    BestFit,
    /// First fit, resuming from the previous allocation.
    NextFit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ArenaError {
    #[error("requested length unavailable")]
    RequestedLengthUnavailable,
    #[error("out of boundary tags")]
    OutOfTags,
}

/// A span provider layered under an arena. Imported spans are owned by the
/// importing arena until it releases them.
pub trait SpanSource: Sync {
    fn import(&self, current: TaskRef, len: usize) -> Result<Allocation, ArenaError>;
    fn release(&self, current: TaskRef, span: Allocation);
}

/// An arena can directly source another arena.
impl SpanSource for ResourceArena {
    fn import(&self, current: TaskRef, len: usize) -> Result<Allocation, ArenaError> {
        self.allocate(current, len, AllocPolicy::InstantFit)
    }

    fn release(&self, current: TaskRef, span: Allocation) {
        self.deallocate(current, span);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SegmentKind {
    Free,
    Allocated,
    /// Extent of one added span; `imported` spans go back to the source
    /// when they become fully free.
    Span { imported: bool },
}

/// Boundary tag. Free and allocated tags sit on the per-arena
/// address-ordered list (`next`/`prev`); span tags sit on the span list and
/// allocated tags additionally hang off a hash bucket, both through
/// `chain`.
struct Segment {
    base: usize,
    len: usize,
    kind: SegmentKind,
    next: *mut Segment,
    prev: *mut Segment,
    chain: *mut Segment,
}

const TAGS_PER_PAGE: usize = PAGE_SIZE / size_of::<Segment>();

struct TagPool {
    head: *mut Segment,
}

unsafe impl Send for TagPool {}

static TAG_POOL: Mutex<TagPool> = Mutex::new(TagPool {
    head: ptr::null_mut(),
});

fn allocate_tag() -> Result<&'static mut Segment, ArenaError> {
    let mut pool = TAG_POOL.lock();

    if pool.head.is_null() {
        // carve a fresh physical page into tags
        let page = frame_list::FRAME_LIST
            .allocate_page()
            .map_err(|_| ArenaError::OutOfTags)?;
        let tags = page.start().into_virt().into_ptr::<Segment>();
        for i in 0..TAGS_PER_PAGE {
            let tag = unsafe { tags.add(i) };
            unsafe {
                (*tag).chain = pool.head;
            }
            pool.head = tag;
        }
    }

    let tag = pool.head;
    pool.head = unsafe { (*tag).chain };
    let tag = unsafe { &mut *tag };
    *tag = Segment {
        base: 0,
        len: 0,
        kind: SegmentKind::Free,
        next: ptr::null_mut(),
        prev: ptr::null_mut(),
        chain: ptr::null_mut(),
    };
    Ok(tag)
}

fn free_tag(tag: *mut Segment) {
    let mut pool = TAG_POOL.lock();
    unsafe {
        (*tag).chain = pool.head;
    }
    pool.head = tag;
}

const HASH_BUCKETS: usize = 64;

struct ArenaInner {
    /// Address-ordered doubly-linked list of free and allocated segments.
    segments: *mut Segment,
    /// Singly-linked list of span tags (via `chain`).
    spans: *mut Segment,
    /// NextFit resume point.
    rotor: *mut Segment,
    /// Allocated segments indexed by base.
    hash: [*mut Segment; HASH_BUCKETS],
    total: usize,
    allocated: usize,
}

pub struct ResourceArena {
    name: &'static str,
    quantum: usize,
    source: Option<&'static dyn SpanSource>,
    lock: TicketSpinLock,
    inner: UnsafeCell<ArenaInner>,
}

unsafe impl Sync for ResourceArena {}
unsafe impl Send for ResourceArena {}

impl ResourceArena {
    /// `quantum` must be a power of two.
    pub const fn new(
        name: &'static str,
        quantum: usize,
        source: Option<&'static dyn SpanSource>,
    ) -> Self {
        assert!(quantum.is_power_of_two());
        Self {
            name,
            quantum,
            source,
            lock: TicketSpinLock::new(),
            inner: UnsafeCell::new(ArenaInner {
                segments: ptr::null_mut(),
                spans: ptr::null_mut(),
                rotor: ptr::null_mut(),
                hash: [ptr::null_mut(); HASH_BUCKETS],
                total: 0,
                allocated: 0,
            }),
        }
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }

    pub const fn quantum(&self) -> usize {
        self.quantum
    }

    /// Seeds the arena with externally owned memory. The span is never
    /// given back to a source.
    pub fn add_span(&self, current: TaskRef, base: usize, len: usize) {
        debug_assert!(len > 0 && len % self.quantum == 0 && base % self.quantum == 0);

        self.lock.lock(current);
        let result = self.inner_mut().add_span(base, len, false);
        self.lock.unlock(current);
        result.expect("out of boundary tags while seeding an arena");
    }

    pub fn allocate(
        &self,
        current: TaskRef,
        len: usize,
        policy: AllocPolicy,
    ) -> Result<Allocation, ArenaError> {
        assert!(len > 0, "zero-length arena allocation");
        let rounded = align_up(len, self.quantum);

        self.lock.lock(current);
        let inner = self.inner_mut();

        let result = loop {
            if let Some(seg) = inner.find_fit(policy, rounded) {
                break inner.carve(seg, rounded);
            }

            let Some(source) = self.source else {
                break Err(ArenaError::RequestedLengthUnavailable);
            };
            // grow lazily; lock order is child arena before source
            match source.import(current, rounded) {
                Ok(span) => {
                    if let Err(e) = inner.add_span(span.base, span.len, true) {
                        source.release(current, span);
                        break Err(e);
                    }
                }
                Err(e) => break Err(e),
            }
        };

        self.lock.unlock(current);
        result
    }

    pub fn deallocate(&self, current: TaskRef, allocation: Allocation) {
        self.free_inner(current, allocation.base, Some(allocation.len));
    }

    /// Frees by base alone; the length is looked up internally. Returns the
    /// length that was freed.
    pub fn deallocate_base(&self, current: TaskRef, base: usize) -> usize {
        self.free_inner(current, base, None)
    }

    fn free_inner(&self, current: TaskRef, base: usize, expected_len: Option<usize>) -> usize {
        self.lock.lock(current);
        let (freed, released) = self.inner_mut().free_by_base(
            base,
            expected_len.map(|l| align_up(l, self.quantum)),
            self.name,
        );
        self.lock.unlock(current);

        // released spans go back to the source outside our own lock, so a
        // source unmapping pages never nests inside this arena
        if let Some(span) = released {
            let source = self
                .source
                .expect("arena released an imported span without a source");
            source.release(current, span);
        }

        freed
    }

    pub fn allocated_bytes(&self, current: TaskRef) -> usize {
        self.lock.lock(current);
        let v = self.inner_mut().allocated;
        self.lock.unlock(current);
        v
    }

    pub fn total_bytes(&self, current: TaskRef) -> usize {
        self.lock.lock(current);
        let v = self.inner_mut().total;
        self.lock.unlock(current);
        v
    }

    #[allow(clippy::mut_from_ref)]
    fn inner_mut(&self) -> &mut ArenaInner {
        // callers hold `self.lock`
        unsafe { &mut *self.inner.get() }
    }
}

impl Debug for ResourceArena {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ResourceArena")
            .field("name", &self.name)
            .field("quantum", &self.quantum)
            .finish_non_exhaustive()
    }
}

impl ArenaInner {
    /// Bases are quantum-aligned, so fold the aligned bits in before
    /// picking a bucket.
    fn bucket_of(base: usize) -> usize {
        ((base >> 4) ^ (base >> 12)) & (HASH_BUCKETS - 1)
    }

    fn add_span(&mut self, base: usize, len: usize, imported: bool) -> Result<(), ArenaError> {
        let span = allocate_tag()?;
        let seg = match allocate_tag() {
            Ok(seg) => seg,
            Err(e) => {
                free_tag(span);
                return Err(e);
            }
        };

        span.base = base;
        span.len = len;
        span.kind = SegmentKind::Span { imported };
        span.chain = self.spans;
        self.spans = span;

        seg.base = base;
        seg.len = len;
        seg.kind = SegmentKind::Free;
        self.insert_ordered(seg);

        self.total += len;
        Ok(())
    }

    /// Inserts `seg` into the address-ordered segment list.
    fn insert_ordered(&mut self, seg: &mut Segment) {
        let mut prev: *mut Segment = ptr::null_mut();
        let mut cur = self.segments;
        while !cur.is_null() && unsafe { (*cur).base } < seg.base {
            prev = cur;
            cur = unsafe { (*cur).next };
        }

        seg.prev = prev;
        seg.next = cur;
        if !cur.is_null() {
            unsafe { (*cur).prev = seg };
        }
        if prev.is_null() {
            self.segments = seg;
        } else {
            unsafe { (*prev).next = seg };
        }
    }

    fn unlink(&mut self, seg: *mut Segment) {
        unsafe {
            let (prev, next) = ((*seg).prev, (*seg).next);
            if prev.is_null() {
                self.segments = next;
            } else {
                (*prev).next = next;
            }
            if !next.is_null() {
                (*next).prev = prev;
            }
            if self.rotor == seg {
                self.rotor = next;
            }
        }
    }

    fn find_fit(&mut self, policy: AllocPolicy, len: usize) -> Option<*mut Segment> {
        let is_free = |seg: *mut Segment| unsafe { (*seg).kind == SegmentKind::Free };

        match policy {
            AllocPolicy::InstantFit => {
                let mut cur = self.segments;
                while !cur.is_null() {
                    if is_free(cur) && unsafe { (*cur).len } >= len {
                        return Some(cur);
                    }
                    cur = unsafe { (*cur).next };
                }
                None
            }
            AllocPolicy::BestFit => {
                let mut best: *mut Segment = ptr::null_mut();
                let mut cur = self.segments;
                while !cur.is_null() {
                    let cur_len = unsafe { (*cur).len };
                    if is_free(cur)
                        && cur_len >= len
                        && (best.is_null() || cur_len < unsafe { (*best).len })
                    {
                        best = cur;
                    }
                    cur = unsafe { (*cur).next };
                }
                (!best.is_null()).then_some(best)
            }
            AllocPolicy::NextFit => {
                let start = if self.rotor.is_null() {
                    self.segments
                } else {
                    self.rotor
                };
                // forward from the rotor, then wrap once
                let mut cur = start;
                while !cur.is_null() {
                    if is_free(cur) && unsafe { (*cur).len } >= len {
                        return Some(cur);
                    }
                    cur = unsafe { (*cur).next };
                }
                let mut cur = self.segments;
                while cur != start && !cur.is_null() {
                    if is_free(cur) && unsafe { (*cur).len } >= len {
                        return Some(cur);
                    }
                    cur = unsafe { (*cur).next };
                }
                None
            }
        }
    }

    /// Turns the front of the free segment `seg` into an allocation of
    /// exactly `len` bytes, splitting off the remainder.
    fn carve(&mut self, seg: *mut Segment, len: usize) -> Result<Allocation, ArenaError> {
        let seg = unsafe { &mut *seg };
        debug_assert_eq!(seg.kind, SegmentKind::Free);
        debug_assert!(seg.len >= len);

        if seg.len > len {
            let rest = allocate_tag()?;
            rest.base = seg.base + len;
            rest.len = seg.len - len;
            rest.kind = SegmentKind::Free;
            self.insert_ordered(rest);
            seg.len = len;
        }

        seg.kind = SegmentKind::Allocated;
        self.hash_insert(seg);
        self.rotor = seg.next;
        self.allocated += len;

        Ok(Allocation {
            base: seg.base,
            len,
        })
    }

    fn hash_insert(&mut self, seg: &mut Segment) {
        let bucket = Self::bucket_of(seg.base);
        seg.chain = self.hash[bucket];
        self.hash[bucket] = seg;
    }

    fn hash_remove(&mut self, base: usize) -> Option<*mut Segment> {
        let bucket = Self::bucket_of(base);
        let mut prev: *mut Segment = ptr::null_mut();
        let mut cur = self.hash[bucket];
        while !cur.is_null() {
            if unsafe { (*cur).base } == base {
                let next = unsafe { (*cur).chain };
                if prev.is_null() {
                    self.hash[bucket] = next;
                } else {
                    unsafe { (*prev).chain = next };
                }
                unsafe { (*cur).chain = ptr::null_mut() };
                return Some(cur);
            }
            prev = cur;
            cur = unsafe { (*cur).chain };
        }
        None
    }

    /// Span tag containing `[base, base + len)`.
    fn containing_span(&self, base: usize, len: usize) -> *mut Segment {
        let mut cur = self.spans;
        while !cur.is_null() {
            let (sb, sl) = unsafe { ((*cur).base, (*cur).len) };
            if sb <= base && base + len <= sb + sl {
                return cur;
            }
            cur = unsafe { (*cur).chain };
        }
        ptr::null_mut()
    }

    fn remove_span(&mut self, span: *mut Segment) {
        let mut prev: *mut Segment = ptr::null_mut();
        let mut cur = self.spans;
        while !cur.is_null() {
            if cur == span {
                let next = unsafe { (*cur).chain };
                if prev.is_null() {
                    self.spans = next;
                } else {
                    unsafe { (*prev).chain = next };
                }
                return;
            }
            prev = cur;
            cur = unsafe { (*cur).chain };
        }
        unreachable!("span tag not on the span list");
    }

    /// Frees the allocated segment starting at `base`, coalesces it with
    /// its free neighbors inside the containing span, and reports a fully
    /// free imported span for release. Returns the freed length.
    fn free_by_base(
        &mut self,
        base: usize,
        expected_len: Option<usize>,
        arena_name: &str,
    ) -> (usize, Option<Allocation>) {
        let seg = self
            .hash_remove(base)
            .unwrap_or_else(|| panic!("arena {arena_name}: freeing unallocated base {base:#x}"));
        let seg = unsafe { &mut *seg };
        debug_assert_eq!(seg.kind, SegmentKind::Allocated);

        if let Some(len) = expected_len {
            assert_eq!(
                seg.len, len,
                "arena {arena_name}: length mismatch on free of {base:#x}"
            );
        }

        let freed = seg.len;
        seg.kind = SegmentKind::Free;
        self.allocated -= freed;

        let span = self.containing_span(seg.base, seg.len);
        debug_assert!(!span.is_null());
        let (span_base, span_len, span_imported) = unsafe {
            let SegmentKind::Span { imported } = (*span).kind else {
                unreachable!()
            };
            ((*span).base, (*span).len, imported)
        };
        let span_end = span_base + span_len;

        // coalesce with the previous neighbor, staying inside the span
        let prev = seg.prev;
        if !prev.is_null() {
            let p = unsafe { &mut *prev };
            if p.kind == SegmentKind::Free && p.base + p.len == seg.base && p.base >= span_base {
                seg.base = p.base;
                seg.len += p.len;
                self.unlink(p);
                free_tag(p);
            }
        }

        // and with the next neighbor
        let next = seg.next;
        if !next.is_null() {
            let n = unsafe { &mut *next };
            if n.kind == SegmentKind::Free && seg.base + seg.len == n.base && n.base + n.len <= span_end
            {
                seg.len += n.len;
                self.unlink(n);
                free_tag(n);
            }
        }

        // a fully free imported span goes back to its source
        if span_imported && seg.base == span_base && seg.len == span_len {
            self.unlink(seg);
            free_tag(seg);
            self.remove_span(span);
            free_tag(span);
            self.total -= span_len;
            return (
                freed,
                Some(Allocation {
                    base: span_base,
                    len: span_len,
                }),
            );
        }

        (freed, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task;

    fn current() -> TaskRef {
        task::current()
    }

    #[test_case]
    fn arena_allocate_roundtrip() {
        let arena = ResourceArena::new("test", 16, None);
        arena.add_span(current(), 0x1000, 0x1000);

        let a = arena.allocate(current(), 100, AllocPolicy::InstantFit).unwrap();
        assert_eq!(a.base % 16, 0);
        assert_eq!(a.len, 112); // rounded to the quantum
        assert_eq!(arena.allocated_bytes(current()), 112);

        arena.deallocate(current(), a);
        assert_eq!(arena.allocated_bytes(current()), 0);

        // the span coalesced back into one free segment
        let whole = arena
            .allocate(current(), 0x1000, AllocPolicy::InstantFit)
            .unwrap();
        assert_eq!(whole.base, 0x1000);
        arena.deallocate(current(), whole);
    }

    #[test_case]
    fn arena_partition_is_exhaustive() {
        let arena = ResourceArena::new("test", 16, None);
        arena.add_span(current(), 0x4000, 0x400);

        let mut allocations = heapless::Vec::<Allocation, 64>::new();
        loop {
            match arena.allocate(current(), 16, AllocPolicy::InstantFit) {
                Ok(a) => allocations.push(a).unwrap(),
                Err(ArenaError::RequestedLengthUnavailable) => break,
                Err(e) => panic!("unexpected arena error: {e:?}"),
            }
        }
        // allocated segments partition the span exactly
        assert_eq!(allocations.len(), 0x400 / 16);
        assert_eq!(arena.allocated_bytes(current()), 0x400);

        for a in allocations {
            arena.deallocate(current(), a);
        }
        assert_eq!(arena.allocated_bytes(current()), 0);
        assert_eq!(arena.total_bytes(current()), 0x400);
    }

    #[test_case]
    fn arena_best_fit_prefers_smallest_hole() {
        let arena = ResourceArena::new("test", 16, None);
        arena.add_span(current(), 0x8000, 0x1000);

        // carve holes of 0x100 and 0x40 separated by live allocations
        let a = arena.allocate(current(), 0x100, AllocPolicy::InstantFit).unwrap();
        let keep1 = arena.allocate(current(), 0x20, AllocPolicy::InstantFit).unwrap();
        let b = arena.allocate(current(), 0x40, AllocPolicy::InstantFit).unwrap();
        let keep2 = arena.allocate(current(), 0x20, AllocPolicy::InstantFit).unwrap();
        arena.deallocate(current(), a);
        arena.deallocate(current(), b);

        let best = arena.allocate(current(), 0x40, AllocPolicy::BestFit).unwrap();
        assert_eq!(best.base, b.base);

        arena.deallocate(current(), best);
        arena.deallocate(current(), keep1);
        arena.deallocate(current(), keep2);
    }

    #[test_case]
    fn arena_deallocate_base_looks_up_length() {
        let arena = ResourceArena::new("test", 64, None);
        arena.add_span(current(), 0x10000, 0x1000);

        let a = arena.allocate(current(), 100, AllocPolicy::InstantFit).unwrap();
        assert_eq!(a.len, 128);

        let freed = arena.deallocate_base(current(), a.base);
        assert_eq!(freed, 128);
        assert_eq!(arena.allocated_bytes(current()), 0);
    }

    #[test_case]
    fn arena_exhaustion_is_an_error() {
        let arena = ResourceArena::new("test", 16, None);
        arena.add_span(current(), 0x2000, 0x100);

        assert_eq!(
            arena.allocate(current(), 0x200, AllocPolicy::InstantFit),
            Err(ArenaError::RequestedLengthUnavailable)
        );
    }

    static SOURCE_ARENA: ResourceArena = ResourceArena::new("test-source", 0x1000, None);
    static CHILD_ARENA: ResourceArena =
        ResourceArena::new("test-child", 16, Some(&SOURCE_ARENA));

    #[test_case]
    fn arena_imports_and_releases_spans() {
        SOURCE_ARENA.add_span(current(), 0x100000, 0x10000);
        assert_eq!(CHILD_ARENA.total_bytes(current()), 0);

        // the child has no spans of its own: it must import
        let a = CHILD_ARENA
            .allocate(current(), 32, AllocPolicy::InstantFit)
            .unwrap();
        assert!(CHILD_ARENA.total_bytes(current()) >= 0x1000);
        assert!(SOURCE_ARENA.allocated_bytes(current()) >= 0x1000);

        // freeing the only allocation releases the whole imported span
        CHILD_ARENA.deallocate(current(), a);
        assert_eq!(CHILD_ARENA.total_bytes(current()), 0);
        assert_eq!(SOURCE_ARENA.allocated_bytes(current()), 0);
    }
}
