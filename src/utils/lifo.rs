//! Atomic intrusive singly-linked LIFO.
//!
//! The element type embeds a [`LifoLink`] and the list only ever touches
//! that link, so pushes and pops are a single compare-exchange each. Used
//! for the per-executor flush-request inboxes and the task cleanup inbox.

use core::ptr;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicPtr, Ordering};

/// Intrusive hook. Embed as a field (at any offset) of the element type and
/// translate back with [`crate::utils::lifo::AtomicLifo::pop`] +
/// `container_of`-style pointer arithmetic at the call site.
#[derive(Debug)]
pub struct LifoLink {
    next: AtomicPtr<LifoLink>,
}

impl LifoLink {
    pub const fn new() -> Self {
        Self {
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

#[derive(Debug)]
pub struct AtomicLifo {
    head: AtomicPtr<LifoLink>,
}

impl AtomicLifo {
    pub const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Pushes `link` onto the list.
    ///
    /// # Safety
    /// `link` must stay valid (and not be pushed elsewhere) until it is
    /// popped again.
    pub unsafe fn push(&self, link: NonNull<LifoLink>) {
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            unsafe { link.as_ref() }.next.store(head, Ordering::Relaxed);
            match self.head.compare_exchange(
                head,
                link.as_ptr(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(observed) => head = observed,
            }
        }
    }

    /// Pops the most recently pushed link.
    pub fn pop(&self) -> Option<NonNull<LifoLink>> {
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            let link = NonNull::new(head)?;
            let next = unsafe { link.as_ref() }.next.load(Ordering::Relaxed);
            match self
                .head
                .compare_exchange(head, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Some(link),
                Err(observed) => head = observed,
            }
        }
    }

    /// Detaches the whole list in one swap; the caller walks the returned
    /// chain via [`Self::chain_next`].
    pub fn take_all(&self) -> Option<NonNull<LifoLink>> {
        NonNull::new(self.head.swap(ptr::null_mut(), Ordering::AcqRel))
    }

    /// Follows a chain returned by [`Self::take_all`].
    pub fn chain_next(link: NonNull<LifoLink>) -> Option<NonNull<LifoLink>> {
        NonNull::new(unsafe { link.as_ref() }.next.load(Ordering::Relaxed))
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn lifo_pops_in_reverse_push_order() {
        let lifo = AtomicLifo::new();
        let links = [LifoLink::new(), LifoLink::new(), LifoLink::new()];

        assert!(lifo.is_empty());
        for link in &links {
            unsafe { lifo.push(NonNull::from(link)) };
        }

        assert_eq!(lifo.pop(), Some(NonNull::from(&links[2])));
        assert_eq!(lifo.pop(), Some(NonNull::from(&links[1])));
        assert_eq!(lifo.pop(), Some(NonNull::from(&links[0])));
        assert_eq!(lifo.pop(), None);
    }

    #[test_case]
    fn lifo_take_all_detaches_the_chain() {
        let lifo = AtomicLifo::new();
        let links = [LifoLink::new(), LifoLink::new()];
        for link in &links {
            unsafe { lifo.push(NonNull::from(link)) };
        }

        let mut walked = 0;
        let mut cursor = lifo.take_all();
        assert!(lifo.is_empty());
        while let Some(link) = cursor {
            walked += 1;
            cursor = AtomicLifo::chain_next(link);
        }
        assert_eq!(walked, 2);
    }
}
