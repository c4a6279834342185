//! Cross-executor TLB invalidation.
//!
//! When a shared kernel mapping is torn down (heap span release, stack
//! free, MMIO window teardown) every other executor's TLB must be
//! invalidated too. The originating task builds one [`FlushRequest`] for
//! the whole range (per-batch coalescing), pushes one node per target onto
//! each target's inbox, sends IPIs, and keeps ownership of the request
//! until every target has acknowledged. Inboxes are LIFOs; ordering is
//! irrelevant because invalidating an unmapped range is idempotent.

use core::sync::atomic::{AtomicU32, Ordering};

use core::ptr::NonNull;

use super::MAX_EXECUTORS;
use crate::arch;
use crate::memory::VirtRange;
use crate::memory::paging::Page;
use crate::task::TaskRef;
use crate::utils::lifo::{AtomicLifo, LifoLink};

pub struct FlushRequest {
    range: VirtRange,
    /// Targets that have not acknowledged yet.
    pending: AtomicU32,
}

impl FlushRequest {
    fn flush(&self) {
        for page in Page::iter_range(self.range) {
            arch::paging::invalidate_page(page.virt_addr());
        }
    }
}

/// One inbox entry; `link` must stay the first field so an inbox link
/// converts back to its node.
#[repr(C)]
struct FlushNode {
    link: LifoLink,
    request: *const FlushRequest,
}

/// Invalidates `range` on every *other* online executor and waits for all
/// of them to acknowledge. The local TLB is the caller's business (the
/// unmap path already invalidated it).
pub fn flush_range(current: TaskRef, range: VirtRange) {
    let executors = super::all();
    if executors.len() <= 1 {
        return;
    }

    let this = super::current();
    let targets = executors
        .iter()
        .filter(|executor| executor.id() != this.id() && executor.is_online());

    let request = FlushRequest {
        range,
        pending: AtomicU32::new(0),
    };
    let mut nodes = heapless::Vec::<FlushNode, MAX_EXECUTORS>::new();
    for _ in targets.clone() {
        nodes
            .push(FlushNode {
                link: LifoLink::new(),
                request: &request,
            })
            .ok()
            .expect("more executors than MAX_EXECUTORS");
    }
    request.pending.store(nodes.len() as u32, Ordering::Release);

    for (executor, node) in targets.zip(nodes.iter()) {
        unsafe {
            executor.flush_requests.push(NonNull::from(&node.link));
        }
        arch::interrupts::send_flush_ipi(executor.arch_id());
    }

    // the request and its nodes live on our stack: they stay ours until
    // every target acknowledged
    while request.pending.load(Ordering::Acquire) > 0 {
        // servicing our own inbox here breaks the cycle of two executors
        // flushing at each other with interrupts disabled
        process_flush_requests(current);
        core::hint::spin_loop();
    }
}

/// Drains the calling executor's flush inbox. Called from the IPI handler
/// and from [`flush_range`]'s wait loop.
pub fn process_flush_requests(_current: TaskRef) {
    let this = super::current();

    let mut link = this.flush_requests.take_all();
    while let Some(node_link) = link {
        // the node may be freed the instant we acknowledge, so step off it
        // first
        let next = AtomicLifo::chain_next(node_link);

        let node = node_link.as_ptr().cast::<FlushNode>();
        let request = unsafe { &*(*node).request };
        request.flush();
        request.pending.fetch_sub(1, Ordering::Release);

        link = next;
    }
}
