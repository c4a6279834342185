//! Kernel locks.
//!
//! Everything here is built on one idea: the ticket. [`TicketSpinLock`] is
//! the task-aware fair lock the scheduler protocol runs on: acquisition
//! disables interrupts and is charged to the acquiring task's
//! `spinlocks_held` counter, and the scheduler may migrate ownership of a
//! held lock across a context switch (see [`TicketSpinLock::unlock_raw`]).
//! Contexts that are not task-aware (the boundary-tag pool, the kernel
//! task set) get the same ticket discipline through `lock_api` raw locks:
//! [`RawTicketMutex`] and the reader/writer [`RawRwSpinLock`], whose
//! contended paths spin for one scheduler tick at a time before conceding
//! the CPU.

use core::sync::atomic::{AtomicU32, Ordering};

use lock_api::{GuardSend, RawMutex, RawRwLock};

use crate::executor::{self, ExecutorId};
use crate::task::TaskRef;

/// A fair FIFO spinlock. Waiters take a ticket and spin until served, so
/// starvation is bounded by the number of waiters ahead.
pub struct TicketSpinLock {
    next_ticket: AtomicU32,
    now_serving: AtomicU32,
    /// Executor that currently holds the lock, for debug asserts only.
    holder: AtomicU32,
}

impl TicketSpinLock {
    pub const fn new() -> Self {
        Self {
            next_ticket: AtomicU32::new(0),
            now_serving: AtomicU32::new(0),
            holder: AtomicU32::new(ExecutorId::NONE_RAW),
        }
    }

    /// Acquires the lock on behalf of `current`. Interrupts are disabled for
    /// the whole time the lock is held (charged to the task's
    /// interrupt-disable counter) and the acquisition is recorded in
    /// `current.spinlocks_held`.
    pub fn lock(&self, current: TaskRef) {
        current.increment_interrupt_disable();

        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        while self.now_serving.load(Ordering::Acquire) != ticket {
            core::hint::spin_loop();
        }

        self.holder
            .store(executor::current().id().raw(), Ordering::Relaxed);
        unsafe { current.spinlocks_inc() };
    }

    /// Releases the lock on behalf of `current`.
    pub fn unlock(&self, current: TaskRef) {
        debug_assert_eq!(
            self.holder.load(Ordering::Relaxed),
            executor::current().id().raw(),
            "ticket lock released by an executor that does not hold it"
        );

        unsafe { current.spinlocks_dec() };
        self.holder.store(ExecutorId::NONE_RAW, Ordering::Relaxed);
        self.now_serving.fetch_add(1, Ordering::Release);

        current.decrement_interrupt_disable();
    }

    /// Releases the ticket without touching any task accounting or the
    /// interrupt flag.
    ///
    /// # Safety
    /// Only the scheduler may use this, when lock ownership has been
    /// migrated across a context switch and the books are kept by hand.
    pub unsafe fn unlock_raw(&self) {
        self.holder.store(ExecutorId::NONE_RAW, Ordering::Relaxed);
        self.now_serving.fetch_add(1, Ordering::Release);
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.now_serving.load(Ordering::Relaxed) != self.next_ticket.load(Ordering::Relaxed)
    }

    /// Whether the calling executor is the recorded holder.
    #[inline]
    pub fn held_by_current_executor(&self) -> bool {
        self.holder.load(Ordering::Relaxed) == executor::current().id().raw()
    }

    /// Guard-style acquisition for straight-line critical sections (arena
    /// and page-table locks). Not usable across a context switch.
    pub fn guard(&self, current: TaskRef) -> TicketGuard<'_> {
        self.lock(current);
        TicketGuard {
            lock: self,
            current,
        }
    }
}

pub struct TicketGuard<'a> {
    lock: &'a TicketSpinLock,
    current: TaskRef,
}

impl Drop for TicketGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock(self.current);
    }
}

/// One round of contended spinning lasts about one scheduler tick; between
/// rounds the CPU is conceded so a preempted holder can run to its
/// release. Before time is calibrated the clock reads zero and a round
/// simply never expires, which is harmless: nothing contends before the
/// scheduler exists.
fn contended_spin<T>(lock: &T, try_lock: impl Fn(&T) -> bool) {
    loop {
        let deadline = crate::arch::utils::time_ms() + crate::init::SCHEDULER_TICK_MS;
        while crate::arch::utils::time_ms() < deadline {
            if try_lock(lock) {
                return;
            }
            core::hint::spin_loop();
        }
        crate::scheduler::try_yield_now();
    }
}

/// The scheduler lock's ticket discipline without the interrupt and hold
/// accounting, for contexts that are not task-aware.
pub struct RawTicketMutex {
    next_ticket: AtomicU32,
    now_serving: AtomicU32,
}

unsafe impl RawMutex for RawTicketMutex {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        next_ticket: AtomicU32::new(0),
        now_serving: AtomicU32::new(0),
    };
    type GuardMarker = GuardSend;

    fn lock(&self) {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        loop {
            let deadline = crate::arch::utils::time_ms() + crate::init::SCHEDULER_TICK_MS;
            while crate::arch::utils::time_ms() < deadline {
                if self.now_serving.load(Ordering::Acquire) == ticket {
                    return;
                }
                core::hint::spin_loop();
            }
            crate::scheduler::try_yield_now();
        }
    }

    /// Takes the next ticket only if it would be served immediately, so a
    /// failed try never delays queued waiters.
    fn try_lock(&self) -> bool {
        let serving = self.now_serving.load(Ordering::Relaxed);
        self.next_ticket
            .compare_exchange(
                serving,
                serving.wrapping_add(1),
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    fn is_locked(&self) -> bool {
        self.next_ticket.load(Ordering::Relaxed) != self.now_serving.load(Ordering::Relaxed)
    }

    unsafe fn unlock(&self) {
        self.now_serving.fetch_add(1, Ordering::Release);
    }
}

/// Reader/writer spin lock. Bit 0 is the writer; every unit above it is
/// one reader. Readers register optimistically and back out when a writer
/// already holds the lock, so the uncontended read path is one
/// `fetch_add`.
pub struct RawRwSpinLock {
    state: AtomicU32,
}

impl RawRwSpinLock {
    const WRITER: u32 = 1;
    const READER: u32 = 2;
}

unsafe impl RawRwLock for RawRwSpinLock {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        state: AtomicU32::new(0),
    };
    type GuardMarker = GuardSend;

    fn lock_shared(&self) {
        contended_spin(self, Self::try_lock_shared);
    }

    fn try_lock_shared(&self) -> bool {
        let previous = self.state.fetch_add(Self::READER, Ordering::Acquire);
        if previous & Self::WRITER != 0 {
            self.state.fetch_sub(Self::READER, Ordering::Relaxed);
            return false;
        }
        true
    }

    fn lock_exclusive(&self) {
        contended_spin(self, Self::try_lock_exclusive);
    }

    fn try_lock_exclusive(&self) -> bool {
        self.state
            .compare_exchange(0, Self::WRITER, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) != 0
    }

    fn is_locked_exclusive(&self) -> bool {
        self.state.load(Ordering::Relaxed) & Self::WRITER != 0
    }

    unsafe fn unlock_shared(&self) {
        self.state.fetch_sub(Self::READER, Ordering::Release);
    }

    unsafe fn unlock_exclusive(&self) {
        // only clear the writer bit: an optimistic reader may have a
        // transient unit in flight that it will back out itself
        self.state.fetch_sub(Self::WRITER, Ordering::Release);
    }
}

pub type Mutex<T> = lock_api::Mutex<RawTicketMutex, T>;
pub type MutexGuard<'a, T> = lock_api::MutexGuard<'a, RawTicketMutex, T>;

pub type RwLock<T> = lock_api::RwLock<RawRwSpinLock, T>;
pub type RwLockReadGuard<'a, T> = lock_api::RwLockReadGuard<'a, RawRwSpinLock, T>;
pub type RwLockWriteGuard<'a, T> = lock_api::RwLockWriteGuard<'a, RawRwSpinLock, T>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task;

    #[test_case]
    fn ticket_lock_charges_the_task() {
        let current = task::current();
        let lock = TicketSpinLock::new();

        let spinlocks_before = current.spinlocks_held();
        let interrupt_before = current.interrupt_disable_count();

        lock.lock(current);
        assert!(lock.is_locked());
        assert!(lock.held_by_current_executor());
        assert_eq!(current.spinlocks_held(), spinlocks_before + 1);
        assert_eq!(current.interrupt_disable_count(), interrupt_before + 1);
        assert!(!crate::arch::interrupts_enabled());

        lock.unlock(current);
        assert!(!lock.is_locked());
        assert_eq!(current.spinlocks_held(), spinlocks_before);
        assert_eq!(current.interrupt_disable_count(), interrupt_before);
    }

    #[test_case]
    fn ticket_guard_releases_on_drop() {
        let current = task::current();
        let lock = TicketSpinLock::new();
        {
            let _guard = lock.guard(current);
            assert!(lock.is_locked());
        }
        assert!(!lock.is_locked());
        assert_eq!(current.spinlocks_held(), 0);
    }

    #[test_case]
    fn rwlock_readers_and_writer() {
        let lock = RwLock::new(5usize);
        {
            let a = lock.read();
            let b = lock.read();
            assert_eq!((*a, *b), (5, 5));
        }
        *lock.write() = 7;
        assert_eq!(*lock.read(), 7);
    }

    #[test_case]
    fn rwlock_writer_excludes_readers() {
        let lock = RwLock::new(0usize);

        let writer = lock.write();
        assert!(lock.try_read().is_none());
        assert!(lock.try_write().is_none());
        drop(writer);

        let reader = lock.read();
        assert!(lock.try_read().is_some());
        assert!(lock.try_write().is_none());
        drop(reader);
    }

    #[test_case]
    fn mutex_roundtrip() {
        let mutex = Mutex::new(1usize);
        *mutex.lock() += 1;
        assert_eq!(*mutex.lock(), 2);
    }

    #[test_case]
    fn mutex_try_lock_fails_while_held() {
        let mutex = Mutex::new(());
        let guard = mutex.lock();
        assert!(mutex.try_lock().is_none());
        drop(guard);
        assert!(mutex.try_lock().is_some());
    }
}
