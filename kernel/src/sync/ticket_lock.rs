//! C2: ticket spinlocks.
//!
//! Two flavors share one core: a plain/recursive lock whose holder identity
//! is a task id, and an irq-save lock whose holder identity is a core id
//! (it may be held across a context with no current task at all, e.g. early
//! boot or inside an interrupt handler before a task is resumed).

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicI32, AtomicU64, Ordering};

use x86_64::instructions::interrupts;

#[inline(always)]
fn spin_hint() {
    core::hint::spin_loop();
}

/// A ticket spinlock whose holder is identified by task id, re-entrant: the
/// same holder may acquire it again without deadlocking itself.
pub struct TicketLock<T: ?Sized> {
    queue: AtomicU64,
    dequeue: AtomicU64,
    /// Task id of the current holder, or `-1` if unheld.
    holder: AtomicI32,
    /// Recursion depth of the current holder.
    depth: AtomicU64,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for TicketLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for TicketLock<T> {}

pub struct TicketLockGuard<'a, T: ?Sized> {
    lock: &'a TicketLock<T>,
    /// Whether this guard is responsible for releasing the underlying ticket
    /// (false for a nested recursive acquire, which only decrements depth).
    outermost: bool,
}

impl<T> TicketLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            queue: AtomicU64::new(0),
            dequeue: AtomicU64::new(0),
            holder: AtomicI32::new(-1),
            depth: AtomicU64::new(0),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> TicketLock<T> {
    /// Acquires the lock on behalf of `holder_task_id`. Reentrant: if the
    /// calling task already holds the lock, this only bumps the recursion
    /// depth and returns immediately.
    pub fn lock(&self, holder_task_id: i32) -> TicketLockGuard<'_, T> {
        if self.holder.load(Ordering::SeqCst) == holder_task_id {
            self.depth.fetch_add(1, Ordering::SeqCst);
            return TicketLockGuard {
                lock: self,
                outermost: false,
            };
        }

        let ticket = self.queue.fetch_add(1, Ordering::SeqCst);
        while self.dequeue.load(Ordering::SeqCst) != ticket {
            spin_hint();
        }
        self.holder.store(holder_task_id, Ordering::SeqCst);
        self.depth.store(1, Ordering::SeqCst);
        TicketLockGuard {
            lock: self,
            outermost: true,
        }
    }

    fn unlock(&self, outermost: bool) {
        if !outermost {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            return;
        }
        if self.depth.fetch_sub(1, Ordering::SeqCst) != 1 {
            return;
        }
        self.holder.store(-1, Ordering::SeqCst);
        self.dequeue.fetch_add(1, Ordering::SeqCst);
    }
}

impl<'a, T: ?Sized> Deref for TicketLockGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T: ?Sized> DerefMut for TicketLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T: ?Sized> Drop for TicketLockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.unlock(self.outermost);
    }
}

/// A ticket spinlock held across interrupt-disabled sections. Holder id is
/// the core id: this lock may be taken with no current task (early boot,
/// inside an interrupt handler before a task is resumed).
pub struct IrqSaveTicketLock<T: ?Sized> {
    queue: AtomicU64,
    dequeue: AtomicU64,
    holder: AtomicI32,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for IrqSaveTicketLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for IrqSaveTicketLock<T> {}

pub struct IrqSaveTicketLockGuard<'a, T: ?Sized> {
    lock: &'a IrqSaveTicketLock<T>,
    irqs_were_enabled: bool,
}

impl<T> IrqSaveTicketLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            queue: AtomicU64::new(0),
            dequeue: AtomicU64::new(0),
            holder: AtomicI32::new(-1),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> IrqSaveTicketLock<T> {
    /// Acquires the lock on behalf of `holder_core_id`, masking interrupts
    /// first and remembering whether they were enabled so `drop` can restore
    /// the prior state exactly.
    pub fn lock(&self, holder_core_id: i32) -> IrqSaveTicketLockGuard<'_, T> {
        let irqs_were_enabled = interrupts::are_enabled();
        interrupts::disable();

        let ticket = self.queue.fetch_add(1, Ordering::SeqCst);
        while self.dequeue.load(Ordering::SeqCst) != ticket {
            spin_hint();
        }
        self.holder.store(holder_core_id, Ordering::SeqCst);
        IrqSaveTicketLockGuard {
            lock: self,
            irqs_were_enabled,
        }
    }
}

impl<'a, T: ?Sized> Deref for IrqSaveTicketLockGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T: ?Sized> DerefMut for IrqSaveTicketLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T: ?Sized> Drop for IrqSaveTicketLockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.holder.store(-1, Ordering::SeqCst);
        self.lock.dequeue.fetch_add(1, Ordering::SeqCst);
        if self.irqs_were_enabled {
            interrupts::enable();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order_of_tickets() {
        let lock = TicketLock::new(0u32);
        {
            let mut g = lock.lock(1);
            *g += 1;
        }
        {
            let mut g = lock.lock(2);
            *g += 1;
        }
        assert_eq!(*lock.lock(3), 2);
    }

    #[test]
    fn recursive_acquire_by_same_holder_does_not_deadlock() {
        let lock = TicketLock::new(0u32);
        let mut outer = lock.lock(7);
        *outer = 1;
        {
            let mut inner = lock.lock(7);
            *inner += 1;
        }
        assert_eq!(*outer, 2);
    }

    #[test]
    fn lock_releases_for_real_only_at_zero_depth() {
        let lock = TicketLock::new(0u32);
        let g1 = lock.lock(1);
        let g2 = lock.lock(1);
        drop(g2);
        assert_eq!(lock.holder.load(Ordering::SeqCst), 1);
        drop(g1);
        assert_eq!(lock.holder.load(Ordering::SeqCst), -1);
    }
}
