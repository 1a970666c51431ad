//! C13: counting semaphore.
//!
//! Unlike the ready queue (C9), which reuses `Task::links` as an intrusive
//! arena list so enqueue/dequeue never allocate, a semaphore's wait queue
//! is a plain per-semaphore `VecDeque<TaskId>`: semaphores are created
//! individually (one heap allocation at construction is already the norm
//! for them, unlike the fixed, preallocated ready queues), and a `VecDeque`
//! gives the same FIFO wakeup order a ring buffer would, with a much
//! simpler implementation.

use alloc::collections::VecDeque;

use kernel_api_types::KernelError;

use crate::memory::cpu_local_data::{get_local, try_get_local};
use crate::sync::ticket_lock::IrqSaveTicketLock;
use crate::task::table::wake;
use crate::task::task::{TaskId, TaskStatus};

struct Inner {
    count: i64,
    /// FIFO order of blocked waiters, oldest first.
    waiters: VecDeque<TaskId>,
}

pub struct Semaphore {
    inner: IrqSaveTicketLock<Inner>,
}

impl Semaphore {
    pub const fn new(initial: i64) -> Self {
        Self {
            inner: IrqSaveTicketLock::new(Inner {
                count: initial,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// -1 off hardware (host unit tests): `IrqSaveTicketLock` treats any
    /// negative holder id as "never matches a real recursive reentry",
    /// which is exactly what a GS-less host test wants.
    fn core_id() -> i32 {
        try_get_local().map_or(-1, |c| c.kernel_id as i32)
    }

    /// Non-blocking: decrements and returns `Ok(())` if the count was
    /// positive, `Err(EAGAIN-shaped ENoSpc)` otherwise. Modeled here as a
    /// plain bool since the ABI-level errno mapping happens in `syscall`.
    pub fn trywait(&self) -> bool {
        let mut inner = self.inner.lock(Self::core_id());
        if inner.count > 0 {
            inner.count -= 1;
            true
        } else {
            false
        }
    }

    /// Blocks the calling task until the count is positive, or until
    /// `timeout_ticks` timer ticks elapse (0 = wait forever). Returns
    /// `Err(KernelError::ETime)` on timeout.
    pub fn wait(&self, timeout_ticks: u64) -> Result<(), KernelError> {
        loop {
            if self.trywait() {
                return Ok(());
            }

            let cpu = get_local();
            let current = cpu.current_task.load(core::sync::atomic::Ordering::SeqCst);
            let Some(current) = (unsafe { current.as_ref() }) else {
                // No task context (e.g. very early boot): degrade to a spin.
                core::hint::spin_loop();
                continue;
            };

            let deadline = (timeout_ticks != 0)
                .then(|| crate::time::get_clock_tick(cpu).saturating_add(timeout_ticks));

            {
                let mut inner = self.inner.lock(Self::core_id());
                if inner.count > 0 {
                    inner.count -= 1;
                    return Ok(());
                }
                inner.waiters.push_back(current.id);
                current.set_status(TaskStatus::Blocked);
            }

            crate::task::switch::yield_now();

            if let Some(deadline) = deadline
                && crate::time::get_clock_tick(cpu) >= deadline
            {
                let mut inner = self.inner.lock(Self::core_id());
                if let Some(pos) = inner.waiters.iter().position(|&id| id == current.id) {
                    inner.waiters.remove(pos);
                    return Err(KernelError::ETime);
                }
                // Already woken by a racing `post` between the deadline
                // check and the lock: fall through and retry trywait.
            }
        }
    }

    /// Increments the count and wakes the oldest waiter, if any, preserving
    /// FIFO release order.
    pub fn post(&self) {
        let woken = {
            let mut inner = self.inner.lock(Self::core_id());
            inner.count += 1;
            inner.waiters.pop_front()
        };
        if let Some(id) = woken {
            wake(id);
        }
    }

    /// Combines `wait` with a hard deadline; returns `ETIME` if the
    /// deadline elapses before the count becomes positive.
    pub fn timedwait(&self, timeout_ticks: u64) -> Result<(), KernelError> {
        if timeout_ticks == 0 {
            return self.wait(0);
        }
        self.wait(timeout_ticks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trywait_fails_on_zero_count() {
        let sem = Semaphore::new(0);
        assert!(!sem.trywait());
    }

    #[test]
    fn trywait_succeeds_and_decrements() {
        let sem = Semaphore::new(1);
        assert!(sem.trywait());
        assert!(!sem.trywait());
    }

    #[test]
    fn post_increments_count() {
        let sem = Semaphore::new(0);
        sem.post();
        assert!(sem.trywait());
    }
}
