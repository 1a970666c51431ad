//! C8 (ready-queue half): per-core priority-bitmapped doubly-linked lists.
//!
//! Queue membership is arena indices into the global task table, not
//! intrusive pointers — see the cyclic-data design note. Each priority level
//! is a plain (head, tail) pair of `TaskId`s; `Task::links` carries prev/next.

use crate::task::task::{MAX_PRIORITY, Task, TaskId, TaskStatus};
use crate::task::table::task_ref;

#[derive(Debug, Clone, Copy)]
struct Level {
    head: i32,
    tail: i32,
}

impl Level {
    const EMPTY: Level = Level { head: -1, tail: -1 };
}

pub struct ReadyQueues {
    levels: [Level; MAX_PRIORITY as usize + 1],
    bitmap: u32,
    pub running_count: u32,
    pub idle_task: Option<TaskId>,
    /// Previous-running task, parked here after it goes FINISHED so its
    /// resources can be reclaimed on the *next* schedule pass rather than
    /// from within the one that just displaced it.
    pub old_task: Option<TaskId>,
}

impl ReadyQueues {
    pub fn new() -> Self {
        Self {
            levels: [Level::EMPTY; MAX_PRIORITY as usize + 1],
            bitmap: 0,
            running_count: 0,
            idle_task: None,
            old_task: None,
        }
    }

    fn set_task(&mut self, id: TaskId, f: impl FnOnce(&Task)) {
        if let Some(task) = task_ref(id) {
            f(task);
        }
    }

    /// Appends `id` to the tail of its own priority level, setting the
    /// level's bitmap bit.
    pub fn enqueue(&mut self, id: TaskId, priority: u8) {
        let level = &mut self.levels[priority as usize];
        if level.tail >= 0 {
            self.set_task(level.tail as TaskId, |t| {
                t.links.next.store(id as i32, core::sync::atomic::Ordering::SeqCst)
            });
        } else {
            level.head = id as i32;
        }
        self.set_task(id, |t| {
            t.links.prev.store(level.tail, core::sync::atomic::Ordering::SeqCst);
            t.links.next.store(-1, core::sync::atomic::Ordering::SeqCst);
        });
        level.tail = id as i32;
        self.bitmap |= 1 << priority;
    }

    /// Removes `id` from whatever priority level it's currently linked into.
    /// Clears the level's bitmap bit iff it becomes empty.
    pub fn remove(&mut self, id: TaskId, priority: u8) {
        use core::sync::atomic::Ordering;
        let (prev, next) = task_ref(id)
            .map(|t| (t.links.prev.load(Ordering::SeqCst), t.links.next.load(Ordering::SeqCst)))
            .unwrap_or((-1, -1));

        let level = &mut self.levels[priority as usize];
        if prev >= 0 {
            self.set_task(prev as TaskId, |t| t.links.next.store(next, Ordering::SeqCst));
        } else {
            level.head = next;
        }
        if next >= 0 {
            self.set_task(next as TaskId, |t| t.links.prev.store(prev, Ordering::SeqCst));
        } else {
            level.tail = prev;
        }
        if level.head < 0 {
            self.bitmap &= !(1 << priority);
        }
    }

    /// Highest non-empty priority level, derived as the index of the
    /// most-significant set bit of the bitmap.
    pub fn highest_priority(&self) -> Option<u8> {
        if self.bitmap == 0 {
            None
        } else {
            Some((31 - self.bitmap.leading_zeros()) as u8)
        }
    }

    /// Pops the head of `priority`'s level, clearing the bit iff the level
    /// emptied.
    pub fn dequeue(&mut self, priority: u8) -> Option<TaskId> {
        let head = self.levels[priority as usize].head;
        if head < 0 {
            return None;
        }
        let id = head as TaskId;
        self.remove(id, priority);
        Some(id)
    }

    pub fn is_empty_level(&self, priority: u8) -> bool {
        self.levels[priority as usize].head < 0
    }
}

impl Default for ReadyQueues {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn highest_priority_picks_msb() {
        let mut q = ReadyQueues::new();
        q.bitmap = (1 << 3) | (1 << 7);
        assert_eq!(q.highest_priority(), Some(7));
    }

    #[test]
    fn empty_bitmap_has_no_priority() {
        let q = ReadyQueues::new();
        assert_eq!(q.highest_priority(), None);
    }
}
