//! C9: per-core priority-preemptive scheduler.
//!
//! `schedule_from_interrupt` is the contract both the naked-asm timer
//! trampoline in `interrupt::handlers` and the voluntary-yield trampoline in
//! `task::switch` call into: read the per-core ready queue, pick the next
//! task by the algorithm below, and hand back a raw pointer to its
//! `CpuContext` for the caller to restore via `iretq`. Only the trampoline
//! that calls in differs; the scheduling decision itself doesn't care
//! whether it was reached from an IRQ or a cooperative yield.

use core::sync::atomic::Ordering;

use crate::memory::cpu_local_data::CpuLocalData;
use crate::task::task::{CpuContext, Task, TaskId, TaskStatus};
use crate::task::table::task_ref;

fn save_fpu_if_used(task: &Task) {
    if task.fpu_used_since_switch.swap(false, Ordering::SeqCst) {
        unsafe {
            core::arch::asm!("fxsave [{}]", in(reg) task.fpu_state.get(), options(nostack));
        }
    }
}

fn restore_fpu(task: &Task) {
    unsafe {
        core::arch::asm!("fxrstor [{}]", in(reg) task.fpu_state.get(), options(nostack));
    }
}

/// Runs the C9 algorithm under the core's ready-queue lock and returns a
/// pointer to the chosen task's `CpuContext`, or null if the core has no
/// ready queue yet (boot-time bootstrap race).
pub fn schedule_from_interrupt(cpu: &CpuLocalData) -> *mut CpuContext {
    let Some(queues_lock) = cpu.ready_queues.get() else {
        return core::ptr::null_mut();
    };
    let mut queues = queues_lock.lock(cpu.kernel_id as i32);

    let current_ptr = cpu.current_task.load(Ordering::SeqCst);
    let current: Option<&Task> = unsafe { current_ptr.as_ref() };

    // Step 1: deferred reclaim of whatever FINISHED last round.
    if let Some(old_id) = queues.old_task.take() {
        if let Some(old) = task_ref(old_id) {
            old.set_status(TaskStatus::Invalid);
        }
    }
    if let Some(cur) = current {
        if cur.status() == TaskStatus::Finished {
            cur.set_status(TaskStatus::Invalid);
            queues.old_task = Some(cur.id);
        }
    }

    let current_is_live = current
        .map(|c| matches!(c.status(), TaskStatus::Running | TaskStatus::Idle))
        .unwrap_or(false);

    // Step 2: nothing ready — keep the incumbent if it's still live, else
    // fall back to idle.
    let Some(highest) = queues.highest_priority() else {
        if current_is_live {
            drop(queues);
            return current_ptr;
        }
        let idle = queues.idle_task;
        drop(queues);
        return idle.and_then(task_ref).map(Task::context_ptr).unwrap_or(core::ptr::null_mut());
    };

    // Step 3: a strictly-higher-priority incumbent keeps running.
    if let Some(cur) = current {
        if current_is_live && cur.priority > highest {
            drop(queues);
            return current_ptr;
        }
    }

    // Step 4: demote the incumbent to the tail of its own level, round-robin.
    if let Some(cur) = current {
        if cur.status() == TaskStatus::Running {
            cur.set_status(TaskStatus::Ready);
            let prio = cur.priority;
            queues.enqueue(cur.id, prio);
        }
    }

    // Step 5: pop the head of the chosen level.
    let Some(next_id) = queues.dequeue(highest) else {
        drop(queues);
        return current_ptr;
    };
    drop(queues);

    let Some(next) = task_ref(next_id) else {
        return current_ptr;
    };
    next.set_status(TaskStatus::Running);

    if let Some(cur) = current {
        if !core::ptr::eq(cur, next) {
            save_fpu_if_used(cur);
        }
    }
    restore_fpu(next);

    cpu.current_task.store(next as *const Task as *mut Task, Ordering::SeqCst);
    next.context_ptr()
}
