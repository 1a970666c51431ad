//! C8 (task-table half): fixed-size array of tasks addressed by dense id.
//!
//! Allocation is a linear scan under a table-wide irq-save lock. Slots are
//! `Box<Task>` so addresses handed out as raw pointers (per-core
//! `current_task`) stay stable across any `Vec` growth elsewhere — the
//! table itself never reallocates past its fixed capacity.

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::memory::guarded_stack::{GuardedStack, NORMAL_STACK_SIZE, StackId, StackType};
use crate::memory::page_table::PageTableManager;
use crate::sync::ticket_lock::IrqSaveTicketLock;
use crate::task::task::{CpuContext, Task, TaskId, TaskStatus};

pub const MAX_TASKS: usize = 1024;

struct TaskTable {
    slots: Vec<Option<Box<Task>>>,
}

static TASK_TABLE: IrqSaveTicketLock<TaskTable> = IrqSaveTicketLock::new(TaskTable { slots: Vec::new() });

pub fn init() {
    let mut table = TASK_TABLE.lock(core_id());
    if table.slots.is_empty() {
        table.slots.reserve_exact(MAX_TASKS);
        for _ in 0..MAX_TASKS {
            table.slots.push(None);
        }
    }
}

fn core_id() -> i32 {
    crate::memory::cpu_local_data::try_get_local()
        .map(|c| c.kernel_id as i32)
        .unwrap_or(-1)
}

/// Returns a raw reference to the task at `id`, if the slot is occupied.
/// The returned reference's lifetime is unbounded on purpose: task slots
/// are never freed while any core might still hold a `current_task`
/// pointer to them (freed only after the next schedule on the owning core
/// observes INVALID).
pub fn task_ref(id: TaskId) -> Option<&'static Task> {
    let table = TASK_TABLE.lock(core_id());
    table
        .slots
        .get(id as usize)
        .and_then(|slot| slot.as_deref())
        .map(|t| unsafe { &*(t as *const Task) })
}

/// Reserves an id under the table lock, builds the PCB (kernel stack via
/// C6, page-table root via C4+C7 sharing the kernel half from `caller`,
/// synthetic entry frame), and returns its id. Caller is responsible for
/// enqueueing it into a ready queue.
pub fn create_task(
    priority: u8,
    last_core: u32,
    caller_page_table: &PageTableManager,
    frames: &crate::memory::physical_bitmap::PhysicalFrameAllocator,
    entry: extern "C" fn(u64) -> !,
    arg: u64,
) -> Option<TaskId> {
    let mut table = TASK_TABLE.lock(core_id());
    let id = table.slots.iter().position(|s| s.is_none())? as TaskId;

    let kernel_stack = GuardedStack::new_kernel(
        NORMAL_STACK_SIZE,
        StackId {
            kind: StackType::Normal,
            cpu_id: last_core,
        },
    );
    let page_table = caller_page_table.page_map_copy(frames)?;

    let task = Box::new(Task {
        id,
        status: core::sync::atomic::AtomicU32::new(TaskStatus::Ready as u32),
        last_core,
        priority,
        kernel_stack,
        page_table,
        context: core::cell::UnsafeCell::new(CpuContext::default()),
        links: crate::task::task::QueueLinks::default(),
        heap_vma: core::cell::Cell::new(None),
        signal_handler: core::sync::atomic::AtomicU64::new(0),
        fpu_state: core::cell::UnsafeCell::new([0u8; crate::task::task::FPU_STATE_BYTES]),
        fpu_used_since_switch: core::sync::atomic::AtomicBool::new(false),
        user_usage: core::sync::atomic::AtomicU32::new(0),
        lock: IrqSaveTicketLock::new(()),
    });
    task.create_default_frame(entry, arg);

    table.slots[id as usize] = Some(task);
    Some(id)
}

/// Frees a FINISHED task's resources. Called from the scheduler's
/// deferred-reclaim step, never from within the schedule pass that first
/// observed FINISHED.
pub fn reap(id: TaskId, frames: &crate::memory::physical_bitmap::PhysicalFrameAllocator) {
    let mut table = TASK_TABLE.lock(core_id());
    if let Some(task) = table.slots[id as usize].take() {
        task.page_table.page_map_drop(frames);
    }
}

/// Transitions a BLOCKED task to READY and enqueues it on its own
/// `last_core`'s ready queue — any core may hold another core's ready-queue
/// lock directly (per the shared-resource policy), so a wakeup from core X
/// for a task whose home is core Y reaches into Y's queue rather than
/// requiring Y to notice on its own.
pub fn wake(id: TaskId) {
    let Some(task) = task_ref(id) else { return };
    if task.status() != TaskStatus::Blocked {
        return;
    }
    task.set_status(TaskStatus::Ready);

    let Some(owner) = crate::memory::cpu_local_data::get_by_id(task.last_core) else {
        return;
    };
    let Some(queues_lock) = owner.ready_queues.get() else {
        return;
    };
    queues_lock.lock(core_id()).enqueue(task.id, task.priority);
}
