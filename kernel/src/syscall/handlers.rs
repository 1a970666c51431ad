//! Individual syscall handlers dispatched through `syscall::TABLE`.
//!
//! `Fork`/`Execve`/`Clone`/`Dup`/`Stat`/`Wait` all return `-ENOSYS`
//! permanently rather than being left unwired: this is a single-address-space
//! kernel with no ELF loader and no per-task address-space duplication (§1
//! Non-goals), so there is no sensible implementation to grow into later.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::Ordering;

use kernel_api_types::KernelError;
use spin::Once;

use super::SyscallArgs;
use super::transport;
use crate::memory::MEMORY;
use crate::memory::cpu_local_data::get_local;
use crate::memory::page_table::MapFlags;
use crate::memory::physical_bitmap::FRAME_SIZE;
use crate::memory::vma::VmaFlags;
use crate::semaphore::Semaphore;
use crate::sync::ticket_lock::IrqSaveTicketLock;
use crate::task::task::TaskId;

pub fn sys_unsupported(_args: &SyscallArgs) -> i64 {
    KernelError::ENoSys.errno()
}

/// Terminates the calling task. For the uhyve runtime this kernel runs a
/// single application under, there is no separate host OS to return
/// control to, so exit also shuts down the hypervisor (`transport::exit`)
/// the same way HermitCore's own uhyve port does.
pub fn sys_exit(args: &SyscallArgs) -> i64 {
    let cpu = get_local();
    if let Some(current) = unsafe { cpu.current_task.load(Ordering::SeqCst).as_ref() } {
        current.set_status(crate::task::task::TaskStatus::Finished);
    }
    transport::exit(args.a0 as i32);
}

pub fn sys_read(args: &SyscallArgs) -> i64 {
    transport::read(args.a0 as i32, args.a1 as *mut u8, args.a2 as usize)
}

pub fn sys_write(args: &SyscallArgs) -> i64 {
    transport::write(args.a0 as i32, args.a1 as *const u8, args.a2 as usize)
}

pub fn sys_open(args: &SyscallArgs) -> i64 {
    transport::open(args.a0 as *const u8, args.a1 as i32, args.a2 as i32) as i64
}

pub fn sys_close(args: &SyscallArgs) -> i64 {
    transport::close(args.a0 as i32) as i64
}

pub fn sys_times(_args: &SyscallArgs) -> i64 {
    let cpu = get_local();
    crate::time::get_clock_tick(cpu) as i64
}

/// Heap window reserved on a task's first `sbrk` call. Generous enough for
/// the single application this kernel hosts without needing a second
/// reservation.
const HEAP_WINDOW_SIZE: u64 = 16 * 1024 * 1024;

/// Grows (or, with a negative delta, shrinks the record of) the calling
/// task's heap by `delta` bytes, returning the previous break. Reserves a
/// fixed-size virtual window on the first call; a delta that would run past
/// that window's end fails with `ENOMEM` rather than silently reserving
/// more, since the window is sized for one application's heap, not
/// unbounded growth.
pub fn sys_sbrk(args: &SyscallArgs) -> i64 {
    let delta = args.a0 as i64;
    let cpu = get_local();
    let Some(task) = (unsafe { cpu.current_task.load(Ordering::SeqCst).as_ref() }) else {
        return KernelError::EPerm.errno();
    };

    let memory = MEMORY.get().expect("memory subsystem not initialized");

    let (window_start, window_end, old_break) = match task.heap_vma.get() {
        Some((start, brk)) => (start, start + HEAP_WINDOW_SIZE, brk),
        None => {
            let start = match memory.vma.lock(core_id()).vma_alloc(HEAP_WINDOW_SIZE, VmaFlags::READ | VmaFlags::WRITE) {
                Ok(s) => s,
                Err(_) => return KernelError::ENoMem.errno(),
            };
            task.heap_vma.set(Some((start, start)));
            (start, start + HEAP_WINDOW_SIZE, start)
        }
    };

    if delta == 0 {
        return old_break as i64;
    }

    let new_break = old_break.wrapping_add_signed(delta);
    if delta > 0 {
        if new_break > window_end {
            return KernelError::ENoMem.errno();
        }
        let first_new_page = old_break.div_ceil(FRAME_SIZE) * FRAME_SIZE;
        if first_new_page < new_break {
            let pages = (new_break - first_new_page).div_ceil(FRAME_SIZE);
            let phys = memory.physical.get_pages(pages);
            if phys == 0 {
                return KernelError::ENoMem.errno();
            }
            if task
                .page_table
                .map(
                    x86_64::VirtAddr::new(first_new_page),
                    x86_64::PhysAddr::new(phys),
                    pages,
                    MapFlags::WRITABLE,
                    &memory.physical,
                )
                .is_err()
            {
                memory.physical.put_pages(phys, pages);
                return KernelError::ENoMem.errno();
            }
        }
    } else if new_break < window_start {
        return KernelError::EInval.errno();
    }

    task.heap_vma.set(Some((window_start, new_break)));
    old_break as i64
}

pub fn sys_msleep(args: &SyscallArgs) -> i64 {
    let cpu = get_local();
    crate::time::timer_wait(cpu, args.a0);
    0
}

pub fn sys_yield(_args: &SyscallArgs) -> i64 {
    crate::task::switch::yield_now();
    0
}

pub fn sys_get_ticks(_args: &SyscallArgs) -> i64 {
    let cpu = get_local();
    crate::time::get_clock_tick(cpu) as i64
}

pub fn sys_getprio(args: &SyscallArgs) -> i64 {
    let id: TaskId = args.a0 as u32;
    match crate::task::table::task_ref(id) {
        Some(task) => task.priority as i64,
        None => KernelError::ENoEnt.errno(),
    }
}

pub fn sys_setprio(args: &SyscallArgs) -> i64 {
    let _id: TaskId = args.a0 as u32;
    let _prio = args.a1 as u8;
    // Priority is fixed at task creation in this scheduler (C9's ready
    // queues are indexed by priority at enqueue time, not re-bucketed in
    // place), so changing it after the fact isn't supported yet.
    KernelError::ENoSys.errno()
}

pub fn sys_kill(args: &SyscallArgs) -> i64 {
    let id: TaskId = args.a0 as u32;
    match crate::signal::kill(id, args.a1 as u8) {
        Ok(()) => 0,
        Err(e) => e.errno(),
    }
}

pub fn sys_signal(args: &SyscallArgs) -> i64 {
    let cpu = get_local();
    let Some(task) = (unsafe { cpu.current_task.load(Ordering::SeqCst).as_ref() }) else {
        return KernelError::EPerm.errno();
    };
    task.signal_handler.store(args.a0, Ordering::SeqCst);
    0
}

/// Per-process semaphore handle table: `SemInit` hands out an index into
/// this table, `SemDestroy` frees it. One table for the whole kernel since
/// tasks share the single address space (no per-process namespace to key
/// handles on).
static SEM_TABLE: Once<IrqSaveTicketLock<Vec<Option<Box<Semaphore>>>>> = Once::new();

fn sem_table() -> &'static IrqSaveTicketLock<Vec<Option<Box<Semaphore>>>> {
    SEM_TABLE.call_once(|| IrqSaveTicketLock::new(Vec::new()))
}

fn core_id() -> i32 {
    crate::memory::cpu_local_data::try_get_local().map_or(-1, |c| c.kernel_id as i32)
}

pub fn sys_sem_init(args: &SyscallArgs) -> i64 {
    let initial = args.a0 as i64;
    let mut table = sem_table().lock(core_id());
    let sem = Box::new(Semaphore::new(initial));
    if let Some(index) = table.iter().position(Option::is_none) {
        table[index] = Some(sem);
        index as i64
    } else {
        table.push(Some(sem));
        (table.len() - 1) as i64
    }
}

pub fn sys_sem_destroy(args: &SyscallArgs) -> i64 {
    let handle = args.a0 as usize;
    let mut table = sem_table().lock(core_id());
    match table.get_mut(handle) {
        Some(slot @ Some(_)) => {
            *slot = None;
            0
        }
        _ => KernelError::EInval.errno(),
    }
}

fn with_sem<R>(handle: usize, f: impl FnOnce(&Semaphore) -> R) -> Result<R, KernelError> {
    let table = sem_table().lock(core_id());
    match table.get(handle) {
        Some(Some(sem)) => Ok(f(sem)),
        _ => Err(KernelError::EInval),
    }
}

pub fn sys_sem_wait(args: &SyscallArgs) -> i64 {
    let handle = args.a0 as usize;
    match with_sem(handle, |sem| sem.wait(0)) {
        Ok(Ok(())) => 0,
        Ok(Err(e)) => e.errno(),
        Err(e) => e.errno(),
    }
}

pub fn sys_sem_post(args: &SyscallArgs) -> i64 {
    let handle = args.a0 as usize;
    match with_sem(handle, Semaphore::post) {
        Ok(()) => 0,
        Err(e) => e.errno(),
    }
}

pub fn sys_sem_timedwait(args: &SyscallArgs) -> i64 {
    let handle = args.a0 as usize;
    let ticks = args.a1;
    match with_sem(handle, |sem| sem.timedwait(ticks)) {
        Ok(Ok(())) => 0,
        Ok(Err(e)) => e.errno(),
        Err(e) => e.errno(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sem_init_and_destroy_reuse_slots() {
        let a = sys_sem_init(&SyscallArgs { a0: 1, ..Default::default() });
        let b = sys_sem_init(&SyscallArgs { a0: 0, ..Default::default() });
        assert_ne!(a, b);
        assert_eq!(sys_sem_destroy(&SyscallArgs { a0: a as u64, ..Default::default() }), 0);
        let c = sys_sem_init(&SyscallArgs { a0: 1, ..Default::default() });
        assert_eq!(c, a);
    }

    #[test]
    fn sem_post_then_wait_succeeds() {
        let h = sys_sem_init(&SyscallArgs { a0: 0, ..Default::default() });
        assert_eq!(sys_sem_post(&SyscallArgs { a0: h as u64, ..Default::default() }), 0);
        assert_eq!(sys_sem_wait(&SyscallArgs { a0: h as u64, ..Default::default() }), 0);
    }

    #[test]
    fn unknown_sem_handle_is_einval() {
        assert_eq!(
            sys_sem_post(&SyscallArgs { a0: 9999, ..Default::default() }),
            KernelError::EInval.errno()
        );
    }
}
