//! C12: signal delivery.
//!
//! Each core owns a bounded ring of pending `{target, signum}` messages,
//! guarded the same way the semaphore's wait queue is (C13): a plain
//! `VecDeque` behind an irq-save ticket lock rather than a literal lock-free
//! ring, since the lock is already required to make `kill()`'s "ring full"
//! check and push atomic.
//!
//! Because every suspension in this kernel — voluntary (`task::switch`) or
//! preempted (the timer trampoline) — copies the full register state into
//! the task's own `CpuContext`, there is no separate "interrupt stack"
//! location to search: a target's saved state always lives at
//! `task.context_ptr()`, whether it got there via a voluntary yield
//! (`int_no == 0`) or a preemption. The only state that *isn't* there yet is
//! a task's live registers while it is the one currently running — the
//! signal IPI's own naked prologue captures exactly that into its context
//! before draining, the same way the timer trampoline does, so by the time
//! the drain loop runs, every target's context is current.

use alloc::collections::VecDeque;

use kernel_api_types::KernelError;

use crate::memory::cpu_local_data::{CURRENT_TASK_OFFSET, get_by_id, get_local, try_get_local};
use crate::sync::ticket_lock::IrqSaveTicketLock;
use crate::task::table::task_ref;
use crate::task::task::{
    CTX_CS, CTX_R8, CTX_R9, CTX_R10, CTX_R11, CTX_R12, CTX_R13, CTX_R14, CTX_R15, CTX_RAX,
    CTX_RBP, CTX_RBX, CTX_RCX, CTX_RDI, CTX_RDX, CTX_RFLAGS, CTX_RIP, CTX_RSI, CTX_RSP, CTX_SS,
    CpuContext, TASK_CONTEXT_OFFSET, TaskStatus,
};
use crate::interrupt::InterruptVector;

pub const SIGNAL_RING_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy)]
struct SignalMessage {
    target: crate::task::task::TaskId,
    signum: u8,
}

pub struct SignalRing {
    messages: VecDeque<SignalMessage>,
}

impl SignalRing {
    fn new() -> Self {
        Self { messages: VecDeque::new() }
    }
}

fn core_id() -> i32 {
    try_get_local().map_or(-1, |c| c.kernel_id as i32)
}

/// Allocates this core's signal ring. Called once per core during boot,
/// after `cpu_local_data::init_bsp`/`init_ap`.
pub fn init() {
    get_local().signal_ring.call_once(|| IrqSaveTicketLock::new(SignalRing::new()));
}

/// `kill(target, signum)`: inline if `target` is the caller, else queued to
/// the target's home core and kicked with an IPI. `ENoEnt` if the task id is
/// unknown, `ENoMem` if that core's ring is full.
pub fn kill(target: crate::task::task::TaskId, signum: u8) -> Result<(), KernelError> {
    let cpu = get_local();
    let current = unsafe { cpu.current_task.load(core::sync::atomic::Ordering::SeqCst).as_ref() };

    if let Some(current) = current
        && current.id == target
    {
        invoke_handler_inline(current, signum);
        return Ok(());
    }

    let task = task_ref(target).ok_or(KernelError::ENoEnt)?;
    let owner = get_by_id(task.last_core).ok_or(KernelError::ENoDev)?;
    let ring_lock = owner.signal_ring.get().ok_or(KernelError::ENoDev)?;

    {
        let mut ring = ring_lock.lock(core_id());
        if ring.messages.len() >= SIGNAL_RING_CAPACITY {
            return Err(KernelError::ENoMem);
        }
        ring.messages.push_back(SignalMessage { target, signum });
    }

    unsafe {
        let local_apic = &mut *cpu.local_apic.get().unwrap().get();
        local_apic.send_ipi(u8::from(InterruptVector::Signal), owner.local_apic_id);
    }
    Ok(())
}

fn invoke_handler_inline(task: &crate::task::task::Task, signum: u8) {
    let handler = task.signal_handler.load(core::sync::atomic::Ordering::SeqCst);
    if handler != 0 {
        let f: extern "C" fn(u64) = unsafe { core::mem::transmute(handler) };
        f(signum as u64);
    }
}

/// Drains this core's ring, delivering each message. Called from the IPI
/// handler's inner function with this core's view of `current_task` already
/// synced into its `CpuContext`.
fn drain(cpu: &crate::memory::cpu_local_data::CpuLocalData) {
    let Some(ring_lock) = cpu.signal_ring.get() else { return };
    loop {
        let msg = {
            let mut ring = ring_lock.lock(core_id());
            match ring.messages.pop_front() {
                Some(m) => m,
                None => break,
            }
        };

        let Some(task) = task_ref(msg.target) else {
            log::warn!("signal: target {} no longer exists, dropping", msg.target);
            continue;
        };
        if task.last_core != cpu.kernel_id {
            // Can only happen if `msg.target`'s slot was reaped and reused
            // for a different task since the message was queued — `last_core`
            // itself never migrates once set.
            log::warn!("signal: target {} not owned by this core, dropping", msg.target);
            continue;
        }
        match task.status() {
            TaskStatus::Finished | TaskStatus::Invalid => {
                log::warn!("signal: target {} already gone, dropping", msg.target);
            }
            _ => craft_signal_frame(task, msg.signum),
        }
    }
}

/// Rewrites `task`'s saved `CpuContext` in place so that the next time it is
/// resumed (by the scheduler, or by this very IPI's own restore tail if
/// `task` is the one we just interrupted) it lands in the signal handler
/// instead of wherever it actually was. Pushes the original state plus the
/// epilog's return address onto the task's own stack first, per the
/// top-down layout: `[original state][&sighandler_epilog][crafted entry]`.
/// Silently drops the signal if no handler is installed.
fn craft_signal_frame(task: &crate::task::task::Task, signum: u8) {
    let handler = task.signal_handler.load(core::sync::atomic::Ordering::SeqCst);
    if handler == 0 {
        return;
    }

    let ctx = unsafe { &mut *task.context_ptr() };
    let original = *ctx;

    let saved_state_addr = original.rsp - core::mem::size_of::<CpuContext>() as u64;
    let epilog_slot_addr = saved_state_addr - 8;

    unsafe {
        (saved_state_addr as *mut CpuContext).write_unaligned(original);
        (epilog_slot_addr as *mut u64).write_unaligned(sighandler_epilog as usize as u64);
    }

    ctx.rdi = signum as u64;
    ctx.rip = handler;
    ctx.rsp = epilog_slot_addr;
    ctx.int_no = 0;
    // cs, rflags, ss are left as inherited from `original`.
}

/// IPI entry point for `InterruptVector::Signal`. Structurally identical to
/// the timer trampoline's save/restore dance (`interrupt::handlers`): saves
/// this core's running task into its own `CpuContext` so `craft_signal_frame`
/// has a current view of it if it happens to be a target, drains the ring,
/// then restores — always the *same* task's context, since delivering a
/// signal never changes who is scheduled, only where they resume.
#[unsafe(naked)]
pub extern "C" fn signal_ipi_handler() {
    core::arch::naked_asm!(
        "push r11",

        "mov r11, gs:[{current_task_offset}]",
        "test r11, r11",
        "jz 3f",
        "add r11, {task_context_offset}",

        "mov [r11 + {CTX_RAX}], rax",
        "mov [r11 + {CTX_R15}], r15",
        "mov [r11 + {CTX_R14}], r14",
        "mov [r11 + {CTX_R13}], r13",
        "mov [r11 + {CTX_R12}], r12",
        "mov rax, [rsp]",
        "mov [r11 + {CTX_R11}], rax",
        "mov [r11 + {CTX_R10}], r10",
        "mov [r11 + {CTX_R9}], r9",
        "mov [r11 + {CTX_R8}], r8",
        "mov [r11 + {CTX_RDI}], rdi",
        "mov [r11 + {CTX_RSI}], rsi",
        "mov [r11 + {CTX_RBP}], rbp",
        "mov [r11 + {CTX_RBX}], rbx",
        "mov [r11 + {CTX_RDX}], rdx",
        "mov [r11 + {CTX_RCX}], rcx",

        "mov rax, [rsp + 8]",
        "mov [r11 + {CTX_RIP}], rax",
        "mov rax, [rsp + 16]",
        "mov [r11 + {CTX_CS}], rax",
        "mov rax, [rsp + 24]",
        "mov [r11 + {CTX_RFLAGS}], rax",
        "mov rax, [rsp + 32]",
        "mov [r11 + {CTX_RSP}], rax",
        "mov rax, [rsp + 40]",
        "mov [r11 + {CTX_SS}], rax",

        "call {inner}",

        "mov r11, rax",

        "mov rax, [r11 + {CTX_RIP}]",
        "mov [rsp + 8], rax",
        "mov rax, [r11 + {CTX_CS}]",
        "mov [rsp + 16], rax",
        "mov rax, [r11 + {CTX_RFLAGS}]",
        "mov [rsp + 24], rax",
        "mov rax, [r11 + {CTX_RSP}]",
        "mov [rsp + 32], rax",
        "mov rax, [r11 + {CTX_SS}]",
        "mov [rsp + 40], rax",

        "mov r15, [r11 + {CTX_R15}]",
        "mov r14, [r11 + {CTX_R14}]",
        "mov r13, [r11 + {CTX_R13}]",
        "mov r12, [r11 + {CTX_R12}]",
        "mov r10, [r11 + {CTX_R10}]",
        "mov r9, [r11 + {CTX_R9}]",
        "mov r8, [r11 + {CTX_R8}]",
        "mov rdi, [r11 + {CTX_RDI}]",
        "mov rsi, [r11 + {CTX_RSI}]",
        "mov rbp, [r11 + {CTX_RBP}]",
        "mov rbx, [r11 + {CTX_RBX}]",
        "mov rdx, [r11 + {CTX_RDX}]",
        "mov rcx, [r11 + {CTX_RCX}]",
        "mov rax, [r11 + {CTX_RAX}]",
        "mov r11, [r11 + {CTX_R11}]",

        "add rsp, 8",
        "iretq",

        "3:",
        // No task bound yet; nothing to save or deliver to. Still need to
        // drain+EOI so the ring doesn't back up, then return normally.
        "call {no_task_inner}",
        "pop r11",
        "iretq",

        inner = sym signal_ipi_inner,
        no_task_inner = sym signal_ipi_inner_no_task,
        current_task_offset = const CURRENT_TASK_OFFSET,
        task_context_offset = const TASK_CONTEXT_OFFSET,
        CTX_R15 = const CTX_R15,
        CTX_R14 = const CTX_R14,
        CTX_R13 = const CTX_R13,
        CTX_R12 = const CTX_R12,
        CTX_R11 = const CTX_R11,
        CTX_R10 = const CTX_R10,
        CTX_R9 = const CTX_R9,
        CTX_R8 = const CTX_R8,
        CTX_RDI = const CTX_RDI,
        CTX_RSI = const CTX_RSI,
        CTX_RBP = const CTX_RBP,
        CTX_RBX = const CTX_RBX,
        CTX_RDX = const CTX_RDX,
        CTX_RCX = const CTX_RCX,
        CTX_RAX = const CTX_RAX,
        CTX_RIP = const CTX_RIP,
        CTX_CS = const CTX_CS,
        CTX_RFLAGS = const CTX_RFLAGS,
        CTX_RSP = const CTX_RSP,
        CTX_SS = const CTX_SS,
    );
}

/// Entered via `ret` from a signal handler, with `rsp` pointing at the
/// `CpuContext`-shaped blob `craft_signal_frame` pushed onto the task's own
/// stack. Restores every field from that blob and `iretq`s back into the
/// original, pre-signal execution — the same restore shape as the timer
/// trampoline's tail and `load_context_and_iretq`, just reading the context
/// off the stack instead of through a pointer argument.
#[unsafe(naked)]
unsafe extern "C" fn sighandler_epilog() -> ! {
    core::arch::naked_asm!(
        "mov r11, rsp",
        "sub rsp, 40",

        "mov rax, [r11 + {CTX_RIP}]",
        "mov [rsp], rax",
        "mov rax, [r11 + {CTX_CS}]",
        "mov [rsp + 8], rax",
        "mov rax, [r11 + {CTX_RFLAGS}]",
        "mov [rsp + 16], rax",
        "mov rax, [r11 + {CTX_RSP}]",
        "mov [rsp + 24], rax",
        "mov rax, [r11 + {CTX_SS}]",
        "mov [rsp + 32], rax",

        "mov r15, [r11 + {CTX_R15}]",
        "mov r14, [r11 + {CTX_R14}]",
        "mov r13, [r11 + {CTX_R13}]",
        "mov r12, [r11 + {CTX_R12}]",
        "mov r10, [r11 + {CTX_R10}]",
        "mov r9, [r11 + {CTX_R9}]",
        "mov r8, [r11 + {CTX_R8}]",
        "mov rdi, [r11 + {CTX_RDI}]",
        "mov rsi, [r11 + {CTX_RSI}]",
        "mov rbp, [r11 + {CTX_RBP}]",
        "mov rbx, [r11 + {CTX_RBX}]",
        "mov rdx, [r11 + {CTX_RDX}]",
        "mov rcx, [r11 + {CTX_RCX}]",
        "mov rax, [r11 + {CTX_RAX}]",
        "mov r11, [r11 + {CTX_R11}]",

        "iretq",

        CTX_R15 = const CTX_R15,
        CTX_R14 = const CTX_R14,
        CTX_R13 = const CTX_R13,
        CTX_R12 = const CTX_R12,
        CTX_R11 = const CTX_R11,
        CTX_R10 = const CTX_R10,
        CTX_R9 = const CTX_R9,
        CTX_R8 = const CTX_R8,
        CTX_RDI = const CTX_RDI,
        CTX_RSI = const CTX_RSI,
        CTX_RBP = const CTX_RBP,
        CTX_RBX = const CTX_RBX,
        CTX_RDX = const CTX_RDX,
        CTX_RCX = const CTX_RCX,
        CTX_RAX = const CTX_RAX,
        CTX_RIP = const CTX_RIP,
        CTX_CS = const CTX_CS,
        CTX_RFLAGS = const CTX_RFLAGS,
        CTX_RSP = const CTX_RSP,
        CTX_SS = const CTX_SS,
    )
}

fn end_of_interrupt(cpu: &crate::memory::cpu_local_data::CpuLocalData) {
    unsafe {
        let local_apic = &mut *cpu.local_apic.get().unwrap().get();
        local_apic.end_of_interrupt()
    };
}

extern "C" fn signal_ipi_inner() -> *mut CpuContext {
    let cpu = get_local();
    end_of_interrupt(cpu);
    drain(cpu);

    let task_ptr = cpu.current_task.load(core::sync::atomic::Ordering::SeqCst);
    if task_ptr.is_null() {
        core::ptr::null_mut()
    } else {
        unsafe { (*task_ptr).context_ptr() }
    }
}

extern "C" fn signal_ipi_inner_no_task() {
    let cpu = get_local();
    end_of_interrupt(cpu);
    drain(cpu);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_ring_starts_empty() {
        let ring = SignalRing::new();
        assert!(ring.messages.is_empty());
    }
}
