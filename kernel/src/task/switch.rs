//! Voluntary task switch.
//!
//! `sem_wait`/`timer_wait` suspend outside of any interrupt, so there is no
//! hardware-pushed iretq frame to save and no EOI to send. `yield_now` plays
//! that missing hardware role itself: it writes the outgoing task's GPRs and
//! a synthetic iretq frame straight into its `CpuContext` (RIP pointed at the
//! resume label below), asks the scheduler for the next context exactly like
//! the timer trampoline does, then builds a fresh on-stack iretq frame for
//! whichever task comes back and jumps into it. A task resumed this way lands
//! back at the resume label with every register exactly as it left them, so
//! to its Rust caller `yield_now()` is just a function that returned.
use crate::memory::cpu_local_data::{CURRENT_TASK_OFFSET, get_local};
use crate::task::task::{
    CTX_CS, CTX_INT_NO, CTX_R8, CTX_R9, CTX_R10, CTX_R11, CTX_R12, CTX_R13, CTX_R14, CTX_R15,
    CTX_RAX, CTX_RBP, CTX_RBX, CTX_RCX, CTX_RDI, CTX_RDX, CTX_RFLAGS, CTX_RIP, CTX_RSI, CTX_RSP,
    CTX_SS, TASK_CONTEXT_OFFSET,
};

#[unsafe(naked)]
pub extern "C" fn yield_now() {
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
        "mov qword ptr [r11 + {CTX_INT_NO}], 0",

        // Synthetic iretq frame: resume at `2:`, same CS/SS/RSP as now, live
        // RFLAGS captured by a balanced pushfq/pop (no net rsp change).
        "pushfq",
        "pop rax",
        "mov [r11 + {CTX_RFLAGS}], rax",
        "lea rax, [rsp + 8]",
        "mov [r11 + {CTX_RSP}], rax",
        "mov qword ptr [r11 + {CTX_CS}], 0x08",
        "mov qword ptr [r11 + {CTX_SS}], 0x10",
        "lea rax, [rip + 2f]",
        "mov [r11 + {CTX_RIP}], rax",

        // Ask the scheduler for the next context; fall back to our own (just
        // saved) context if none is ready yet.
        "push r11",
        "call {inner}",
        "test rax, rax",
        "jnz 6f",
        "mov rax, [rsp]",
        "6:",
        "mov r11, rax",
        "add rsp, 8",

        "sub rsp, 40",
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

        "2:",
        "ret",

        "3:",
        "pop r11",
        "ret",

        current_task_offset = const CURRENT_TASK_OFFSET,
        task_context_offset = const TASK_CONTEXT_OFFSET,
        inner = sym yield_inner,
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
        CTX_INT_NO = const CTX_INT_NO,
        CTX_RIP = const CTX_RIP,
        CTX_CS = const CTX_CS,
        CTX_RFLAGS = const CTX_RFLAGS,
        CTX_RSP = const CTX_RSP,
        CTX_SS = const CTX_SS,
    );
}

extern "C" fn yield_inner() -> *mut crate::task::task::CpuContext {
    let cpu = get_local();
    if cpu.ready_queues.get().is_none() {
        return core::ptr::null_mut();
    }
    crate::task::scheduler::schedule_from_interrupt(cpu)
}
