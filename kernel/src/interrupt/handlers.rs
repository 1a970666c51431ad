use crate::hlt_loop;
use crate::memory::cpu_local_data::{CURRENT_TASK_OFFSET, get_local, local_apic_id_of, try_get_local};
use crate::memory::guarded_stack::STACK_GUARD_PAGES;
use crate::task::task::{
    CTX_CS, CTX_R8, CTX_R9, CTX_R10, CTX_R11, CTX_R12, CTX_R13, CTX_R14, CTX_R15, CTX_RAX,
    CTX_RBP, CTX_RBX, CTX_RCX, CTX_RDI, CTX_RDX, CTX_RFLAGS, CTX_RIP, CTX_RSI, CTX_RSP, CTX_SS,
    CpuContext, TASK_CONTEXT_OFFSET,
};
use core::sync::atomic::{AtomicU64, Ordering};
use x86_64::registers::control::Cr2;
use x86_64::structures::idt::{InterruptStackFrame, PageFaultErrorCode};

pub static TIMER_INTERRUPT_COUNT: AtomicU64 = AtomicU64::new(0);
use crate::interrupt::nmi_handler_state::{NMI_HANDLER_STATES, NmiHandlerState};

pub extern "x86-interrupt" fn page_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    let accessed_address = Cr2::read_raw();
    log::error!(
        "Page fault at {:#x}, error: {error_code:#?}, ip: {:#x}",
        accessed_address,
        stack_frame.instruction_pointer.as_u64()
    );
    let accessed_address = x86_64::VirtAddr::new(accessed_address);
    if let Some(stack) = STACK_GUARD_PAGES
        .lock()
        .iter()
        .find_map(|(page_start, info)| {
            if accessed_address.align_down(4096u64).as_u64() == *page_start {
                Some(*info)
            } else {
                None
            }
        })
    {
        panic!("Stack overflow: {stack:#X?}");
    } else {
        panic!(
            "Page fault! Stack frame: {stack_frame:#?}. Error code: {error_code:#?}. Accessed address: {accessed_address:?}."
        );
    }
}

pub extern "x86-interrupt" fn general_protection_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) {
    panic!("General Protection Fault! Stack frame: {stack_frame:#?}. Error code: {error_code}.")
}

pub extern "x86-interrupt" fn double_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) -> ! {
    panic!("Double Fault! Stack frame: {stack_frame:#?}. Error code: {error_code}.")
}

pub extern "x86-interrupt" fn breakpoint_handler(stack_frame: InterruptStackFrame) {
    log::info!("Breakpoint! Stack frame: {stack_frame:#?}");
}

pub extern "x86-interrupt" fn nmi_handler(_stack_frame: InterruptStackFrame) {
    handle_panic_from_other_cpu()
}

pub extern "x86-interrupt" fn machine_check_handler(stack_frame: InterruptStackFrame) -> ! {
    log::error!("Machine check! Stack frame: {stack_frame:#?}");
    handle_panic_from_other_cpu()
}

/// Timer interrupt handler: saves the outgoing task's GPRs and iretq frame
/// into its `CpuContext`, asks the scheduler for the next one, and restores
/// that task's state before `iretq`. Single address space, single ring — no
/// swapgs, no CPL check: GS always points at this core's `CpuLocalData`.
///
/// Flow:
/// 1. Load the current task's context pointer (`CpuLocalData.current_task`
///    plus `Task.context`) from GS-relative addressing.
/// 2. If null, no task has been bootstrapped yet on this core; try that.
/// 3. Save all GPRs and the hardware iretq frame into the context struct.
/// 4. Call the inner handler, which asks the scheduler for the next
///    context pointer.
/// 5. Copy the new context's iretq frame onto the stack and restore GPRs.
/// 6. `iretq`.
#[unsafe(naked)]
pub extern "C" fn timer_interrupt_handler() {
    core::arch::naked_asm!(
        "push r11",

        // r11 = CpuLocalData.current_task (Task*)
        "mov r11, gs:[{current_task_offset}]",
        "test r11, r11",
        "jz 2f",
        // r11 = &Task.context (CpuContext*)
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
        "jmp 5f",

        "2:",
        "call {bootstrap}",
        "test rax, rax",
        "jz 4f",

        "5:",
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

        "4:",
        "pop r11",
        "call {early_eoi}",
        "iretq",

        inner = sym timer_interrupt_handler_inner,
        bootstrap = sym timer_bootstrap_first_task,
        early_eoi = sym timer_early_eoi,
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

extern "C" fn timer_early_eoi() {
    let cpu = get_local();
    crate::time::on_timer_tick(cpu);
    unsafe {
        let local_apic = &mut *cpu.local_apic.get().unwrap().get();
        local_apic.end_of_interrupt()
    };
    TIMER_INTERRUPT_COUNT.fetch_add(1, Ordering::Relaxed);
}

/// Bootstraps the first task on this core when the timer fires before any
/// task has run yet. Returns null if the scheduler isn't initialized.
extern "C" fn timer_bootstrap_first_task() -> *mut CpuContext {
    let cpu = get_local();
    crate::time::on_timer_tick(cpu);
    unsafe {
        let local_apic = &mut *cpu.local_apic.get().unwrap().get();
        local_apic.end_of_interrupt()
    };
    TIMER_INTERRUPT_COUNT.fetch_add(1, Ordering::Relaxed);

    if cpu.ready_queues.get().is_none() {
        log::warn!("timer fired before this core's ready queues were initialized");
        return core::ptr::null_mut();
    }
    crate::task::scheduler::schedule_from_interrupt(cpu)
}

extern "C" fn timer_interrupt_handler_inner() -> *mut CpuContext {
    let cpu = get_local();
    crate::time::on_timer_tick(cpu);
    unsafe {
        let local_apic = &mut *cpu.local_apic.get().unwrap().get();
        local_apic.end_of_interrupt()
    };
    TIMER_INTERRUPT_COUNT.fetch_add(1, Ordering::Relaxed);
    crate::task::scheduler::schedule_from_interrupt(cpu)
}

/// Launches a core's very first task from boot code, outside of any
/// interrupt: builds a fake iretq frame on the stack and jumps into it.
///
/// # Safety
/// `context` must point to a valid, fully-initialized `CpuContext`. Never
/// returns.
#[unsafe(naked)]
pub unsafe extern "C" fn load_context_and_iretq(context: *const CpuContext) -> ! {
    core::arch::naked_asm!(
        "mov r11, rdi",
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

// -- NMI cross-core panic propagation (AS1) --
pub fn handle_panic_from_other_cpu() -> ! {
    if let Some(local) = try_get_local()
        && let Some(nmi_handler_states) = NMI_HANDLER_STATES.get()
    {
        let local_apic = unsafe {
            &mut *local
                .local_apic
                .get()
                .expect("local APIC not initialized")
                .get()
        };

        for (cpu_id, nmi_handler_state) in nmi_handler_states
            .iter()
            .enumerate()
            .filter(|(cpu_id, _)| *cpu_id as u32 != local.kernel_id)
        {
            if nmi_handler_state.swap(NmiHandlerState::KernelPanicked, Ordering::Release)
                == NmiHandlerState::NmiHandlerSet
            {
                unsafe {
                    local_apic.send_nmi(local_apic_id_of(cpu_id as u32));
                }
            }
        }
    }

    hlt_loop()
}
