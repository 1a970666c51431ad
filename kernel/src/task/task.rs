//! C8: task control block.
//!
//! One `Task` per entry in the fixed-size task table. Queue membership
//! (ready list, block list) is modeled as arena indices into the table
//! rather than intrusive pointers, per the arena-as-queue design note: no
//! heap allocation on the hot enqueue/dequeue path.

use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};

use crate::memory::guarded_stack::GuardedStack;
use crate::memory::page_table::PageTableManager;
use crate::sync::ticket_lock::IrqSaveTicketLock;

pub type TaskId = u32;

pub const IDLE_PRIORITY: u8 = 0;
pub const MAX_PRIORITY: u8 = 31;
pub const FPU_STATE_BYTES: usize = 512; // legacy FXSAVE area

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskStatus {
    Invalid = 0,
    Ready = 1,
    Running = 2,
    Blocked = 3,
    Finished = 4,
    Idle = 5,
}

/// The machine register state pushed by an interrupt entry, or synthesized
/// by `create_default_frame` for a never-yet-run task. Field offsets are
/// exposed as `CTX_*` constants so the naked-asm trampolines in
/// `interrupt::handlers` can address them without a Rust call frame.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct CpuContext {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rax: u64,
    /// Zero means "this state was voluntarily saved by a context switch",
    /// matching the Core-frame tag in the data model; any other value is a
    /// real interrupt vector number.
    pub int_no: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

pub const CTX_R15: usize = core::mem::offset_of!(CpuContext, r15);
pub const CTX_R14: usize = core::mem::offset_of!(CpuContext, r14);
pub const CTX_R13: usize = core::mem::offset_of!(CpuContext, r13);
pub const CTX_R12: usize = core::mem::offset_of!(CpuContext, r12);
pub const CTX_R11: usize = core::mem::offset_of!(CpuContext, r11);
pub const CTX_R10: usize = core::mem::offset_of!(CpuContext, r10);
pub const CTX_R9: usize = core::mem::offset_of!(CpuContext, r9);
pub const CTX_R8: usize = core::mem::offset_of!(CpuContext, r8);
pub const CTX_RDI: usize = core::mem::offset_of!(CpuContext, rdi);
pub const CTX_RSI: usize = core::mem::offset_of!(CpuContext, rsi);
pub const CTX_RBP: usize = core::mem::offset_of!(CpuContext, rbp);
pub const CTX_RBX: usize = core::mem::offset_of!(CpuContext, rbx);
pub const CTX_RDX: usize = core::mem::offset_of!(CpuContext, rdx);
pub const CTX_RCX: usize = core::mem::offset_of!(CpuContext, rcx);
pub const CTX_RAX: usize = core::mem::offset_of!(CpuContext, rax);
pub const CTX_INT_NO: usize = core::mem::offset_of!(CpuContext, int_no);
pub const CTX_RIP: usize = core::mem::offset_of!(CpuContext, rip);
pub const CTX_CS: usize = core::mem::offset_of!(CpuContext, cs);
pub const CTX_RFLAGS: usize = core::mem::offset_of!(CpuContext, rflags);
pub const CTX_RSP: usize = core::mem::offset_of!(CpuContext, rsp);
pub const CTX_SS: usize = core::mem::offset_of!(CpuContext, ss);

/// Arena-index queue links: `-1` means "not linked".
#[derive(Debug, Default)]
pub struct QueueLinks {
    pub prev: AtomicI32,
    pub next: AtomicI32,
}

impl QueueLinks {
    const fn new() -> Self {
        Self {
            prev: AtomicI32::new(-1),
            next: AtomicI32::new(-1),
        }
    }
}

pub struct Task {
    pub id: TaskId,
    status: AtomicU32,
    /// Fixed at creation, never mutated again (closes the migration
    /// loophole: a task is never moved to another core's ready queue).
    pub last_core: u32,
    pub priority: u8,

    pub kernel_stack: GuardedStack,
    pub page_table: PageTableManager,

    /// The task's own saved machine state. For a RUNNING task this is stale
    /// until the next switch-away; for everyone else it is authoritative.
    pub context: core::cell::UnsafeCell<CpuContext>,

    pub links: QueueLinks,

    /// Start/end of the task's heap VMA, if it has requested one.
    pub heap_vma: core::cell::Cell<Option<(u64, u64)>>,

    /// Signal handler entry point, 0 = no handler installed.
    pub signal_handler: AtomicU64,

    pub fpu_state: core::cell::UnsafeCell<[u8; FPU_STATE_BYTES]>,
    pub fpu_used_since_switch: AtomicBool,

    /// Reference count of user pages mapped through this task's page table
    /// (shared, not copy-on-write, per C7).
    pub user_usage: AtomicU32,

    pub lock: IrqSaveTicketLock<()>,
}

unsafe impl Sync for Task {}

/// Task-relative offset of `context`, used by the naked-asm timer
/// trampoline together with `CURRENT_TASK_OFFSET` to reach a task's
/// `CpuContext` directly from GS-relative addressing.
pub const TASK_CONTEXT_OFFSET: usize = core::mem::offset_of!(Task, context);

impl Task {
    pub fn status(&self) -> TaskStatus {
        match self.status.load(Ordering::SeqCst) {
            0 => TaskStatus::Invalid,
            1 => TaskStatus::Ready,
            2 => TaskStatus::Running,
            3 => TaskStatus::Blocked,
            4 => TaskStatus::Finished,
            _ => TaskStatus::Idle,
        }
    }

    pub fn set_status(&self, status: TaskStatus) {
        self.status.store(status as u32, Ordering::SeqCst);
    }

    pub fn context_ptr(&self) -> *mut CpuContext {
        self.context.get()
    }

    /// Lays a synthetic interrupt frame on the task's own context so the
    /// first scheduler dispatch "returns from interrupt" straight into
    /// `entry(arg)`. `int_no` is left at 0, tagging this as a
    /// voluntarily-saved state per the Core-frame convention.
    pub fn create_default_frame(&self, entry: extern "C" fn(u64) -> !, arg: u64) {
        let ctx = unsafe { &mut *self.context.get() };
        *ctx = CpuContext::default();
        ctx.rdi = arg;
        ctx.rip = entry as u64;
        // GDT layout is fixed (gdt::init): null, kernel code, kernel data, TSS.
        ctx.cs = 0x08;
        ctx.ss = 0x10;
        ctx.rflags = 0x202; // IF set, reserved bit 1 set
        ctx.rsp = self.kernel_stack.top().as_u64();
    }
}
