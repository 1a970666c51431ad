//! Kernel stacks with an unmapped guard page below them, so a stack
//! overflow faults instead of silently corrupting whatever sits below.

use alloc::collections::BTreeMap;

use x86_64::VirtAddr;

use crate::memory::MEMORY;
use crate::memory::physical_bitmap::FRAME_SIZE;

pub const NORMAL_STACK_SIZE: u64 = 64 * 0x400;
pub const EXCEPTION_HANDLER_STACK_SIZE: u64 = 64 * 0x400;

pub static STACK_GUARD_PAGES: spin::Mutex<BTreeMap<u64, StackInfo>> = spin::Mutex::new(BTreeMap::new());

#[derive(Debug, Clone, Copy)]
pub enum StackType {
    Normal,
    ExceptionHandler,
}

#[derive(Debug, Clone, Copy)]
pub struct StackId {
    pub kind: StackType,
    pub cpu_id: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct StackInfo {
    #[allow(unused)]
    pub id: StackId,
    pub size: u64,
}

#[derive(Debug)]
pub struct GuardedStack {
    top: VirtAddr,
    guard_page_start: u64,
}

impl GuardedStack {
    /// Reserves `size` bytes of stack plus one unmapped guard page below it
    /// in the kernel VMA arena (C5), backs the stack pages with fresh
    /// frames from C4, and maps them via C7.
    pub fn allocate(size: u64, id: StackId) -> Self {
        let memory = MEMORY.get().unwrap();
        let n_stack_pages = size.div_ceil(FRAME_SIZE);
        let n_total_pages = n_stack_pages + 1;

        let region_start = {
            let mut vma = memory.vma.lock(core_id());
            vma.vma_alloc(
                n_total_pages * FRAME_SIZE,
                crate::memory::vma::VmaFlags::WRITE | crate::memory::vma::VmaFlags::KERNEL,
            )
            .expect("out of kernel virtual address space for stack")
        };

        let guard_page_start = region_start;
        STACK_GUARD_PAGES
            .lock()
            .insert(guard_page_start, StackInfo { id, size });

        let stack_start = region_start + FRAME_SIZE;
        let phys = memory.physical.get_pages(n_stack_pages);
        assert_ne!(phys, 0, "out of physical memory for a kernel stack");

        memory
            .pages
            .map(
                VirtAddr::new(stack_start),
                x86_64::PhysAddr::new(phys),
                n_stack_pages,
                crate::memory::page_table::MapFlags::WRITABLE,
                &memory.physical,
            )
            .expect("failed to map kernel stack");

        Self {
            top: VirtAddr::new(stack_start + n_stack_pages * FRAME_SIZE),
            guard_page_start,
        }
    }

    pub fn new_kernel(size: u64, id: StackId) -> Self {
        Self::allocate(size, id)
    }

    pub fn top(&self) -> VirtAddr {
        self.top
    }

    /// Jumps onto this stack and tail-calls `entry`, never returning. Used
    /// exactly once per core, for the very first stack transition off the
    /// Limine-provided boot stack — every later transition goes through
    /// `interrupt::load_context_and_iretq`, which restores a saved
    /// `CpuContext` instead of just relocating `rsp`.
    pub unsafe fn switch(&self, entry: extern "sysv64" fn() -> !) -> ! {
        unsafe { switch_stack_and_call(self.top.as_u64(), entry) }
    }
}

#[unsafe(naked)]
unsafe extern "sysv64" fn switch_stack_and_call(new_rsp: u64, entry: extern "sysv64" fn() -> !) -> ! {
    core::arch::naked_asm!("mov rsp, rdi", "jmp rsi")
}

impl Drop for GuardedStack {
    fn drop(&mut self) {
        STACK_GUARD_PAGES.lock().remove(&self.guard_page_start);
    }
}

fn core_id() -> i32 {
    crate::memory::cpu_local_data::try_get_local()
        .map(|c| c.kernel_id as i32)
        .unwrap_or(-1)
}
