use limine::response::MemoryMapResponse;
use spin::Once;
use x86_64::PhysAddr;
use x86_64::registers::control::{Cr3, Cr3Flags};
use x86_64::structures::paging::{PageTable, PhysFrame, Size4KiB};

use crate::memory::buddy::BuddyAllocator;
use crate::memory::page_table::{MapFlags, PageTableManager, RECURSIVE_INDEX};
use crate::memory::physical_bitmap::PhysicalFrameAllocator;
use crate::memory::vma::VmaArena;
use crate::sync::ticket_lock::IrqSaveTicketLock;

pub mod buddy;
pub mod cpu_local_data;
pub mod guarded_stack;
pub mod hhdm_offset;
pub mod page_table;
pub mod physical_bitmap;
pub mod vma;

/// Start of the kernel virtual window C5/C6 hand out addresses from. Chosen
/// well above the higher-half direct map so the two never collide.
pub const KERNEL_HEAP_WINDOW_START: u64 = 0xFFFF_9000_0000_0000;
pub const KERNEL_HEAP_WINDOW_END: u64 = 0xFFFF_A000_0000_0000;

#[global_allocator]
static GLOBAL_ALLOCATOR: BuddyAllocator = BuddyAllocator::new();

#[non_exhaustive]
pub struct Memory {
    pub physical: PhysicalFrameAllocator,
    pub vma: IrqSaveTicketLock<VmaArena>,
    pub pages: PageTableManager,
    pub new_kernel_cr3: PhysFrame<Size4KiB>,
    pub new_kernel_cr3_flags: Cr3Flags,
}

pub static MEMORY: Once<Memory> = Once::new();

/// Builds a fresh top-level table that self-maps at `RECURSIVE_INDEX` and
/// shares the bootloader's kernel mappings for the upper half, by copying
/// the active CR3's upper-half entries (identical strategy to
/// `PageTableManager::page_map_copy`, but bootstrapped from the bootloader's
/// table rather than from a `PageTableManager`).
unsafe fn build_new_kernel_table(
    physical: &PhysicalFrameAllocator,
    hhdm_offset: u64,
) -> (PhysFrame<Size4KiB>, PageTableManager) {
    let new_phys = physical.get_pages(1);
    assert_ne!(new_phys, 0, "no physical memory to build the kernel page table");
    let new_frame = PhysFrame::containing_address(PhysAddr::new(new_phys));

    let new_table = unsafe { &mut *((hhdm_offset + new_phys) as *mut PageTable) };
    new_table.zero();

    let (current_frame, _) = Cr3::read();
    let current_table =
        unsafe { &*((hhdm_offset + current_frame.start_address().as_u64()) as *const PageTable) };
    for i in 256..512usize {
        new_table[i] = current_table[i].clone();
    }
    new_table[RECURSIVE_INDEX as usize].set_frame(
        new_frame,
        x86_64::structures::paging::PageTableFlags::PRESENT
            | x86_64::structures::paging::PageTableFlags::WRITABLE,
    );

    (new_frame, PageTableManager::new(new_frame))
}

/// Initializes the physical allocator, builds the self-mapped kernel page
/// table, switches CR3 to it, and brings up the buddy heap on top. Must run
/// exactly once, on the BSP, before any other per-core init.
///
/// # Safety
/// No page tables may be modified before calling this, and it must run
/// before any AP calls `init_ap`.
pub unsafe fn init_bsp(memory_map: &'static MemoryMapResponse) {
    let hhdm: u64 = hhdm_offset::hhdm_offset().into();

    let physical = PhysicalFrameAllocator::new(memory_map);
    let (new_kernel_cr3, pages) = unsafe { build_new_kernel_table(&physical, hhdm) };

    unsafe { Cr3::write(new_kernel_cr3, Cr3Flags::empty()) };

    let memory = MEMORY.call_once(|| Memory {
        physical,
        vma: IrqSaveTicketLock::new(VmaArena::new(
            KERNEL_HEAP_WINDOW_START,
            KERNEL_HEAP_WINDOW_END,
        )),
        pages,
        new_kernel_cr3,
        new_kernel_cr3_flags: Cr3Flags::empty(),
    });

    unsafe {
        GLOBAL_ALLOCATOR.init(&memory.physical, &memory.pages, KERNEL_HEAP_WINDOW_START);
    }
}

/// # Safety
/// Must be called on every AP before it touches any mapped memory, after
/// `init_bsp` has run on the BSP.
pub unsafe fn init_ap() {
    let memory = MEMORY.get().unwrap();
    unsafe { Cr3::write(memory.new_kernel_cr3, memory.new_kernel_cr3_flags) };
}
