use crate::gdt::Gdt;
use crate::limine_requests::MP_REQUEST;
use crate::sync::ticket_lock::IrqSaveTicketLock;
use crate::task::ready_queue::ReadyQueues;
use crate::task::task::Task;
use alloc::boxed::Box;
use core::cell::UnsafeCell;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicPtr, AtomicU64};
use force_send_sync::SendSync;
use limine::mp::Cpu;
use limine::response::MpResponse;
use spin::{Lazy, Once};
use x2apic::lapic::LocalApic;
use x86_64::VirtAddr;
use x86_64::registers::model_specific::GsBase;
use x86_64::structures::idt::InterruptDescriptorTable;
use x86_64::structures::tss::TaskStateSegment;

/// C3: per-core state reached through GS-base. `current_task` and `kernel_id`
/// (the core id) are the two designated variables every other per-core
/// lookup is bootstrapped from.
pub struct CpuLocalData {
    pub kernel_id: u32,
    pub local_apic_id: u32,

    pub tss: Once<UnsafeCell<TaskStateSegment>>,
    pub gdt: Once<Gdt>,
    pub idt: Once<InterruptDescriptorTable>,

    pub local_apic: Once<UnsafeCell<SendSync<LocalApic>>>,
    pub ready_queues: Once<IrqSaveTicketLock<ReadyQueues>>,

    /// C12: this core's bounded inbox of pending signal messages, drained by
    /// the `Signal` IPI handler.
    pub signal_ring: Once<IrqSaveTicketLock<crate::signal::SignalRing>>,

    /// Pointer to the PCB of the task currently running on this core.
    pub current_task: AtomicPtr<Task>,

    /// C10: monotonic per-core tick counter, incremented once per timer IRQ.
    pub tick: AtomicU64,
}

/// GS-relative offset of `current_task`, used by the naked-asm timer
/// trampoline in `interrupt::handlers` to load/store it without a Rust call
/// frame.
pub const CURRENT_TASK_OFFSET: usize = core::mem::offset_of!(CpuLocalData, current_task);

impl CpuLocalData {
    /// Update TSS.RSP0 so that interrupts from ring 3 use the correct kernel stack.
    ///
    /// # Safety
    /// Must only be called with interrupts disabled (e.g., from within the scheduler).
    pub unsafe fn set_tss_rsp0(&self, rsp0: u64) {
        let tss = unsafe { &mut *self.tss.get().unwrap().get() };
        tss.privilege_stack_table[0] = VirtAddr::new(rsp0);
    }
}

// Safety:
// - Per-CPU data
// - Accessed only via GS base
// - No cross-CPU access
unsafe impl Sync for CpuLocalData {}

fn mp_response() -> &'static MpResponse {
    MP_REQUEST.get_response().expect("expected MP response")
}

static CPU_LOCAL_DATA: Lazy<Box<[Once<CpuLocalData>]>> =
    Lazy::new(|| mp_response().cpus().iter().map(|_| Once::new()).collect());

fn write_gs_base(ptr: &'static CpuLocalData) {
    unsafe {
        GsBase::write(VirtAddr::from_ptr(ptr));
    }
}

/// Initializes the item in 'CPU_LOCAL_DATA' and GS.Base
fn init_cpu(kernel_id: u32, local_apic_id: u32) {
    write_gs_base(
        CPU_LOCAL_DATA[kernel_id as usize].call_once(|| CpuLocalData {
            kernel_id,
            local_apic_id,
            tss: Once::new(),
            gdt: Once::new(),
            idt: Once::new(),
            local_apic: Once::new(),
            ready_queues: Once::new(),
            signal_ring: Once::new(),
            current_task: AtomicPtr::new(core::ptr::null_mut()),
            tick: AtomicU64::new(0),
        }),
    )
}

pub fn cpus_count() -> usize {
    mp_response().cpus().len()
}

pub fn local_apic_id_of(kernel_assigned_id: u32) -> u32 {
    CPU_LOCAL_DATA[kernel_assigned_id as usize]
        .get()
        .unwrap()
        .local_apic_id
}

/// Looks up another core's `CpuLocalData` by its kernel-assigned id.
/// Used for cross-core wakeups and signal delivery (C12/C13), which per the
/// shared-resource policy are allowed to hold another core's ready-queue or
/// signal-ring lock directly.
pub fn get_by_id(kernel_id: u32) -> Option<&'static CpuLocalData> {
    CPU_LOCAL_DATA.get(kernel_id as usize).and_then(Once::get)
}

pub fn try_get_local() -> Option<&'static CpuLocalData> {
    let ptr = NonNull::new(GsBase::read().as_mut_ptr::<CpuLocalData>())?;
    // Safety: we only wrote to GsBase using `write_gs_base`, which ensures that the pointer is `&'static CpuLocalData`
    unsafe { Some(ptr.as_ref()) }
}

pub fn get_local() -> &'static CpuLocalData {
    try_get_local().unwrap()
}

/// Initialize CPU local data for the BSP
///
/// # Safety:
/// Must be called on the AP
pub unsafe fn init_bsp() {
    // Always assign 0 to BSP
    init_cpu(0, mp_response().bsp_lapic_id())
}

pub unsafe fn init_ap(cpu: &Cpu) {
    let local_apic_id = cpu.lapic_id;
    init_cpu(
        // Get the position within the array (0 is BSP)
        mp_response()
            .cpus()
            .iter()
            .filter(|cpu| cpu.lapic_id != mp_response().bsp_lapic_id())
            .position(|cpu| cpu.lapic_id == local_apic_id)
            .expect("CPUs array should contain this AP") as u32
            + 1,
        local_apic_id,
    )
}
