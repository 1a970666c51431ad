use crate::memory::cpu_local_data::get_local;
use crate::memory::guarded_stack::{
    EXCEPTION_HANDLER_STACK_SIZE, GuardedStack, StackId, StackType,
};
use num_enum::IntoPrimitive;
use x86_64::instructions::segmentation::{CS, SS, Segment};
use x86_64::instructions::tables::load_tss;
use x86_64::registers::segmentation::SegmentSelector;
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable};
use x86_64::structures::tss::TaskStateSegment;

/// C11: the NMI, double-fault, and machine-check vectors each get a
/// distinct IST stack, so a corrupted task stack can't also take down the
/// handler meant to report or survive it. `Exception` remains the shared
/// slot for faults that don't need their own (`#PF`).
#[derive(Debug, IntoPrimitive)]
#[repr(u8)]
pub enum IstStackIndexes {
    Exception,
    Nmi,
    DoubleFault,
    MachineCheck,
}

pub struct Gdt {
    gdt: GlobalDescriptorTable,
    kernel_code_selector: SegmentSelector,
    kernel_data_selector: SegmentSelector,
    tss_selector: SegmentSelector,
}

fn ist_stack(local: &'static crate::memory::cpu_local_data::CpuLocalData) -> x86_64::VirtAddr {
    GuardedStack::new_kernel(
        EXCEPTION_HANDLER_STACK_SIZE,
        StackId {
            kind: StackType::ExceptionHandler,
            cpu_id: local.kernel_id,
        },
    )
    .top()
}

pub fn init() {
    let local = get_local();
    let tss = local.tss.call_once(|| {
        let mut tss = TaskStateSegment::new();
        tss.interrupt_stack_table[u8::from(IstStackIndexes::Exception) as usize] = ist_stack(local);
        tss.interrupt_stack_table[u8::from(IstStackIndexes::Nmi) as usize] = ist_stack(local);
        tss.interrupt_stack_table[u8::from(IstStackIndexes::DoubleFault) as usize] = ist_stack(local);
        tss.interrupt_stack_table[u8::from(IstStackIndexes::MachineCheck) as usize] = ist_stack(local);
        tss
    });

    let gdt = local.gdt.call_once(|| {
        let mut gdt = GlobalDescriptorTable::new();
        let kernel_code_selector = gdt.append(Descriptor::kernel_code_segment());
        let kernel_data_selector = gdt.append(Descriptor::kernel_data_segment());
        let tss_selector = gdt.append(Descriptor::tss_segment(tss));
        Gdt {
            gdt,
            kernel_code_selector,
            kernel_data_selector,
            tss_selector,
        }
    });

    gdt.gdt.load();

    // Reload selectors
    unsafe { CS::set_reg(gdt.kernel_code_selector) };
    unsafe { SS::set_reg(gdt.kernel_data_selector) };
    unsafe { load_tss(gdt.tss_selector) };
}
