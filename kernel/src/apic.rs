//! Local APIC bring-up. `MP_REQUEST` asks Limine for x2APIC mode
//! (`RequestFlags::X2APIC`), so every core here always talks to its local
//! APIC through MSRs — there is no xAPIC MMIO fallback to map.

use core::cell::UnsafeCell;

use acpi::AcpiTables;
use acpi::platform::InterruptModel;
use force_send_sync::SendSync;
use raw_cpuid::CpuId;
use x2apic::lapic::LocalApicBuilder;
use x86_64::registers::model_specific::Msr;

use crate::interrupt::InterruptVector;
use crate::memory::cpu_local_data::get_local;

const IA32_X2APIC_SVR: u32 = 0x80F;

/// Validates that this machine has an APIC interrupt model and that every
/// core supports x2APIC; panics otherwise, since the rest of the kernel
/// assumes MSR-based local APIC access unconditionally.
pub fn init_bsp(acpi_tables: &AcpiTables<impl acpi::Handler>) {
    match InterruptModel::new(acpi_tables).unwrap().0 {
        InterruptModel::Apic(_) => {}
        other => panic!("unsupported interrupt model: {other:#?}"),
    }
    assert!(cpu_has_x2apic(), "this kernel requires x2APIC support");
}

/// Must be called on every core, after `init_bsp` has run on the BSP.
pub fn init_local_apic() {
    get_local().local_apic.call_once(|| {
        UnsafeCell::new({
            let mut builder = LocalApicBuilder::new();
            builder.spurious_vector(u8::from(InterruptVector::LocalApicSpurious).into());
            builder.error_vector(u8::from(InterruptVector::LocalApicError).into());
            builder.timer_vector(u8::from(InterruptVector::LocalApicTimer).into());

            let mut local_apic = builder.build().expect("local APIC configuration");
            unsafe { local_apic.enable() }
            unsafe { SendSync::new(local_apic) }
        })
    });
}

fn cpu_has_x2apic() -> bool {
    CpuId::new()
        .get_feature_info()
        .map(|info| info.has_x2apic())
        .unwrap_or(false)
}

pub fn is_enabled() -> bool {
    let svr = unsafe { Msr::new(IA32_X2APIC_SVR).read() };
    svr & (1 << 8) != 0
}
