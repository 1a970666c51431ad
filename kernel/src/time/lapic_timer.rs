//! Local APIC timer in TSC-deadline mode: the LVT entry is armed once at
//! `init`, and every re-arm afterwards is a plain MSR write, no PIT
//! round-trip involved.

use x86::msr::{IA32_TSC_DEADLINE, IA32_X2APIC_ESR, IA32_X2APIC_LVT_THERMAL, IA32_X2APIC_LVT_TIMER, wrmsr};

use crate::interrupt::InterruptVector;
use crate::time::tsc;

/// LVT Timer Mode bits (17:18) = `0b10`, TSC-Deadline mode.
const LVT_TIMER_TSC_DEADLINE_MODE: u64 = 0b10 << 17;

/// Switches this core's local APIC timer into TSC-deadline mode, routed to
/// `InterruptVector::LocalApicTimer`. Must run after `tsc::calibrate`.
pub fn init() {
    unsafe {
        wrmsr(
            IA32_X2APIC_LVT_TIMER,
            u8::from(InterruptVector::LocalApicTimer) as u64 | LVT_TIMER_TSC_DEADLINE_MODE,
        );
        wrmsr(IA32_X2APIC_LVT_THERMAL, 0);
        wrmsr(IA32_X2APIC_ESR, 0);
    }
}

/// Arms a one-shot interrupt `ticks_from_now` TSC ticks in the future.
pub fn arm_deadline(ticks_from_now: u64) {
    let deadline = tsc::value().saturating_add(ticks_from_now);
    unsafe {
        wrmsr(IA32_TSC_DEADLINE, deadline);
    }
}

/// Disarms the timer (writing 0 to the deadline MSR cancels any pending one).
pub fn disarm() {
    unsafe {
        wrmsr(IA32_TSC_DEADLINE, 0);
    }
}
