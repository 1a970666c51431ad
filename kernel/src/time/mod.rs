//! C10: monotonic per-core tick counter and one-shot deadline timer.

pub mod lapic_timer;
pub mod pit;
pub mod tsc;

use core::sync::atomic::Ordering;

use crate::memory::cpu_local_data::CpuLocalData;

/// Tick period, in TSC ticks, corresponding to one timer IRQ (1ms).
fn ticks_per_period() -> u64 {
    tsc::hz() / 1000
}

/// Called from the timer IRQ handler: advances this core's tick counter and
/// re-arms the next one-shot deadline.
pub fn on_timer_tick(cpu: &CpuLocalData) {
    cpu.tick.fetch_add(1, Ordering::Relaxed);
    lapic_timer::arm_deadline(ticks_per_period());
}

/// Reads this core's monotonic tick counter.
pub fn get_clock_tick(cpu: &CpuLocalData) -> u64 {
    cpu.tick.load(Ordering::Relaxed)
}

/// Arms the one-shot timer for `deadline` ticks (absolute, as returned by
/// `get_clock_tick`) in the future on this core.
pub fn set_timer(cpu: &CpuLocalData, deadline: u64) {
    let now = get_clock_tick(cpu);
    let ticks_away = deadline.saturating_sub(now);
    lapic_timer::arm_deadline(ticks_away * ticks_per_period());
}

/// Waits for `ticks` timer periods to elapse. If the calling task is the
/// core's idle task, busy-waits with `hlt`; otherwise yields the core to
/// the scheduler on every iteration so other ready tasks still run while
/// this one waits.
pub fn timer_wait(cpu: &CpuLocalData, ticks: u64) {
    let deadline = get_clock_tick(cpu).saturating_add(ticks);
    let is_idle = unsafe { cpu.current_task.load(Ordering::SeqCst).as_ref() }
        .map(|t| t.status() == crate::task::task::TaskStatus::Idle)
        .unwrap_or(true);

    while get_clock_tick(cpu) < deadline {
        if is_idle {
            x86_64::instructions::hlt();
        } else {
            crate::task::switch::yield_now();
        }
    }
}
