//! TSC reads and frequency detection.
//!
//! C10 detects the CPU frequency by trying, in order: the `-freq` command
//! line override, the CPU brand string (e.g. `"... @ 2.40GHz"`), and
//! finally a TSC-vs-PIT calibration run as the fallback of last resort.

use core::arch::x86_64::{__cpuid, __rdtscp, _mm_lfence, _rdtsc};
use core::sync::atomic::{AtomicU64, Ordering};

use crate::boot_config::BootConfig;
use crate::time::pit;

/// TSC ticks per second, set once during boot by `calibrate`.
pub static TSC_HZ: AtomicU64 = AtomicU64::new(0);

pub fn hz() -> u64 {
    TSC_HZ.load(Ordering::Relaxed)
}

pub fn value() -> u64 {
    if has_rdtscp() {
        let mut aux = 0;
        unsafe { __rdtscp(&mut aux) }
    } else {
        unsafe {
            _mm_lfence();
            _rdtsc()
        }
    }
}

fn has_rdtscp() -> bool {
    let max_ext = unsafe { __cpuid(0x8000_0000) }.eax;
    if max_ext < 0x8000_0001 {
        return false;
    }
    let res = unsafe { __cpuid(0x8000_0001) };
    (res.edx & (1 << 27)) != 0
}

/// Parses a CPU brand string of the form `"... X.YZGHz"` into MHz.
/// Returns `None` if no frequency suffix is found.
fn parse_brand_string_mhz(brand: &str) -> Option<u32> {
    let ghz_pos = brand.find("GHz")?;
    let before = &brand[..ghz_pos];
    let start = before
        .rfind(|c: char| !(c.is_ascii_digit() || c == '.'))
        .map(|i| i + 1)
        .unwrap_or(0);
    let number = &before[start..];
    let ghz: f64 = number.parse().ok()?;
    Some((ghz * 1000.0) as u32)
}

fn brand_string_mhz() -> Option<u32> {
    let cpuid = raw_cpuid::CpuId::new();
    let brand = cpuid.get_processor_brand_string()?;
    parse_brand_string_mhz(brand.as_str())
}

/// Ticks elapsed across a PIT-timed calibration window.
fn calibrate_with_pit() -> u64 {
    const PIT_WAIT_MS: u32 = 10;

    let start = value();
    pit::sleep_ms(PIT_WAIT_MS);
    let end = value();

    let elapsed = end.saturating_sub(start);
    (elapsed * 1000) / PIT_WAIT_MS as u64
}

/// Detects the TSC frequency and stores it in `TSC_HZ`. Must be called
/// once during early boot, before any code reads `hz()`.
pub fn calibrate(config: &BootConfig) {
    let hz = if let Some(mhz) = config.cpu_freq_override_mhz {
        log::info!("tsc: using command-line frequency override ({mhz} MHz)");
        mhz as u64 * 1_000_000
    } else if let Some(mhz) = brand_string_mhz() {
        log::info!("tsc: using CPU brand string frequency ({mhz} MHz)");
        mhz as u64 * 1_000_000
    } else {
        let hz = calibrate_with_pit();
        log::info!("tsc: calibrated against PIT ({hz} Hz)");
        hz
    };
    TSC_HZ.store(hz, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ghz_brand_string() {
        assert_eq!(
            parse_brand_string_mhz("Intel(R) Core(TM) i7-9700K CPU @ 3.60GHz"),
            Some(3600)
        );
    }

    #[test]
    fn parses_decimal_ghz() {
        assert_eq!(parse_brand_string_mhz("Some CPU 2.40GHz"), Some(2400));
    }

    #[test]
    fn missing_suffix_is_none() {
        assert_eq!(parse_brand_string_mhz("Generic CPU"), None);
    }
}
