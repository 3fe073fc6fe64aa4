//! Processor tick-counter access.
//!
//! Two flavors: [`ticks_fenced`] serializes the pipeline before reading so
//! that no earlier instruction's timing leaks into a measurement, and
//! [`ticks_raw`] reads the counter bare. Calibration uses the fenced read
//! exclusively; the stall loop uses the raw read, where loop-level ordering
//! suffices and serialization cost would dominate the quantity being
//! measured.

// ---------------------------------------------------------------------------
// Counter reads
// ---------------------------------------------------------------------------

/// Read the tick counter with a serialization barrier before the read.
///
/// On x86_64 this is `lfence; rdtsc`; on aarch64, `isb; mrs cntvct_el0`.
/// Elsewhere it falls back to monotonic-clock nanoseconds relative to a
/// process-local epoch.
#[cfg(target_arch = "x86_64")]
#[inline]
pub fn ticks_fenced() -> u64 {
    // SAFETY: lfence and rdtsc have no memory or register preconditions.
    unsafe {
        core::arch::x86_64::_mm_lfence();
        core::arch::x86_64::_rdtsc()
    }
}

/// Read the tick counter with no serialization.
#[cfg(target_arch = "x86_64")]
#[inline(always)]
pub fn ticks_raw() -> u64 {
    // SAFETY: rdtsc has no preconditions.
    unsafe { core::arch::x86_64::_rdtsc() }
}

#[cfg(target_arch = "aarch64")]
#[inline]
pub fn ticks_fenced() -> u64 {
    let val: u64;
    // SAFETY: CNTVCT_EL0 is readable from EL0; isb only synchronizes the
    // instruction stream.
    unsafe {
        std::arch::asm!("isb", "mrs {}, cntvct_el0", out(reg) val, options(nostack, nomem));
    }
    val
}

#[cfg(target_arch = "aarch64")]
#[inline(always)]
pub fn ticks_raw() -> u64 {
    let val: u64;
    // SAFETY: read-only system register, no side effects.
    unsafe {
        std::arch::asm!("mrs {}, cntvct_el0", out(reg) val, options(nostack, nomem));
    }
    val
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
#[inline]
pub fn ticks_fenced() -> u64 {
    fallback_ns()
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
#[inline(always)]
pub fn ticks_raw() -> u64 {
    fallback_ns()
}

/// Monotonic nanoseconds since a process-local epoch.
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn fallback_ns() -> u64 {
    use std::sync::OnceLock;
    use std::time::Instant;
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_nanos() as u64
}

// ---------------------------------------------------------------------------
// Fences
// ---------------------------------------------------------------------------

/// Load fence: no later load starts before earlier loads complete.
#[inline]
pub fn load_fence() {
    #[cfg(target_arch = "x86_64")]
    // SAFETY: no preconditions.
    unsafe {
        core::arch::x86_64::_mm_lfence()
    }
    #[cfg(target_arch = "aarch64")]
    // SAFETY: dmb is a bare barrier instruction.
    unsafe {
        std::arch::asm!("dmb ishld", options(nostack))
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    std::sync::atomic::fence(std::sync::atomic::Ordering::Acquire);
}

/// Full memory fence: all earlier loads and stores complete first.
#[inline]
pub fn full_fence() {
    #[cfg(target_arch = "x86_64")]
    // SAFETY: no preconditions.
    unsafe {
        core::arch::x86_64::_mm_mfence()
    }
    #[cfg(target_arch = "aarch64")]
    // SAFETY: dmb is a bare barrier instruction.
    unsafe {
        std::arch::asm!("dmb ish", options(nostack))
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
}

// ---------------------------------------------------------------------------
// Self-overhead and frequency
// ---------------------------------------------------------------------------

/// Measure the mean cost of [`ticks_fenced`] itself.
///
/// Every latency measurement in the calibrator subtracts this value
/// (flooring at zero) so that recorded cycle counts approximate the cost of
/// the memory operation alone.
pub fn measure_tick_overhead() -> u64 {
    const SAMPLES: u64 = 128;

    let mut total = 0u64;
    for _ in 0..SAMPLES {
        let s = ticks_fenced();
        total += ticks_fenced().wrapping_sub(s);
    }
    total / SAMPLES
}

/// Estimate the CPU tick rate in kHz by counting ticks across a ~100 ms
/// monotonic-clock window.
///
/// The original ran in the kernel and read `cpu_khz` directly; a userspace
/// estimate against `Instant` is accurate to well under a percent, which is
/// finer than the bus-scale rounding that consumes it.
pub fn estimate_cpu_khz() -> u64 {
    use std::time::{Duration, Instant};

    let window = Duration::from_millis(100);
    let t0 = Instant::now();
    let c0 = ticks_fenced();
    while t0.elapsed() < window {
        std::hint::spin_loop();
    }
    let c1 = ticks_fenced();
    let elapsed_us = t0.elapsed().as_micros().max(1) as u64;

    c1.wrapping_sub(c0) * 1000 / elapsed_us
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fenced_is_monotonic() {
        let t1 = ticks_fenced();
        let t2 = ticks_fenced();
        assert!(t2 >= t1);
    }

    #[test]
    fn raw_is_monotonic_on_one_cpu() {
        let t1 = ticks_raw();
        let t2 = ticks_raw();
        assert!(t2 >= t1);
    }

    #[test]
    fn overhead_is_small() {
        let overhead = measure_tick_overhead();
        // A fenced counter read costs tens of cycles, not tens of thousands.
        assert!(overhead < 100_000, "overhead {overhead} looks wrong");
    }

    #[test]
    #[ignore] // Hardware-dependent: slow in emulators and CI
    fn cpu_khz_is_plausible() {
        let khz = estimate_cpu_khz();
        // Anything between 10 MHz and 10 GHz.
        assert!(khz > 10_000 && khz < 10_000_000, "cpu_khz = {khz}");
    }
}
