//! Cycle-accurate timestamps.
//!
//! Mirrors `u-scl/rdtsc.h` from the original C source: an unfenced `rdtsc`
//! for hot loops and a fenced `rdtscp` for slice-deadline comparisons (design
//! note: "use the fenced variant at acquire entry and at the deadline
//! check").

use crate::error::{Result, ScheduledLockError};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// A monotonically non-decreasing cycle count, 64-bit.
pub type Cycles = u64;

/// Unfenced cycle read. Cheap; acceptable inside bounded spin loops.
#[inline(always)]
pub fn rdtsc() -> Cycles {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        core::arch::x86_64::_rdtsc()
    }
    #[cfg(target_arch = "x86")]
    unsafe {
        core::arch::x86::_rdtsc()
    }
    #[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
    {
        fallback_cycles()
    }
}

/// Fenced cycle read (`rdtscp`), used where the sample must be ordered
/// against surrounding memory operations: at acquire entry and when
/// comparing against a slice deadline.
#[inline(always)]
pub fn rdtscp() -> Cycles {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        let mut aux: u32 = 0;
        core::arch::x86_64::__rdtscp(&mut aux)
    }
    #[cfg(target_arch = "x86")]
    unsafe {
        let mut aux: u32 = 0;
        core::arch::x86::__rdtscp(&mut aux)
    }
    #[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
    {
        fallback_cycles()
    }
}

#[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
fn fallback_cycles() -> Cycles {
    // No cycle counter on this architecture; derive a monotonic surrogate
    // from the calibrated clock so the slice arithmetic below still behaves.
    let cyc_per_us = cycle_per_us().unwrap_or(1000);
    (Instant::now().elapsed().as_nanos() as u64 / 1000) * cyc_per_us
}

static CYCLE_PER_US: OnceLock<Cycles> = OnceLock::new();

/// Cycles elapsed per microsecond on this machine.
///
/// Honours a build-time `SCL_CYCLE_PER_US` override (see `build.rs`) for
/// reproducible test runs; otherwise self-calibrates once by timing an
/// `rdtsc` delta across a short sleep and caches the result for the process
/// lifetime.
pub fn cycle_per_us() -> Result<Cycles> {
    if let Some(&v) = CYCLE_PER_US.get() {
        return Ok(v);
    }

    let v = if let Some(compiled) = option_env!("SCL_CYCLE_PER_US") {
        compiled
            .parse::<Cycles>()
            .map_err(|e| ScheduledLockError::Configuration(format!("bad SCL_CYCLE_PER_US: {e}")))?
    } else {
        calibrate()?
    };

    Ok(*CYCLE_PER_US.get_or_init(|| v))
}

fn calibrate() -> Result<Cycles> {
    let warmup = Instant::now();
    let start_cyc = rdtscp();
    while warmup.elapsed() < Duration::from_millis(1) {
        std::hint::spin_loop();
    }
    let wall = Instant::now();
    let t0 = Instant::now();
    let c0 = rdtscp();
    // Busy-spin rather than sleep: sleeping risks the scheduler parking us
    // long enough that the cycle/wall ratio is skewed by C-state transitions.
    while t0.elapsed() < Duration::from_millis(10) {
        std::hint::spin_loop();
    }
    let c1 = rdtscp();
    let elapsed = wall.elapsed().as_micros() as u64;
    if elapsed == 0 || c1 <= c0 {
        log::warn!("cycle counter calibration degenerate, falling back to 1000 cyc/us");
        return Ok(1000);
    }
    let _ = start_cyc;
    Ok((c1 - c0) / elapsed.max(1))
}

#[inline(always)]
pub fn cycle_per_ms() -> Result<Cycles> {
    Ok(cycle_per_us()? * 1_000)
}

#[inline(always)]
pub fn cycle_per_s() -> Result<Cycles> {
    Ok(cycle_per_us()? * 1_000_000)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rdtsc_is_monotonic_ish() {
        let a = rdtsc();
        let b = rdtsc();
        assert!(b >= a);
    }

    #[test]
    fn calibration_is_sane() {
        let cpu = cycle_per_us().expect("calibration should succeed in CI");
        // Even a slow emulator should clear a few hundred cycles per us.
        assert!(cpu > 0);
    }
}
