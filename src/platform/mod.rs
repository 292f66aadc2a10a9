//! Platform primitives required by all three lock variants.
//!
//! - [`time`]: cycle-counter reads and cycle/wall-clock calibration.
//! - [`weight`]: nice-value to scheduler-weight lookup.
//! - [`futex`]: parking primitives and bounded spin-then-yield.
//! - [`topology`]: core-id and NUMA-node discovery.

pub mod futex;
pub mod time;
pub mod topology;
pub mod weight;

use crate::error::Result;
use time::Cycles;

/// Bounded-spin-then-yield iteration count, shared by all three lock
/// variants.
pub use futex::SPIN_LIMIT;

/// `FAIRLOCK_GRANULARITY = 2ms`, u-scl's slice length.
pub fn fairlock_granularity_cycles() -> Result<Cycles> {
    Ok(time::cycle_per_ms()? * 2)
}

/// `SLEEP_GRANULARITY = 8µs`, the sleep chunk size used while serving a ban
/// or waiting out a slice.
pub fn sleep_granularity_cycles() -> Result<Cycles> {
    Ok(time::cycle_per_us()? * 8)
}

/// `TOTAL_SLICE = 20ms`, RW-SCL's slice length.
pub fn total_slice_rw_cycles() -> Result<Cycles> {
    Ok(time::cycle_per_ms()? * 20)
}

/// `INACTIVE_THRESHOLD`, nominally ~1s at 2.4GHz; k-scl reclaims a waiter
/// record once its last critical section ended more than this long ago.
pub fn inactive_threshold_cycles() -> Result<Cycles> {
    Ok(time::cycle_per_s()?)
}

/// Reads the cycle counter and the current core/NUMA-node identifiers in one
/// call, as the fenced variant so the sample is ordered against surrounding
/// memory operations.
pub fn now_with_core() -> (Cycles, usize) {
    // Order matters: sample the core id, then the fenced timestamp, so a
    // migration between the two can only make the (core, time) pair stale
    // rather than internally inconsistent with `now()`'s own ordering.
    let core = topology::current_core();
    (time::rdtscp(), core)
}
