//! Single-address parking primitives and bounded spin-then-yield.
//!
//! Only u-scl needs `futex_wait`/`futex_wake`; RW-SCL and k-scl only need
//! `sleep_for`/`yield_thread`/`spin_then_yield`.

use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

// SYS_futex addresses a raw 32-bit word; AtomicI32 must match that layout
// exactly for the `addr as *mut i32` casts below to be sound.
static_assertions::assert_eq_size!(AtomicI32, i32);

/// Number of bounded-spin iterations before falling back to `sched_yield`
/// (`SPIN_LIMIT = 20`).
pub const SPIN_LIMIT: u32 = 20;

/// Spin on `cond` up to `limit` iterations, then fall back to
/// `std::thread::yield_now()` in a tight loop until `cond` is false.
///
/// `cond` is re-evaluated on every iteration; it should have side effects
/// limited to refreshing whatever state the caller is polling (mirrors the
/// `spin_then_yield(limit, expr)` macro in `u-scl/common.h`).
#[inline]
pub fn spin_then_yield(limit: u32, mut cond: impl FnMut() -> bool) {
    let mut spins = 0;
    while cond() {
        spins += 1;
        if spins >= limit {
            std::thread::yield_now();
        } else {
            std::hint::spin_loop();
        }
    }
}

/// Coarse sleep. Callers must recompute elapsed time after waking, since no
/// guarantee is made about exact wake time (spurious early/late wakes).
#[inline]
pub fn sleep_for(dur: Duration) {
    std::thread::sleep(dur);
}

#[inline]
pub fn yield_thread() {
    std::thread::yield_now();
}

/// Blocks until `*addr != expected`, or until `timeout` elapses (Linux only;
/// every other target degrades to a bounded spin-then-yield poll since there
/// is no portable single-address futex).
#[cfg(target_os = "linux")]
pub fn futex_wait(addr: &AtomicI32, expected: i32, timeout: Option<Duration>) {
    let ts = timeout.map(|d| libc::timespec {
        tv_sec: d.as_secs() as libc::time_t,
        tv_nsec: d.subsec_nanos() as i64,
    });
    let ts_ptr = ts
        .as_ref()
        .map(|t| t as *const libc::timespec)
        .unwrap_or(std::ptr::null());
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            addr as *const AtomicI32 as *mut i32,
            libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
            expected,
            ts_ptr,
        );
    }
}

#[cfg(target_os = "linux")]
pub fn futex_wake(addr: &AtomicI32, n: i32) {
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            addr as *const AtomicI32 as *mut i32,
            libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
            n,
        );
    }
}

#[cfg(not(target_os = "linux"))]
pub fn futex_wait(addr: &AtomicI32, expected: i32, timeout: Option<Duration>) {
    use std::time::Instant;
    let deadline = timeout.map(|d| Instant::now() + d);
    while addr.load(Ordering::Acquire) == expected {
        if let Some(dl) = deadline {
            if Instant::now() >= dl {
                return;
            }
        }
        std::thread::yield_now();
    }
}

#[cfg(not(target_os = "linux"))]
pub fn futex_wake(_addr: &AtomicI32, _n: i32) {
    // No parked waiters to target without a real futex; the spin-poll above
    // will observe the state change on its own.
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicI32;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn spin_then_yield_terminates() {
        let mut n = 0;
        spin_then_yield(SPIN_LIMIT, || {
            n += 1;
            n < 50
        });
        assert_eq!(n, 50);
    }

    #[test]
    fn futex_wait_wakes_on_store_and_wake() {
        let word = Arc::new(AtomicI32::new(0));
        let w2 = word.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            w2.store(1, Ordering::Release);
            futex_wake(&w2, 1);
        });
        let start = Instant::now();
        futex_wait(&word, 0, Some(Duration::from_secs(2)));
        handle.join().unwrap();
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
