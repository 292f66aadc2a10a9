//! Scheduler-cooperative, weighted-fair locks.
//!
//! Three lock families, each trading a different amount of queue-ordering
//! strictness for weighted fairness across contending threads:
//!
//! - [`uscl`]: a mutex with in-slice owner reentry, fair across a rotating
//!   time slice via a CAS-linked MCS queue (u-scl).
//! - [`rwscl`]: a reader/writer lock that alternates slices between a reader
//!   class and a writer class, each weighted by its members' nice values
//!   (RW-SCL).
//! - [`kscl`]: a ticket-lock-backed mutex for contexts that already supply
//!   cooperative rescheduling, banning a thread from re-acquiring for a
//!   duration proportional to its last critical section (k-scl).
//!
//! All three share the platform layer in [`platform`]: cycle-counter reads
//! and calibration, nice-to-weight lookup, futex-based parking, and
//! NUMA-topology discovery.

pub mod error;
pub mod kscl;
pub mod platform;
pub mod rwscl;
pub mod uscl;

pub use error::{Result, ScheduledLockError};
pub use kscl::{BanPolicy, KernelStyleMutex, KernelStyleMutexGuard};
pub use rwscl::{FairRwLock, FairRwLockBuilder, FairRwLockReadGuard, FairRwLockWriteGuard, WeightPolicy};
pub use uscl::{FairMutex, FairMutexBuilder, FairMutexGuard};

#[cfg(test)]
mod test {
    use super::*;
    use rand::Rng;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn fair_mutex_single_threaded() {
        let lock = FairMutex::new(()).unwrap();
        let locked = lock.lock().unwrap();
        drop(locked);
        let _again = lock.lock().unwrap();
    }

    #[test]
    fn fair_rwlock_multi_threaded() {
        const READ_NUM_THREADS: usize = 6;
        const WRITE_NUM_THREADS: usize = 2;
        const WRITE_MARK: i64 = 1 << 31;

        let lock = Arc::new(FairRwLock::new(0i64).unwrap());
        let r_ths: Vec<_> = (0..READ_NUM_THREADS)
            .map(|_| {
                let lock = lock.clone();
                thread::spawn(move || {
                    let mut rng = rand::thread_rng();
                    for _ in 0..50 {
                        let locked = lock.read().unwrap();
                        assert_eq!(*locked & WRITE_MARK, 0);
                        thread::sleep(Duration::from_micros(rng.gen_range(100..300)));
                        drop(locked);
                        thread::yield_now();
                    }
                })
            })
            .collect();

        let w_ths: Vec<_> = (0..WRITE_NUM_THREADS)
            .map(|_| {
                let lock = lock.clone();
                thread::spawn(move || {
                    let mut rng = rand::thread_rng();
                    for _ in 0..50 {
                        let mut locked = lock.write().unwrap();
                        assert_eq!(*locked & WRITE_MARK, 0);
                        *locked |= WRITE_MARK;
                        thread::sleep(Duration::from_micros(rng.gen_range(100..300)));
                        *locked &= !WRITE_MARK;
                        drop(locked);
                        thread::yield_now();
                    }
                })
            })
            .collect();

        for th in r_ths {
            th.join().unwrap();
        }
        for th in w_ths {
            th.join().unwrap();
        }
    }

    #[test]
    fn kernel_style_mutex_multi_threaded() {
        let lock = Arc::new(KernelStyleMutex::new(0u64));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lock = lock.clone();
                thread::spawn(move || {
                    for _ in 0..200 {
                        let mut g = lock.lock().unwrap();
                        *g += 1;
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.lock().unwrap(), 800);
    }
}
