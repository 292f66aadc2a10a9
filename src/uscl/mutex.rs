//! u-scl: a weighted-fair mutex with in-slice owner reentry.

use super::qnode::{self, QNode};
use super::thread_info::{self, ThreadInfo};
use crate::error::Result;
use crate::platform::{self, futex, time};
use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, AtomicU64, Ordering};
use std::time::Duration;

const SLEEP_GRANULARITY_US: u64 = 8;

/// Configures the slice length and ban ceiling for a [`FairMutex`], in place
/// of the C source's compile-time-only `FAIRLOCK_GRANULARITY`/ban-ceiling.
pub struct FairMutexBuilder {
    granularity: Option<time::Cycles>,
    ban_ceiling: Option<time::Cycles>,
    spin_limit: u32,
}

impl Default for FairMutexBuilder {
    fn default() -> Self {
        FairMutexBuilder {
            granularity: None,
            ban_ceiling: None,
            spin_limit: platform::SPIN_LIMIT,
        }
    }
}

impl FairMutexBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides `FAIRLOCK_GRANULARITY` (default: 2ms worth of cycles).
    pub fn granularity(mut self, cycles: time::Cycles) -> Self {
        self.granularity = Some(cycles);
        self
    }

    /// Overrides the ban ceiling: the maximum `banned_until - now` a release
    /// may install (design note; default ~1s worth of cycles).
    pub fn ban_ceiling(mut self, cycles: time::Cycles) -> Self {
        self.ban_ceiling = Some(cycles);
        self
    }

    /// Overrides `SPIN_LIMIT` (default 20).
    pub fn spin_limit(mut self, limit: u32) -> Self {
        self.spin_limit = limit;
        self
    }

    pub fn build<T>(self, data: T) -> Result<FairMutex<T>> {
        let granularity = match self.granularity {
            Some(g) => g,
            None => platform::fairlock_granularity_cycles()?,
        };
        let ban_ceiling = match self.ban_ceiling {
            Some(c) => c,
            None => time::cycle_per_s()?,
        };
        Ok(FairMutex {
            inner: Inner {
                qtail: AtomicPtr::new(ptr::null_mut()),
                qnext: AtomicPtr::new(ptr::null_mut()),
                slice: CachePadded::new(AtomicU64::new(0)),
                slice_valid: CachePadded::new(AtomicI32::new(0)),
                total_weight: CachePadded::new(AtomicU64::new(0)),
                destroyed: AtomicBool::new(false),
                granularity,
                ban_ceiling,
                spin_limit: self.spin_limit,
            },
            data: UnsafeCell::new(data),
        })
    }
}

struct Inner {
    qtail: AtomicPtr<QNode>,
    qnext: AtomicPtr<QNode>,
    slice: CachePadded<AtomicU64>,
    slice_valid: CachePadded<AtomicI32>,
    total_weight: CachePadded<AtomicU64>,
    destroyed: AtomicBool,
    granularity: time::Cycles,
    ban_ceiling: time::Cycles,
    spin_limit: u32,
}

/// A mutex that grants holding time in proportion to each contending
/// thread's scheduler weight, rather than strictly in arrival order.
///
/// The current slice holder may reacquire the lock within its own slice
/// without joining the wait queue (`reentry`); all other acquisitions
/// proceed in MCS queue order, weighted-fair across slices via a per-thread
/// ban that grows in proportion to critical-section time already spent.
pub struct FairMutex<T> {
    inner: Inner,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for FairMutex<T> {}
unsafe impl<T: Send> Sync for FairMutex<T> {}

impl<T> FairMutex<T> {
    /// Creates a new fair mutex with default granularity/ban-ceiling
    /// (`mutex_init`).
    pub fn new(data: T) -> Result<Self> {
        FairMutexBuilder::new().build(data)
    }

    pub fn builder() -> FairMutexBuilder {
        FairMutexBuilder::new()
    }

    #[inline]
    fn lock_id(&self) -> thread_info::LockId {
        &self.inner as *const Inner as usize
    }

    #[inline]
    fn sentinel(&self) -> *mut QNode {
        // A stable, per-instance address that is never dereferenced as a
        // real QNode, only ever compared for pointer identity. Occupies
        // the queue-tail slot that represents "a holder exists with no real
        // successor node", per the design note above.
        &self.inner.qnext as *const AtomicPtr<QNode> as *mut QNode
    }

    /// Registers this thread's weight against the lock ahead of its first
    /// acquire (`mutex_thread_init`). `weight = None` derives the weight
    /// from the thread's current nice value.
    pub fn register_thread(&self, weight: Option<u32>) -> Result<()> {
        let now = time::rdtscp();
        let w = thread_info::register(self.lock_id(), now, weight.unwrap_or(0));
        self.inner.total_weight.fetch_add(w as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Blocks until this thread holds the lock (`mutex_acquire`), then
    /// returns a guard that releases it on drop (`mutex_release`).
    pub fn lock(&self) -> Result<FairMutexGuard<'_, T>> {
        #[cfg(debug_assertions)]
        if self.inner.destroyed.load(Ordering::Relaxed) {
            log::error!("u-scl: acquire after destroy is a programmer error");
        }
        debug_assert!(
            !self.inner.destroyed.load(Ordering::Relaxed),
            "acquire after destroy is a programmer error"
        );
        self.acquire()?;
        Ok(FairMutexGuard {
            lock: self,
            data: unsafe { &mut *self.data.get() },
        })
    }

    /// Blocks further acquisitions (`mutex_destroy`). Does not affect a
    /// currently held guard.
    pub fn destroy(&self) {
        self.inner.destroyed.store(true, Ordering::Release);
    }

    fn acquire(&self) -> Result<()> {
        let lock_id = self.lock_id();
        let now0 = time::rdtscp();
        let (mut info, delta) = thread_info::get_or_init(lock_id, now0, 0);
        if delta != 0 {
            self.inner.total_weight.fetch_add(delta as u64, Ordering::Relaxed);
        }

        if self.try_reenter(&mut info)? {
            thread_info::set(lock_id, info);
            return Ok(());
        }

        self.serve_ban(&mut info)?;
        self.enqueue_and_wait(&mut info)?;

        thread_info::set(lock_id, info);
        Ok(())
    }

    /// Step A: in-slice reentry fast path.
    fn try_reenter(&self, info: &mut ThreadInfo) -> Result<bool> {
        if self.inner.slice_valid.load(Ordering::Acquire) == 0 {
            return Ok(false);
        }
        let curr_slice = self.inner.slice.load(Ordering::Acquire);
        let now = time::rdtscp();
        if info.slice != curr_slice || now >= curr_slice {
            return Ok(false);
        }

        let mut succ = self.inner.qnext.load(Ordering::Acquire);
        if succ.is_null() {
            if self
                .inner
                .qtail
                .compare_exchange(ptr::null_mut(), self.sentinel(), Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                info.start_ticks = now;
                log::trace!("u-scl reentry: empty queue fast path");
                return Ok(true);
            }
            let mut expired = false;
            futex::spin_then_yield(self.inner.spin_limit, || {
                if time::rdtscp() >= curr_slice {
                    expired = true;
                    return false;
                }
                succ = self.inner.qnext.load(Ordering::Acquire);
                succ.is_null()
            });
            if expired {
                return Ok(false);
            }
        }

        if succ.is_null() {
            return Ok(false);
        }
        let succ_ref = unsafe { &*succ };
        let state = succ_ref.load_state(Ordering::Acquire);
        if state < qnode::RUNNABLE
            || succ_ref
                .state
                .compare_exchange(qnode::RUNNABLE, qnode::NEXT, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        {
            info.start_ticks = time::rdtscp();
            log::trace!("u-scl reentry: displaced not-yet-runnable successor");
            return Ok(true);
        }
        Ok(false)
    }

    /// Step B: serve an outstanding ban before (re)joining the queue.
    fn serve_ban(&self, info: &mut ThreadInfo) -> Result<()> {
        if !info.banned {
            return Ok(());
        }
        if time::rdtscp() >= info.banned_until {
            return Ok(());
        }
        let cyc_per_us = time::cycle_per_us()?;
        let sleep_chunk_cycles = cyc_per_us * SLEEP_GRANULARITY_US;
        log::debug!("u-scl: serving ban");
        loop {
            let now = time::rdtscp();
            if now >= info.banned_until {
                break;
            }
            if info.banned_until - now <= sleep_chunk_cycles {
                break;
            }
            futex::sleep_for(Duration::from_micros(SLEEP_GRANULARITY_US));
        }
        futex::spin_then_yield(self.inner.spin_limit, || time::rdtscp() < info.banned_until);
        Ok(())
    }

    /// Steps C–F: enqueue, wait out the current slice, become RUNNING, and
    /// install the next slice.
    fn enqueue_and_wait(&self, info: &mut ThreadInfo) -> Result<()> {
        let n = QNode::new();
        let n_ptr = &n as *const QNode as *mut QNode;

        loop {
            let prev = self.inner.qtail.load(Ordering::Acquire);
            if self
                .inner
                .qtail
                .compare_exchange(prev, n_ptr, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }
            if prev.is_null() {
                n.state.store(qnode::RUNNABLE, Ordering::Release);
                self.inner.qnext.store(n_ptr, Ordering::Release);
            } else if prev == self.sentinel() {
                n.state.store(qnode::NEXT, Ordering::Release);
                self.inner.qnext.store(n_ptr, Ordering::Release);
            } else {
                let prev_ref = unsafe { &*prev };
                prev_ref.next.store(n_ptr, Ordering::Release);
                loop {
                    futex::futex_wait(&n.state, qnode::INIT, None);
                    if n.load_state(Ordering::Acquire) != qnode::INIT {
                        break;
                    }
                }
            }
            break;
        }

        // Step D: wait for the current slice to expire.
        loop {
            if self.inner.slice_valid.load(Ordering::Acquire) == 0 {
                break;
            }
            let curr_slice = self.inner.slice.load(Ordering::Acquire);
            let now = time::rdtscp();
            let sleep_gran = platform::sleep_granularity_cycles()?;
            if curr_slice > now + sleep_gran {
                let remaining_us = (curr_slice - now) / time::cycle_per_us()?.max(1);
                futex::futex_wait(&self.inner.slice_valid, 1, Some(Duration::from_micros(remaining_us)));
                continue;
            }
            break;
        }
        if self.inner.slice_valid.load(Ordering::Acquire) != 0 {
            let mut still_valid = true;
            futex::spin_then_yield(self.inner.spin_limit, || {
                still_valid = self.inner.slice_valid.load(Ordering::Acquire) != 0;
                still_valid && time::rdtscp() < self.inner.slice.load(Ordering::Acquire)
            });
            if still_valid {
                self.inner.slice_valid.store(0, Ordering::Release);
            }
        }

        // Step E: become RUNNING.
        futex::spin_then_yield(self.inner.spin_limit, || {
            n.load_state(Ordering::Acquire) != qnode::RUNNABLE
                || n
                    .state
                    .compare_exchange(qnode::RUNNABLE, qnode::RUNNING, Ordering::AcqRel, Ordering::Relaxed)
                    .is_err()
        });

        // Step F: publish our successor, install the slice, wake it.
        let mut succ = n.next.load(Ordering::Acquire);
        if succ.is_null() {
            self.inner.qnext.store(ptr::null_mut(), Ordering::Release);
            if self
                .inner
                .qtail
                .compare_exchange(n_ptr, self.sentinel(), Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                futex::spin_then_yield(self.inner.spin_limit, || {
                    succ = n.next.load(Ordering::Acquire);
                    succ.is_null()
                });
                self.inner.qnext.store(succ, Ordering::Release);
            }
        } else {
            self.inner.qnext.store(succ, Ordering::Release);
        }

        let now = time::rdtscp();
        info.start_ticks = now;
        info.slice = now + self.inner.granularity;
        self.inner.slice.store(info.slice, Ordering::Release);
        self.inner.slice_valid.store(1, Ordering::Release);

        if !succ.is_null() {
            let succ_ref = unsafe { &*succ };
            succ_ref.state.store(qnode::NEXT, Ordering::Release);
            futex::futex_wake(&succ_ref.state, 1);
        }

        Ok(())
    }

    fn release(&self) {
        let lock_id = self.lock_id();
        let now0 = time::rdtscp();
        let (mut info, _delta) = thread_info::get_or_init(lock_id, now0, 0);

        let mut succ = self.inner.qnext.load(Ordering::Acquire);
        if succ.is_null() {
            if self
                .inner
                .qtail
                .compare_exchange(self.sentinel(), ptr::null_mut(), Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                futex::spin_then_yield(self.inner.spin_limit, || {
                    succ = self.inner.qnext.load(Ordering::Acquire);
                    succ.is_null()
                });
            }
        }
        if !succ.is_null() {
            let succ_ref = unsafe { &*succ };
            succ_ref.state.store(qnode::RUNNABLE, Ordering::Release);
        }

        let now = time::rdtscp();
        let cs = now.saturating_sub(info.start_ticks);
        let total_weight = self.inner.total_weight.load(Ordering::Relaxed).max(1);
        let weight = info.weight.max(1) as u64;
        let raw_delta = cs.saturating_mul(total_weight) / weight;
        let candidate = info.banned_until.saturating_add(raw_delta);
        let ceiling = now.saturating_add(self.inner.ban_ceiling);
        info.banned_until = candidate.min(ceiling);
        info.banned = now < info.banned_until;

        if info.banned {
            log::debug!(
                "u-scl: thread banned for {} cycles (weight {}/{})",
                info.banned_until - now,
                weight,
                total_weight
            );
            if self
                .inner
                .slice_valid
                .compare_exchange(1, 0, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                futex::futex_wake(&self.inner.slice_valid, 1);
            }
        }

        thread_info::set(lock_id, info);
    }
}

/// RAII guard returned by [`FairMutex::lock`]. Releases the lock on drop.
pub struct FairMutexGuard<'a, T> {
    lock: &'a FairMutex<T>,
    data: &'a mut T,
}

impl<'a, T> Deref for FairMutexGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.data
    }
}

impl<'a, T> DerefMut for FairMutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.data
    }
}

impl<'a, T> Drop for FairMutexGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn single_thread_mutual_exclusion_and_reentry() {
        let lock = Arc::new(FairMutex::new(0u64).unwrap());
        for _ in 0..1000 {
            let mut g = lock.lock().unwrap();
            *g += 1;
        }
        assert_eq!(*lock.lock().unwrap(), 1000);
    }

    #[test]
    fn two_threads_never_observe_concurrent_holders() {
        let lock = Arc::new(FairMutex::new(0i64).unwrap());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let lock = lock.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..2000 {
                    let mut g = lock.lock().unwrap();
                    let before = *g;
                    *g += 1;
                    assert_eq!(*g, before + 1);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.lock().unwrap(), 8000);
    }

    #[test]
    fn ban_is_monotonic_across_releases() {
        let lock = FairMutex::new(()).unwrap();
        let lock_id = lock.lock_id();
        let mut last = 0u64;
        for _ in 0..50 {
            let g = lock.lock().unwrap();
            drop(g);
            let (info, _) = thread_info::get_or_init(lock_id, time::rdtscp(), 0);
            assert!(info.banned_until >= last);
            last = info.banned_until;
        }
    }
}
