//! RW-SCL: a weighted-fair reader/writer lock with alternating time slices
//! and per-NUMA-node reader counters.

use crate::error::Result;
use crate::platform::{self, futex, time, topology};
use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

const WA_FLAG: u32 = 1;
const RC_INC: u32 = 2;

/// How a class's (readers' or writers') shared weight is established.
///
/// The original C is first-wins: whichever thread registers first for its
/// class sets `reader_weight`/`writer_weight` for every thread in that
/// class, silently ignoring later threads with a different priority (design
/// note). Rather than silently keep or silently fix that
/// restriction, it's exposed here as a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightPolicy {
    /// First registrant's weight wins for the whole class (original
    /// behavior; assumes homogeneous per-class priorities).
    FirstWins,
    /// Every registrant's weight is summed into the class weight.
    Summed,
}

pub struct FairRwLockBuilder {
    total_slice: Option<time::Cycles>,
    weight_policy: WeightPolicy,
}

impl Default for FairRwLockBuilder {
    fn default() -> Self {
        FairRwLockBuilder {
            total_slice: None,
            weight_policy: WeightPolicy::FirstWins,
        }
    }
}

impl FairRwLockBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides `TOTAL_SLICE` (default 20ms worth of cycles).
    pub fn total_slice(mut self, cycles: time::Cycles) -> Self {
        self.total_slice = Some(cycles);
        self
    }

    pub fn weight_policy(mut self, policy: WeightPolicy) -> Self {
        self.weight_policy = policy;
        self
    }

    pub fn build<T>(self, data: T) -> Result<FairRwLock<T>> {
        let total_slice = match self.total_slice {
            Some(s) => s,
            None => platform::total_slice_rw_cycles()?,
        };
        let node_count = topology::topology().node_count().max(1);
        let counters = (0..node_count).map(|_| CachePadded::new(AtomicU32::new(0))).collect();
        let now = time::rdtscp();
        Ok(FairRwLock {
            inner: Inner {
                slice: CachePadded::new(AtomicU64::new(now)),
                read_slice: CachePadded::new(AtomicU64::new(now)),
                write_slice: CachePadded::new(AtomicU64::new(0)),
                reader_weight: AtomicU32::new(0),
                writer_weight: AtomicU32::new(0),
                total_weight: AtomicU32::new(0),
                counters,
                total_slice,
                weight_policy: self.weight_policy,
                destroyed: AtomicBool::new(false),
            },
            data: UnsafeCell::new(data),
        })
    }
}

struct Inner {
    slice: CachePadded<AtomicU64>,
    read_slice: CachePadded<AtomicU64>,
    write_slice: CachePadded<AtomicU64>,
    reader_weight: AtomicU32,
    writer_weight: AtomicU32,
    /// Floored at 1 wherever used as a divisor instead of being seeded with
    /// a sentinel value (design note): seeding the accumulator
    /// itself would permanently skew every real ratio, where flooring only
    /// matters in the brief window before any thread has registered.
    total_weight: AtomicU32,
    counters: Vec<CachePadded<AtomicU32>>,
    total_slice: time::Cycles,
    weight_policy: WeightPolicy,
    destroyed: AtomicBool,
}

/// A reader/writer lock that alternates ownership between a reader epoch
/// and a writer epoch, each sized in proportion to its class's aggregate
/// scheduler weight, with per-NUMA-node reader counters to avoid
/// cross-socket cache-line traffic on the read-acquire hot path.
pub struct FairRwLock<T> {
    inner: Inner,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for FairRwLock<T> {}
unsafe impl<T: Send + Sync> Sync for FairRwLock<T> {}

impl<T> FairRwLock<T> {
    pub fn new(data: T) -> Result<Self> {
        FairRwLockBuilder::new().build(data)
    }

    pub fn builder() -> FairRwLockBuilder {
        FairRwLockBuilder::new()
    }

    fn add_total_weight(&self, w: u32) {
        self.inner.total_weight.fetch_add(w, Ordering::Relaxed);
    }

    fn register_writer_weight(&self) {
        if self.inner.writer_weight.load(Ordering::Relaxed) != 0 {
            return;
        }
        let w = platform::weight::weight_for_current_thread();
        match self.inner.weight_policy {
            WeightPolicy::FirstWins => {
                if self
                    .inner
                    .writer_weight
                    .compare_exchange(0, w, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    self.add_total_weight(w);
                }
            }
            WeightPolicy::Summed => {
                self.inner.writer_weight.fetch_add(w, Ordering::Relaxed);
                self.add_total_weight(w);
            }
        }
    }

    fn register_reader_weight(&self) {
        if self.inner.reader_weight.load(Ordering::Relaxed) != 0 {
            return;
        }
        let w = platform::weight::weight_for_current_thread();
        match self.inner.weight_policy {
            WeightPolicy::FirstWins => {
                if self
                    .inner
                    .reader_weight
                    .compare_exchange(0, w, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    self.add_total_weight(w);
                }
            }
            WeightPolicy::Summed => {
                self.inner.reader_weight.fetch_add(w, Ordering::Relaxed);
                self.add_total_weight(w);
            }
        }
    }

    fn read_slice_size(&self) -> time::Cycles {
        let total = self.inner.total_weight.load(Ordering::Relaxed).max(1) as u64;
        let rw = self.inner.reader_weight.load(Ordering::Relaxed) as u64;
        (self.inner.total_slice * rw / total).max(1)
    }

    fn write_slice_size(&self) -> time::Cycles {
        let total = self.inner.total_weight.load(Ordering::Relaxed).max(1) as u64;
        let ww = self.inner.writer_weight.load(Ordering::Relaxed) as u64;
        (self.inner.total_slice * ww / total).max(1)
    }

    fn reader_node(&self) -> usize {
        topology::current_node().min(self.inner.counters.len() - 1)
    }

    /// Acquires the lock exclusively, blocking until the writer slice is
    /// owned and every NUMA counter has drained (`rwlock_writer_lock`).
    pub fn write(&self) -> Result<FairRwLockWriteGuard<'_, T>> {
        #[cfg(debug_assertions)]
        if self.inner.destroyed.load(Ordering::Relaxed) {
            log::error!("RW-SCL: writer acquire after destroy is a programmer error");
        }
        debug_assert!(!self.inner.destroyed.load(Ordering::Relaxed));
        self.register_writer_weight();
        loop {
            let slice = self.inner.slice.load(Ordering::Acquire);
            let now = time::rdtscp();
            if self.inner.write_slice.load(Ordering::Acquire) == slice && now < slice {
                for counter in &self.inner.counters {
                    while counter
                        .compare_exchange(0, WA_FLAG, Ordering::AcqRel, Ordering::Relaxed)
                        .is_err()
                    {
                        futex::sleep_for(Duration::from_micros(100));
                    }
                }
                return Ok(FairRwLockWriteGuard {
                    lock: self,
                    data: unsafe { &mut *self.data.get() },
                });
            }
            self.wait_out_slice(slice);
            let new_slice = time::rdtscp() + self.write_slice_size();
            if self
                .inner
                .slice
                .compare_exchange(slice, new_slice, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                self.inner.write_slice.store(new_slice, Ordering::Release);
            }
        }
    }

    /// Acquires the lock for shared read access, blocking until the reader
    /// slice is owned on this core's NUMA node (`rwlock_reader_lock`).
    pub fn read(&self) -> Result<FairRwLockReadGuard<'_, T>> {
        #[cfg(debug_assertions)]
        if self.inner.destroyed.load(Ordering::Relaxed) {
            log::error!("RW-SCL: reader acquire after destroy is a programmer error");
        }
        debug_assert!(!self.inner.destroyed.load(Ordering::Relaxed));
        self.register_reader_weight();
        let node = self.reader_node();
        loop {
            let slice = self.inner.slice.load(Ordering::Acquire);
            let now = time::rdtscp();
            if self.inner.read_slice.load(Ordering::Acquire) == slice && now < slice {
                self.inner.counters[node].fetch_add(RC_INC, Ordering::AcqRel);
                while self.inner.counters[node].load(Ordering::Acquire) & WA_FLAG == WA_FLAG {
                    futex::sleep_for(Duration::from_micros(100));
                }
                return Ok(FairRwLockReadGuard { lock: self, node, data: unsafe { &*self.data.get() } });
            }
            self.wait_out_slice(slice);
            let new_slice = time::rdtscp() + self.read_slice_size();
            if self
                .inner
                .slice
                .compare_exchange(slice, new_slice, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                self.inner.read_slice.store(new_slice, Ordering::Release);
            }
        }
    }

    /// Non-blocking write acquisition: succeeds only if the writer slice is
    /// already current and every NUMA counter is immediately free.
    pub fn try_write(&self) -> Option<FairRwLockWriteGuard<'_, T>> {
        self.register_writer_weight();
        let slice = self.inner.slice.load(Ordering::Acquire);
        let now = time::rdtscp();
        if self.inner.write_slice.load(Ordering::Acquire) != slice || now >= slice {
            return None;
        }
        let mut acquired = Vec::with_capacity(self.inner.counters.len());
        for counter in &self.inner.counters {
            if counter.compare_exchange(0, WA_FLAG, Ordering::AcqRel, Ordering::Relaxed).is_ok() {
                acquired.push(counter);
            } else {
                for c in acquired {
                    c.fetch_sub(WA_FLAG, Ordering::AcqRel);
                }
                return None;
            }
        }
        Some(FairRwLockWriteGuard {
            lock: self,
            data: unsafe { &mut *self.data.get() },
        })
    }

    /// Non-blocking read acquisition: succeeds only if the reader slice is
    /// already current for this core's node and no writer is active there.
    pub fn try_read(&self) -> Option<FairRwLockReadGuard<'_, T>> {
        self.register_reader_weight();
        let node = self.reader_node();
        let slice = self.inner.slice.load(Ordering::Acquire);
        let now = time::rdtscp();
        if self.inner.read_slice.load(Ordering::Acquire) != slice || now >= slice {
            return None;
        }
        let prev = self.inner.counters[node].fetch_add(RC_INC, Ordering::AcqRel);
        if prev & WA_FLAG == WA_FLAG {
            self.inner.counters[node].fetch_sub(RC_INC, Ordering::AcqRel);
            return None;
        }
        Some(FairRwLockReadGuard { lock: self, node, data: unsafe { &*self.data.get() } })
    }

    fn wait_out_slice(&self, observed_slice: time::Cycles) {
        loop {
            let now = time::rdtscp();
            if now >= observed_slice {
                return;
            }
            let diff = observed_slice - now;
            let cyc_per_us = time::cycle_per_us().unwrap_or(1000);
            let remaining_us = diff / cyc_per_us.max(1);
            if remaining_us > 100 {
                futex::sleep_for(Duration::from_micros(100));
            } else {
                std::hint::spin_loop();
            }
        }
    }

    fn writer_unlock(&self) {
        let curr_slice = self.inner.slice.load(Ordering::Acquire);
        let now = time::rdtscp();
        if now > curr_slice {
            let new_slice = now + self.read_slice_size();
            if self
                .inner
                .slice
                .compare_exchange(curr_slice, new_slice, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                self.inner.read_slice.store(new_slice, Ordering::Release);
            }
        }
        for counter in &self.inner.counters {
            counter.fetch_sub(WA_FLAG, Ordering::AcqRel);
        }
    }

    fn reader_unlock(&self, node: usize) {
        let curr_slice = self.inner.slice.load(Ordering::Acquire);
        let now = time::rdtscp();
        if now > curr_slice {
            let new_slice = now + self.write_slice_size();
            if self
                .inner
                .slice
                .compare_exchange(curr_slice, new_slice, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                self.inner.write_slice.store(new_slice, Ordering::Release);
            }
        }
        self.inner.counters[node].fetch_sub(RC_INC, Ordering::AcqRel);
    }

    /// Blocks further acquisitions (`rwlock_destroy`). Spins until every
    /// NUMA counter is free before marking it, so no acquisition in
    /// progress is left stranded mid-counter-update.
    pub fn destroy(&self) {
        for counter in &self.inner.counters {
            while counter
                .compare_exchange(0, RC_INC + WA_FLAG, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                futex::sleep_for(Duration::from_micros(100));
            }
        }
        self.inner.destroyed.store(true, Ordering::Release);
    }
}

pub struct FairRwLockReadGuard<'a, T> {
    lock: &'a FairRwLock<T>,
    node: usize,
    data: &'a T,
}

impl<'a, T> Deref for FairRwLockReadGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.data
    }
}

impl<'a, T> Drop for FairRwLockReadGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.reader_unlock(self.node);
    }
}

pub struct FairRwLockWriteGuard<'a, T> {
    lock: &'a FairRwLock<T>,
    data: &'a mut T,
}

impl<'a, T> Deref for FairRwLockWriteGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.data
    }
}

impl<'a, T> DerefMut for FairRwLockWriteGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.data
    }
}

impl<'a, T> Drop for FairRwLockWriteGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.writer_unlock();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn single_threaded_exclusion() {
        let lock = FairRwLock::new(()).unwrap();
        let w = lock.write().unwrap();
        assert!(lock.try_read().is_none());
        assert!(lock.try_write().is_none());
        drop(w);

        let _r1 = lock.read().unwrap();
        let _r2 = lock.read().unwrap();
        assert!(lock.try_write().is_none());
    }

    #[test]
    fn readers_overlap_writers_do_not() {
        const READ_THREADS: usize = 6;
        const WRITE_THREADS: usize = 2;
        const WRITER_BIT: i64 = 1 << 40;

        let lock = Arc::new(FairRwLock::new(0i64).unwrap());
        let mut handles = Vec::new();

        for _ in 0..READ_THREADS {
            let lock = lock.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..50 {
                    let g = lock.read().unwrap();
                    assert_eq!(*g & WRITER_BIT, 0);
                    thread::yield_now();
                }
            }));
        }
        for _ in 0..WRITE_THREADS {
            let lock = lock.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..50 {
                    let mut g = lock.write().unwrap();
                    assert_eq!(*g & WRITER_BIT, 0);
                    *g |= WRITER_BIT;
                    thread::yield_now();
                    *g &= !WRITER_BIT;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn destroy_blocks_future_acquires_from_succeeding_uncontended() {
        let lock = FairRwLock::new(()).unwrap();
        lock.destroy();
        assert!(lock.try_read().is_none());
        assert!(lock.try_write().is_none());
    }
}
