//! Per-thread, per-lock bookkeeping (`flthread_info_t` in the original C).
//!
//! The C source keys this off a `pthread_key_t` owned by each `fairlock_t`
//! instance. Rust's `thread_local!` only gives one slot per *type*, not per
//! object, so each lock instance is keyed here by its own address instead,
//! functionally the same "one key per lock" shape, without needing a
//! dynamic TLS-key allocator.
//!
//! Since a thread only ever touches its own entry, callers fetch a `Copy`
//! snapshot, mutate it locally like any other local variable, and write it
//! back; there is no concurrent access to race against.

use crate::platform::time::Cycles;
use std::cell::RefCell;
use std::collections::HashMap;

/// Per-thread state u-scl tracks against one lock instance.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ThreadInfo {
    pub weight: u32,
    pub slice: Cycles,
    pub start_ticks: Cycles,
    pub banned_until: Cycles,
    pub banned: bool,
}

impl ThreadInfo {
    fn new(now: Cycles, weight: u32) -> Self {
        ThreadInfo {
            weight,
            slice: 0,
            start_ticks: 0,
            banned_until: now,
            banned: false,
        }
    }
}

thread_local! {
    static REGISTRY: RefCell<HashMap<usize, ThreadInfo>> = RefCell::new(HashMap::new());
}

/// Lock-instance identity used to key the thread-local registry. Any stable,
/// unique address for the lock's non-generic inner state works; callers
/// pass `&self.inner as *const _ as usize`.
pub(crate) type LockId = usize;

/// Returns this thread's `ThreadInfo` for `lock_id`, creating it (with the
/// given weight, or the current thread's nice-derived weight if
/// `weight == 0`) on first touch. Returns `(info, total_weight_delta)` where
/// the delta is the weight just added to `lock.total_weight`, if this call
/// created a new entry (0 otherwise).
pub(crate) fn get_or_init(lock_id: LockId, now: Cycles, default_weight: u32) -> (ThreadInfo, u32) {
    REGISTRY.with(|reg| {
        let mut reg = reg.borrow_mut();
        if let Some(info) = reg.get(&lock_id) {
            return (*info, 0);
        }
        let weight = if default_weight == 0 {
            crate::platform::weight::weight_for_current_thread()
        } else {
            default_weight
        };
        let info = ThreadInfo::new(now, weight);
        reg.insert(lock_id, info);
        (info, weight)
    })
}

/// Overwrites this thread's `ThreadInfo` for `lock_id`.
pub(crate) fn set(lock_id: LockId, info: ThreadInfo) {
    REGISTRY.with(|reg| {
        reg.borrow_mut().insert(lock_id, info);
    });
}

/// Explicitly (re)registers this thread's weight for `lock_id`, replacing
/// any prior registration (`mutex_thread_init`). Returns the weight that was
/// just added to `lock.total_weight`.
pub(crate) fn register(lock_id: LockId, now: Cycles, weight: u32) -> u32 {
    let weight = if weight == 0 {
        crate::platform::weight::weight_for_current_thread()
    } else {
        weight
    };
    set(lock_id, ThreadInfo::new(now, weight));
    weight
}

/// Drops this thread's bookkeeping for `lock_id`, if any was ever created.
#[cfg(test)]
pub(crate) fn forget(lock_id: LockId) {
    REGISTRY.with(|reg| {
        reg.borrow_mut().remove(&lock_id);
    });
}
