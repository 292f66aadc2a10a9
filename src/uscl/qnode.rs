//! MCS-style waiter node and its state machine.
//!
//! ```text
//!   INIT ──(pred marks us next)──► NEXT ──(pred releases)──► RUNNABLE ──(CAS on self)──► RUNNING
//! ```
//!
//! `INIT` is the only state a thread futex-waits on; `NEXT`/`RUNNABLE` are
//! spin-then-yield states; `RUNNING` is terminal.

use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicI32, AtomicPtr, Ordering};

pub(crate) const INIT: i32 = 0;
pub(crate) const NEXT: i32 = 1;
pub(crate) const RUNNABLE: i32 = 2;
pub(crate) const RUNNING: i32 = 3;

/// One node per in-flight acquire attempt. Lives on the acquiring thread's
/// stack for the duration of `acquire`; never heap-allocated.
#[repr(C)]
pub(crate) struct QNode {
    /// Also the futex word a queued waiter parks on while `state == INIT`.
    pub state: CachePadded<AtomicI32>,
    pub next: CachePadded<AtomicPtr<QNode>>,
}

impl QNode {
    pub fn new() -> Self {
        QNode {
            state: CachePadded::new(AtomicI32::new(INIT)),
            next: CachePadded::new(AtomicPtr::new(std::ptr::null_mut())),
        }
    }

    #[inline]
    pub fn load_state(&self, order: Ordering) -> i32 {
        self.state.load(order)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn new_node_starts_at_init() {
        let n = QNode::new();
        assert_eq!(n.load_state(Ordering::Relaxed), INIT);
        assert!(n.next.load(Ordering::Relaxed).is_null());
    }
}
