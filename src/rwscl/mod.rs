//! RW-SCL: user-space weighted-fair reader/writer lock.

mod rwlock;

pub use rwlock::{FairRwLock, FairRwLockBuilder, FairRwLockReadGuard, FairRwLockWriteGuard, WeightPolicy};
