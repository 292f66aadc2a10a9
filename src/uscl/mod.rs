//! u-scl: user-space weighted-fair mutex.

mod mutex;
mod qnode;
mod thread_info;

pub use mutex::{FairMutex, FairMutexBuilder, FairMutexGuard};
