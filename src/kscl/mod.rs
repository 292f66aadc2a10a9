//! k-scl: ticket-lock-backed weighted-fair mutex.

mod mutex;
mod waiter;

pub use mutex::{BanPolicy, KernelStyleMutex, KernelStyleMutexGuard};
