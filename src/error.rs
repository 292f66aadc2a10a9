//! Error kinds surfaced by the lock family.
//!
//! Per the design notes: programmer errors (release without hold, double
//! release, acquire after destroy) are intentionally left unchecked in
//! release builds, matching the C source this crate is based on. Only the
//! two recoverable kinds below ever reach a caller.

use thiserror::Error;

/// Failure modes that a scheduler-cooperative lock can report.
///
/// These are the only two error kinds this crate's core assigns: a
/// configuration failure (cycle-counter calibration) and a resource
/// exhaustion failure (k-scl waiter allocation). Everything else is either a
/// programmer error (unchecked) or recovered locally via retry loops.
#[derive(Debug, Error)]
pub enum ScheduledLockError {
    /// The platform's cycle-counter could not be calibrated against wall
    /// clock time, or no cycle counter is available on this architecture.
    #[error("cycle counter calibration failed: {0}")]
    Configuration(String),

    /// A k-scl waiter record could not be registered because the lock's
    /// waiter table is full. The original C implementation sizes its waiter
    /// hash table once at compile time and panics past that bound
    /// (`fair_lock`) or fails the call (`fair_trylock`); this crate always
    /// reports it as an error so callers can decide how to react instead of
    /// aborting the process.
    #[error("failed to register waiter record: {0}")]
    ResourceExhausted(String),
}

pub type Result<T> = core::result::Result<T, ScheduledLockError>;
