//! Bounded-wait acquisition of `parking_lot` reader/writer locks.
//!
//! Every lock that guards broker state is taken through these helpers so a
//! stuck holder surfaces as a [`LockTimeout`] error instead of a hang.

use std::time::Duration;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// The lock could not be acquired within the allotted time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("lock acquisition timed out after {0:?}")]
pub struct LockTimeout(pub Duration);

/// Acquire shared access, waiting at most `timeout`.
#[inline]
pub fn read_for<T: ?Sized>(lock: &RwLock<T>, timeout: Duration) -> Result<RwLockReadGuard<'_, T>, LockTimeout> {
    lock.try_read_for(timeout).ok_or(LockTimeout(timeout))
}

/// Acquire exclusive access, waiting at most `timeout`.
#[inline]
pub fn write_for<T: ?Sized>(
    lock: &RwLock<T>,
    timeout: Duration,
) -> Result<RwLockWriteGuard<'_, T>, LockTimeout> {
    lock.try_write_for(timeout).ok_or(LockTimeout(timeout))
}
