//! Data protected by another lock's raw lock.

use core::cell::UnsafeCell;
use core::ptr;

use super::{RawSpinlock, SpinlockGuard};

/// Similar to `Spinlock<T>`, but instead of internally owning a
/// `RawSpinlock`, this stores a `'static` reference to an external
/// `RawSpinlock` provided by the caller. By making multiple
/// `SpinlockProtected<T>`'s refer to a single `RawSpinlock`, you can
/// have one global lock guard many scattered fields; every process's
/// parent link shares `wait_lock` this way.
///
/// To dereference the inner data you must present a guard of the
/// owning lock to `get_mut`.
pub struct SpinlockProtected<T> {
    lock: &'static RawSpinlock,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for SpinlockProtected<T> {}

impl<T> SpinlockProtected<T> {
    pub const fn new(raw_lock: &'static RawSpinlock, data: T) -> Self {
        Self {
            lock: raw_lock,
            data: UnsafeCell::new(data),
        }
    }

    /// Returns a mutable reference to the inner data, provided that
    /// the given guard was obtained from the `Spinlock` whose raw lock
    /// this `SpinlockProtected` refers to. Panics otherwise.
    ///
    /// The returned reference cannot outlive the guard, so no
    /// reference leaks past the critical section. The `ptr::eq` check
    /// is a small runtime cost that ties the guard to the right lock.
    pub fn get_mut<'a: 'b, 'b, U>(&'a self, guard: &'b mut SpinlockGuard<'_, U>) -> &'b mut T {
        assert!(ptr::eq(self.lock, guard.get_lock().raw_lock()));
        unsafe { &mut *self.data.get() }
    }
}
