//! The lock module.
//!
//! Contains types for locks and lock guards that provide mutual
//! exclusion, and the traits that express their behaviors. A
//! `SpinlockProtected` owns data but borrows another lock's raw lock,
//! which is how several fragmented fields can hang off one global
//! lock (the parent links all share `wait_lock`).

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};

mod spinlock;
mod spinlock_protected;

pub use spinlock::{new_spin_lock, pop_off, push_off, RawSpinlock, Spinlock, SpinlockGuard};
pub use spinlock_protected::SpinlockProtected;

pub trait RawLock {
    /// Acquires the lock.
    fn acquire(&self);
    /// Releases the lock.
    fn release(&self);
    /// Whether this cpu is holding the lock.
    fn holding(&self) -> bool;
}

/// Locks that provide mutual exclusion and own their `RawLock`.
pub struct Lock<R: RawLock, T> {
    lock: R,
    data: UnsafeCell<T>,
}

unsafe impl<R: RawLock + Sync, T: Send> Sync for Lock<R, T> {}

/// Guards that guarantee exclusive mutable access to the lock's inner
/// data.
pub struct Guard<'s, R: RawLock, T> {
    lock: &'s Lock<R, T>,
    _marker: PhantomData<*const ()>,
}

// Do not implement Send; a lock must be released by the CPU that
// acquired it.
unsafe impl<'s, R: RawLock + Sync, T: Sync> Sync for Guard<'s, R, T> {}

impl<R: RawLock, T> Lock<R, T> {
    pub const fn new(lock: R, data: T) -> Self {
        Self {
            lock,
            data: UnsafeCell::new(data),
        }
    }

    /// Acquires the lock and returns the lock guard.
    pub fn lock(&self) -> Guard<'_, R, T> {
        self.lock.acquire();

        Guard {
            lock: self,
            _marker: PhantomData,
        }
    }

    pub const fn raw_lock(&self) -> &R {
        &self.lock
    }

    /// Returns a raw pointer to the inner data. The caller must ensure
    /// that accessing the pointer does not incur a race.
    pub fn get_mut_raw(&self) -> *mut T {
        self.data.get()
    }

    /// Unlock the lock.
    ///
    /// # Safety
    ///
    /// Use this only when we acquired the lock but did `mem::forget()`
    /// to the guard.
    pub unsafe fn unlock(&self) {
        self.lock.release();
    }

    /// Whether this cpu is holding the lock.
    pub fn holding(&self) -> bool {
        self.lock.holding()
    }
}

impl<'a, R: RawLock, T> Guard<'a, R, T> {
    pub fn get_lock(&self) -> &'a Lock<R, T> {
        self.lock
    }
}

impl<R: RawLock, T> Drop for Guard<'_, R, T> {
    fn drop(&mut self) {
        self.lock.lock.release();
    }
}

impl<R: RawLock, T> Deref for Guard<'_, R, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.data.get() }
    }
}

impl<R: RawLock, T> DerefMut for Guard<'_, R, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.lock.data.get() }
    }
}

/// Lock guards that `sleep` can release and reacquire around a context
/// switch.
pub trait Waitable {
    /// Releases the inner raw lock.
    ///
    /// # Safety
    ///
    /// `raw_release()` and `raw_acquire()` must always be used as a
    /// pair; do not access the guarded data in between.
    unsafe fn raw_release(&mut self);

    /// Reacquires the inner raw lock.
    ///
    /// # Safety
    ///
    /// Must be paired with a previous `raw_release()`.
    unsafe fn raw_acquire(&mut self);
}

impl<R: RawLock, T> Waitable for Guard<'_, R, T> {
    unsafe fn raw_release(&mut self) {
        self.lock.lock.release();
    }

    unsafe fn raw_acquire(&mut self) {
        self.lock.lock.acquire();
    }
}
