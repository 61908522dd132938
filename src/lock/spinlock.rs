//! Spin locks.

use core::hint::spin_loop;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

use super::{Guard, Lock, RawLock};
use crate::cpu::Cpu;
use crate::hal::{Interrupts, TargetHal};
use crate::kernel::kernel;

/// Mutual exclusion lock that busy waits (spins).
pub struct RawSpinlock {
    /// Name of lock.
    name: &'static str,

    /// If the lock is held, the `Cpu` holding it; null otherwise.
    /// Doubles as the holder record for `holding()` and debugging.
    locked: AtomicPtr<Cpu>,
}

/// Locks that busy wait (spin).
pub type Spinlock<T> = Lock<RawSpinlock, T>;
/// Guards of `Spinlock<T>`.
pub type SpinlockGuard<'s, T> = Guard<'s, RawSpinlock, T>;

impl RawSpinlock {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            locked: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

impl RawLock for RawSpinlock {
    /// Acquires the lock; loops (spins) until it is acquired.
    ///
    /// The `Acquire` exchange pairs with the `Release` store in
    /// `release()`, so stores made in one critical section are visible
    /// to loads in the next.
    fn acquire(&self) {
        // Disable interrupts to avoid deadlock.
        unsafe { push_off() };
        assert!(!self.holding(), "acquire {}", self.name);

        while self
            .locked
            .compare_exchange(
                ptr::null_mut(),
                kernel().cpus.current_raw(),
                Ordering::Acquire,
                // Okay to use `Relaxed` ordering on failure since we
                // don't enter the critical section anyway.
                Ordering::Relaxed,
            )
            .is_err()
        {
            spin_loop();
        }
    }

    /// Releases the lock.
    fn release(&self) {
        assert!(self.holding(), "release {}", self.name);
        self.locked.store(ptr::null_mut(), Ordering::Release);
        unsafe { pop_off() };
    }

    /// Whether this cpu is holding the lock. Interrupts must be off.
    fn holding(&self) -> bool {
        self.locked.load(Ordering::Relaxed) == kernel().cpus.current_raw()
    }
}

/// Returns a new `Spinlock` with name `name` and data `data`.
pub const fn new_spin_lock<T>(name: &'static str, data: T) -> Spinlock<T> {
    Lock::new(RawSpinlock::new(name), data)
}

/// push_off/pop_off are like intr_off()/intr_on() except that they are
/// matched: it takes two pop_off()s to undo two push_off()s. Also, if
/// interrupts are initially off, then push_off, pop_off leaves them
/// off.
///
/// # Safety
///
/// The caller must be pinned to its CPU (interrupt state and the
/// nesting depth are per-CPU).
pub unsafe fn push_off() {
    let old = TargetHal::intr_get();
    TargetHal::intr_off();

    let cpu = kernel().cpus.current_raw();
    unsafe {
        if (*cpu).noff == 0 {
            (*cpu).interrupt_enabled = old;
        }
        (*cpu).noff += 1;
    }
}

/// pop_off() should be paired with push_off(). See push_off() for more
/// details.
///
/// # Safety
///
/// May turn interrupts back on; the caller must not rely on them
/// staying disabled.
pub unsafe fn pop_off() {
    let cpu = kernel().cpus.current_raw();
    assert!(!TargetHal::intr_get(), "pop_off - interruptible");
    unsafe {
        assert!((*cpu).noff >= 1, "pop_off");
        (*cpu).noff -= 1;
        if (*cpu).noff == 0 && (*cpu).interrupt_enabled {
            TargetHal::intr_on();
        }
    }
}
