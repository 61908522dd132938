//! Lock-coupled process lists.
//!
//! Every queue in the kernel (the free list, the sleeping and zombie
//! lists, each CPU's runnable queue) is a singly linked list of slot
//! indices threaded through the process table. A `ProcList` owns the
//! head index under its own spinlock; each slot's successor index
//! lives in a `Link` under that slot's item lock. Walks are
//! hand-over-hand: the successor's item lock is acquired before the
//! predecessor's is released, so a walk never stands on an unlocked
//! link and never holds more than two adjacent ones.
//!
//! A slot may be on at most one list at a time; callers enforce that
//! through the process state machine.

use crate::lock::{new_spin_lock, Spinlock};
use crate::param::NPROC;

/// Nil successor.
const NIL: i32 = -1;

/// One slot's successor index, guarded by its item lock.
pub struct Link {
    next: Spinlock<i32>,
}

impl Link {
    pub const fn new() -> Self {
        Self {
            next: new_spin_lock("node", NIL),
        }
    }
}

impl Default for Link {
    fn default() -> Self {
        Self::new()
    }
}

/// A queue of process slots: a head index plus the slot links it
/// threads through.
pub struct ProcList {
    head: Spinlock<i32>,
}

impl ProcList {
    pub const fn new(name: &'static str) -> Self {
        Self {
            head: new_spin_lock(name, NIL),
        }
    }

    /// Append `idx` at the tail, preserving arrival order. The slot
    /// must not currently be on any list.
    pub fn push(&self, links: &[Link; NPROC], idx: usize) {
        let mut head = self.head.lock();
        if *head == NIL {
            *links[idx].next.lock() = NIL;
            *head = idx as i32;
            return;
        }

        let mut cur = links[*head as usize].next.lock();
        drop(head);
        loop {
            let succ = *cur;
            if succ == NIL {
                break;
            }
            let next = links[succ as usize].next.lock();
            cur = next;
        }
        *links[idx].next.lock() = NIL;
        *cur = idx as i32;
    }

    /// Detach and return the head slot, or `None` on an empty list.
    pub fn pop(&self, links: &[Link; NPROC]) -> Option<usize> {
        let mut head = self.head.lock();
        if *head == NIL {
            return None;
        }
        let idx = *head as usize;
        let mut first = links[idx].next.lock();
        *head = *first;
        *first = NIL;
        Some(idx)
    }

    /// Unlink `idx` if present and report whether it was found. Racing
    /// removers may lose; callers treat `false` as already gone.
    pub fn remove(&self, links: &[Link; NPROC], idx: usize) -> bool {
        let mut head = self.head.lock();
        if *head == NIL {
            return false;
        }
        if *head as usize == idx {
            let mut first = links[idx].next.lock();
            *head = *first;
            *first = NIL;
            return true;
        }

        let mut cur = links[*head as usize].next.lock();
        drop(head);
        loop {
            let succ = *cur;
            if succ == NIL {
                return false;
            }
            if succ as usize == idx {
                let mut target = links[idx].next.lock();
                *cur = *target;
                *target = NIL;
                return true;
            }
            let next = links[succ as usize].next.lock();
            cur = next;
        }
    }

    /// The head index, `-1` when empty. The list can shift the moment
    /// the head lock drops; see wakeup's walk for the discipline.
    pub fn first(&self) -> i32 {
        *self.head.lock()
    }

    /// Successor of `idx`, `-1` at the tail. Only meaningful while the
    /// caller pins the slot through its state lock.
    pub fn next_of(&self, links: &[Link; NPROC], idx: usize) -> i32 {
        *links[idx].next.lock()
    }
}
