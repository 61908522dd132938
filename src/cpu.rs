//! Per-CPU state.

use core::cell::UnsafeCell;
use core::ptr;
use core::sync::atomic::{AtomicU32, Ordering};

use array_macro::array;
use itertools::Itertools;

use crate::hal::{Interrupts, ProcPort, TargetHal};
use crate::kernel::kernel;
use crate::list::ProcList;
use crate::param::NCPU;
use crate::proc::Proc;

type Context = <TargetHal as ProcPort>::Context;

/// Per-CPU private state. Only code running on the CPU itself touches
/// its own record, with interrupts disabled.
pub struct Cpu {
    /// The process running on this cpu, or null.
    pub(crate) proc: *const Proc,

    /// Context-switch here to enter scheduler().
    pub(crate) context: Context,

    /// Depth of push_off() nesting.
    pub(crate) noff: u32,

    /// Were interrupts enabled before push_off()?
    pub(crate) interrupt_enabled: bool,
}

impl Cpu {
    fn new() -> Self {
        Self {
            proc: ptr::null(),
            context: Context::default(),
            noff: 0,
            interrupt_enabled: false,
        }
    }
}

/// The per-CPU state other CPUs may touch: the runnable queue and the
/// placement counter. It lives beside, not inside, the `UnsafeCell`'d
/// owner record so a remote fork can enqueue without aliasing it.
pub struct RunQueue {
    /// FIFO of RUNNABLE slots assigned to this CPU.
    pub runnable: ProcList,

    /// Monotone count of placements onto this CPU; an approximation
    /// of cumulative assignment, never of instantaneous depth.
    process_count: AtomicU32,
}

impl RunQueue {
    const fn new() -> Self {
        Self {
            runnable: ProcList::new("runq"),
            process_count: AtomicU32::new(0),
        }
    }

    pub fn count(&self) -> u32 {
        self.process_count.load(Ordering::Relaxed)
    }

    /// Account one placement onto this CPU.
    pub(crate) fn record_assignment(&self) {
        self.process_count.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct Cpus {
    cpus: [UnsafeCell<Cpu>; NCPU],
    queues: [RunQueue; NCPU],
}

// SAFETY: each CPU mutates only its own `Cpu` record, with interrupts
// disabled; everything cross-CPU lives in `RunQueue`, which is
// lock- and atomic-protected.
unsafe impl Send for Cpus {}
unsafe impl Sync for Cpus {}

impl Cpus {
    pub(crate) fn new() -> Self {
        Self {
            cpus: array![_ => UnsafeCell::new(Cpu::new()); NCPU],
            queues: array![_ => RunQueue::new(); NCPU],
        }
    }

    /// Return this CPU's cpu struct.
    ///
    /// It is safe to call this with interrupts enabled, but the
    /// returned address may no longer be the current CPU once the
    /// scheduler moves the caller.
    pub fn current_raw(&self) -> *mut Cpu {
        self.cpus[cpuid()].get()
    }

    pub fn runq(&self, cpu: usize) -> &RunQueue {
        &self.queues[cpu]
    }

    /// The CPU with the fewest recorded assignments, lowest index on
    /// ties.
    pub fn choose(&self) -> usize {
        self.queues
            .iter()
            .position_min_by_key(|q| q.count())
            .unwrap()
    }
}

/// Return this CPU's ID.
///
/// It is safe to call this with interrupts enabled, but the answer may
/// be stale once the scheduler moves the caller to another CPU.
pub fn cpuid() -> usize {
    TargetHal::cpu_id()
}

/// Read CPU `num`'s assignment counter.
pub fn cpu_process_count(num: usize) -> u32 {
    kernel().cpus.runq(num).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;

    #[test]
    fn choose_tracks_min_and_counts_stay_monotone() {
        let _t = test_support::table();
        let cpus = &kernel().cpus;

        let before: [u32; NCPU] = array![i => cpus.runq(i).count(); NCPU];
        let chosen = cpus.choose();
        // Lowest index among the minima.
        let min = *before.iter().min().unwrap();
        assert_eq!(before[chosen], min);
        assert!(before[..chosen].iter().all(|&c| c > min));

        cpus.runq(chosen).record_assignment();
        let after: [u32; NCPU] = array![i => cpus.runq(i).count(); NCPU];
        for i in 0..NCPU {
            let expect = if i == chosen { before[i] + 1 } else { before[i] };
            assert_eq!(after[i], expect);
        }
    }
}
