//! Load-balancing scenarios, in their own test binary so the
//! placement counters start pristine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::time::Duration;

use mq6::cpu::cpu_process_count;
use mq6::error::KernelError;
use mq6::hal::sim;
use mq6::param::NCPU;
use mq6::proc;

const STEP_TIMEOUT: Duration = Duration::from_secs(60);

fn total_placements() -> u32 {
    (0..NCPU).map(cpu_process_count).sum()
}

fn conductor(tx: Sender<&'static str>) -> i32 {
    // Pin to CPU 0. The move itself is a recorded placement.
    let c0 = cpu_process_count(0);
    assert_eq!(proc::set_cpu(0), Ok(0));
    assert_eq!(proc::get_cpu(), 0);
    assert_eq!(cpu_process_count(0), c0 + 1);

    // Two balanced forks from a parent pinned to CPU 0, with the
    // kernel otherwise quiet: the children spread to the idle CPUs
    // (the first onto CPU 1) and the counters record exactly one
    // placement each.
    let base = total_placements();
    let gate = Arc::new(AtomicBool::new(false));
    let (ctx, crx) = mpsc::channel();
    for _ in 0..2 {
        let ctx = ctx.clone();
        let gate = gate.clone();
        sim::fork_program(move || {
            ctx.send(proc::get_cpu()).unwrap();
            while !gate.load(Ordering::SeqCst) {
                proc::proc_yield();
            }
            0
        })
        .unwrap();
    }
    let mut cpus = [
        crx.recv_timeout(STEP_TIMEOUT).unwrap(),
        crx.recv_timeout(STEP_TIMEOUT).unwrap(),
    ];
    cpus.sort_unstable();
    assert_eq!(cpus, [1, 2]);
    assert_eq!(total_placements(), base + 2);

    gate.store(true, Ordering::SeqCst);
    proc::wait(0).unwrap();
    proc::wait(0).unwrap();

    // set_cpu migrates promptly and records the placement.
    let c3 = cpu_process_count(3);
    assert_eq!(proc::set_cpu(3), Ok(3));
    assert_eq!(proc::get_cpu(), 3);
    assert_eq!(cpu_process_count(3), c3 + 1);
    assert_eq!(proc::set_cpu(NCPU), Err(KernelError::BadCpu));

    tx.send("done").unwrap();
    0
}

#[test]
fn balanced_fork_spread() {
    sim::init_kernel();

    let (tx, rx) = mpsc::channel();
    sim::install_program(1, move || {
        sim::fork_program(move || conductor(tx)).unwrap();
        loop {
            if proc::wait(0).is_err() {
                proc::proc_yield();
            }
        }
    });
    sim::run_schedulers();

    assert_eq!(rx.recv_timeout(STEP_TIMEOUT).unwrap(), "done");
}
