//! End-to-end lifecycle scenarios on the hosted port.
//!
//! One ordered test: the kernel is global and never exits, and the
//! boot state is only observable before the schedulers start. All
//! kernel operations run inside processes ("user programs" on the
//! hosted port); the test body only stages programs, reads the
//! diagnostic peeks, and collects progress over channels.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mq6::cpu::cpu_process_count;
use mq6::error::KernelError;
use mq6::hal::sim;
use mq6::hal::{MemLayout, TargetHal};
use mq6::kernel::kernel;
use mq6::lock::{new_spin_lock, Spinlock};
use mq6::param::{NCPU, NPROC, PGSIZE};
use mq6::proc::{self, Procstate, WaitChannel};

const STEP_TIMEOUT: Duration = Duration::from_secs(60);

static INIT_REAPS: AtomicUsize = AtomicUsize::new(0);

/// Reap one child, returning (pid, status).
fn reap() -> (i32, i32) {
    let mut status: i32 = 0;
    let pid = proc::wait(&mut status as *mut i32 as usize).expect("wait failed");
    (pid, status)
}

fn conductor(tx: Sender<&'static str>) -> i32 {
    let my_pid = sim::my_pid();
    let procs = &kernel().procs;

    // fork / exit / wait round-trip; the pid the parent gets from
    // fork is the pid the child sees and the pid wait returns.
    let (ptx, prx) = mpsc::channel();
    let child = sim::fork_program(move || {
        ptx.send(sim::my_pid()).unwrap();
        42
    })
    .unwrap();
    assert!(child > my_pid);
    let seen = prx.recv_timeout(STEP_TIMEOUT).unwrap();
    assert_eq!(seen, child);
    let (pid, status) = reap();
    assert_eq!(pid, child);
    assert_eq!(status, 42);
    tx.send("fork-exit-wait").unwrap();

    // Nothing left to wait for.
    assert_eq!(proc::wait(0), Err(KernelError::NoChildren));
    tx.send("no-children").unwrap();

    // A bad status address surfaces the failure and leaves the child
    // reapable.
    let child = sim::fork_program(|| 7).unwrap();
    assert_eq!(proc::wait(8), Err(KernelError::BadAddress));
    let (pid, status) = reap();
    assert_eq!(pid, child);
    assert_eq!(status, 7);
    tx.send("bad-addr").unwrap();

    // PIDs issue strictly increasing.
    let mut last = child;
    for _ in 0..3 {
        let k = sim::fork_program(|| 0).unwrap();
        assert!(k > last);
        last = k;
        let (pid, _) = reap();
        assert_eq!(pid, k);
    }
    tx.send("pid-order").unwrap();

    // Orphan reparenting: P forks C and exits without waiting; C is
    // handed to init, whose reaper collects it.
    let before = INIT_REAPS.load(Ordering::SeqCst);
    let release = Arc::new(AtomicBool::new(false));
    let r = release.clone();
    let p_pid = sim::fork_program(move || {
        sim::fork_program(move || {
            while !r.load(Ordering::SeqCst) {
                proc::proc_yield();
            }
            0
        })
        .unwrap();
        11
    })
    .unwrap();
    let (pid, status) = reap();
    assert_eq!(pid, p_pid);
    assert_eq!(status, 11);
    release.store(true, Ordering::SeqCst);
    let deadline = Instant::now() + STEP_TIMEOUT;
    while INIT_REAPS.load(Ordering::SeqCst) < before + 1 {
        assert!(Instant::now() < deadline, "init never reaped the orphan");
        proc::proc_yield();
    }
    tx.send("reparent").unwrap();

    // Sleep on a channel, wake from another process. Wakeup of a
    // not-yet-sleeping target is lost by design, so keep knocking.
    static CHAN: WaitChannel = WaitChannel::new();
    static SLEEP_LOCK: Spinlock<()> = new_spin_lock("sleep_test", ());
    let (stx, srx) = mpsc::channel();
    let sleeper = sim::fork_program(move || {
        let mut guard = SLEEP_LOCK.lock();
        CHAN.sleep(&mut guard);
        drop(guard);
        stx.send(sim::my_pid()).unwrap();
        0
    })
    .unwrap();
    let deadline = Instant::now() + STEP_TIMEOUT;
    let woke = loop {
        assert!(Instant::now() < deadline, "sleeper never woke");
        CHAN.wakeup();
        match srx.recv_timeout(Duration::from_millis(10)) {
            Ok(pid) => break pid,
            Err(_) => proc::proc_yield(),
        }
    };
    assert_eq!(woke, sleeper);
    let (pid, _) = reap();
    assert_eq!(pid, sleeper);
    tx.send("sleep-wakeup").unwrap();

    // Kill a sleeper: it is yanked off the sleeping list, scheduled,
    // observes the kill at the user boundary, and exits -1.
    static CHAN2: WaitChannel = WaitChannel::new();
    static SLEEP_LOCK2: Spinlock<()> = new_spin_lock("kill_test", ());
    let (ktx, krx) = mpsc::channel();
    let victim = sim::fork_program(move || {
        let mut guard = SLEEP_LOCK2.lock();
        while !sim::killed() {
            CHAN2.sleep(&mut guard);
        }
        drop(guard);
        ktx.send(true).unwrap();
        0
    })
    .unwrap();
    // Let it actually reach the sleeping list first.
    let vslot = (0..NPROC)
        .find(|&i| unsafe { procs.slot(i).pid() } == victim)
        .expect("victim has a slot");
    let deadline = Instant::now() + STEP_TIMEOUT;
    while unsafe { procs.slot(vslot).state() } != Procstate::SLEEPING {
        assert!(Instant::now() < deadline, "victim never slept");
        proc::proc_yield();
    }
    assert_eq!(proc::kill(victim), Ok(()));
    // Killing twice is killing once.
    assert_eq!(proc::kill(victim), Ok(()));
    assert!(krx.recv_timeout(STEP_TIMEOUT).unwrap());
    let (pid, status) = reap();
    assert_eq!(pid, victim);
    assert_eq!(status, -1);
    tx.send("kill-sleeping").unwrap();

    // growproc round-trip.
    let me = proc::myproc();
    let sz0 = unsafe { (*me).size() };
    assert_eq!(proc::growproc(PGSIZE as isize), Ok(()));
    assert_eq!(unsafe { (*me).size() }, sz0 + PGSIZE);
    assert_eq!(proc::growproc(-(PGSIZE as isize)), Ok(()));
    assert_eq!(unsafe { (*me).size() }, sz0);
    tx.send("growproc").unwrap();

    // either_copyout / either_copyin on kernel addresses.
    let mut buf = [0u8; 8];
    proc::either_copyout(false, buf.as_mut_ptr() as usize, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
    assert_eq!(buf, [1, 2, 3, 4, 5, 6, 7, 8]);
    let mut out = [0u8; 8];
    proc::either_copyin(&mut out, false, buf.as_ptr() as usize).unwrap();
    assert_eq!(out, buf);
    tx.send("either-copy").unwrap();

    0
}

#[test]
fn lifecycle() {
    sim::init_kernel();

    // Boot: exactly one slot in use: pid 1, RUNNABLE, named
    // initcode, one page of user memory, queued on CPU 0.
    let procs = &kernel().procs;
    let live: Vec<usize> = (0..NPROC)
        .filter(|&i| unsafe { procs.slot(i).state() } != Procstate::UNUSED)
        .collect();
    assert_eq!(live.len(), 1);
    let init = procs.slot(live[0]);
    assert_eq!(unsafe { init.pid() }, 1);
    assert_eq!(unsafe { init.state() }, Procstate::RUNNABLE);
    assert_eq!(unsafe { init.name() }.as_str(), "initcode");
    assert_eq!(unsafe { init.size() }, PGSIZE);
    assert_eq!(init.assigned_cpu(), 0);
    assert_eq!(kernel().cpus.runq(0).runnable.first(), live[0] as i32);
    let placements: u32 = (0..NCPU).map(cpu_process_count).sum();
    assert_eq!(placements, 0);
    // Kernel stacks were mapped at boot; fs init waits for the first
    // process.
    assert!(sim::kvm_lookup(TargetHal::kstack(0)).is_some());
    assert_eq!(sim::fs_init_count(), 0);

    // Init reaps forever; the conductor runs every scenario and
    // reports progress.
    let (tx, rx) = mpsc::channel();
    sim::install_program(1, move || {
        sim::fork_program(move || conductor(tx)).unwrap();
        loop {
            if proc::wait(0).is_ok() {
                INIT_REAPS.fetch_add(1, Ordering::SeqCst);
            } else {
                proc::proc_yield();
            }
        }
    });
    sim::run_schedulers();

    let steps = [
        "fork-exit-wait",
        "no-children",
        "bad-addr",
        "pid-order",
        "reparent",
        "sleep-wakeup",
        "kill-sleeping",
        "growproc",
        "either-copy",
    ];
    for step in steps {
        let got = rx
            .recv_timeout(STEP_TIMEOUT)
            .unwrap_or_else(|_| panic!("timed out before step {:?}", step));
        assert_eq!(got, step);
    }

    // The first process ran the one-shot fs init, and every log
    // bracket opened by an exit was closed again.
    assert_eq!(sim::fs_init_count(), 1);
    assert!(sim::log_quiesced());
}
