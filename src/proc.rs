//! Processes: the table, the lifecycle state machine, and the per-CPU
//! scheduler.
//!
//! Every process occupies a fixed slot in the table; the slot index is
//! its stable identity. A slot moves between the free list, one CPU's
//! runnable queue, the sleeping list, and the zombie list, and is on
//! at most one of them at a time. `wait_lock` orders parent/child
//! termination: it is acquired before any slot lock and never the
//! other way around.

use core::cell::UnsafeCell;
use core::mem;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};

use array_macro::array;
use arrayvec::ArrayString;
use spin::Once;

use crate::cpu::{cpuid, Cpu};
use crate::error::KernelError;
use crate::hal::{
    ContextOps, FsPort, Interrupts, MapPerm, MemLayout, PageAlloc, ProcPort, TargetHal,
    TrapFrameOps, UserVm,
};
use crate::kernel::kernel;
use crate::list::{Link, ProcList};
use crate::lock::{new_spin_lock, Spinlock, SpinlockGuard, SpinlockProtected, Waitable};
use crate::param::{BALANCE_MODE, MAXPROCNAME, NCPU, NOFILE, NPROC, PGSIZE, ROOTDEV};
use crate::println;

type Context = <TargetHal as ProcPort>::Context;
type TrapFrame = <TargetHal as ProcPort>::TrapFrame;
type PageTable = <TargetHal as UserVm>::PageTable;
type File = <TargetHal as FsPort>::File;
type Inode = <TargetHal as FsPort>::Inode;

/// Helps ensure that wakeups of wait()ing parents are not lost, and
/// guards every slot's parent link. Must be acquired before any slot
/// lock.
static WAIT_LOCK: Spinlock<()> = new_spin_lock("wait_lock", ());

const NO_PARENT: i32 = -1;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Procstate {
    UNUSED,
    USED,
    SLEEPING,
    RUNNABLE,
    RUNNING,
    ZOMBIE,
}

impl Procstate {
    fn as_str(&self) -> &'static str {
        match self {
            Procstate::UNUSED => "unused",
            Procstate::USED => "used",
            Procstate::SLEEPING => "sleep ",
            Procstate::RUNNABLE => "runble",
            Procstate::RUNNING => "run   ",
            Procstate::ZOMBIE => "zombie",
        }
    }
}

/// A rendezvous token. Sleepers record the channel's address; wakeup
/// matches on it. The padding byte keeps distinct channels at distinct
/// addresses.
pub struct WaitChannel {
    _padding: u8,
}

impl WaitChannel {
    pub const fn new() -> Self {
        Self { _padding: 0 }
    }

    fn addr(&self) -> usize {
        self as *const Self as usize
    }

    /// Atomically release `lk` and sleep on this channel; reacquires
    /// `lk` when awakened.
    pub fn sleep<G: Waitable>(&self, lk: &mut G) {
        kernel().procs.sleep(self.addr(), lk);
    }

    /// Wake up all processes sleeping on this channel. Must be called
    /// without any slot lock held.
    pub fn wakeup(&self) {
        kernel().procs.wakeup(self.addr());
    }
}

impl Default for WaitChannel {
    fn default() -> Self {
        Self::new()
    }
}

/// Slot fields guarded by the slot lock.
struct ProcInfo {
    state: Procstate,
    /// Wakeup channel; nonzero only while SLEEPING.
    chan: usize,
    /// Exit status to be returned to the parent's wait.
    xstate: i32,
    /// Process ID; zero when the slot is free.
    pid: i32,
}

/// Private to the running process, so the slot lock need not be held
/// to use these. Setup and teardown are the exception; there the slot
/// lock serializes access.
pub struct ProcData {
    /// Virtual address of the kernel stack; fixed at boot.
    kstack: usize,
    /// Size of user memory in bytes.
    sz: usize,
    /// User page table.
    pagetable: Option<PageTable>,
    /// The trapframe page, owned by this slot while non-UNUSED.
    trap_frame: *mut TrapFrame,
    /// Context-switch here to run the process.
    context: Context,
    /// Open files.
    open_files: [Option<File>; NOFILE],
    /// Current directory.
    cwd: Option<Inode>,
    /// Debugging label.
    name: ArrayString<MAXPROCNAME>,
}

impl ProcData {
    fn new() -> Self {
        Self {
            kstack: 0,
            sz: 0,
            pagetable: None,
            trap_frame: ptr::null_mut(),
            context: Context::default(),
            open_files: array![_ => None; NOFILE],
            cwd: None,
            name: ArrayString::new(),
        }
    }

    fn pagetable(&self) -> &PageTable {
        self.pagetable.as_ref().expect("proc without pagetable")
    }

    fn pagetable_mut(&mut self) -> &mut PageTable {
        self.pagetable.as_mut().expect("proc without pagetable")
    }
}

/// Per-process state.
pub struct Proc {
    info: Spinlock<ProcInfo>,

    pub(crate) data: UnsafeCell<ProcData>,

    /// Sticky kill flag, observed at the user boundary.
    killed: AtomicBool,

    /// The CPU whose runnable queue this slot joins when RUNNABLE; the
    /// one it was last assigned to otherwise.
    assigned_cpu: AtomicUsize,

    /// Parent slot index, or -1. Shares wait_lock.
    parent: SpinlockProtected<i32>,

    /// Woken when a child of this process exits.
    child_chan: WaitChannel,

    /// This slot's position in the table.
    idx: usize,
}

// SAFETY: `info` is lock-guarded, `data` is touched only by the
// running process itself or under the slot lock during setup and
// teardown, and the remaining fields are atomics or wait_lock
// protected. The port's Context/TrapFrame/PageTable/File/Inode types
// are all Send.
unsafe impl Send for Proc {}
unsafe impl Sync for Proc {}

impl Proc {
    fn new(idx: usize) -> Self {
        Self {
            info: new_spin_lock(
                "proc",
                ProcInfo {
                    state: Procstate::UNUSED,
                    chan: 0,
                    xstate: 0,
                    pid: 0,
                },
            ),
            data: UnsafeCell::new(ProcData::new()),
            killed: AtomicBool::new(false),
            assigned_cpu: AtomicUsize::new(0),
            parent: SpinlockProtected::new(WAIT_LOCK.raw_lock(), NO_PARENT),
            child_chan: WaitChannel::new(),
            idx,
        }
    }

    fn lock(&self) -> ProcGuard<'_> {
        mem::forget(self.info.lock());
        ProcGuard { proc: self }
    }

    /// Lock-free peek for procdump and diagnostics.
    ///
    /// # Safety
    ///
    /// Racy by design; the caller accepts a possibly torn view.
    pub unsafe fn pid(&self) -> i32 {
        unsafe { (*self.info.get_mut_raw()).pid }
    }

    /// Lock-free peek for procdump and diagnostics.
    ///
    /// # Safety
    ///
    /// Racy by design; the caller accepts a possibly torn view.
    pub unsafe fn state(&self) -> Procstate {
        unsafe { (*self.info.get_mut_raw()).state }
    }

    /// Lock-free peek at the debugging label.
    ///
    /// # Safety
    ///
    /// Racy by design; the caller accepts a possibly torn view.
    pub unsafe fn name(&self) -> ArrayString<MAXPROCNAME> {
        unsafe { (*self.data.get()).name }
    }

    /// Lock-free peek at the user-memory size.
    ///
    /// # Safety
    ///
    /// Racy by design; the caller accepts a possibly torn view.
    pub unsafe fn size(&self) -> usize {
        unsafe { (*self.data.get()).sz }
    }

    pub fn killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    pub fn assigned_cpu(&self) -> usize {
        self.assigned_cpu.load(Ordering::Relaxed)
    }

    pub fn index(&self) -> usize {
        self.idx
    }
}

/// A locked slot. Holds the slot's info lock from `Proc::lock` until
/// drop; `sched` is only reachable through here.
struct ProcGuard<'s> {
    proc: &'s Proc,
}

impl<'s> ProcGuard<'s> {
    fn deref_info(&self) -> &ProcInfo {
        unsafe { &*self.proc.info.get_mut_raw() }
    }

    fn deref_mut_info(&mut self) -> &mut ProcInfo {
        unsafe { &mut *self.proc.info.get_mut_raw() }
    }

    fn deref_mut_data(&mut self) -> &mut ProcData {
        unsafe { &mut *self.proc.data.get() }
    }

    /// Switch to the scheduler. Must hold only this slot's lock and
    /// have already changed the state. Saves and restores
    /// interrupt_enabled because it is a property of this kernel
    /// thread, not this CPU.
    unsafe fn sched(&mut self) {
        let c = kernel().cpus.current_raw();
        unsafe {
            assert_eq!((*c).noff, 1, "sched locks");
            assert_ne!(self.deref_info().state, Procstate::RUNNING, "sched running");
            assert!(!TargetHal::intr_get(), "sched interruptible");

            let intena = (*c).interrupt_enabled;
            let pctx: *mut Context = &mut self.deref_mut_data().context;
            TargetHal::context_switch(pctx, &mut (*c).context);
            // We may resume on a different CPU.
            let c = kernel().cpus.current_raw();
            (*c).interrupt_enabled = intena;
        }
    }
}

impl core::ops::Deref for ProcGuard<'_> {
    type Target = Proc;

    fn deref(&self) -> &Self::Target {
        self.proc
    }
}

impl Drop for ProcGuard<'_> {
    fn drop(&mut self) {
        unsafe { self.proc.info.unlock() };
    }
}

/// The process table and the global lists threaded through it.
pub struct Procs {
    nextpid: AtomicI32,
    pool: [Proc; NPROC],
    links: [Link; NPROC],
    unused: ProcList,
    sleeping: ProcList,
    zombie: ProcList,
    /// Slot index of the init process; -1 until userinit.
    init_idx: AtomicI32,
}

impl Procs {
    pub(crate) fn new() -> Self {
        Self {
            nextpid: AtomicI32::new(1),
            pool: array![i => Proc::new(i); NPROC],
            links: array![_ => Link::new(); NPROC],
            unused: ProcList::new("unused"),
            sleeping: ProcList::new("sleeping"),
            zombie: ProcList::new("zombie"),
            init_idx: AtomicI32::new(-1),
        }
    }

    pub fn slot(&self, idx: usize) -> &Proc {
        &self.pool[idx]
    }

    fn allocpid(&self) -> i32 {
        self.nextpid.fetch_add(1, Ordering::Relaxed)
    }

    /// Pop a free slot and initialize it to run in the kernel.
    /// Returns with the slot lock held.
    fn alloc(&self) -> Result<ProcGuard<'_>, KernelError> {
        let idx = match self.unused.pop(&self.links) {
            Some(idx) => idx,
            None => return Err(KernelError::OutOfProcs),
        };
        let p = &self.pool[idx];
        let mut guard = p.lock();
        guard.deref_mut_info().pid = self.allocpid();
        guard.deref_mut_info().state = Procstate::USED;

        // A trapframe page.
        match TargetHal::alloc_page() {
            Some(pa) => guard.deref_mut_data().trap_frame = pa as *mut TrapFrame,
            None => {
                self.free(&mut guard, None);
                return Err(KernelError::OutOfMemory);
            }
        }

        // An empty user page table.
        let trap_frame = guard.deref_mut_data().trap_frame as usize;
        match proc_pagetable(trap_frame) {
            Ok(pt) => guard.deref_mut_data().pagetable = Some(pt),
            Err(e) => {
                self.free(&mut guard, None);
                return Err(e);
            }
        }

        // Set up a new context to start executing at forkret, which
        // returns to user space.
        let data = guard.deref_mut_data();
        let sp = data.kstack + PGSIZE;
        data.context = Context::default();
        data.context.set_ret_addr(forkret as usize);
        data.context.set_stack(sp);

        Ok(guard)
    }

    /// Free a slot and everything hanging from it, including user
    /// pages, and return it to the free list. The slot lock must be
    /// held; pass the wait_lock guard as well to sever the parent
    /// link (reaping), or `None` when the slot never gained one
    /// (failed allocation).
    fn free(&self, guard: &mut ProcGuard<'_>, parent_guard: Option<&mut SpinlockGuard<'_, ()>>) {
        let idx = guard.idx;
        {
            let data = guard.deref_mut_data();
            let trap_frame = mem::replace(&mut data.trap_frame, ptr::null_mut());
            if !trap_frame.is_null() {
                unsafe { TargetHal::free_page(trap_frame as usize) };
            }
            if let Some(pt) = data.pagetable.take() {
                proc_freepagetable(pt, data.sz);
            }
            data.sz = 0;
            data.name.clear();
        }
        if let Some(wl) = parent_guard {
            *guard.proc.parent.get_mut(wl) = NO_PARENT;
        }
        guard.proc.killed.store(false, Ordering::Release);
        {
            let info = guard.deref_mut_info();
            info.pid = 0;
            info.chan = 0;
            info.xstate = 0;
        }

        // A zombie reached here through the zombie list; a slot
        // discarded by a failed allocation never joined it.
        let _ = self.zombie.remove(&self.links, idx);
        guard.deref_mut_info().state = Procstate::UNUSED;
        self.unused.push(&self.links, idx);
    }

    /// Pass the caller's abandoned children to init. Caller holds
    /// wait_lock.
    fn reparent(&self, me: usize, wl: &mut SpinlockGuard<'_, ()>) {
        let init = self.init_idx.load(Ordering::Acquire);
        for pp in &self.pool {
            if *pp.parent.get_mut(wl) == me as i32 {
                *pp.parent.get_mut(wl) = init;
                self.pool[init as usize].child_chan.wakeup();
            }
        }
    }

    /// Atomically release `lk` and sleep on `chan`; reacquire `lk` on
    /// wake.
    ///
    /// We must take the slot lock before releasing `lk`: once we hold
    /// the slot lock, a concurrent wakeup cannot transition us (it
    /// locks every sleeper it considers), so no wakeup between the
    /// release of `lk` and `sched` can be lost.
    fn sleep<G: Waitable>(&self, chan: usize, lk: &mut G) {
        let p = myproc();
        assert!(!p.is_null(), "sleep: no current process");
        let p = unsafe { &*p };

        let mut guard = p.lock();
        self.sleeping.push(&self.links, p.idx);
        unsafe { lk.raw_release() };

        // Go to sleep.
        guard.deref_mut_info().chan = chan;
        guard.deref_mut_info().state = Procstate::SLEEPING;
        unsafe { guard.sched() };

        // Tidy up.
        guard.deref_mut_info().chan = 0;
        drop(guard);

        // Reacquire original lock.
        unsafe { lk.raw_acquire() };
    }

    /// Wake every process sleeping on `chan`. Must be called without
    /// any slot lock held.
    fn wakeup(&self, chan: usize) {
        // Snapshot the head, then walk with each successor read while
        // the slot is locked, before any unlink can touch it.
        let mut idx = self.sleeping.first();
        while idx >= 0 {
            let p = &self.pool[idx as usize];
            let mut guard = p.lock();
            let next = self.sleeping.next_of(&self.links, idx as usize);
            if guard.deref_info().state == Procstate::SLEEPING && guard.deref_info().chan == chan {
                // A racing wakeup or kill may have won the unlink.
                if self.sleeping.remove(&self.links, idx as usize) {
                    guard.deref_mut_info().state = Procstate::RUNNABLE;
                    let cpu = if BALANCE_MODE {
                        let chosen = kernel().cpus.choose();
                        kernel().cpus.runq(chosen).record_assignment();
                        p.assigned_cpu.store(chosen, Ordering::Relaxed);
                        chosen
                    } else {
                        p.assigned_cpu()
                    };
                    kernel().cpus.runq(cpu).runnable.push(&self.links, idx as usize);
                }
            }
            drop(guard);
            idx = next;
        }
    }
}

/// Create a user page table for a process: no user memory yet, but
/// with the trampoline and trapframe pages mapped.
fn proc_pagetable(trap_frame_pa: usize) -> Result<PageTable, KernelError> {
    let mut pt = TargetHal::uvm_create().ok_or(KernelError::OutOfMemory)?;

    // The trampoline code, for trap return, at the highest user
    // virtual address. Only the supervisor uses it on the way to and
    // from user space, so not U.
    if let Err(e) = TargetHal::map_page(
        &mut pt,
        TargetHal::TRAMPOLINE,
        TargetHal::trampoline_pa(),
        MapPerm::R | MapPerm::X,
    ) {
        TargetHal::uvm_free(pt, 0);
        return Err(e);
    }

    // The trapframe page just below it.
    if let Err(e) = TargetHal::map_page(
        &mut pt,
        TargetHal::TRAPFRAME,
        trap_frame_pa,
        MapPerm::R | MapPerm::W,
    ) {
        TargetHal::unmap_page(&mut pt, TargetHal::TRAMPOLINE);
        TargetHal::uvm_free(pt, 0);
        return Err(e);
    }

    Ok(pt)
}

/// Free a process's page table and the physical memory it refers to.
fn proc_freepagetable(mut pt: PageTable, sz: usize) {
    TargetHal::unmap_page(&mut pt, TargetHal::TRAMPOLINE);
    TargetHal::unmap_page(&mut pt, TargetHal::TRAPFRAME);
    TargetHal::uvm_free(pt, sz);
}

/// Allocate a page for each process's kernel stack and map it high in
/// kernel memory, followed by an invalid guard page.
pub fn proc_mapstacks() {
    for i in 0..NPROC {
        let pa = TargetHal::alloc_page().expect("proc_mapstacks: out of pages");
        unsafe { TargetHal::kvm_map(TargetHal::kstack(i), pa, PGSIZE, MapPerm::R | MapPerm::W) };
    }
}

/// Initialize the process table at boot time: kernel stack addresses
/// and the free list.
pub fn procinit() {
    let procs = &kernel().procs;
    for (i, p) in procs.pool.iter().enumerate() {
        unsafe { (*p.data.get()).kstack = TargetHal::kstack(i) };
        procs.unused.push(&procs.links, i);
    }
}

/// Return this CPU's cpu struct. Interrupts must be disabled for the
/// answer to stay current.
pub fn mycpu() -> *mut Cpu {
    kernel().cpus.current_raw()
}

/// Return the current process, or null when running the scheduler.
pub fn myproc() -> *const Proc {
    unsafe { crate::lock::push_off() };
    let c = mycpu();
    let p = unsafe { (*c).proc };
    unsafe { crate::lock::pop_off() };
    p
}

/// A user program that calls exec("/init").
/// od -t xC initcode
const INITCODE: [u8; 52] = [
    0x17, 0x05, 0x00, 0x00, 0x13, 0x05, 0x45, 0x02, 0x97, 0x05, 0x00, 0x00, 0x93, 0x85, 0x35, 0x02,
    0x93, 0x08, 0x70, 0x00, 0x73, 0x00, 0x00, 0x00, 0x93, 0x08, 0x20, 0x00, 0x73, 0x00, 0x00, 0x00,
    0xef, 0xf0, 0x9f, 0xff, 0x2f, 0x69, 0x6e, 0x69, 0x74, 0x00, 0x00, 0x24, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00,
];

/// Set up the first user process: one page of user memory holding the
/// init image, pinned to CPU 0's runnable queue.
pub fn userinit() {
    let procs = &kernel().procs;
    let mut guard = procs.alloc().expect("userinit: no free slot");
    procs
        .init_idx
        .store(guard.idx as i32, Ordering::Release);

    {
        let data = guard.deref_mut_data();
        TargetHal::uvm_init(data.pagetable_mut(), &INITCODE);
        data.sz = PGSIZE;

        // Prepare for the very first "return" from kernel to user.
        let tf = unsafe { &mut *data.trap_frame };
        tf.set_pc(0); // user program counter
        tf.set_stack(PGSIZE); // user stack pointer

        data.name.push_str("initcode");
        data.cwd = Some(TargetHal::root_inode());
    }

    guard.proc.assigned_cpu.store(0, Ordering::Relaxed);
    guard.deref_mut_info().state = Procstate::RUNNABLE;
    kernel()
        .cpus
        .runq(0)
        .runnable
        .push(&procs.links, guard.idx);
}

/// Create a new process, copying the parent. Sets up the child to
/// return as if from the fork() system call.
pub fn fork() -> Result<i32, KernelError> {
    let p = myproc();
    assert!(!p.is_null(), "fork: no current process");
    let p = unsafe { &*p };
    let procs = &kernel().procs;

    let mut np = procs.alloc()?;

    // The parent's data is private to it while it runs; fork runs on
    // the parent's own kernel thread.
    let pdata = unsafe { &mut *p.data.get() };

    // Copy user memory from parent to child.
    {
        let ndata = np.deref_mut_data();
        if let Err(e) = TargetHal::uvm_copy(
            pdata.pagetable(),
            ndata.pagetable_mut(),
            pdata.sz,
        ) {
            procs.free(&mut np, None);
            return Err(e);
        }
        ndata.sz = pdata.sz;

        // Copy saved user registers; cause fork to return 0 in the
        // child.
        unsafe {
            *ndata.trap_frame = *pdata.trap_frame;
            (*ndata.trap_frame).set_ret_val(0);
        }

        // Increment reference counts on open file descriptors.
        for (nf, f) in ndata.open_files.iter_mut().zip(&pdata.open_files) {
            *nf = f.clone();
        }
        ndata.cwd = pdata.cwd.clone();
        ndata.name = pdata.name;
    }

    let pid = np.deref_info().pid;
    let child_idx = np.idx;

    // wait_lock comes before any slot lock, so drop the child first.
    drop(np);

    let child = &procs.pool[child_idx];
    {
        let mut wl = WAIT_LOCK.lock();
        *child.parent.get_mut(&mut wl) = p.idx as i32;

        let cpu = if BALANCE_MODE {
            let chosen = kernel().cpus.choose();
            kernel().cpus.runq(chosen).record_assignment();
            chosen
        } else {
            p.assigned_cpu()
        };
        child.assigned_cpu.store(cpu, Ordering::Relaxed);
    }

    let mut np = child.lock();
    np.deref_mut_info().state = Procstate::RUNNABLE;
    kernel()
        .cpus
        .runq(child.assigned_cpu())
        .runnable
        .push(&procs.links, child_idx);
    drop(np);

    Ok(pid)
}

/// Exit the current process; does not return. An exited process stays
/// a zombie until its parent calls wait().
pub fn exit(status: i32) -> ! {
    let procs = &kernel().procs;
    let p = myproc();
    assert!(!p.is_null(), "exit: no current process");
    let p = unsafe { &*p };
    assert_ne!(
        p.idx as i32,
        procs.init_idx.load(Ordering::Acquire),
        "init exiting"
    );

    {
        let data = unsafe { &mut *p.data.get() };

        // Close all open files.
        for f in data.open_files.iter_mut() {
            *f = None;
        }

        // The cwd inode goes back inside a log bracket.
        TargetHal::begin_op();
        let _op = scopeguard::guard((), |()| TargetHal::end_op());
        data.cwd = None;
    }

    let mut wl = WAIT_LOCK.lock();

    // Give any children to init.
    procs.reparent(p.idx, &mut wl);

    // The parent might be sleeping in wait().
    let parent_idx = *p.parent.get_mut(&mut wl);
    if parent_idx >= 0 {
        procs.pool[parent_idx as usize].child_chan.wakeup();
    }

    let mut guard = p.lock();
    guard.deref_mut_info().xstate = status;
    guard.deref_mut_info().state = Procstate::ZOMBIE;
    procs.zombie.push(&procs.links, p.idx);
    drop(wl);

    // Jump into the scheduler, never to return.
    unsafe { guard.sched() };
    unreachable!("zombie exit");
}

/// Wait for a child to exit and return its pid, copying the exit
/// status to user address `addr` when it is nonzero.
pub fn wait(addr: usize) -> Result<i32, KernelError> {
    let procs = &kernel().procs;
    let p = myproc();
    assert!(!p.is_null(), "wait: no current process");
    let p = unsafe { &*p };

    let mut wl = WAIT_LOCK.lock();

    loop {
        // Scan the table looking for exited children.
        let mut havekids = false;
        for np in procs.pool.iter() {
            if *np.parent.get_mut(&mut wl) != p.idx as i32 {
                continue;
            }
            // The child may still be in exit() or the context switch.
            let mut child = np.lock();
            havekids = true;
            if child.deref_info().state == Procstate::ZOMBIE {
                let pid = child.deref_info().pid;
                if addr != 0 {
                    let xstate = child.deref_info().xstate;
                    let pdata = unsafe { &mut *p.data.get() };
                    if TargetHal::copy_out(pdata.pagetable(), addr, &xstate.to_ne_bytes())
                        .is_err()
                    {
                        return Err(KernelError::BadAddress);
                    }
                }
                procs.free(&mut child, Some(&mut wl));
                return Ok(pid);
            }
            drop(child);
        }

        // No point waiting if we don't have any children.
        if !havekids {
            return Err(KernelError::NoChildren);
        }
        if p.killed() {
            return Err(KernelError::Killed);
        }

        // Wait for a child to exit.
        p.child_chan.sleep(&mut wl);
    }
}

/// Kill the process with the given pid. The victim won't exit until it
/// next tries to return to user space; a sleeping victim is woken so
/// it notices promptly. Killing twice is the same as killing once.
pub fn kill(pid: i32) -> Result<(), KernelError> {
    let procs = &kernel().procs;
    for p in procs.pool.iter() {
        let mut guard = p.lock();
        if guard.deref_info().pid == pid {
            p.killed.store(true, Ordering::Release);
            if guard.deref_info().state == Procstate::SLEEPING {
                // Wake it from sleep(), unless a wakeup got there
                // first.
                if procs.sleeping.remove(&procs.links, p.idx) {
                    guard.deref_mut_info().state = Procstate::RUNNABLE;
                    kernel()
                        .cpus
                        .runq(p.assigned_cpu())
                        .runnable
                        .push(&procs.links, p.idx);
                }
            }
            return Ok(());
        }
        drop(guard);
    }
    Err(KernelError::NotFound)
}

/// Per-CPU process scheduler; never returns. Each CPU pops its own
/// runnable queue, switches to the process, and takes back over when
/// the process calls `sched`.
pub fn scheduler() -> ! {
    let procs = &kernel().procs;
    let id = cpuid();
    let c = kernel().cpus.current_raw();
    unsafe { (*c).proc = ptr::null() };
    loop {
        // Let devices interrupt, so a full queue elsewhere cannot
        // starve this loop of wakeups.
        TargetHal::intr_on();

        let idx = match kernel().cpus.runq(id).runnable.pop(&procs.links) {
            Some(idx) => idx,
            None => {
                core::hint::spin_loop();
                continue;
            }
        };

        let p = &procs.pool[idx];
        let mut guard = p.lock();
        guard.deref_mut_info().state = Procstate::RUNNING;
        unsafe {
            (*c).proc = p;
            let pctx: *mut Context = &mut guard.deref_mut_data().context;
            TargetHal::context_switch(&mut (*c).context, pctx);

            // The process is done for now; it changed its own state
            // before coming back.
            (*c).proc = ptr::null();
        }
        drop(guard);
    }
}

/// Give up the CPU for one scheduling round.
pub fn proc_yield() {
    let p = myproc();
    assert!(!p.is_null(), "yield: no current process");
    let p = unsafe { &*p };
    let procs = &kernel().procs;

    let mut guard = p.lock();
    let cpu = p.assigned_cpu();
    guard.deref_mut_info().state = Procstate::RUNNABLE;
    kernel().cpus.runq(cpu).runnable.push(&procs.links, p.idx);
    unsafe { guard.sched() };
    drop(guard);
}

/// A fork child's very first scheduling lands here.
///
/// # Safety
///
/// Only the scheduler's first switch into a fresh process may call
/// this; the slot lock is still held from the scheduler.
pub unsafe fn forkret() {
    static FSINIT: Once = Once::new();

    // Still holding the slot lock from the scheduler.
    unsafe { (*myproc()).info.unlock() };

    // Filesystem initialization must run in the context of a regular
    // process (it may sleep), so it cannot run from main(); the first
    // process does it here.
    FSINIT.call_once(|| TargetHal::fs_init(ROOTDEV));

    unsafe { TargetHal::user_trap_ret() }
}

/// Grow or shrink user memory by `n` bytes.
pub fn growproc(n: isize) -> Result<(), KernelError> {
    let p = myproc();
    assert!(!p.is_null(), "growproc: no current process");
    let data = unsafe { &mut *(*p).data.get() };

    let sz = data.sz;
    if n > 0 {
        let newsz = TargetHal::uvm_alloc(data.pagetable_mut(), sz, sz + n as usize)?;
        data.sz = newsz;
    } else if n < 0 {
        let target = sz.saturating_sub(n.unsigned_abs());
        data.sz = TargetHal::uvm_dealloc(data.pagetable_mut(), sz, target);
    }
    Ok(())
}

/// Copy to either a user address (through the current process's page
/// table) or a kernel address.
pub fn either_copyout(user_dst: bool, dst: usize, src: &[u8]) -> Result<(), KernelError> {
    if user_dst {
        let p = myproc();
        assert!(!p.is_null(), "either_copyout: no current process");
        let data = unsafe { &*(*p).data.get() };
        TargetHal::copy_out(data.pagetable(), dst, src)
    } else {
        unsafe { ptr::copy_nonoverlapping(src.as_ptr(), dst as *mut u8, src.len()) };
        Ok(())
    }
}

/// Copy from either a user address or a kernel address.
pub fn either_copyin(dst: &mut [u8], user_src: bool, src: usize) -> Result<(), KernelError> {
    if user_src {
        let p = myproc();
        assert!(!p.is_null(), "either_copyin: no current process");
        let data = unsafe { &*(*p).data.get() };
        TargetHal::copy_in(data.pagetable(), dst, src)
    } else {
        unsafe { ptr::copy_nonoverlapping(src as *const u8, dst.as_mut_ptr(), dst.len()) };
        Ok(())
    }
}

/// Print a process listing to the console. Runs when a user types ^P;
/// no locks, to avoid wedging a stuck machine further.
pub fn procdump() {
    println!();
    for p in kernel().procs.pool.iter() {
        let (state, pid) = unsafe { (p.state(), p.pid()) };
        if state == Procstate::UNUSED {
            continue;
        }
        let name = unsafe { p.name() };
        println!("{} {} {}", pid, state.as_str(), name.as_str());
    }
}

/// The CPU the current process is assigned to.
pub fn get_cpu() -> usize {
    let p = myproc();
    assert!(!p.is_null(), "get_cpu: no current process");
    unsafe { (*p).assigned_cpu() }
}

/// Reassign the current process to `cpu` and yield so the migration
/// takes effect at once. Counts as a placement on the target CPU.
pub fn set_cpu(cpu: usize) -> Result<usize, KernelError> {
    if cpu >= NCPU {
        return Err(KernelError::BadCpu);
    }
    let p = myproc();
    assert!(!p.is_null(), "set_cpu: no current process");
    unsafe { (*p).assigned_cpu.store(cpu, Ordering::Relaxed) };
    kernel().cpus.runq(cpu).record_assignment();
    proc_yield();
    Ok(cpu)
}

#[cfg(test)]
mod tests {
    use std::vec::Vec;

    use super::*;
    use crate::test_support;

    static STAGE_CHAN: WaitChannel = WaitChannel::new();

    #[test]
    fn allocpid_monotone() {
        let _t = test_support::table();
        let procs = &kernel().procs;
        let a = procs.allocpid();
        let b = procs.allocpid();
        assert!(b > a);
    }

    #[test]
    fn table_starts_free_with_distinct_kstacks() {
        let _t = test_support::table();
        let procs = &kernel().procs;

        let mut drained = Vec::new();
        while let Some(idx) = procs.unused.pop(&procs.links) {
            drained.push(idx);
        }
        assert_eq!(drained.len(), NPROC);

        let mut kstacks: Vec<usize> = drained
            .iter()
            .map(|&i| unsafe { (*procs.pool[i].data.get()).kstack })
            .collect();
        kstacks.sort_unstable();
        kstacks.dedup();
        assert_eq!(kstacks.len(), NPROC);
        assert!(kstacks.iter().all(|&k| k != 0));

        for idx in drained {
            procs.unused.push(&procs.links, idx);
        }
    }

    #[test]
    fn alloc_exhaust_free_cycle() {
        let _t = test_support::table();
        let procs = &kernel().procs;

        let mut guards = Vec::new();
        for _ in 0..NPROC {
            let guard = procs.alloc().expect("table should have room");
            assert_eq!(guard.deref_info().state, Procstate::USED);
            assert!(guard.deref_info().pid > 0);
            guards.push(guard);
        }
        assert_eq!(procs.alloc().err(), Some(KernelError::OutOfProcs));

        for mut guard in guards {
            procs.free(&mut guard, None);
            assert_eq!(guard.deref_info().state, Procstate::UNUSED);
            assert_eq!(guard.deref_info().pid, 0);
        }

        // Slots are usable again.
        let mut guard = procs.alloc().expect("freed slots should recycle");
        procs.free(&mut guard, None);
    }

    #[test]
    fn kill_unknown_pid() {
        let _t = test_support::table();
        assert_eq!(kill(-42), Err(KernelError::NotFound));
    }

    #[test]
    fn wakeup_on_empty_list_is_noop() {
        let _t = test_support::table();
        STAGE_CHAN.wakeup();
    }

    #[test]
    fn wakeup_moves_staged_sleeper_to_a_runqueue() {
        let _t = test_support::table();
        let procs = &kernel().procs;

        let mut guard = procs.alloc().unwrap();
        let idx = guard.idx;
        guard.deref_mut_info().chan = STAGE_CHAN.addr();
        guard.deref_mut_info().state = Procstate::SLEEPING;
        procs.sleeping.push(&procs.links, idx);
        drop(guard);

        STAGE_CHAN.wakeup();

        let p = procs.slot(idx);
        assert_eq!(unsafe { p.state() }, Procstate::RUNNABLE);
        let cpu = p.assigned_cpu();
        assert_eq!(
            kernel().cpus.runq(cpu).runnable.pop(&procs.links),
            Some(idx)
        );

        let mut guard = p.lock();
        procs.free(&mut guard, None);
    }

    #[test]
    fn kill_dequeues_staged_sleeper() {
        let _t = test_support::table();
        let procs = &kernel().procs;

        let mut guard = procs.alloc().unwrap();
        let idx = guard.idx;
        let pid = guard.deref_info().pid;
        guard.proc.assigned_cpu.store(3, Ordering::Relaxed);
        guard.deref_mut_info().chan = STAGE_CHAN.addr();
        guard.deref_mut_info().state = Procstate::SLEEPING;
        procs.sleeping.push(&procs.links, idx);
        drop(guard);

        assert_eq!(kill(pid), Ok(()));
        let p = procs.slot(idx);
        assert!(p.killed());
        assert_eq!(unsafe { p.state() }, Procstate::RUNNABLE);
        // Kill repushes to the victim's own CPU; no rebalancing.
        assert_eq!(p.assigned_cpu(), 3);
        assert_eq!(kernel().cpus.runq(3).runnable.pop(&procs.links), Some(idx));

        // Second kill has nothing left to do but is still a match.
        assert_eq!(kill(pid), Ok(()));
        assert!(p.killed());

        let mut guard = p.lock();
        procs.free(&mut guard, None);
    }
}
