//! The hosted port: runs the scheduling core on the build machine.
//!
//! Kernel contexts are OS threads. The context-switch primitive parks
//! the switching thread and resumes (or first spawns) the target,
//! handing the logical CPU identity over with it, so at any moment
//! each logical CPU has exactly one runnable host thread, the same
//! shape the real switch has on hardware. Interrupt state is a per-CPU
//! flag, pages are heap blocks, and user addresses are
//! identity-mapped, so copies move bytes directly.
//!
//! A process's "user half" is a closure registered per pid. The
//! trap-return seam runs it with the kill check a trap handler
//! performs at the user boundary, then exits with its status. Tests
//! drive whole lifecycles this way.

use core::cell::Cell;
use core::mem;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicIsize, AtomicUsize, Ordering};

use std::boxed::Box;
use std::collections::BTreeMap;
use std::format;
use std::io::Write;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use array_macro::array;

use super::{
    ConsolePort, ContextOps, FsPort, Hal, Interrupts, MapPerm, MemLayout, PageAlloc, ProcPort,
    TrapFrameOps, UserVm,
};
use crate::error::KernelError;
use crate::param::{NCPU, PGSIZE, ROOTDEV};
use crate::proc;

pub struct Sim;

impl Hal for Sim {}

// ------------------------------------------------------------------
// CPU identity and interrupts.

std::thread_local! {
    static CPU_ID: Cell<usize> = Cell::new(usize::MAX);
}

static NEXT_CPU: AtomicUsize = AtomicUsize::new(0);
static INTR: [AtomicBool; NCPU] = array![_ => AtomicBool::new(false); NCPU];

fn cpu_slot() -> usize {
    CPU_ID.with(|c| {
        if c.get() == usize::MAX {
            // Stray host threads (the test harness) get an identity
            // lazily; kernel threads are pinned explicitly.
            c.set(NEXT_CPU.fetch_add(1, Ordering::Relaxed) % NCPU);
        }
        c.get()
    })
}

/// Pin the calling thread to logical CPU `id`. Scheduler threads and
/// test workers use this; context switches hand the id over on their
/// own.
pub fn pin_cpu(id: usize) {
    assert!(id < NCPU, "pin_cpu: no such cpu");
    CPU_ID.with(|c| c.set(id));
}

impl Interrupts for Sim {
    fn cpu_id() -> usize {
        cpu_slot()
    }

    fn intr_on() {
        INTR[cpu_slot()].store(true, Ordering::Release);
        // An interrupts-enabled window is also where the host may
        // preempt us.
        thread::yield_now();
    }

    fn intr_off() {
        INTR[cpu_slot()].store(false, Ordering::Release);
    }

    fn intr_get() -> bool {
        INTR[cpu_slot()].load(Ordering::Acquire)
    }
}

// ------------------------------------------------------------------
// Kernel contexts and the switch.

struct Park {
    /// `Some(cpu)` once the parked thread may resume, carrying the
    /// logical CPU it resumes on.
    resume: Mutex<Option<usize>>,
    cv: Condvar,
}

impl Park {
    fn new() -> Self {
        Self {
            resume: Mutex::new(None),
            cv: Condvar::new(),
        }
    }
}

/// A kernel thread's saved position: a parked OS thread, or the entry
/// point of one not yet spawned.
pub struct Context {
    park: Option<Arc<Park>>,
    entry: usize,
    /// Stack top, recorded for parity with a hardware context; the
    /// host thread brings its own stack.
    pub sp: usize,
}

impl Default for Context {
    fn default() -> Self {
        Self {
            park: None,
            entry: 0,
            sp: 0,
        }
    }
}

impl ContextOps for Context {
    fn set_ret_addr(&mut self, addr: usize) {
        self.entry = addr;
    }

    fn set_stack(&mut self, sp: usize) {
        self.sp = sp;
    }
}

/// The saved user registers this port bothers to model.
#[derive(Clone, Copy, Default)]
pub struct TrapFrame {
    pub epc: usize,
    pub sp: usize,
    pub a0: usize,
}

impl TrapFrameOps for TrapFrame {
    fn set_pc(&mut self, pc: usize) {
        self.epc = pc;
    }

    fn set_stack(&mut self, sp: usize) {
        self.sp = sp;
    }

    fn set_ret_val(&mut self, val: usize) {
        self.a0 = val;
    }
}

impl ProcPort for Sim {
    type Context = Context;
    type TrapFrame = TrapFrame;

    unsafe fn context_switch(old: *mut Context, new: *mut Context) {
        let park = Arc::new(Park::new());
        let cpu = cpu_slot();

        // Publish our own continuation before waking the target: it
        // may switch right back into `old`.
        let target = unsafe {
            (*old).park = Some(park.clone());
            (*old).entry = 0;
            ((*new).park.take(), (*new).entry)
        };

        match target {
            (Some(t), _) => {
                let mut resume = t.resume.lock().unwrap();
                *resume = Some(cpu);
                t.cv.notify_one();
            }
            (None, entry) if entry != 0 => {
                // First switch into a fresh process: give it a thread.
                let _ = thread::Builder::new()
                    .name(format!("kproc@cpu{}", cpu))
                    .spawn(move || {
                        pin_cpu(cpu);
                        let entry: unsafe fn() = unsafe { mem::transmute(entry) };
                        unsafe { entry() };
                    })
                    .expect("context_switch: spawn failed");
            }
            _ => panic!("context_switch: target context is dead"),
        }

        let mut resume = park.resume.lock().unwrap();
        while resume.is_none() {
            resume = park.cv.wait(resume).unwrap();
        }
        pin_cpu(resume.expect("resumed without a cpu"));
    }

    unsafe fn user_trap_ret() -> ! {
        user_mode()
    }
}

// ------------------------------------------------------------------
// The "user half" of a process.

type Program = Box<dyn FnOnce() -> i32 + Send>;

static PROGRAMS: Mutex<BTreeMap<i32, Program>> = Mutex::new(BTreeMap::new());

/// Register pid's user program; the trap-return seam will run it.
pub fn install_program<F>(pid: i32, program: F)
where
    F: FnOnce() -> i32 + Send + 'static,
{
    PROGRAMS.lock().unwrap().insert(pid, Box::new(program));
}

/// Fork, register the child's program, and return the child pid.
pub fn fork_program<F>(program: F) -> Result<i32, KernelError>
where
    F: FnOnce() -> i32 + Send + 'static,
{
    let pid = proc::fork()?;
    install_program(pid, program);
    Ok(pid)
}

/// The current process's pid.
pub fn my_pid() -> i32 {
    let p = proc::myproc();
    assert!(!p.is_null(), "my_pid: no current process");
    unsafe { (*p).pid() }
}

/// Whether the current process has been killed.
pub fn killed() -> bool {
    let p = proc::myproc();
    assert!(!p.is_null(), "killed: no current process");
    unsafe { (*p).killed() }
}

/// A real port would drop to user instructions here; this one runs
/// the registered program, with the kill check a trap handler makes at
/// every user boundary.
fn user_mode() -> ! {
    loop {
        let p = proc::myproc();
        assert!(!p.is_null(), "user_mode: no current process");
        let p = unsafe { &*p };
        if p.killed() {
            proc::exit(-1);
        }

        let pid = unsafe { p.pid() };
        let program = PROGRAMS.lock().unwrap().remove(&pid);
        match program {
            Some(program) => {
                let status = program();
                if p.killed() {
                    proc::exit(-1);
                }
                proc::exit(status);
            }
            // fork can schedule the child before the parent has
            // registered its program; wait for it to appear.
            None => thread::sleep(Duration::from_millis(1)),
        }
    }
}

// ------------------------------------------------------------------
// Memory layout and physical pages.

const MAXVA: usize = 1 << 38;

static TRAMPOLINE_PAGE: [u8; PGSIZE] = [0; PGSIZE];

static KVM: Mutex<BTreeMap<usize, (usize, usize, MapPerm)>> = Mutex::new(BTreeMap::new());

impl MemLayout for Sim {
    const TRAMPOLINE: usize = MAXVA - PGSIZE;
    const TRAPFRAME: usize = MAXVA - 2 * PGSIZE;

    fn kstack(i: usize) -> usize {
        Self::TRAMPOLINE - (i + 1) * 2 * PGSIZE
    }

    fn trampoline_pa() -> usize {
        TRAMPOLINE_PAGE.as_ptr() as usize
    }

    unsafe fn kvm_map(va: usize, pa: usize, size: usize, perm: MapPerm) {
        let old = KVM.lock().unwrap().insert(va, (pa, size, perm));
        assert!(old.is_none(), "kvm_map: remap of {:#x}", va);
    }
}

/// The kernel mapping installed at `va`, if any.
pub fn kvm_lookup(va: usize) -> Option<(usize, usize, MapPerm)> {
    KVM.lock().unwrap().get(&va).copied()
}

#[repr(C, align(4096))]
struct Page([u8; PGSIZE]);

impl PageAlloc for Sim {
    fn alloc_page() -> Option<usize> {
        let page: Box<Page> = Box::new(Page([0; PGSIZE]));
        Some(Box::into_raw(page) as usize)
    }

    unsafe fn free_page(pa: usize) {
        drop(unsafe { Box::from_raw(pa as *mut Page) });
    }
}

// ------------------------------------------------------------------
// User virtual memory.

struct Mapping {
    pa: usize,
    perm: MapPerm,
    /// User pages are owned and freed with the table; the trampoline
    /// and trapframe pages are not.
    owned: bool,
}

/// VA → page map. User addresses are identity-mapped on the host, so
/// the page content only matters to uvm_copy's bookkeeping.
pub struct PageTable {
    maps: BTreeMap<usize, Mapping>,
}

fn pgroundup(a: usize) -> usize {
    (a + PGSIZE - 1) & !(PGSIZE - 1)
}

impl UserVm for Sim {
    type PageTable = PageTable;

    fn uvm_create() -> Option<PageTable> {
        Some(PageTable {
            maps: BTreeMap::new(),
        })
    }

    fn map_page(
        pt: &mut PageTable,
        va: usize,
        pa: usize,
        perm: MapPerm,
    ) -> Result<(), KernelError> {
        let old = pt.maps.insert(
            va,
            Mapping {
                pa,
                perm,
                owned: false,
            },
        );
        assert!(old.is_none(), "map_page: remap of {:#x}", va);
        Ok(())
    }

    fn unmap_page(pt: &mut PageTable, va: usize) {
        let m = pt.maps.remove(&va);
        assert!(m.is_some(), "unmap_page: {:#x} not mapped", va);
    }

    fn uvm_init(pt: &mut PageTable, src: &[u8]) {
        assert!(src.len() <= PGSIZE, "uvm_init: more than a page");
        let pa = Self::alloc_page().expect("uvm_init: out of pages");
        unsafe { ptr::copy_nonoverlapping(src.as_ptr(), pa as *mut u8, src.len()) };
        let old = pt.maps.insert(
            0,
            Mapping {
                pa,
                perm: MapPerm::R | MapPerm::W | MapPerm::X | MapPerm::U,
                owned: true,
            },
        );
        assert!(old.is_none(), "uvm_init: first page mapped twice");
    }

    fn uvm_alloc(
        pt: &mut PageTable,
        oldsz: usize,
        newsz: usize,
    ) -> Result<usize, KernelError> {
        if newsz < oldsz {
            return Ok(oldsz);
        }
        let mut va = pgroundup(oldsz);
        while va < newsz {
            match Self::alloc_page() {
                Some(pa) => {
                    pt.maps.insert(
                        va,
                        Mapping {
                            pa,
                            perm: MapPerm::R | MapPerm::W | MapPerm::X | MapPerm::U,
                            owned: true,
                        },
                    );
                }
                None => {
                    let _ = Self::uvm_dealloc(pt, va, oldsz);
                    return Err(KernelError::OutOfMemory);
                }
            }
            va += PGSIZE;
        }
        Ok(newsz)
    }

    fn uvm_dealloc(pt: &mut PageTable, oldsz: usize, newsz: usize) -> usize {
        if newsz >= oldsz {
            return oldsz;
        }
        let mut va = pgroundup(newsz);
        while va < oldsz {
            if let Some(m) = pt.maps.remove(&va) {
                assert!(m.owned, "uvm_dealloc: freeing a borrowed page");
                unsafe { Self::free_page(m.pa) };
            }
            va += PGSIZE;
        }
        newsz
    }

    fn uvm_copy(old: &PageTable, new: &mut PageTable, sz: usize) -> Result<(), KernelError> {
        let mut va = 0;
        while va < sz {
            let m = old.maps.get(&va).expect("uvm_copy: page not present");
            match Self::alloc_page() {
                Some(pa) => {
                    unsafe {
                        ptr::copy_nonoverlapping(m.pa as *const u8, pa as *mut u8, PGSIZE)
                    };
                    new.maps.insert(
                        va,
                        Mapping {
                            pa,
                            perm: m.perm,
                            owned: true,
                        },
                    );
                }
                None => {
                    let _ = Self::uvm_dealloc(new, va, 0);
                    return Err(KernelError::OutOfMemory);
                }
            }
            va += PGSIZE;
        }
        Ok(())
    }

    fn uvm_free(mut pt: PageTable, sz: usize) {
        let _ = Self::uvm_dealloc(&mut pt, pgroundup(sz), 0);
        // Anything left is a borrowed leaf the caller forgot to unmap.
        assert!(pt.maps.is_empty(), "uvm_free: leaf mappings remain");
    }

    fn copy_out(_pt: &PageTable, dst: usize, src: &[u8]) -> Result<(), KernelError> {
        if dst < PGSIZE {
            // The null guard page is never writable.
            return Err(KernelError::BadAddress);
        }
        unsafe { ptr::copy_nonoverlapping(src.as_ptr(), dst as *mut u8, src.len()) };
        Ok(())
    }

    fn copy_in(_pt: &PageTable, dst: &mut [u8], src: usize) -> Result<(), KernelError> {
        if src < PGSIZE {
            return Err(KernelError::BadAddress);
        }
        unsafe { ptr::copy_nonoverlapping(src as *const u8, dst.as_mut_ptr(), dst.len()) };
        Ok(())
    }
}

// ------------------------------------------------------------------
// Filesystem handles and the log bracket.

#[derive(Clone)]
pub struct File {
    _inner: Arc<()>,
}

#[derive(Clone)]
pub struct Inode {
    _path: Arc<str>,
}

static FS_INITS: AtomicUsize = AtomicUsize::new(0);
static FS_OPS: AtomicIsize = AtomicIsize::new(0);

impl FsPort for Sim {
    type File = File;
    type Inode = Inode;

    fn root_inode() -> Inode {
        Inode {
            _path: Arc::from("/"),
        }
    }

    fn fs_init(dev: u32) {
        assert_eq!(dev, ROOTDEV, "fs_init: unexpected device");
        FS_INITS.fetch_add(1, Ordering::SeqCst);
    }

    fn begin_op() {
        FS_OPS.fetch_add(1, Ordering::SeqCst);
    }

    fn end_op() {
        let prev = FS_OPS.fetch_sub(1, Ordering::SeqCst);
        assert!(prev > 0, "end_op: unbalanced");
    }
}

/// How many times the one-shot filesystem init has run.
pub fn fs_init_count() -> usize {
    FS_INITS.load(Ordering::SeqCst)
}

/// Whether every begin_op has been matched by an end_op.
pub fn log_quiesced() -> bool {
    FS_OPS.load(Ordering::SeqCst) == 0
}

// ------------------------------------------------------------------
// Console and boot.

impl ConsolePort for Sim {
    fn console_write(args: core::fmt::Arguments<'_>) {
        let stdout = std::io::stdout();
        let mut handle = stdout.lock();
        let _ = handle.write_fmt(args);
    }
}

/// Map the kernel stacks, initialize the table, create the first
/// process. Kept separate from `run_schedulers` so boot-state
/// assertions can run in between.
pub fn init_kernel() {
    proc::proc_mapstacks();
    proc::procinit();
    proc::userinit();
}

/// Start one scheduler thread per CPU. They never exit; neither does
/// the kernel.
pub fn run_schedulers() {
    for i in 0..NCPU {
        let _ = thread::Builder::new()
            .name(format!("scheduler{}", i))
            .spawn(move || {
                pin_cpu(i);
                proc::scheduler();
            })
            .expect("run_schedulers: spawn failed");
    }
}
