//! Hardware and subsystem seams.
//!
//! The scheduling core consumes its collaborators (virtual memory,
//! the page allocator, the context switch, trap return, the
//! filesystem, the console) through the traits below, the same way
//! the rest of a kernel would link them in. `TargetHal` names the port
//! the build runs on; the hosted `sim` port is the only one in-tree.

use core::fmt;

use bitflags::bitflags;

use crate::error::KernelError;

bitflags! {
    /// Page mapping permissions.
    pub struct MapPerm: u32 {
        const R = 1 << 0;
        const W = 1 << 1;
        const X = 1 << 2;
        const U = 1 << 3;
    }
}

/// Saved execution state of a kernel thread. The core only resets it
/// and points it at an entry with a stack; the port owns the layout.
pub trait ContextOps: Default + Send {
    /// Where the thread resumes when first switched to.
    fn set_ret_addr(&mut self, addr: usize);

    /// Top of the thread's kernel stack.
    fn set_stack(&mut self, sp: usize);
}

/// The saved user registers the core needs to touch.
pub trait TrapFrameOps: Copy + Send {
    /// Saved user program counter.
    fn set_pc(&mut self, pc: usize);

    /// Saved user stack pointer.
    fn set_stack(&mut self, sp: usize);

    /// The syscall return-value register.
    fn set_ret_val(&mut self, val: usize);
}

/// Kernel-thread plumbing: contexts, trap frames, the switch itself.
pub trait ProcPort {
    type Context: ContextOps;
    type TrapFrame: TrapFrameOps;

    /// Save the current callee-saved state into `old` and resume
    /// `new`.
    ///
    /// # Safety
    ///
    /// Both must point to valid contexts, and the caller must hold
    /// exactly the locks the scheduler protocol prescribes: the slot
    /// lock of the process being switched in or out, nothing else.
    unsafe fn context_switch(old: *mut Self::Context, new: *mut Self::Context);

    /// Resume the current process in user mode. Never returns.
    ///
    /// # Safety
    ///
    /// Must be called from a process's kernel thread with no locks
    /// held.
    unsafe fn user_trap_ret() -> !;
}

/// Interrupt control and CPU identity.
pub trait Interrupts {
    /// Which CPU is this? Only stable while interrupts are off.
    fn cpu_id() -> usize;

    fn intr_on();
    fn intr_off();
    fn intr_get() -> bool;
}

/// The virtual-address map the core assumes.
pub trait MemLayout {
    /// The trampoline code page is mapped here, at the highest user
    /// virtual address, in every user page table.
    const TRAMPOLINE: usize;

    /// The trapframe page sits just below the trampoline.
    const TRAPFRAME: usize;

    /// Kernel stack of process slot `i`: mapped high, each stack
    /// followed by an invalid guard page.
    fn kstack(i: usize) -> usize;

    /// Physical address of the trampoline code page.
    fn trampoline_pa() -> usize;

    /// Map a page range into the kernel's address space (boot only).
    ///
    /// # Safety
    ///
    /// `pa` must reference `size` bytes the caller owns; boot-time
    /// single-threaded use only.
    unsafe fn kvm_map(va: usize, pa: usize, size: usize, perm: MapPerm);
}

/// Physical page allocator.
pub trait PageAlloc {
    /// One zeroed page, or `None` when memory is exhausted.
    fn alloc_page() -> Option<usize>;

    /// # Safety
    ///
    /// `pa` came from `alloc_page` and nothing references it anymore.
    unsafe fn free_page(pa: usize);
}

/// User virtual memory.
pub trait UserVm {
    type PageTable: Send;

    /// An empty user page table.
    fn uvm_create() -> Option<Self::PageTable>;

    /// Map one page. The core maps only the trampoline and trapframe
    /// pages itself; user memory goes through `uvm_alloc`.
    fn map_page(
        pt: &mut Self::PageTable,
        va: usize,
        pa: usize,
        perm: MapPerm,
    ) -> Result<(), KernelError>;

    /// Unmap one page previously mapped with `map_page`.
    fn unmap_page(pt: &mut Self::PageTable, va: usize);

    /// Load the init image into the first user page; `src` fits one
    /// page.
    fn uvm_init(pt: &mut Self::PageTable, src: &[u8]);

    /// Grow user memory from `oldsz` to `newsz`; returns the new size.
    fn uvm_alloc(pt: &mut Self::PageTable, oldsz: usize, newsz: usize)
        -> Result<usize, KernelError>;

    /// Shrink user memory from `oldsz` to `newsz`; returns the new
    /// size.
    fn uvm_dealloc(pt: &mut Self::PageTable, oldsz: usize, newsz: usize) -> usize;

    /// Copy `sz` bytes of user memory into a fresh table (fork).
    fn uvm_copy(
        old: &Self::PageTable,
        new: &mut Self::PageTable,
        sz: usize,
    ) -> Result<(), KernelError>;

    /// Free user memory and the table itself. Panics if non-user
    /// leaves (trampoline, trapframe) are still mapped.
    fn uvm_free(pt: Self::PageTable, sz: usize);

    /// Copy `src` to user address `dst`.
    fn copy_out(pt: &Self::PageTable, dst: usize, src: &[u8]) -> Result<(), KernelError>;

    /// Fill `dst` from user address `src`.
    fn copy_in(pt: &Self::PageTable, dst: &mut [u8], src: usize) -> Result<(), KernelError>;
}

/// What the lifecycle needs from the filesystem: handle duplication is
/// `Clone`, closing is `Drop`, and inode puts happen inside a log
/// bracket.
pub trait FsPort {
    type File: Clone + Send;
    type Inode: Clone + Send;

    /// Inode of "/" for the first process's working directory.
    fn root_inode() -> Self::Inode;

    /// One-shot filesystem initialization; needs a process context
    /// because it may sleep.
    fn fs_init(dev: u32);

    /// Begin a filesystem log operation.
    fn begin_op();

    /// End a filesystem log operation.
    fn end_op();
}

/// Console output.
pub trait ConsolePort {
    fn console_write(args: fmt::Arguments<'_>);
}

/// A complete port.
pub trait Hal:
    ProcPort + Interrupts + MemLayout + PageAlloc + UserVm + FsPort + ConsolePort
{
}

cfg_if::cfg_if! {
    if #[cfg(any(test, feature = "sim"))] {
        pub mod sim;

        /// The port this build runs on.
        pub type TargetHal = sim::Sim;
    } else {
        compile_error!("mq6 needs a hal port; build with the `sim` feature");
    }
}
