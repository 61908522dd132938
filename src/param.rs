//! Kernel parameters.

use static_assertions::const_assert;

/// Maximum number of processes.
pub const NPROC: usize = 64;

/// Maximum number of CPUs.
pub const NCPU: usize = 8;

/// Open files per process.
pub const NOFILE: usize = 16;

/// Device number of file system root disk.
pub const ROOTDEV: u32 = 1;

/// Bytes per page.
pub const PGSIZE: usize = 4096;

/// Maximum length of process name.
pub const MAXPROCNAME: usize = 16;

/// When set, fork and wakeup place processes on the least-loaded CPU;
/// otherwise a child inherits its parent's CPU and a woken process
/// returns to the one it was last assigned to.
pub const BALANCE_MODE: bool = cfg!(feature = "balance");

// Slot indices travel through the queues as i32 with -1 as the nil
// link.
const_assert!(NPROC < i32::MAX as usize);
const_assert!(NCPU >= 1);
