//! The kernel singleton.

use core::fmt;

use spin::Lazy;

use crate::cpu::Cpus;
use crate::hal::{ConsolePort, TargetHal};
use crate::proc::Procs;

/// The process table, the CPU records, and nothing else: every other
/// subsystem sits behind the hal seams.
pub struct Kernel {
    pub procs: Procs,
    pub cpus: Cpus,
}

static KERNEL: Lazy<Kernel> = Lazy::new(Kernel::new);

/// The kernel is built on first touch, initialized once by `procinit`,
/// and never torn down.
#[inline]
pub fn kernel() -> &'static Kernel {
    &KERNEL
}

impl Kernel {
    fn new() -> Self {
        Self {
            procs: Procs::new(),
            cpus: Cpus::new(),
        }
    }
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments<'_>) {
    TargetHal::console_write(args);
}

/// print! prints to the console through the hal seam.
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::kernel::_print(format_args!($($arg)*))
    };
}

/// println! prints to the console through the hal seam.
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}
