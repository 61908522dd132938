//! Kernel error codes.

use core::fmt;

/// Everything a lifecycle operation can fail with. The syscall shims
/// collapse all of these to `-1`; the distinctions exist for callers
/// inside the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// Every process slot is in use.
    OutOfProcs,
    /// A page or page-table allocation failed.
    OutOfMemory,
    /// wait() found no live children.
    NoChildren,
    /// The caller was killed while blocked.
    Killed,
    /// No process with the requested pid.
    NotFound,
    /// A user-memory copy failed.
    BadAddress,
    /// CPU index out of range.
    BadCpu,
}

impl KernelError {
    pub fn as_str(&self) -> &'static str {
        match self {
            KernelError::OutOfProcs => "out of proc slots",
            KernelError::OutOfMemory => "out of memory",
            KernelError::NoChildren => "no children",
            KernelError::Killed => "killed",
            KernelError::NotFound => "no such pid",
            KernelError::BadAddress => "bad user address",
            KernelError::BadCpu => "bad cpu index",
        }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The user-visible convention: every kernel error is -1.
impl From<KernelError> for i32 {
    fn from(_: KernelError) -> i32 {
        -1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_error_surfaces_as_minus_one() {
        let all = [
            KernelError::OutOfProcs,
            KernelError::OutOfMemory,
            KernelError::NoChildren,
            KernelError::Killed,
            KernelError::NotFound,
            KernelError::BadAddress,
            KernelError::BadCpu,
        ];
        for e in all {
            assert_eq!(i32::from(e), -1);
            assert!(!e.as_str().is_empty());
        }
    }
}
