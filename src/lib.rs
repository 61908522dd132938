//! mq6: the process-lifecycle and multi-CPU scheduling core of a
//! Unix-like teaching kernel.
//!
//! The crate owns a fixed-size process table, per-CPU runnable queues,
//! and the global free/sleeping/zombie lists, and implements
//! fork/exit/wait, channel-based sleep and wakeup, asynchronous kill,
//! cooperative yield, and a per-CPU round-robin scheduler with
//! load-balanced placement. Everything the core consumes from the rest
//! of a kernel sits behind the seams in [`hal`]; the hosted `sim` port
//! (the default feature) runs the whole machine on the build host.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

#[cfg(any(test, feature = "sim"))]
extern crate std;

pub mod cpu;
pub mod error;
pub mod hal;
pub mod kernel;
pub mod list;
pub mod lock;
pub mod param;
pub mod proc;
