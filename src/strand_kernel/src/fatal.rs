//! Fatal error handling
use core::fmt;

use crate::{thread::ThreadCb, Kernel, ThreadOptions};

/// The cause of a fatal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum FatalReason {
    /// A processor exception (e.g., a memory fault).
    CpuException,
    /// An interrupt with no registered handler.
    SpuriousIrq,
    /// A stack overflow was detected.
    StackCheckFail,
    /// A recoverable kernel error. Only the offending thread is terminated.
    KernelOops,
    /// An unrecoverable kernel error.
    KernelPanic,
}

impl FatalReason {
    /// Get a human-readable description of the reason.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CpuException => "CPU exception",
            Self::SpuriousIrq => "unhandled interrupt",
            Self::StackCheckFail => "stack overflow",
            Self::KernelOops => "kernel oops",
            Self::KernelPanic => "kernel panic",
        }
    }
}

impl fmt::Display for FatalReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Report a fatal error that occurred in the context of `thread` and
/// terminate the thread.
///
/// The system is halted (by panicking) instead if the reason is
/// [`FatalReason::KernelPanic`], if there's no offending thread, or if the
/// thread is essential.
///
/// Precondition: Kernel lock inactive
pub fn fatal_error<System: Kernel>(reason: FatalReason, thread: Option<&'static ThreadCb<System>>) {
    log::error!(
        "fatal error: {reason} (thread {:?})",
        thread.map(|t| t as *const ThreadCb<System>)
    );

    System::fatal_error_handler(reason, thread);

    let Some(thread) = thread else {
        panic!("fatal error in a non-thread context: {reason}");
    };

    let essential = thread
        .options()
        .map_or(true, |o| o.contains(ThreadOptions::ESSENTIAL));
    if reason == FatalReason::KernelPanic || essential {
        panic!("fatal error in an essential thread: {reason}");
    }

    log::warn!("aborting thread {:p}", thread);

    // Safety: The kernel lock is inactive
    unsafe { System::abort_thread(thread) };
}
