//! Runtime statistics
//!
//! The port reports every context switch through [`PortToKernel`]. On
//! switch-in, the cycle counter is recorded in the thread. On switch-out, the
//! elapsed cycles are added to the thread's total and to the aggregate total
//! of all threads. Dummy threads and threads that were never switched in are
//! not accounted.
//!
//! [`PortToKernel`]: crate::PortToKernel
use crate::{
    error::GetRuntimeStatsError,
    klock::KernelLockGuardBorrowMut,
    thread::ThreadCb,
    Kernel,
};

#[cfg(feature = "runtime_stats")]
use crate::{klock::lock_kernel, thread::ThreadSt, utils::Init};

/// Execution statistics of a thread or of the whole system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RuntimeStats {
    /// The accumulated number of cycles spent executing.
    pub execution_cycles: u64,
}

/// The per-thread bookkeeping.
#[cfg(feature = "runtime_stats")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ThreadUsage {
    /// The cycle count at the last switch-in. `None` if the thread isn't
    /// running.
    pub(crate) last_switched_in: Option<u32>,
    pub(crate) total: u64,
}

#[cfg(feature = "runtime_stats")]
impl Init for ThreadUsage {
    const INIT: Self = Self {
        last_switched_in: None,
        total: 0,
    };
}

pub(crate) fn mark_switched_in<System: Kernel>(
    mut lock: KernelLockGuardBorrowMut<'_, System>,
    thread: &'static ThreadCb<System>,
) {
    #[cfg(feature = "runtime_stats")]
    {
        let now = System::cycle_count();
        thread.usage.write(&mut *lock).last_switched_in = Some(now);
    }
    #[cfg(not(feature = "runtime_stats"))]
    let _ = (&mut lock, thread);
}

pub(crate) fn mark_switched_out<System: Kernel>(
    mut lock: KernelLockGuardBorrowMut<'_, System>,
    thread: &'static ThreadCb<System>,
) {
    #[cfg(feature = "runtime_stats")]
    {
        let now = System::cycle_count();
        if thread.st.get(&lock) == ThreadSt::Dummy {
            return;
        }

        let usage = thread.usage.write(&mut *lock);
        let Some(last_switched_in) = usage.last_switched_in.take() else {
            return;
        };
        let elapsed = now.wrapping_sub(last_switched_in) as u64;
        usage.total += elapsed;

        *System::state().all_thread_usage.write(&mut *lock) += elapsed;
    }
    #[cfg(not(feature = "runtime_stats"))]
    let _ = (&mut lock, thread);
}

/// Zero the statistics of a new thread.
pub(crate) fn reset<System: Kernel>(
    mut lock: KernelLockGuardBorrowMut<'_, System>,
    thread: &'static ThreadCb<System>,
) {
    #[cfg(feature = "runtime_stats")]
    thread.usage.replace(&mut lock, Init::INIT);
    #[cfg(not(feature = "runtime_stats"))]
    let _ = (&mut lock, thread);
}

/// Get the statistics of `thread`. Fails with `BadParam` if `thread` is
/// `None`.
pub fn thread_runtime_stats<System: Kernel>(
    thread: Option<&'static ThreadCb<System>>,
) -> Result<RuntimeStats, GetRuntimeStatsError> {
    let thread = thread.ok_or(GetRuntimeStatsError::BadParam)?;
    #[cfg(feature = "runtime_stats")]
    {
        let lock = lock_kernel::<System>()?;
        Ok(RuntimeStats {
            execution_cycles: thread.usage.read(&*lock).total,
        })
    }
    #[cfg(not(feature = "runtime_stats"))]
    {
        let _ = thread;
        Err(GetRuntimeStatsError::NotSupported)
    }
}

/// Get the aggregate statistics of all threads.
pub fn all_runtime_stats<System: Kernel>() -> Result<RuntimeStats, GetRuntimeStatsError> {
    #[cfg(feature = "runtime_stats")]
    {
        let lock = lock_kernel::<System>()?;
        Ok(RuntimeStats {
            execution_cycles: System::state().all_thread_usage.get(&lock),
        })
    }
    #[cfg(not(feature = "runtime_stats"))]
    Err(GetRuntimeStatsError::NotSupported)
}
