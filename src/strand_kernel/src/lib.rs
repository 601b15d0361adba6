//! The thread lifecycle core of the Strand RTOS kernel.
//!
//! This crate creates, starts, monitors, and retires threads whose control
//! blocks and stacks are supplied by the application (usually as `static`s).
//! It doesn't include a scheduler. Context switching, ready queues, and
//! timeout queues are provided by a port through the [`Port`] traits, and the
//! port reports context switch boundaries back through [`PortToKernel`].
//!
//! # Kernel lock
//!
//! All shared kernel state is protected by a single spinlock-class lock
//! provided by the port ([`PortThreading::try_enter_kernel_lock`]). It's never
//! held while calling back into the port's scheduler or into application code
//! except in [`monitor::foreach`].
//!
//! # Optional features
//!
//! | Feature          | Adds                                                  |
//! | ---------------- | ----------------------------------------------------- |
//! | `thread_monitor` | the thread registry ([`monitor`])                     |
//! | `thread_name`    | fixed-capacity thread names                           |
//! | `custom_data`    | a private pointer-sized slot per thread               |
//! | `runtime_stats`  | per-thread and aggregate execution cycles ([`stats`]) |
//! | `userspace`      | kernel objects, permissions, and memory domains       |
//! | `init_stacks`    | stack poisoning and [`stack::stack_space_get`]        |
//! | `stack_sentinel` | stack overflow detection                              |
//! | `sched_cpu_mask` | per-thread CPU affinity masks                         |
//!
//! When a feature is disabled, the corresponding fields are removed from
//! [`ThreadCb`] and the operations become no-ops or return `NotSupported`.
#![cfg_attr(not(test), no_std)] // Link `std` only when building a test (`cfg(test)`)
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::all)]
#![allow(clippy::new_without_default)]
use core::time::Duration;

pub mod utils;

mod error;

mod cfg;
pub mod device;
pub mod fatal;
mod klock;
#[cfg(feature = "userspace")]
pub mod kobj;
#[cfg(feature = "userspace")]
pub mod mem_domain;
pub mod monitor;
pub mod stack;
mod startup;
pub mod stats;
mod state;
pub mod thread;

pub use self::{
    cfg::*,
    error::*,
    fatal::FatalReason,
    klock::{
        assume_kernel_lock, lock_kernel, KernelLockCell, KernelLockGuard,
        KernelLockGuardBorrowMut, KernelLockKeyhole, KernelLockToken,
    },
    stack::{StackInfo, StackRef, ThreadStack, ThreadStackObj},
    startup::init_static_threads,
    state::State,
    thread::{ThreadAttr, ThreadCb, ThreadEntry, ThreadOptions, ThreadSt, Timeout},
};

/// Used by `build!`
#[doc(hidden)]
pub use core;

use crate::utils::Init;

/// Represents "system" types having sufficient trait `impl`s to instantiate the
/// kernel.
pub trait Kernel: Port + KernelCfg + Sized + Send + Sync + 'static {}
impl<T: Port + KernelCfg + Send + Sync + 'static> Kernel for T {}

/// Implemented by a port. This is a collection of all the `Port*` traits.
pub trait Port: PortThreading + PortScheduler + PortTimer {}
impl<T: PortThreading + PortScheduler + PortTimer> Port for T {}

/// Implemented by a port. Provides the per-thread context state, the stack
/// geometry, and the kernel lock.
///
/// # Safety
///
/// Implementing a port is inherently unsafe because it's responsible for
/// initializing the execution environment and providing a context switcher.
///
/// These methods are only meant to be called by the kernel.
pub unsafe trait PortThreading: Sized + Send + Sync + 'static {
    type PortThreadState: Send + Sync + Init + 'static;

    /// The alignment requirement for stack pointers and stack regions. Must be
    /// a power of two.
    const STACK_ALIGN: usize = 8;

    /// The number of bytes reserved at the lowest address of a kernel-only
    /// stack object (e.g., for a guard area). Must be a multiple of
    /// [`Self::STACK_ALIGN`].
    const KERNEL_STACK_RESERVED: usize = 0;

    /// The number of bytes reserved at the lowest address of a user-capable
    /// stack object. Usually larger than [`Self::KERNEL_STACK_RESERVED`]
    /// because it holds the privileged stack or an MPU guard. Must be a
    /// multiple of [`Self::STACK_ALIGN`].
    const THREAD_STACK_RESERVED: usize = 0;

    /// Indicates that stacks grow toward higher addresses.
    const STACK_GROWS_UP: bool = false;

    /// The exclusive upper bound of the pseudo-random offset subtracted from
    /// the initial stack pointer. `0` disables the randomization. Can't be
    /// combined with [`Self::STACK_GROWS_UP`].
    const STACK_POINTER_RANDOM: usize = 0;

    /// The size of the per-thread block carved out of the top of the stack
    /// for user-mode runtime data. `0` disables the block.
    const USERSPACE_LOCAL_DATA_SIZE: usize = 0;

    /// The number of processor cores.
    const NUM_CPUS: usize = 1;

    /// Prepare the thread for the first dispatch, ensuring that it will start
    /// execution from `entry(params[0], params[1], params[2])` with the stack
    /// pointer `stack_ptr` next time it receives the control.
    ///
    /// Precondition: Kernel lock inactive, the thread is in the Prestart state
    unsafe fn initialize_thread_state(
        thread: &'static ThreadCb<Self>,
        stack_ptr: usize,
        entry: ThreadEntry,
        params: [usize; 3],
    );

    /// Lay out the thread-local storage area just below `stack_ptr` and
    /// return its size in bytes.
    ///
    /// Precondition: Kernel lock inactive
    unsafe fn tls_stack_setup(thread: &'static ThreadCb<Self>, stack_ptr: usize) -> usize {
        let _ = (thread, stack_ptr);
        0
    }

    /// Get a pseudo-random number for stack pointer randomization.
    fn stack_random() -> usize {
        0
    }

    /// Drop the current thread to user mode and call `entry` on the stack
    /// pointer `stack_ptr`. Never returns.
    ///
    /// Precondition: Kernel lock inactive, a thread context
    unsafe fn user_mode_enter(entry: ThreadEntry, params: [usize; 3], stack_ptr: usize) -> !;

    /// Try to acquire the kernel lock. Return `false` if the current context
    /// already holds it. Spins while another context holds it.
    unsafe fn try_enter_kernel_lock() -> bool;

    /// Release the kernel lock previously acquired by
    /// `try_enter_kernel_lock`.
    ///
    /// Precondition: Kernel lock active
    unsafe fn leave_kernel_lock();

    /// Return a flag indicating whether the current context holds the kernel
    /// lock.
    fn is_kernel_lock_active() -> bool;

    /// Return a flag indicating whether the current context is an interrupt
    /// handler.
    fn is_in_isr() -> bool {
        false
    }
}

/// Implemented by a port. The scheduler and the timeout queue, which this
/// crate treats as external collaborators.
///
/// # Safety
///
/// These methods are only meant to be called by the kernel.
pub unsafe trait PortScheduler: PortThreading {
    /// Get the currently running thread. `None` during boot.
    fn current_thread() -> Option<&'static ThreadCb<Self>>;

    /// Make the thread eligible for scheduling.
    ///
    /// Precondition: Kernel lock inactive, the thread is in the Queued state
    unsafe fn start_thread(thread: &'static ThreadCb<Self>);

    /// Arrange [`thread::start`] to be called for the thread after `delay`
    /// elapses.
    ///
    /// Precondition: Kernel lock inactive, the thread is in the Prestart state
    unsafe fn add_thread_timeout(thread: &'static ThreadCb<Self>, delay: Duration);

    /// Prevent the current context from being preempted. Nestable.
    unsafe fn sched_lock();

    /// Undo one `sched_lock`. Threads made runnable in the meantime may be
    /// dispatched at this point.
    unsafe fn sched_unlock();

    /// Terminate the thread. May not return if the thread is the current one.
    ///
    /// Precondition: Kernel lock inactive
    unsafe fn abort_thread(thread: &'static ThreadCb<Self>);

    /// Called on a fatal error before the kernel terminates the offending
    /// thread (or the system). The port may halt or reset the system here.
    fn fatal_error_handler(reason: FatalReason, thread: Option<&'static ThreadCb<Self>>) {
        let _ = (reason, thread);
    }
}

/// Implemented by a port. A free-running cycle counter for runtime
/// statistics.
pub trait PortTimer {
    /// Read the cycle counter. It's allowed to wrap around.
    fn cycle_count() -> u32;
}

/// Methods intended to be called by a port.
///
/// # Safety
///
/// These are only meant to be called by the port.
pub trait PortToKernel: PortThreading {
    /// Called after the thread is switched in.
    ///
    /// Precondition: Kernel lock active
    unsafe fn thread_switched_in(thread: &'static ThreadCb<Self>);

    /// Called before the thread is switched out.
    ///
    /// Precondition: Kernel lock active
    unsafe fn thread_switched_out(thread: &'static ThreadCb<Self>);

    /// Update the scheduling state of the thread (e.g., `Pending` while it's
    /// blocked).
    ///
    /// Precondition: Kernel lock active
    unsafe fn set_thread_state(thread: &'static ThreadCb<Self>, st: ThreadSt);

    /// Called exactly once by the scheduler's teardown path after the thread
    /// has terminated. Moves the thread to the Dead state and removes it from
    /// the thread registry.
    ///
    /// Precondition: Kernel lock inactive
    unsafe fn thread_exited(thread: &'static ThreadCb<Self>);
}

impl<System: Kernel> PortToKernel for System {
    unsafe fn thread_switched_in(thread: &'static ThreadCb<Self>) {
        // Safety: The precondition of this method includes the kernel lock
        // being active
        let mut lock = unsafe { klock::assume_kernel_lock::<Self>() };
        stats::mark_switched_in(lock.borrow_mut(), thread);

        // Post-condition: Kernel lock active
        core::mem::forget(lock);
    }

    unsafe fn thread_switched_out(thread: &'static ThreadCb<Self>) {
        // Safety: The precondition of this method includes the kernel lock
        // being active
        let mut lock = unsafe { klock::assume_kernel_lock::<Self>() };
        stats::mark_switched_out(lock.borrow_mut(), thread);

        // Post-condition: Kernel lock active
        core::mem::forget(lock);
    }

    unsafe fn set_thread_state(thread: &'static ThreadCb<Self>, st: ThreadSt) {
        // Safety: The precondition of this method includes the kernel lock
        // being active
        let mut lock = unsafe { klock::assume_kernel_lock::<Self>() };
        thread::set_state(lock.borrow_mut(), thread, st);

        // Post-condition: Kernel lock active
        core::mem::forget(lock);
    }

    unsafe fn thread_exited(thread: &'static ThreadCb<Self>) {
        thread::retire(thread);
    }
}

/// Associates "system" types with kernel-private data. Use [`build!`] to
/// implement.
///
/// # Safety
///
/// This is only intended to be implemented by `build!`.
pub unsafe trait KernelCfg: Port + Sized {
    /// The number of cooperative (non-preemptible) priority levels. They are
    /// represented by the negative priorities `-NUM_COOP_PRIORITIES..0`.
    const NUM_COOP_PRIORITIES: i32;

    /// The number of preemptible priority levels, represented by
    /// `0..NUM_PREEMPT_PRIORITIES`. The priority `NUM_PREEMPT_PRIORITIES`
    /// itself is the idle priority, reserved for essential kernel threads.
    const NUM_PREEMPT_PRIORITIES: i32;

    /// Access the kernel's global state.
    fn state() -> &'static State<Self>;

    /// The build-time table of statically defined threads.
    fn static_threads() -> &'static [StaticThread<Self>];

    /// The build-time table of object access grants for static threads.
    #[cfg(feature = "userspace")]
    fn object_assignments() -> &'static [kobj::ObjectAssignment<Self>];

    /// The build-time table of device instances.
    fn devices() -> &'static [&'static device::Device];
}
