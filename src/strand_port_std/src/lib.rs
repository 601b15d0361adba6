//! Simulation environment for running the Strand kernel on a hosted
//! environment.
//!
//! This port doesn't switch contexts. A thread's entry function runs to
//! completion on the host thread that makes the thread runnable, and timeouts
//! fire only when [`advance`] is called. This makes the behavior of the kernel
//! fully deterministic, which is what the tests in this crate rely on.
//!
//! ```rust,ignore
//! strand_port_std::use_port!(unsafe pub struct System);
//! strand_kernel::build!(System);
//! ```
#![deny(unsafe_op_in_unsafe_fn)]
use spin::Mutex as SpinMutex;
use std::{
    fmt,
    sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
    thread::ThreadId as HostThreadId,
    time::Duration,
};
use strand_kernel::{
    utils::Init, FatalReason, Kernel, PortThreading, PortToKernel, ThreadCb, ThreadEntry, ThreadSt,
};

mod sched;

use self::sched::Sched;

/// Used by `use_port!`
#[doc(hidden)]
pub extern crate strand_kernel;

/// Implemented on a system type by [`use_port!`].
///
/// # Safety
///
/// Only meant to be implemented by [`use_port!`].
#[doc(hidden)]
pub unsafe trait PortInstance: Kernel + PortThreading<PortThreadState = ThreadState> {
    fn port_state() -> &'static State<Self>;
}

/// The internal state of the port.
///
/// # Safety
///
/// For the safety information of this type's methods, see the documentation of
/// the corresponding trait methods of `Port*`.
#[doc(hidden)]
pub struct State<Traits: PortThreading> {
    /// The host thread holding the kernel lock.
    kernel_lock: SpinMutex<Option<HostThreadId>>,
    sched: SpinMutex<Sched<Traits>>,
    cycle_count: AtomicU32,
    stack_random: AtomicUsize,
    tls_size: AtomicUsize,
    in_isr: AtomicBool,
    events: SpinMutex<Vec<Event>>,
}

/// The port-specific per-thread state.
pub struct ThreadState {
    /// The initial context. Set by `initialize_thread_state` and consumed
    /// when the thread is dispatched.
    frame: SpinMutex<Option<EntryFrame>>,
}

#[derive(Clone, Copy)]
struct EntryFrame {
    entry: ThreadEntry,
    params: [usize; 3],
}

impl Init for ThreadState {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();
}

impl ThreadState {
    pub const fn new() -> Self {
        Self {
            frame: SpinMutex::new(None),
        }
    }

    /// Return `true` if the thread has a context that hasn't been dispatched
    /// yet.
    pub fn is_dormant(&self) -> bool {
        self.frame.lock().is_some()
    }
}

impl fmt::Debug for ThreadState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ThreadState")
            .field("dormant", &self.is_dormant())
            .finish()
    }
}

/// Identifies a thread in an [`Event`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadId(usize);

impl ThreadId {
    pub fn of<Traits: PortThreading>(thread: &ThreadCb<Traits>) -> Self {
        Self(thread as *const ThreadCb<Traits> as usize)
    }
}

impl fmt::Debug for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ThreadId({:#x})", self.0)
    }
}

/// Something the kernel asked the port to do, recorded in the order it
/// happened. See [`events`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// `initialize_thread_state`
    Initialized { thread: ThreadId, stack_ptr: usize },
    /// `start_thread`
    Started(ThreadId),
    /// `add_thread_timeout`
    TimeoutAdded { thread: ThreadId, delay: Duration },
    /// The thread's entry function was called.
    Ran(ThreadId),
    /// The thread terminated and was reported to the kernel.
    Exited(ThreadId),
    /// `abort_thread`
    Aborted(ThreadId),
    SchedLocked,
    SchedUnlocked,
    /// `user_mode_enter`
    UserModeEntered { thread: Option<ThreadId>, stack_ptr: usize },
    /// `fatal_error_handler`
    Fatal {
        reason: FatalReason,
        thread: Option<ThreadId>,
    },
}

/// The payload used to unwind out of a thread that terminates itself.
struct ThreadExit;

#[allow(clippy::missing_safety_doc)]
impl<Traits: PortInstance> State<Traits> {
    #[allow(clippy::new_without_default)]
    pub const fn new() -> Self {
        Self {
            kernel_lock: SpinMutex::new(None),
            sched: SpinMutex::new(Sched::new()),
            cycle_count: AtomicU32::new(0),
            stack_random: AtomicUsize::new(0),
            tls_size: AtomicUsize::new(0),
            in_isr: AtomicBool::new(false),
            events: SpinMutex::new(Vec::new()),
        }
    }

    fn record(&self, event: Event) {
        log::trace!("{event:?}");
        self.events.lock().push(event);
    }

    pub unsafe fn initialize_thread_state(
        &self,
        thread: &'static ThreadCb<Traits>,
        stack_ptr: usize,
        entry: ThreadEntry,
        params: [usize; 3],
    ) {
        assert!(!self.is_kernel_lock_active());
        *thread.port_thread_state.frame.lock() = Some(EntryFrame { entry, params });
        self.record(Event::Initialized {
            thread: ThreadId::of(thread),
            stack_ptr,
        });
    }

    pub unsafe fn try_enter_kernel_lock(&self) -> bool {
        let me = std::thread::current().id();
        loop {
            let mut owner = self.kernel_lock.lock();
            match *owner {
                None => {
                    *owner = Some(me);
                    return true;
                }
                Some(id) if id == me => return false,
                Some(_) => {}
            }
            drop(owner);
            std::thread::yield_now();
        }
    }

    pub unsafe fn leave_kernel_lock(&self) {
        let mut owner = self.kernel_lock.lock();
        assert_eq!(*owner, Some(std::thread::current().id()));
        *owner = None;
    }

    pub fn is_kernel_lock_active(&self) -> bool {
        *self.kernel_lock.lock() == Some(std::thread::current().id())
    }

    pub fn is_in_isr(&self) -> bool {
        self.in_isr.load(Ordering::Relaxed)
    }

    pub fn current_thread(&self) -> Option<&'static ThreadCb<Traits>> {
        self.sched.lock().current
    }

    pub unsafe fn start_thread(&'static self, thread: &'static ThreadCb<Traits>) {
        assert!(!self.is_kernel_lock_active());
        self.record(Event::Started(ThreadId::of(thread)));

        let mut sched = self.sched.lock();
        if sched.sched_locked > 0 {
            log::trace!("scheduler locked; deferring {thread:p}");
            sched.deferred.push(thread);
            return;
        }
        drop(sched);

        self.run(thread);
    }

    pub unsafe fn add_thread_timeout(&self, thread: &'static ThreadCb<Traits>, delay: Duration) {
        assert!(!self.is_kernel_lock_active());
        self.sched.lock().add_timeout(thread, delay);
        self.record(Event::TimeoutAdded {
            thread: ThreadId::of(thread),
            delay,
        });
    }

    pub unsafe fn sched_lock(&self) {
        self.sched.lock().sched_locked += 1;
        self.record(Event::SchedLocked);
    }

    pub unsafe fn sched_unlock(&'static self) {
        {
            let mut sched = self.sched.lock();
            assert!(sched.sched_locked > 0, "unbalanced `sched_unlock`");
            sched.sched_locked -= 1;
        }
        self.record(Event::SchedUnlocked);

        loop {
            let mut batch = {
                let mut sched = self.sched.lock();
                if sched.sched_locked > 0 {
                    break;
                }
                std::mem::take(&mut sched.deferred)
            };
            if batch.is_empty() {
                break;
            }

            // The most urgent thread runs first. `sort_by_key` is stable, so
            // threads of the same priority run in the order they were started.
            batch.sort_by_key(|t| t.priority().unwrap_or(i32::MAX));
            for thread in batch {
                self.run(thread);
            }
        }
    }

    pub unsafe fn abort_thread(&self, thread: &'static ThreadCb<Traits>) {
        assert!(!self.is_kernel_lock_active());
        self.record(Event::Aborted(ThreadId::of(thread)));

        let is_current = {
            let mut sched = self.sched.lock();
            sched.forget(thread);
            sched.current.map_or(false, |c| std::ptr::eq(c, thread))
        };

        if is_current {
            // Unwind to `run`, which reports the termination
            std::panic::resume_unwind(Box::new(ThreadExit));
        }

        // The thread never ran. Discard its context.
        *thread.port_thread_state.frame.lock() = None;
        self.exit(thread);
    }

    pub unsafe fn user_mode_enter(&self, entry: ThreadEntry, params: [usize; 3], stack_ptr: usize) -> ! {
        assert!(!self.is_kernel_lock_active());
        self.record(Event::UserModeEntered {
            thread: self.current_thread().map(ThreadId::of),
            stack_ptr,
        });

        entry(params[0], params[1], params[2]);

        // Unwind to `run`, which reports the termination
        std::panic::resume_unwind(Box::new(ThreadExit));
    }

    pub fn fatal_error_handler(&self, reason: FatalReason, thread: Option<&'static ThreadCb<Traits>>) {
        self.record(Event::Fatal {
            reason,
            thread: thread.map(ThreadId::of),
        });
    }

    pub fn cycle_count(&self) -> u32 {
        self.cycle_count.load(Ordering::Relaxed)
    }

    pub fn stack_random(&self) -> usize {
        self.stack_random.load(Ordering::Relaxed)
    }

    pub unsafe fn tls_stack_setup(&self, thread: &'static ThreadCb<Traits>, stack_ptr: usize) -> usize {
        let size = self.tls_size.load(Ordering::Relaxed);
        log::trace!("TLS area of {thread:p}: {size} bytes below {stack_ptr:#x}");
        size
    }

    /// Run `thread`'s entry function to completion, then report its
    /// termination to the kernel.
    fn run(&'static self, thread: &'static ThreadCb<Traits>) {
        let frame = thread
            .port_thread_state
            .frame
            .lock()
            .take()
            .unwrap_or_else(|| panic!("thread {thread:p} has no initial context"));

        let prev = std::mem::replace(&mut self.sched.lock().current, Some(thread));
        if let Some(prev) = prev {
            self.switch_out(prev);
        }
        self.switch_in(thread);

        log::debug!("thread {thread:p} is now running");
        self.record(Event::Ran(ThreadId::of(thread)));

        let result = std::panic::catch_unwind(|| {
            (frame.entry)(frame.params[0], frame.params[1], frame.params[2])
        });

        self.switch_out(thread);
        self.sched.lock().current = prev;
        if let Some(prev) = prev {
            self.switch_in(prev);
        }

        match result {
            Ok(()) => {}
            Err(e) if e.is::<ThreadExit>() => {}
            Err(e) => std::panic::resume_unwind(e),
        }

        self.exit(thread);
    }

    fn switch_in(&self, thread: &'static ThreadCb<Traits>) {
        let lock = strand_kernel::lock_kernel::<Traits>().unwrap();
        // Safety: The kernel lock is active
        unsafe { <Traits as PortToKernel>::thread_switched_in(thread) };
        drop(lock);
    }

    fn switch_out(&self, thread: &'static ThreadCb<Traits>) {
        let lock = strand_kernel::lock_kernel::<Traits>().unwrap();
        // Safety: The kernel lock is active
        unsafe { <Traits as PortToKernel>::thread_switched_out(thread) };
        drop(lock);
    }

    fn exit(&self, thread: &'static ThreadCb<Traits>) {
        self.record(Event::Exited(ThreadId::of(thread)));
        // Safety: The kernel lock is inactive, and this is the only place
        // reporting the termination
        unsafe { <Traits as PortToKernel>::thread_exited(thread) };
    }
}

/// Initialize `env_logger` for the current process. Does nothing if it has
/// already been initialized.
pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Bring up the kernel: initialize the devices of every init level and create
/// the static threads.
pub fn boot<Traits: PortInstance>() {
    use strand_kernel::device::{init_devices, InitLevel};

    init_logger();
    log::debug!("booting");

    init_devices::<Traits>(InitLevel::PreKernel1).unwrap();
    init_devices::<Traits>(InitLevel::PreKernel2).unwrap();
    init_devices::<Traits>(InitLevel::PostKernel).unwrap();
    strand_kernel::init_static_threads::<Traits>().unwrap();
    init_devices::<Traits>(InitLevel::Application).unwrap();
}

/// Advance the simulated time by `duration`, starting every thread whose
/// delay has elapsed.
pub fn advance<Traits: PortInstance>(duration: Duration) {
    let state = Traits::port_state();
    let expired = state.sched.lock().advance(duration);
    for thread in expired {
        log::trace!("timeout elapsed for {thread:p}");
        strand_kernel::thread::start(thread).unwrap();
    }
}

/// Get the simulated time elapsed since the system started.
pub fn now<Traits: PortInstance>() -> Duration {
    Traits::port_state().sched.lock().now
}

/// Set the value returned by [`PortTimer::cycle_count`].
///
/// [`PortTimer::cycle_count`]: strand_kernel::PortTimer::cycle_count
pub fn set_cycle_count<Traits: PortInstance>(value: u32) {
    Traits::port_state().cycle_count.store(value, Ordering::Relaxed);
}

/// Set the value returned by [`PortThreading::stack_random`].
pub fn set_stack_random<Traits: PortInstance>(value: usize) {
    Traits::port_state().stack_random.store(value, Ordering::Relaxed);
}

/// Set the size of the thread-local storage area the port reports for every
/// thread set up afterward.
pub fn set_tls_size<Traits: PortInstance>(value: usize) {
    Traits::port_state().tls_size.store(value, Ordering::Relaxed);
}

/// Get a copy of the event log.
pub fn events<Traits: PortInstance>() -> Vec<Event> {
    Traits::port_state().events.lock().clone()
}

/// Clear the event log and return its former contents.
pub fn take_events<Traits: PortInstance>() -> Vec<Event> {
    std::mem::take(&mut *Traits::port_state().events.lock())
}

/// Call `f` as if it were executed by `thread`.
pub fn with_current<Traits: PortInstance, R>(thread: &'static ThreadCb<Traits>, f: impl FnOnce() -> R) -> R {
    let state = Traits::port_state();
    let prev = std::mem::replace(&mut state.sched.lock().current, Some(thread));
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f));
    state.sched.lock().current = prev;
    result.unwrap_or_else(|e| std::panic::resume_unwind(e))
}

/// Call `f` as if it were executed by an interrupt handler.
pub fn simulate_interrupt<Traits: PortInstance, R>(f: impl FnOnce() -> R) -> R {
    let state = Traits::port_state();
    let was_in_isr = state.in_isr.swap(true, Ordering::Relaxed);
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f));
    state.in_isr.store(was_in_isr, Ordering::Relaxed);
    result.unwrap_or_else(|e| std::panic::resume_unwind(e))
}

/// Update the scheduling state of `thread` as a scheduler would do when it
/// blocks or wakes up the thread.
pub fn set_thread_state<Traits: PortInstance>(thread: &'static ThreadCb<Traits>, st: ThreadSt) {
    let lock = strand_kernel::lock_kernel::<Traits>().unwrap();
    // Safety: The kernel lock is active
    unsafe { <Traits as PortToKernel>::set_thread_state(thread, st) };
    drop(lock);
}

/// Instantiate the port.
///
/// The port's stack constants can be overridden in the optional braces.
///
/// ```rust,ignore
/// strand_port_std::use_port!(unsafe pub struct System {
///     const THREAD_STACK_RESERVED: usize = 64;
/// });
/// ```
#[macro_export]
macro_rules! use_port {
    (
        unsafe $vis:vis struct $SystemTraits:ident
        $({
            $( const $name:ident: $ty:ty = $value:expr; )*
        })?
    ) => {
        $vis struct $SystemTraits;

        mod port_std_impl {
            use super::$SystemTraits;
            use $crate::strand_kernel::{
                FatalReason, PortScheduler, PortThreading, PortTimer, ThreadCb, ThreadEntry,
            };
            use $crate::{State, ThreadState, PortInstance};

            pub(super) static PORT_STATE: State<$SystemTraits> = State::new();

            unsafe impl PortInstance for $SystemTraits {
                #[inline]
                fn port_state() -> &'static State<Self> {
                    &PORT_STATE
                }
            }

            // Assume `$SystemTraits: KernelCfg`
            unsafe impl PortThreading for $SystemTraits {
                type PortThreadState = ThreadState;

                $($( const $name: $ty = $value; )*)?

                unsafe fn initialize_thread_state(
                    thread: &'static ThreadCb<Self>,
                    stack_ptr: usize,
                    entry: ThreadEntry,
                    params: [usize; 3],
                ) {
                    unsafe { PORT_STATE.initialize_thread_state(thread, stack_ptr, entry, params) }
                }

                unsafe fn tls_stack_setup(thread: &'static ThreadCb<Self>, stack_ptr: usize) -> usize {
                    unsafe { PORT_STATE.tls_stack_setup(thread, stack_ptr) }
                }

                fn stack_random() -> usize {
                    PORT_STATE.stack_random()
                }

                unsafe fn user_mode_enter(entry: ThreadEntry, params: [usize; 3], stack_ptr: usize) -> ! {
                    unsafe { PORT_STATE.user_mode_enter(entry, params, stack_ptr) }
                }

                unsafe fn try_enter_kernel_lock() -> bool {
                    unsafe { PORT_STATE.try_enter_kernel_lock() }
                }

                unsafe fn leave_kernel_lock() {
                    unsafe { PORT_STATE.leave_kernel_lock() }
                }

                fn is_kernel_lock_active() -> bool {
                    PORT_STATE.is_kernel_lock_active()
                }

                fn is_in_isr() -> bool {
                    PORT_STATE.is_in_isr()
                }
            }

            unsafe impl PortScheduler for $SystemTraits {
                fn current_thread() -> Option<&'static ThreadCb<Self>> {
                    PORT_STATE.current_thread()
                }

                unsafe fn start_thread(thread: &'static ThreadCb<Self>) {
                    unsafe { PORT_STATE.start_thread(thread) }
                }

                unsafe fn add_thread_timeout(thread: &'static ThreadCb<Self>, delay: ::std::time::Duration) {
                    unsafe { PORT_STATE.add_thread_timeout(thread, delay) }
                }

                unsafe fn sched_lock() {
                    unsafe { PORT_STATE.sched_lock() }
                }

                unsafe fn sched_unlock() {
                    unsafe { PORT_STATE.sched_unlock() }
                }

                unsafe fn abort_thread(thread: &'static ThreadCb<Self>) {
                    unsafe { PORT_STATE.abort_thread(thread) }
                }

                fn fatal_error_handler(reason: FatalReason, thread: Option<&'static ThreadCb<Self>>) {
                    PORT_STATE.fatal_error_handler(reason, thread)
                }
            }

            impl PortTimer for $SystemTraits {
                fn cycle_count() -> u32 {
                    PORT_STATE.cycle_count()
                }
            }
        }
    };
}
