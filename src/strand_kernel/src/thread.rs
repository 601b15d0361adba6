//! Threads
use core::{fmt, time::Duration};

use crate::{
    cfg::StaticThread,
    error::{BadContextError, CpuMaskError, CustomDataError, GetThreadNameError, SetThreadNameError},
    klock::{lock_kernel, KernelLockCell, KernelLockGuardBorrowMut},
    stack::{StackInfo, StackRef},
    utils::Init,
    Kernel, KernelCfg, PortThreading,
};

#[cfg(feature = "thread_monitor")]
use crate::monitor::MonitorLink;
#[cfg(feature = "runtime_stats")]
use crate::stats::ThreadUsage;
#[cfg(feature = "userspace")]
use crate::{klock::KernelLockToken, kobj::KObject, mem_domain::MemDomain};

mod lifecycle;
mod name;
pub use self::{lifecycle::*, name::*};

/// The entry point of a thread. Receives the three parameters given at
/// creation.
pub type ThreadEntry = fn(usize, usize, usize);

bitflags::bitflags! {
    /// User options of a thread, specified at creation.
    pub struct ThreadOptions: u8 {
        /// The thread runs in user mode (unprivileged).
        const USER = 1 << 0;
        /// The thread's unexpected termination is a system-fatal condition.
        const ESSENTIAL = 1 << 1;
        /// The thread inherits all object permissions of its creator.
        const INHERIT_PERMS = 1 << 2;
    }
}

impl Init for ThreadOptions {
    const INIT: Self = Self::empty();
}

/// The lifecycle state of a thread.
///
/// A thread moves from `Prestart` through the scheduler-internal states to
/// `Dead`. It never moves backward except when the storage is set up again
/// by [`setup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreadSt {
    /// Constructed but not yet made schedulable.
    Prestart,
    /// Ready to run, or running.
    Queued,
    /// Blocked on a kernel object or a timeout.
    Pending,
    /// Suspended by request.
    Suspended,
    /// Being terminated.
    Aborting,
    /// Terminated, or never set up. The storage may be set up again.
    Dead,
    /// The bootstrap pseudo-thread used before the scheduler starts.
    Dummy,
}

impl Init for ThreadSt {
    const INIT: Self = Self::Dead;
}

impl ThreadSt {
    /// Get a human-readable name of the state.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Prestart => "prestart",
            Self::Queued => "queued",
            Self::Pending => "pending",
            Self::Suspended => "suspended",
            Self::Aborting => "aborting",
            Self::Dead => "dead",
            Self::Dummy => "dummy",
        }
    }

    /// Return `true` if the thread storage is occupied by a live thread.
    pub const fn is_live(self) -> bool {
        !matches!(self, Self::Dead)
    }

    fn can_transition_to(self, to: Self) -> bool {
        use ThreadSt::*;
        match (self, to) {
            (Dead, Prestart | Dummy) => true,
            (Dead, _) => false,
            (_, Dead) => true,
            (_, Prestart | Dummy) => false,
            (Dummy, _) => false,
            (Aborting, _) => false,
            (Prestart | Queued | Pending | Suspended, Queued | Pending | Suspended | Aborting) => true,
        }
    }
}

impl fmt::Display for ThreadSt {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Specifies when a newly created thread starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Start immediately.
    NoWait,
    /// Start after the given delay.
    After(Duration),
    /// Stay in the Prestart state until [`start`] is called.
    Forever,
}

impl Timeout {
    /// Construct a `Timeout` from a number of milliseconds. `0` means
    /// [`Timeout::NoWait`].
    pub const fn from_millis(ms: u64) -> Self {
        if ms == 0 {
            Self::NoWait
        } else {
            Self::After(Duration::from_millis(ms))
        }
    }

    /// Map a zero delay to `NoWait`.
    pub(crate) const fn normalize(self) -> Self {
        match self {
            Self::After(d) if d.is_zero() => Self::NoWait,
            x => x,
        }
    }
}

/// The entry point and parameters recorded for postmortem tooling.
#[derive(Clone, Copy)]
pub struct EntryRecord {
    pub entry: ThreadEntry,
    pub params: [usize; 3],
}

impl fmt::Debug for EntryRecord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("EntryRecord")
            .field("entry", &(self.entry as *const ()))
            .field("params", &self.params)
            .finish()
    }
}

/// A resource pool that a thread draws kernel-managed allocations from.
/// Threads inherit their creator's pool.
#[derive(Debug)]
pub struct ResourcePool {
    name: &'static str,
}

impl ResourcePool {
    pub const fn new(name: &'static str) -> Self {
        Self { name }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Thread control block, the per-thread kernel state. Supplied by the
/// application, usually as a `static` initialized with
/// [`ThreadCb::new`] or [`Init::INIT`].
///
/// The address of a `ThreadCb` is the thread's identity.
#[repr(C)]
pub struct ThreadCb<System: PortThreading> {
    /// The port-specific thread state. Placed first so that a port can locate
    /// it at a fixed offset.
    pub port_thread_state: System::PortThreadState,

    pub(crate) st: KernelLockCell<System, ThreadSt>,

    /// The priority. Lower values are more urgent.
    pub(crate) priority: KernelLockCell<System, i32>,

    pub(crate) options: KernelLockCell<System, ThreadOptions>,

    /// The scheduler lock nesting depth.
    pub(crate) sched_locked: KernelLockCell<System, u8>,

    #[cfg(feature = "sched_cpu_mask")]
    pub(crate) cpu_mask: KernelLockCell<System, u32>,

    pub(crate) stack_info: KernelLockCell<System, StackInfo>,

    /// The stack object the thread was set up with. `None` for a dummy
    /// thread.
    pub(crate) stack_obj: KernelLockCell<System, Option<StackRef<System>>>,

    /// The static definition the thread was created from.
    pub(crate) init_data: KernelLockCell<System, Option<&'static StaticThread<System>>>,

    pub(crate) resource_pool: KernelLockCell<System, Option<&'static ResourcePool>>,

    #[cfg(feature = "thread_monitor")]
    pub(crate) link: KernelLockCell<System, MonitorLink<System>>,

    #[cfg(feature = "thread_monitor")]
    pub(crate) entry: KernelLockCell<System, Option<EntryRecord>>,

    #[cfg(feature = "thread_name")]
    pub(crate) name: KernelLockCell<System, ThreadName>,

    #[cfg(feature = "custom_data")]
    pub(crate) custom_data: KernelLockCell<System, usize>,

    #[cfg(feature = "runtime_stats")]
    pub(crate) usage: KernelLockCell<System, ThreadUsage>,

    #[cfg(feature = "userspace")]
    pub(crate) kobj: KObject<System>,

    /// The index of the thread's bit in permission bitmaps.
    #[cfg(feature = "userspace")]
    pub(crate) perm_index: KernelLockCell<System, Option<u8>>,

    #[cfg(feature = "userspace")]
    pub(crate) mem_domain: KernelLockCell<System, Option<&'static MemDomain<System>>>,

    /// The address of the user-mode runtime data block carved out of the
    /// top of the stack. `0` if the block is disabled.
    #[cfg(feature = "userspace")]
    pub(crate) local_data: KernelLockCell<System, usize>,
}

impl<System: PortThreading> Init for ThreadCb<System> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        port_thread_state: Init::INIT,
        st: Init::INIT,
        priority: Init::INIT,
        options: Init::INIT,
        sched_locked: Init::INIT,
        #[cfg(feature = "sched_cpu_mask")]
        cpu_mask: KernelLockCell::new(u32::MAX),
        stack_info: Init::INIT,
        stack_obj: Init::INIT,
        init_data: Init::INIT,
        resource_pool: Init::INIT,
        #[cfg(feature = "thread_monitor")]
        link: Init::INIT,
        #[cfg(feature = "thread_monitor")]
        entry: Init::INIT,
        #[cfg(feature = "thread_name")]
        name: Init::INIT,
        #[cfg(feature = "custom_data")]
        custom_data: Init::INIT,
        #[cfg(feature = "runtime_stats")]
        usage: Init::INIT,
        #[cfg(feature = "userspace")]
        kobj: KObject::new(crate::kobj::KObjectKind::Thread),
        #[cfg(feature = "userspace")]
        perm_index: Init::INIT,
        #[cfg(feature = "userspace")]
        mem_domain: Init::INIT,
        #[cfg(feature = "userspace")]
        local_data: Init::INIT,
    };
}

impl<System: PortThreading> ThreadCb<System> {
    /// Construct an unused thread control block. It reads as
    /// [`ThreadSt::Dead`] until it's set up.
    #[allow(clippy::declare_interior_mutable_const)]
    pub const fn new() -> Self {
        Self::INIT
    }

    /// Get the thread's lifecycle state.
    pub fn state(&self) -> Result<ThreadSt, BadContextError> {
        let lock = lock_kernel::<System>()?;
        Ok(self.st.get(&lock))
    }

    /// Get the thread's priority.
    pub fn priority(&self) -> Result<i32, BadContextError> {
        let lock = lock_kernel::<System>()?;
        Ok(self.priority.get(&lock))
    }

    /// Get the thread's user options.
    pub fn options(&self) -> Result<ThreadOptions, BadContextError> {
        let lock = lock_kernel::<System>()?;
        Ok(self.options.get(&lock))
    }

    /// Get the scheduler lock nesting depth.
    pub fn sched_locked(&self) -> Result<u8, BadContextError> {
        let lock = lock_kernel::<System>()?;
        Ok(self.sched_locked.get(&lock))
    }

    /// Get the usable stack region computed by [`setup`].
    pub fn stack_info(&self) -> Result<StackInfo, BadContextError> {
        let lock = lock_kernel::<System>()?;
        Ok(self.stack_info.get(&lock))
    }

    /// Get the static definition the thread was created from, if any.
    pub fn init_data(&self) -> Result<Option<&'static StaticThread<System>>, BadContextError> {
        let lock = lock_kernel::<System>()?;
        Ok(self.init_data.get(&lock))
    }

    /// Get the resource pool the thread draws from.
    pub fn resource_pool(&self) -> Result<Option<&'static ResourcePool>, BadContextError> {
        let lock = lock_kernel::<System>()?;
        Ok(self.resource_pool.get(&lock))
    }

    /// Get the entry point recorded by [`setup`] or [`user_mode_enter`].
    #[cfg(feature = "thread_monitor")]
    pub fn entry(&self) -> Result<Option<EntryRecord>, BadContextError> {
        let lock = lock_kernel::<System>()?;
        Ok(self.entry.get(&lock))
    }

    /// Get the CPU affinity mask.
    #[cfg(feature = "sched_cpu_mask")]
    pub fn cpu_mask(&self) -> Result<u32, BadContextError> {
        let lock = lock_kernel::<System>()?;
        Ok(self.cpu_mask.get(&lock))
    }

    /// Get the address of the user-mode runtime data block.
    #[cfg(feature = "userspace")]
    pub fn local_data(&self) -> Result<usize, BadContextError> {
        let lock = lock_kernel::<System>()?;
        Ok(self.local_data.get(&lock))
    }
}

impl<System: PortThreading> fmt::Debug for ThreadCb<System> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ThreadCb")
            .field("self", &(self as *const _))
            .field("st", &self.st)
            .field("priority", &self.priority)
            .field("options", &self.options)
            .field("stack_info", &self.stack_info)
            .finish_non_exhaustive()
    }
}

/// Parameters of [`setup`] and [`create`].
pub struct ThreadAttr<'a, System: PortThreading> {
    /// The stack object. Must outlive the thread (enforced by `'static`).
    pub stack: StackRef<System>,
    /// The requested stack size, not including the reserved area.
    pub stack_size: usize,
    pub entry: ThreadEntry,
    pub params: [usize; 3],
    pub priority: i32,
    pub options: ThreadOptions,
    /// The name. Truncated if it's longer than [`THREAD_MAX_NAME_LEN`] - 1
    /// bytes. `None` clears the name.
    pub name: Option<&'a str>,
}

impl<System: PortThreading> Clone for ThreadAttr<'_, System> {
    fn clone(&self) -> Self {
        Self { ..*self }
    }
}

impl<System: PortThreading> Copy for ThreadAttr<'_, System> {}

impl<System: PortThreading> fmt::Debug for ThreadAttr<'_, System> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ThreadAttr")
            .field("stack", &self.stack.as_ptr())
            .field("stack_size", &self.stack_size)
            .field("entry", &(self.entry as *const ()))
            .field("params", &self.params)
            .field("priority", &self.priority)
            .field("options", &self.options)
            .field("name", &self.name)
            .finish()
    }
}

/// Return `true` if `prio` is a valid priority for a thread with `options`.
///
/// The idle priority is only available to essential kernel-mode threads.
pub fn is_valid_prio<System: KernelCfg>(prio: i32, options: ThreadOptions) -> bool {
    let idle = System::NUM_PREEMPT_PRIORITIES;
    if prio == idle {
        options.contains(ThreadOptions::ESSENTIAL) && !options.contains(ThreadOptions::USER)
    } else {
        (-System::NUM_COOP_PRIORITIES..idle).contains(&prio)
    }
}

/// Return `true` if `prio1` is less urgent than or as urgent as `prio2`.
#[inline]
pub const fn is_prio_lower_or_equal(prio1: i32, prio2: i32) -> bool {
    prio1 >= prio2
}

/// Get the currently running thread.
#[inline]
pub fn current<System: Kernel>() -> Option<&'static ThreadCb<System>> {
    System::current_thread()
}

/// Transition the thread to `st`, panicking if the transition goes backward.
pub(crate) fn set_state<System: Kernel>(
    mut lock: KernelLockGuardBorrowMut<'_, System>,
    thread: &ThreadCb<System>,
    st: ThreadSt,
) {
    let old = thread.st.replace(&mut lock, st);
    assert!(
        old.can_transition_to(st),
        "invalid thread state transition: {old} -> {st}"
    );
}

/// Return `true` if the current thread runs in user mode.
#[cfg(feature = "userspace")]
pub(crate) fn is_current_user<System: Kernel>(token: &KernelLockToken<System>) -> bool {
    System::current_thread().is_some_and(|t| t.options.get(token).contains(ThreadOptions::USER))
}

/// Mark the current thread as essential.
pub fn essential_set<System: Kernel>() -> Result<(), BadContextError> {
    update_current_options::<System>(|o| o.insert(ThreadOptions::ESSENTIAL))
}

/// Clear the essential flag of the current thread.
pub fn essential_clear<System: Kernel>() -> Result<(), BadContextError> {
    update_current_options::<System>(|o| o.remove(ThreadOptions::ESSENTIAL))
}

/// Return `true` if the current thread is essential.
pub fn is_essential<System: Kernel>() -> Result<bool, BadContextError> {
    let thread = System::current_thread().ok_or(BadContextError::BadContext)?;
    Ok(thread.options()?.contains(ThreadOptions::ESSENTIAL))
}

fn update_current_options<System: Kernel>(
    f: impl FnOnce(&mut ThreadOptions),
) -> Result<(), BadContextError> {
    let thread = System::current_thread().ok_or(BadContextError::BadContext)?;
    let mut lock = lock_kernel::<System>()?;
    f(thread.options.write(&mut *lock));
    Ok(())
}

/// Set the current thread's custom data slot.
pub fn custom_data_set<System: Kernel>(value: usize) -> Result<(), CustomDataError> {
    let thread = System::current_thread().ok_or(CustomDataError::BadContext)?;
    #[cfg(feature = "custom_data")]
    {
        let mut lock = lock_kernel::<System>()?;
        thread.custom_data.replace(&mut lock, value);
        Ok(())
    }
    #[cfg(not(feature = "custom_data"))]
    {
        let _ = (thread, value);
        Err(CustomDataError::NotSupported)
    }
}

/// Get the current thread's custom data slot.
pub fn custom_data_get<System: Kernel>() -> Result<usize, CustomDataError> {
    let thread = System::current_thread().ok_or(CustomDataError::BadContext)?;
    #[cfg(feature = "custom_data")]
    {
        let lock = lock_kernel::<System>()?;
        Ok(thread.custom_data.get(&lock))
    }
    #[cfg(not(feature = "custom_data"))]
    {
        let _ = thread;
        Err(CustomDataError::NotSupported)
    }
}

/// Set the name of `thread`, or of the current thread if `thread` is `None`.
///
/// The name is truncated to [`THREAD_MAX_NAME_LEN`] - 1 bytes.
pub fn set_name<System: Kernel>(
    thread: Option<&'static ThreadCb<System>>,
    name: &str,
) -> Result<(), SetThreadNameError> {
    let thread = thread
        .or_else(System::current_thread)
        .ok_or(SetThreadNameError::BadContext)?;
    #[cfg(feature = "thread_name")]
    {
        let mut lock = lock_kernel::<System>()?;
        #[cfg(feature = "userspace")]
        if is_current_user(&lock) {
            crate::kobj::check_current_access(&lock, &thread.kobj)
                .map_err(|_| SetThreadNameError::NoAccess)?;
        }
        thread.name.write(&mut *lock).set(Some(name));
        Ok(())
    }
    #[cfg(not(feature = "thread_name"))]
    {
        let _ = (thread, name);
        Err(SetThreadNameError::NotSupported)
    }
}

/// Get a copy of the name of `thread`.
pub fn name<System: Kernel>(thread: &'static ThreadCb<System>) -> Result<ThreadName, GetThreadNameError> {
    #[cfg(feature = "thread_name")]
    {
        let lock = lock_kernel::<System>()?;
        Ok(thread.name.get(&lock))
    }
    #[cfg(not(feature = "thread_name"))]
    {
        let _ = thread;
        Err(GetThreadNameError::NotSupported)
    }
}

/// Copy the NUL-terminated name of `thread` into `buf`. Returns the length
/// of the name, not including the terminator.
pub fn copy_name<System: Kernel>(
    thread: &'static ThreadCb<System>,
    buf: &mut [u8],
) -> Result<usize, GetThreadNameError> {
    let name = name(thread)?;
    let bytes = name.as_bytes_with_nul();
    let dst = buf
        .get_mut(..bytes.len())
        .ok_or(GetThreadNameError::BadParam)?;
    dst.copy_from_slice(bytes);
    Ok(bytes.len() - 1)
}

/// Assign a resource pool to `thread`. Threads created by `thread` later
/// inherit it.
pub fn resource_pool_assign<System: Kernel>(
    thread: &'static ThreadCb<System>,
    pool: &'static ResourcePool,
) -> Result<(), BadContextError> {
    let mut lock = lock_kernel::<System>()?;
    thread.resource_pool.replace(&mut lock, Some(pool));
    Ok(())
}

/// The CPU affinity mask allowing all cores.
pub const CPU_MASK_ALL: u32 = u32::MAX;

/// Allow `thread` to run on `cpu`. The thread must not have been started.
pub fn cpu_mask_enable<System: Kernel>(
    thread: &'static ThreadCb<System>,
    cpu: usize,
) -> Result<(), CpuMaskError> {
    let bit = cpu_bit::<System>(cpu)?;
    update_cpu_mask(thread, |m| m | bit)
}

/// Forbid `thread` from running on `cpu`. The thread must not have been
/// started.
pub fn cpu_mask_disable<System: Kernel>(
    thread: &'static ThreadCb<System>,
    cpu: usize,
) -> Result<(), CpuMaskError> {
    let bit = cpu_bit::<System>(cpu)?;
    update_cpu_mask(thread, |m| m & !bit)
}

/// Forbid `thread` from running on any core.
pub fn cpu_mask_clear<System: Kernel>(thread: &'static ThreadCb<System>) -> Result<(), CpuMaskError> {
    update_cpu_mask(thread, |_| 0)
}

/// Allow `thread` to run on all cores.
pub fn cpu_mask_enable_all<System: Kernel>(
    thread: &'static ThreadCb<System>,
) -> Result<(), CpuMaskError> {
    update_cpu_mask(thread, |_| CPU_MASK_ALL)
}

fn cpu_bit<System: Kernel>(cpu: usize) -> Result<u32, CpuMaskError> {
    if cpu < System::NUM_CPUS && cpu < 32 {
        Ok(1 << cpu)
    } else {
        Err(CpuMaskError::BadParam)
    }
}

fn update_cpu_mask<System: Kernel>(
    thread: &'static ThreadCb<System>,
    f: impl FnOnce(u32) -> u32,
) -> Result<(), CpuMaskError> {
    #[cfg(feature = "sched_cpu_mask")]
    {
        let mut lock = lock_kernel::<System>()?;
        if thread.st.get(&lock) != ThreadSt::Prestart {
            return Err(CpuMaskError::BadObjectState);
        }
        let mask = f(thread.cpu_mask.get(&lock));
        thread.cpu_mask.replace(&mut lock, mask);
        Ok(())
    }
    #[cfg(not(feature = "sched_cpu_mask"))]
    {
        let _ = (thread, f);
        Err(CpuMaskError::NotSupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_names() {
        assert_eq!(ThreadSt::Prestart.as_str(), "prestart");
        assert_eq!(ThreadSt::Dummy.to_string(), "dummy");
        assert_eq!(ThreadSt::Aborting.as_str(), "aborting");
    }

    #[test]
    fn state_transitions_are_monotonic() {
        use ThreadSt::*;
        assert!(Dead.can_transition_to(Prestart));
        assert!(Prestart.can_transition_to(Queued));
        assert!(Queued.can_transition_to(Pending));
        assert!(Pending.can_transition_to(Queued));
        assert!(Queued.can_transition_to(Dead));
        assert!(Dummy.can_transition_to(Dead));
        assert!(!Queued.can_transition_to(Prestart));
        assert!(!Dead.can_transition_to(Queued));
        assert!(!Dead.can_transition_to(Dead));
        assert!(!Aborting.can_transition_to(Queued));
    }

    #[test]
    fn timeout_normalization() {
        assert_eq!(Timeout::from_millis(0), Timeout::NoWait);
        assert_eq!(
            Timeout::After(Duration::ZERO).normalize(),
            Timeout::NoWait
        );
        assert_eq!(
            Timeout::from_millis(50),
            Timeout::After(Duration::from_millis(50))
        );
        assert_eq!(Timeout::Forever.normalize(), Timeout::Forever);
    }

    #[test]
    fn prio_ordering() {
        assert!(is_prio_lower_or_equal(5, 3));
        assert!(is_prio_lower_or_equal(3, 3));
        assert!(!is_prio_lower_or_equal(3, 5));
        assert!(is_prio_lower_or_equal(0, -2));
    }
}
