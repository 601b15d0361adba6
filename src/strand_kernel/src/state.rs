use core::fmt;

use crate::{klock::KernelLockCell, thread::ThreadCb, utils::Init, PortThreading};

#[cfg(feature = "userspace")]
use crate::{kobj::KObject, mem_domain::MemDomain, utils::PermBitmap};

/// Global kernel state. Created by [`build!`] as a `static` and lives until
/// the system shuts down.
///
/// [`build!`]: crate::build
pub struct State<System: PortThreading> {
    /// The head of the thread registry.
    #[cfg(feature = "thread_monitor")]
    pub(crate) threads: KernelLockCell<System, Option<&'static ThreadCb<System>>>,

    /// The insertion sequence number to be assigned to the next thread
    /// inserted into the registry.
    #[cfg(feature = "thread_monitor")]
    pub(crate) next_monitor_seq: KernelLockCell<System, u64>,

    /// The execution cycles of all threads.
    #[cfg(feature = "runtime_stats")]
    pub(crate) all_thread_usage: KernelLockCell<System, u64>,

    /// The head of the kernel object table.
    #[cfg(feature = "userspace")]
    pub(crate) objects: KernelLockCell<System, Option<&'static KObject<System>>>,

    /// Thread permission indices in use.
    #[cfg(feature = "userspace")]
    pub(crate) thread_indices: KernelLockCell<System, PermBitmap>,

    /// The domain of threads created without a creator.
    #[cfg(feature = "userspace")]
    pub(crate) default_mem_domain: MemDomain<System>,

    _phantom: core::marker::PhantomData<fn() -> ThreadCb<System>>,
}

impl<System: PortThreading> Init for State<System> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        #[cfg(feature = "thread_monitor")]
        threads: Init::INIT,
        #[cfg(feature = "thread_monitor")]
        next_monitor_seq: Init::INIT,
        #[cfg(feature = "runtime_stats")]
        all_thread_usage: Init::INIT,
        #[cfg(feature = "userspace")]
        objects: Init::INIT,
        #[cfg(feature = "userspace")]
        thread_indices: Init::INIT,
        #[cfg(feature = "userspace")]
        default_mem_domain: MemDomain::new(),
        _phantom: core::marker::PhantomData,
    };
}

impl<System: PortThreading> fmt::Debug for State<System> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        #[allow(unused_mut)]
        let mut s = f.debug_struct("State");
        #[cfg(feature = "thread_monitor")]
        s.field(
            "threads",
            &self.threads.debug_fmt_with_ref(|head, f| {
                fmt::Debug::fmt(&head.map(|t| t as *const ThreadCb<System>), f)
            }),
        );
        #[cfg(feature = "runtime_stats")]
        s.field("all_thread_usage", &self.all_thread_usage);
        #[cfg(feature = "userspace")]
        s.field("thread_indices", &self.thread_indices);
        s.finish_non_exhaustive()
    }
}
