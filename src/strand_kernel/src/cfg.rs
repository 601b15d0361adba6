//! Static configuration mechanism for the kernel
use core::fmt;

use crate::{
    stack::StackRef,
    thread::{ThreadAttr, ThreadCb, ThreadEntry, ThreadOptions, Timeout},
    PortThreading,
};

/// A statically defined thread, created and started by
/// [`init_static_threads`] at boot.
///
/// [`init_static_threads`]: crate::init_static_threads
pub struct StaticThread<System: PortThreading> {
    pub thread: &'static ThreadCb<System>,
    pub stack: StackRef<System>,
    /// The stack size, not including the reserved area.
    pub stack_size: usize,
    pub entry: ThreadEntry,
    pub params: [usize; 3],
    pub priority: i32,
    pub options: ThreadOptions,
    pub name: Option<&'static str>,
    /// When the thread starts. [`Timeout::Forever`] leaves it in the Prestart
    /// state until [`thread::start`] is called.
    ///
    /// [`thread::start`]: crate::thread::start
    pub delay: Timeout,
}

impl<System: PortThreading> StaticThread<System> {
    /// Get the creation parameters.
    pub fn to_attr(&self) -> ThreadAttr<'static, System> {
        ThreadAttr {
            stack: self.stack,
            stack_size: self.stack_size,
            entry: self.entry,
            params: self.params,
            priority: self.priority,
            options: self.options,
            name: self.name,
        }
    }
}

impl<System: PortThreading> fmt::Debug for StaticThread<System> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("StaticThread")
            .field("thread", &(self.thread as *const ThreadCb<System>))
            .field("stack", &self.stack.as_ptr())
            .field("stack_size", &self.stack_size)
            .field("priority", &self.priority)
            .field("options", &self.options)
            .field("name", &self.name)
            .field("delay", &self.delay)
            .finish_non_exhaustive()
    }
}

/// Attach the static configuration and the global kernel state to a
/// "system" type.
///
/// ```rust,ignore
/// strand_kernel::build!(
///     System,
///     preempt_priorities: 8,
///     static_threads: &[StaticThread { .. }],
///     devices: &[&UART0],
/// );
/// ```
///
/// Every table is optional and defaults to empty. `coop_priorities` and
/// `preempt_priorities` default to 16 and 15, respectively.
/// `object_assignments` is ignored unless `userspace` is enabled.
#[macro_export]
macro_rules! build {
    (@or [] $default:expr) => { $default };
    (@or [$e:expr] $default:expr) => { $e };

    (
        $sys:ty
        $(, coop_priorities: $coop:expr)?
        $(, preempt_priorities: $preempt:expr)?
        $(, static_threads: $threads:expr)?
        $(, object_assignments: $assignments:expr)?
        $(, devices: $devices:expr)?
        $(,)?
    ) => {
        const _: () = {
            use $crate::{device::Device, utils::Init, KernelCfg, State, StaticThread};

            static STATE: State<$sys> = Init::INIT;
            static STATIC_THREADS: &[StaticThread<$sys>] =
                $crate::build!(@or [$($threads)?] &[]);
            static DEVICES: &[&Device] = $crate::build!(@or [$($devices)?] &[]);

            // Safety: We are `build!`, so it's okay to `impl` this
            unsafe impl KernelCfg for $sys {
                const NUM_COOP_PRIORITIES: i32 = $crate::build!(@or [$($coop)?] 16);
                const NUM_PREEMPT_PRIORITIES: i32 = $crate::build!(@or [$($preempt)?] 15);

                #[inline(always)]
                fn state() -> &'static State<Self> {
                    &STATE
                }

                #[inline(always)]
                fn static_threads() -> &'static [StaticThread<Self>] {
                    STATIC_THREADS
                }

                $crate::__build_object_assignments!($sys, [$($assignments)?]);

                #[inline(always)]
                fn devices() -> &'static [&'static Device] {
                    DEVICES
                }
            }
        };
    };
}

#[cfg(feature = "userspace")]
#[doc(hidden)]
#[macro_export]
macro_rules! __build_object_assignments {
    ($sys:ty, [$($assignments:expr)?]) => {
        #[inline(always)]
        fn object_assignments() -> &'static [$crate::kobj::ObjectAssignment<Self>] {
            static OBJECT_ASSIGNMENTS: &[$crate::kobj::ObjectAssignment<$sys>] =
                $crate::build!(@or [$($assignments)?] &[]);
            OBJECT_ASSIGNMENTS
        }
    };
}

#[cfg(not(feature = "userspace"))]
#[doc(hidden)]
#[macro_export]
macro_rules! __build_object_assignments {
    ($sys:ty, [$($assignments:expr)?]) => {};
}
